pub mod analysis;
pub mod classify;
pub mod config;
pub mod db;
pub mod detector;
pub mod events;
pub mod fusion;
pub mod labels;
pub mod models;
pub mod persistence;
pub mod queue;
pub mod reconcile;
pub mod scheduler;
pub mod session;
pub mod utils;

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use classify::HttpClassifier;
use config::{ConfigOverrides, VigilConfig};
use db::Database;
use scheduler::SpoolFrameSource;
use session::SessionController;

const DEFAULT_DATA_DIR: &str = "vigil-data";
const DB_FILE_NAME: &str = "vigil.sqlite3";

/// How often the run loop notices a session that ended on its own.
const LIVENESS_CHECK: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopSignal {
    /// Ctrl-C: drain the pipeline and end the session normally.
    Interrupt,
    /// SIGTERM: stop quickly and leave unclassified samples spooled.
    Terminate,
}

#[cfg(unix)]
async fn stop_signal() -> Result<StopSignal> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).context("failed to listen for SIGTERM")?;
    tokio::select! {
        interrupted = tokio::signal::ctrl_c() => {
            interrupted.context("failed to listen for Ctrl-C")?;
            Ok(StopSignal::Interrupt)
        }
        _ = terminate.recv() => Ok(StopSignal::Terminate),
    }
}

#[cfg(not(unix))]
async fn stop_signal() -> Result<StopSignal> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    Ok(StopSignal::Interrupt)
}

/// Runs one monitoring session until Ctrl-C or SIGTERM, then stops it and
/// writes the segment report.
pub async fn run(config_path: Option<PathBuf>) -> Result<()> {
    let config = VigilConfig::load_layered(
        config_path.as_deref(),
        std::env::vars(),
        &ConfigOverrides::default(),
    )
    .context("failed to load configuration")?;

    let data_dir = config
        .storage
        .data_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let database = Database::open(data_dir.join(DB_FILE_NAME))?;

    let classifier = Arc::new(HttpClassifier::from_config(&config.classifier)?);
    let source = Arc::new(SpoolFrameSource::from_config(&config.capture)?);
    let controller = SessionController::new(config, database, classifier, source)?;

    let cancel = CancellationToken::new();
    let report = controller.recover(&cancel).await?;
    if !report.failed_sessions.is_empty() || report.resumed + report.discarded > 0 {
        warn!(
            "recovered {} interrupted sessions ({} samples resumed, {} discarded, {} still spooled)",
            report.failed_sessions.len(),
            report.resumed,
            report.discarded,
            report.remaining
        );
    }

    let session = controller.start_session().await?;
    info!("Vigil monitoring session {}; press Ctrl-C to end it", session.id);

    let mut liveness = tokio::time::interval(LIVENESS_CHECK);
    let stop = tokio::select! {
        signal = stop_signal() => match signal {
            Ok(signal) => signal,
            Err(err) => {
                controller.shutdown().await?;
                return Err(err);
            }
        },
        _ = async {
            loop {
                liveness.tick().await;
                if !controller.is_running().await {
                    break;
                }
            }
        } => {
            warn!("session {} stopped on its own", session.id);
            StopSignal::Interrupt
        }
    };

    if stop == StopSignal::Terminate {
        warn!("terminated; spooling session {} for recovery", session.id);
        controller.shutdown().await?;
        return Ok(());
    }

    match controller.end_session().await {
        Ok(ended) => info!(
            "session {} {} with {} samples ({} dropped)",
            ended.id,
            ended.status.as_str(),
            ended.samples_captured,
            ended.samples_dropped
        ),
        Err(err) => warn!("session {} was not running at exit: {err:#}", session.id),
    }

    let segments = controller.reconcile_session(&session.id, None, None).await?;
    info!("session {} report: {} segments", session.id, segments.len());
    Ok(())
}
