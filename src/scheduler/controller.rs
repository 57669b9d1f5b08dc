use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::info;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::MIN_SAMPLE_INTERVAL_SECS;

use super::loop_worker::{capture_loop, SchedulerContext, SchedulerStats};

/// Owns the capture loop of one session.
pub struct CaptureScheduler {
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
    paused_tx: Option<watch::Sender<bool>>,
    stats: Arc<SchedulerStats>,
}

impl Default for CaptureScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureScheduler {
    pub fn new() -> Self {
        Self {
            handle: None,
            cancel_token: None,
            paused_tx: None,
            stats: Arc::new(SchedulerStats::default()),
        }
    }

    pub fn start(&mut self, ctx: SchedulerContext) -> Result<()> {
        if self.handle.is_some() {
            bail!("capture scheduler already active");
        }
        let interval = ctx.config.sample_interval_secs;
        if interval < MIN_SAMPLE_INTERVAL_SECS {
            bail!(
                "sample interval {}s is below the {}s minimum",
                interval,
                MIN_SAMPLE_INTERVAL_SECS
            );
        }

        info!(
            "starting capture scheduler for session {} every {}s",
            ctx.session_id, interval
        );
        let cancel_token = CancellationToken::new();
        let (paused_tx, paused_rx) = watch::channel(false);
        self.stats = Arc::new(SchedulerStats::default());

        let handle = tokio::spawn(capture_loop(
            ctx,
            self.stats.clone(),
            paused_rx,
            cancel_token.clone(),
        ));

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        self.paused_tx = Some(paused_tx);
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.handle.is_some()
    }

    /// Slots reached while paused are skipped; the anchor is kept.
    pub fn pause(&self) {
        if let Some(tx) = &self.paused_tx {
            let _ = tx.send(true);
            info!("capture scheduler paused");
        }
    }

    pub fn resume(&self) {
        if let Some(tx) = &self.paused_tx {
            let _ = tx.send(false);
            info!("capture scheduler resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused_tx
            .as_ref()
            .map(|tx| *tx.borrow())
            .unwrap_or(false)
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        self.stats.clone()
    }

    /// Stops the loop and waits for any in-flight capture to be queued.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }
        self.paused_tx = None;

        if let Some(handle) = self.handle.take() {
            handle
                .await
                .context("capture loop task failed to join")
                .map(|_| ())
        } else {
            Ok(())
        }
    }
}
