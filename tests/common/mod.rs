#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::TempDir;

use vigil_lib::{
    classify::{Classification, ClassifyError, Classifier},
    config::VigilConfig,
    db::Database,
    models::{ImageRef, SourceKind, SourceLabels},
    persistence::{PersistRecord, RecordSink},
    scheduler::FrameSource,
    session::SessionController,
};

/// Answers every camera image with `camera` and every screen image with `screen`.
pub struct FixedClassifier {
    pub camera: &'static str,
    pub screen: &'static str,
    pub delay: Duration,
}

impl FixedClassifier {
    pub fn new(camera: &'static str) -> Self {
        Self {
            camera,
            screen: "Code",
            delay: Duration::ZERO,
        }
    }

    pub fn slow(camera: &'static str, delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new(camera)
        }
    }
}

#[async_trait]
impl Classifier for FixedClassifier {
    async fn classify(&self, _image: &ImageRef, kind: SourceKind) -> Result<Classification, ClassifyError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let label = match kind {
            SourceKind::Camera => self.camera,
            SourceKind::Screen => self.screen,
        };
        Ok(Classification {
            labels: SourceLabels::single(label, 0.9),
            primary: Some(label.to_string()),
        })
    }
}

/// Hands out a fresh frame name for every capture.
#[derive(Default)]
pub struct CountingSource {
    pub frames: AtomicU64,
}

#[async_trait]
impl FrameSource for CountingSource {
    async fn capture(&self, kind: SourceKind, _at: DateTime<Utc>) -> Result<Option<ImageRef>> {
        let n = self.frames.fetch_add(1, Ordering::SeqCst);
        Ok(Some(ImageRef::new(format!("{}-{n}.jpg", kind.as_str()))))
    }
}

/// Storage that never accepts anything.
pub struct BrokenSink;

#[async_trait]
impl RecordSink for BrokenSink {
    async fn commit(&self, record: &PersistRecord) -> Result<()> {
        Err(anyhow!("disk full while writing {}", record.kind()))
    }
}

pub fn database() -> (TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("vigil.sqlite3")).unwrap();
    (dir, db)
}

/// One-minute sampling, camera only.
pub fn config() -> VigilConfig {
    let mut config = VigilConfig::default();
    config.scheduler.sample_interval_secs = 60;
    config.scheduler.capture_screen = false;
    config.workers.rate_limit_per_minute = 600;
    config.workers.rate_limit_burst = 10;
    config
}

pub fn controller(
    config: VigilConfig,
    db: &Database,
    classifier: impl Classifier + 'static,
) -> SessionController {
    SessionController::new(
        config,
        db.clone(),
        Arc::new(classifier),
        Arc::new(CountingSource::default()),
    )
    .unwrap()
}
