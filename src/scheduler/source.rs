use std::{
    fs,
    path::{Path, PathBuf},
    time::SystemTime,
};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    config::CaptureConfig,
    models::{ImageRef, SourceKind},
};

/// Capture seam for the scheduler. `Ok(None)` means no frame was available.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn capture(&self, kind: SourceKind, at: DateTime<Utc>) -> Result<Option<ImageRef>>;
}

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Picks up frames that an external capture helper drops into spool directories.
pub struct SpoolFrameSource {
    camera_dir: PathBuf,
    screen_dir: Option<PathBuf>,
}

impl SpoolFrameSource {
    pub fn new(camera_dir: impl Into<PathBuf>, screen_dir: Option<PathBuf>) -> Self {
        Self {
            camera_dir: camera_dir.into(),
            screen_dir,
        }
    }

    pub fn from_config(config: &CaptureConfig) -> Result<Self> {
        let Some(camera_dir) = &config.camera_dir else {
            bail!("capture.cameraDir is not configured");
        };
        Ok(Self::new(camera_dir.clone(), config.screen_dir.clone()))
    }

    fn dir_for(&self, kind: SourceKind) -> Option<&Path> {
        match kind {
            SourceKind::Camera => Some(self.camera_dir.as_path()),
            SourceKind::Screen => self.screen_dir.as_deref(),
        }
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Most recently modified image file in `dir`.
fn newest_image(dir: &Path) -> Result<Option<PathBuf>> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("failed to read spool directory {}", dir.display()))?;

    let mut newest: Option<(SystemTime, PathBuf)> = None;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() || !is_image(&path) {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        let replace = newest
            .as_ref()
            .map_or(true, |(current, current_path)| {
                modified > *current || (modified == *current && path > *current_path)
            });
        if replace {
            newest = Some((modified, path));
        }
    }
    Ok(newest.map(|(_, path)| path))
}

#[async_trait]
impl FrameSource for SpoolFrameSource {
    async fn capture(&self, kind: SourceKind, _at: DateTime<Utc>) -> Result<Option<ImageRef>> {
        let Some(dir) = self.dir_for(kind).map(Path::to_path_buf) else {
            return Ok(None);
        };
        let newest = tokio::task::spawn_blocking(move || newest_image(&dir))
            .await
            .context("spool scan worker join failed")??;
        Ok(newest.map(|path| ImageRef::new(path.to_string_lossy().into_owned())))
    }
}
