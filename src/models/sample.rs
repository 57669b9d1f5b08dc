use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Camera,
    Screen,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Camera => "camera",
            SourceKind::Screen => "screen",
        }
    }
}

/// Where a captured frame lives. The pipeline never holds pixel data itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageRef {
    pub uri: String,
}

impl ImageRef {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

/// One scheduled capture: a camera frame and, when available, a screen frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SamplePair {
    pub id: String,
    pub session_id: String,
    /// Slot number `n` of the anchored schedule `start + n * interval`.
    pub seq: u64,
    pub captured_at: DateTime<Utc>,
    pub camera: ImageRef,
    pub screen: Option<ImageRef>,
}

impl SamplePair {
    pub fn new(
        session_id: impl Into<String>,
        seq: u64,
        captured_at: DateTime<Utc>,
        camera: ImageRef,
        screen: Option<ImageRef>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            seq,
            captured_at,
            camera,
            screen,
        }
    }
}

/// Pipeline stage a sample was evicted from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DropStage {
    Upload,
    Fusion,
}

impl DropStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropStage::Upload => "upload",
            DropStage::Fusion => "fusion",
        }
    }
}

/// Audit entry for a sample evicted by a drop-oldest queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DroppedSample {
    pub sample_id: String,
    pub session_id: String,
    pub stage: DropStage,
    pub captured_at: DateTime<Utc>,
    pub dropped_at: DateTime<Utc>,
}
