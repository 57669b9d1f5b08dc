use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::focus::AttentionState;

/// Analysis inputs the reconciliation engine can draw on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "camelCase")]
pub enum AnalysisSourceKind {
    Realtime,
    Pattern,
    Emotion,
}

impl AnalysisSourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisSourceKind::Realtime => "realtime",
            AnalysisSourceKind::Pattern => "pattern",
            AnalysisSourceKind::Emotion => "emotion",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "realtime" => Some(AnalysisSourceKind::Realtime),
            "pattern" => Some(AnalysisSourceKind::Pattern),
            "emotion" => Some(AnalysisSourceKind::Emotion),
            _ => None,
        }
    }
}

/// One span of the post-session timeline. Created once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReconciledSegment {
    pub id: String,
    pub session_id: String,
    /// Session-relative seconds.
    pub start_secs: f64,
    pub end_secs: f64,
    /// Realtime attention state that bounded this segment.
    pub state: AttentionState,
    pub labels: BTreeMap<String, f64>,
    pub confidence: f64,
    pub sources: Vec<AnalysisSourceKind>,
}

impl ReconciledSegment {
    pub fn new(
        session_id: impl Into<String>,
        start_secs: f64,
        end_secs: f64,
        state: AttentionState,
        labels: BTreeMap<String, f64>,
        confidence: f64,
        sources: Vec<AnalysisSourceKind>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            start_secs,
            end_secs,
            state,
            labels,
            confidence,
            sources,
        }
    }

    pub fn duration_secs(&self) -> f64 {
        (self.end_secs - self.start_secs).max(0.0)
    }
}
