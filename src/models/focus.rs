use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::classification::ClassificationResult;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "camelCase")]
pub enum AttentionState {
    Focused,
    Distracted,
    Break,
    Absent,
}

impl AttentionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttentionState::Focused => "Focused",
            AttentionState::Distracted => "Distracted",
            AttentionState::Break => "Break",
            AttentionState::Absent => "Absent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Focused" => Some(AttentionState::Focused),
            "Distracted" => Some(AttentionState::Distracted),
            "Break" => Some(AttentionState::Break),
            "Absent" => Some(AttentionState::Absent),
            _ => None,
        }
    }
}

/// What caused a state change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum TransitionTrigger {
    Vote,
    Pause,
    Resume,
    ManualOverride { reason: String },
}

impl TransitionTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionTrigger::Vote => "vote",
            TransitionTrigger::Pause => "pause",
            TransitionTrigger::Resume => "resume",
            TransitionTrigger::ManualOverride { .. } => "manualOverride",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            TransitionTrigger::ManualOverride { reason } => Some(reason.as_str()),
            _ => None,
        }
    }
}

/// Emitted each time the fusion engine changes state. Never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StateTransition {
    pub id: String,
    pub session_id: String,
    pub from_state: AttentionState,
    pub to_state: AttentionState,
    pub at: DateTime<Utc>,
    pub confidence: f64,
    /// Primary label → number of buffered samples it was primary in.
    pub evidence: BTreeMap<String, u32>,
    pub trigger: TransitionTrigger,
}

impl StateTransition {
    pub fn new(
        session_id: impl Into<String>,
        from_state: AttentionState,
        to_state: AttentionState,
        at: DateTime<Utc>,
        confidence: f64,
        evidence: BTreeMap<String, u32>,
        trigger: TransitionTrigger,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            from_state,
            to_state,
            at,
            confidence,
            evidence,
            trigger,
        }
    }
}

/// Read-only copy of the fusion engine's state for reporting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FocusSnapshot {
    pub state: AttentionState,
    pub entered_at: DateTime<Utc>,
    pub confidence: f64,
    pub history: Vec<ClassificationResult>,
    pub evidence: BTreeMap<String, u32>,
    pub paused: bool,
    pub override_reason: Option<String>,
    pub accepted_samples: u64,
    pub rejected_samples: u64,
    /// Accepted samples that arrived later than the staleness limit.
    pub stale_samples: u64,
}
