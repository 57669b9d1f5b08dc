use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum AlertKind {
    /// Distracted state held past the grace period.
    Sustained,
    /// Too many Distracted transitions in the trailing pattern window.
    Pattern,
    /// Absence/fatigue votes dominating the trailing ergonomic window.
    Ergonomic,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Sustained => "sustained",
            AlertKind::Pattern => "pattern",
            AlertKind::Ergonomic => "ergonomic",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sustained" => Some(AlertKind::Sustained),
            "pattern" => Some(AlertKind::Pattern),
            "ergonomic" => Some(AlertKind::Ergonomic),
            _ => None,
        }
    }
}

/// A user-facing alert. Only `acknowledged` may change after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DistractionEvent {
    pub id: String,
    pub session_id: String,
    pub kind: AlertKind,
    /// Dominant evidence label, e.g. `PhoneLikely`, or a rule name for window rules.
    pub distraction_type: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: i64,
    pub evidence: BTreeMap<String, u32>,
    pub sample_ids: Vec<String>,
    pub acknowledged: bool,
}

impl DistractionEvent {
    pub fn new(
        session_id: impl Into<String>,
        kind: AlertKind,
        distraction_type: impl Into<String>,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        evidence: BTreeMap<String, u32>,
        sample_ids: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            kind,
            distraction_type: distraction_type.into(),
            started_at,
            ended_at,
            duration_secs: (ended_at - started_at).num_seconds().max(0),
            evidence,
            sample_ids,
            acknowledged: false,
        }
    }
}
