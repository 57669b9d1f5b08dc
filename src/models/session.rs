use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "Active",
            SessionStatus::Paused => "Paused",
            SessionStatus::Completed => "Completed",
            SessionStatus::Failed => "Failed",
        }
    }

    /// Active and Paused sessions are the ones a crash can leave behind.
    pub fn is_open(&self) -> bool {
        matches!(self, SessionStatus::Active | SessionStatus::Paused)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub sample_interval_secs: u64,
    pub status: SessionStatus,
    pub samples_captured: u64,
    pub samples_dropped: u64,
    pub overruns: u64,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn start(sample_interval_secs: u64, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            started_at,
            ended_at: None,
            sample_interval_secs,
            status: SessionStatus::Active,
            samples_captured: 0,
            samples_dropped: 0,
            overruns: 0,
            failure_reason: None,
            created_at: started_at,
            updated_at: started_at,
        }
    }
}

/// Scheduler-maintained counters, written back to the session row.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionCounts {
    pub samples_captured: u64,
    pub samples_dropped: u64,
    pub overruns: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub sample_interval_secs: u64,
    pub samples_captured: u64,
    pub samples_dropped: u64,
}

impl From<Session> for SessionInfo {
    fn from(session: Session) -> Self {
        Self {
            id: session.id,
            started_at: session.started_at,
            ended_at: session.ended_at,
            status: session.status,
            sample_interval_secs: session.sample_interval_secs,
            samples_captured: session.samples_captured,
            samples_dropped: session.samples_dropped,
        }
    }
}
