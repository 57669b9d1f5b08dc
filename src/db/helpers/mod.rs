use std::convert::TryFrom;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{de::DeserializeOwned, Serialize};

use crate::models::{AttentionState, SessionStatus};

pub fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("value {value} exceeds SQLite INTEGER range"))
}

pub fn to_u64(value: i64, field: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("{field} contains negative value {value}"))
}

/// Fixed-width RFC 3339 so text ordering matches time ordering.
pub fn format_datetime(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_datetime(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("failed to parse {field}"))
}

pub fn parse_optional_datetime(
    value: Option<String>,
    field: &str,
) -> Result<Option<DateTime<Utc>>> {
    match value {
        Some(raw) => parse_datetime(&raw, field).map(Some),
        None => Ok(None),
    }
}

pub fn parse_status(value: &str) -> Result<SessionStatus> {
    match value {
        "Active" => Ok(SessionStatus::Active),
        "Paused" => Ok(SessionStatus::Paused),
        "Completed" => Ok(SessionStatus::Completed),
        "Failed" => Ok(SessionStatus::Failed),
        other => Err(anyhow!("unknown session status {other}")),
    }
}

pub fn parse_state(value: &str, field: &str) -> Result<AttentionState> {
    AttentionState::parse(value).ok_or_else(|| anyhow!("{field} has unknown state {value}"))
}

pub fn to_json<T: Serialize + ?Sized>(value: &T, field: &str) -> Result<String> {
    serde_json::to_string(value).with_context(|| format!("failed to encode {field}"))
}

pub fn from_json<T: DeserializeOwned>(raw: &str, field: &str) -> Result<T> {
    serde_json::from_str(raw).with_context(|| format!("failed to decode {field}"))
}
