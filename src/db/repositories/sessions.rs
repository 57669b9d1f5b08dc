use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::{
    db::{
        connection::Database,
        helpers::{format_datetime, parse_datetime, parse_optional_datetime, parse_status, to_i64, to_u64},
    },
    models::{Session, SessionCounts, SessionStatus},
};

const SESSION_COLUMNS: &str = "id, started_at, ended_at, sample_interval_secs, status, samples_captured, samples_dropped, overruns, failure_reason, created_at, updated_at";

fn row_to_session(row: &Row) -> Result<Session> {
    let started_at: String = row.get("started_at")?;
    let ended_at: Option<String> = row.get("ended_at")?;
    let status: String = row.get("status")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(Session {
        id: row.get("id")?,
        started_at: parse_datetime(&started_at, "started_at")?,
        ended_at: parse_optional_datetime(ended_at, "ended_at")?,
        sample_interval_secs: to_u64(row.get("sample_interval_secs")?, "sample_interval_secs")?,
        status: parse_status(&status)?,
        samples_captured: to_u64(row.get("samples_captured")?, "samples_captured")?,
        samples_dropped: to_u64(row.get("samples_dropped")?, "samples_dropped")?,
        overruns: to_u64(row.get("overruns")?, "overruns")?,
        failure_reason: row.get("failure_reason")?,
        created_at: parse_datetime(&created_at, "created_at")?,
        updated_at: parse_datetime(&updated_at, "updated_at")?,
    })
}

impl Database {
    pub async fn insert_session(&self, session: &Session) -> Result<()> {
        let record = session.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO sessions (id, started_at, ended_at, sample_interval_secs, status, samples_captured, samples_dropped, overruns, failure_reason, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    record.id,
                    format_datetime(&record.started_at),
                    record.ended_at.as_ref().map(format_datetime),
                    to_i64(record.sample_interval_secs)?,
                    record.status.as_str(),
                    to_i64(record.samples_captured)?,
                    to_i64(record.samples_dropped)?,
                    to_i64(record.overruns)?,
                    record.failure_reason,
                    format_datetime(&record.created_at),
                    format_datetime(&record.updated_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"
            ))?;
            let row = stmt
                .query_row(params![session_id], |row| Ok(row_to_session(row)))
                .optional()?;
            row.transpose()
        })
        .await
    }

    pub async fn update_session_counts(
        &self,
        session_id: &str,
        counts: SessionCounts,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE sessions
                 SET samples_captured = ?1,
                     samples_dropped = ?2,
                     overruns = ?3,
                     updated_at = ?4
                 WHERE id = ?5",
                params![
                    to_i64(counts.samples_captured)?,
                    to_i64(counts.samples_dropped)?,
                    to_i64(counts.overruns)?,
                    format_datetime(&updated_at),
                    session_id,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn mark_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        ended_at: Option<DateTime<Utc>>,
        failure_reason: Option<String>,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE sessions
                 SET status = ?1,
                     ended_at = COALESCE(?2, ended_at),
                     failure_reason = COALESCE(?3, failure_reason),
                     updated_at = ?4
                 WHERE id = ?5",
                params![
                    status.as_str(),
                    ended_at.as_ref().map(format_datetime),
                    failure_reason,
                    format_datetime(&updated_at),
                    session_id,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Sessions that never reached Completed or Failed.
    pub async fn get_open_sessions(&self) -> Result<Vec<Session>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions
                 WHERE status IN ('Active', 'Paused')
                 ORDER BY started_at DESC"
            ))?;

            let mut rows = stmt.query([])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_session(row)?);
            }
            Ok(sessions)
        })
        .await
    }
}
