use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use rusqlite::{params, Row};

use crate::{
    db::{
        connection::Database,
        helpers::{format_datetime, from_json, parse_datetime, to_json},
    },
    models::{AlertKind, DistractionEvent},
};

fn row_to_event(row: &Row) -> Result<DistractionEvent> {
    let kind: String = row.get("kind")?;
    let started_at: String = row.get("started_at")?;
    let ended_at: String = row.get("ended_at")?;
    let evidence: String = row.get("evidence")?;
    let sample_ids: String = row.get("sample_ids")?;

    Ok(DistractionEvent {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        kind: AlertKind::parse(&kind).ok_or_else(|| anyhow!("unknown alert kind {kind}"))?,
        distraction_type: row.get("distraction_type")?,
        started_at: parse_datetime(&started_at, "started_at")?,
        ended_at: parse_datetime(&ended_at, "ended_at")?,
        duration_secs: row.get("duration_secs")?,
        evidence: from_json::<BTreeMap<String, u32>>(&evidence, "evidence")?,
        sample_ids: from_json::<Vec<String>>(&sample_ids, "sample_ids")?,
        acknowledged: row.get::<_, i64>("acknowledged")? != 0,
    })
}

impl Database {
    pub async fn insert_distraction_event(&self, event: &DistractionEvent) -> Result<()> {
        let record = event.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO distraction_events (id, session_id, kind, distraction_type, started_at, ended_at, duration_secs, evidence, sample_ids, acknowledged)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.id,
                    record.session_id,
                    record.kind.as_str(),
                    record.distraction_type,
                    format_datetime(&record.started_at),
                    format_datetime(&record.ended_at),
                    record.duration_secs,
                    to_json(&record.evidence, "evidence")?,
                    to_json(&record.sample_ids, "sample_ids")?,
                    record.acknowledged as i64,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_events_for_session(&self, session_id: &str) -> Result<Vec<DistractionEvent>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, kind, distraction_type, started_at, ended_at, duration_secs, evidence, sample_ids, acknowledged
                 FROM distraction_events
                 WHERE session_id = ?1
                 ORDER BY started_at ASC",
            )?;
            let mut rows = stmt.query(params![session_id])?;
            let mut events = Vec::new();
            while let Some(row) = rows.next()? {
                events.push(row_to_event(row)?);
            }
            Ok(events)
        })
        .await
    }

    /// Returns false when no event has that id.
    pub async fn acknowledge_event(&self, event_id: &str) -> Result<bool> {
        let event_id = event_id.to_string();
        self.execute(move |conn| {
            let updated = conn.execute(
                "UPDATE distraction_events SET acknowledged = 1 WHERE id = ?1",
                params![event_id],
            )?;
            Ok(updated > 0)
        })
        .await
    }
}
