use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use rusqlite::{params, Row};

use crate::{
    db::{
        connection::Database,
        helpers::{format_datetime, from_json, parse_datetime, parse_state, to_json},
    },
    models::{StateTransition, TransitionTrigger},
};

fn parse_trigger(kind: &str, reason: Option<String>) -> Result<TransitionTrigger> {
    match kind {
        "vote" => Ok(TransitionTrigger::Vote),
        "pause" => Ok(TransitionTrigger::Pause),
        "resume" => Ok(TransitionTrigger::Resume),
        "manualOverride" => Ok(TransitionTrigger::ManualOverride {
            reason: reason.unwrap_or_default(),
        }),
        other => Err(anyhow!("unknown transition trigger {other}")),
    }
}

fn row_to_transition(row: &Row) -> Result<StateTransition> {
    let from_state: String = row.get("from_state")?;
    let to_state: String = row.get("to_state")?;
    let at: String = row.get("at")?;
    let evidence: String = row.get("evidence")?;
    let trigger_kind: String = row.get("trigger_kind")?;

    Ok(StateTransition {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        from_state: parse_state(&from_state, "from_state")?,
        to_state: parse_state(&to_state, "to_state")?,
        at: parse_datetime(&at, "at")?,
        confidence: row.get("confidence")?,
        evidence: from_json::<BTreeMap<String, u32>>(&evidence, "evidence")?,
        trigger: parse_trigger(&trigger_kind, row.get("reason")?)?,
    })
}

impl Database {
    pub async fn insert_transition(&self, transition: &StateTransition) -> Result<()> {
        let record = transition.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO state_transitions (id, session_id, from_state, to_state, at, confidence, evidence, trigger_kind, reason)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.id,
                    record.session_id,
                    record.from_state.as_str(),
                    record.to_state.as_str(),
                    format_datetime(&record.at),
                    record.confidence,
                    to_json(&record.evidence, "evidence")?,
                    record.trigger.as_str(),
                    record.trigger.reason(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_transitions_for_session(&self, session_id: &str) -> Result<Vec<StateTransition>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, from_state, to_state, at, confidence, evidence, trigger_kind, reason
                 FROM state_transitions
                 WHERE session_id = ?1
                 ORDER BY at ASC, rowid ASC",
            )?;
            let mut rows = stmt.query(params![session_id])?;
            let mut transitions = Vec::new();
            while let Some(row) = rows.next()? {
                transitions.push(row_to_transition(row)?);
            }
            Ok(transitions)
        })
        .await
    }
}
