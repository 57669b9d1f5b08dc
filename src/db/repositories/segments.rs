use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use rusqlite::{params, Row};

use crate::{
    db::{
        connection::Database,
        helpers::{from_json, parse_state, to_json},
    },
    models::{AnalysisSourceKind, ReconciledSegment},
};

fn row_to_segment(row: &Row) -> Result<ReconciledSegment> {
    let state: String = row.get("state")?;
    let labels: String = row.get("labels")?;
    let sources: String = row.get("sources")?;
    let sources = from_json::<Vec<String>>(&sources, "sources")?
        .iter()
        .map(|raw| {
            AnalysisSourceKind::parse(raw).ok_or_else(|| anyhow!("unknown analysis source {raw}"))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ReconciledSegment {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        start_secs: row.get("start_secs")?,
        end_secs: row.get("end_secs")?,
        state: parse_state(&state, "state")?,
        labels: from_json::<BTreeMap<String, f64>>(&labels, "labels")?,
        confidence: row.get("confidence")?,
        sources,
    })
}

impl Database {
    /// Replaces any earlier reconciliation of the session in one transaction.
    pub async fn replace_segments(
        &self,
        session_id: &str,
        segments: &[ReconciledSegment],
    ) -> Result<()> {
        let session_id = session_id.to_string();
        let segments = segments.to_vec();
        self.transaction(move |tx| {
            tx.execute(
                "DELETE FROM reconciled_segments WHERE session_id = ?1",
                params![session_id],
            )?;

            for segment in &segments {
                let sources: Vec<&str> = segment.sources.iter().map(|s| s.as_str()).collect();
                tx.execute(
                    "INSERT INTO reconciled_segments (id, session_id, start_secs, end_secs, state, labels, confidence, sources)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        segment.id,
                        segment.session_id,
                        segment.start_secs,
                        segment.end_secs,
                        segment.state.as_str(),
                        to_json(&segment.labels, "labels")?,
                        segment.confidence,
                        to_json(&sources, "sources")?,
                    ],
                )?;
            }
            Ok(())
        })
        .await
    }

    pub async fn get_segments_for_session(&self, session_id: &str) -> Result<Vec<ReconciledSegment>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, start_secs, end_secs, state, labels, confidence, sources
                 FROM reconciled_segments
                 WHERE session_id = ?1
                 ORDER BY start_secs ASC",
            )?;
            let mut rows = stmt.query(params![session_id])?;
            let mut segments = Vec::new();
            while let Some(row) = rows.next()? {
                segments.push(row_to_segment(row)?);
            }
            Ok(segments)
        })
        .await
    }
}
