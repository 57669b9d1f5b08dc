use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use crate::{
    db::{
        connection::Database,
        helpers::{format_datetime, from_json, parse_datetime, to_i64, to_json, to_u64},
    },
    models::{ClassificationResult, DropStage, DroppedSample, ImageRef, SamplePair, SourceLabels},
};

fn row_to_sample(row: &Row) -> Result<ClassificationResult> {
    let captured_at: String = row.get("captured_at")?;
    let processed_at: String = row.get("processed_at")?;
    let camera: String = row.get("camera_labels")?;
    let screen: Option<String> = row.get("screen_labels")?;

    Ok(ClassificationResult {
        sample_id: row.get("sample_id")?,
        session_id: row.get("session_id")?,
        captured_at: parse_datetime(&captured_at, "captured_at")?,
        processed_at: parse_datetime(&processed_at, "processed_at")?,
        latency_ms: to_u64(row.get("latency_ms")?, "latency_ms")?,
        camera: from_json::<SourceLabels>(&camera, "camera_labels")?,
        screen: screen
            .map(|raw| from_json::<SourceLabels>(&raw, "screen_labels"))
            .transpose()?,
        fallback: row.get::<_, i64>("fallback")? != 0,
    })
}

fn parse_stage(value: &str) -> Result<DropStage> {
    match value {
        "upload" => Ok(DropStage::Upload),
        "fusion" => Ok(DropStage::Fusion),
        other => Err(anyhow!("unknown drop stage {other}")),
    }
}

fn row_to_dropped(row: &Row) -> Result<DroppedSample> {
    let stage: String = row.get("stage")?;
    let captured_at: String = row.get("captured_at")?;
    let dropped_at: String = row.get("dropped_at")?;
    Ok(DroppedSample {
        sample_id: row.get("sample_id")?,
        session_id: row.get("session_id")?,
        stage: parse_stage(&stage)?,
        captured_at: parse_datetime(&captured_at, "captured_at")?,
        dropped_at: parse_datetime(&dropped_at, "dropped_at")?,
    })
}

fn row_to_pending(row: &Row) -> Result<SamplePair> {
    let captured_at: String = row.get("captured_at")?;
    let screen_uri: Option<String> = row.get("screen_uri")?;
    Ok(SamplePair {
        id: row.get("sample_id")?,
        session_id: row.get("session_id")?,
        seq: to_u64(row.get("seq")?, "seq")?,
        captured_at: parse_datetime(&captured_at, "captured_at")?,
        camera: ImageRef::new(row.get::<_, String>("camera_uri")?),
        screen: screen_uri.map(ImageRef::new),
    })
}

fn spool_pending(conn: &Connection, pair: &SamplePair, spooled_at: &DateTime<Utc>) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO pending_samples (sample_id, session_id, seq, captured_at, camera_uri, screen_uri, spooled_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            pair.id,
            pair.session_id,
            to_i64(pair.seq)?,
            format_datetime(&pair.captured_at),
            pair.camera.uri,
            pair.screen.as_ref().map(|screen| screen.uri.as_str()),
            format_datetime(spooled_at),
        ],
    )?;
    Ok(())
}

fn clear_pending(conn: &Connection, sample_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM pending_samples WHERE sample_id = ?1",
        params![sample_id],
    )?;
    Ok(())
}

impl Database {
    /// Stores a classified sample and clears its spooled pair in the same
    /// transaction. Idempotent on `sample_id`, so replaying a recovered
    /// sample is harmless.
    pub async fn insert_sample(&self, result: &ClassificationResult) -> Result<()> {
        let record = result.clone();
        self.transaction(move |tx| {
            tx.execute(
                "INSERT OR IGNORE INTO samples (sample_id, session_id, captured_at, processed_at, latency_ms, camera_labels, screen_labels, camera_primary, screen_primary, fallback)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.sample_id,
                    record.session_id,
                    format_datetime(&record.captured_at),
                    format_datetime(&record.processed_at),
                    to_i64(record.latency_ms)?,
                    to_json(&record.camera, "camera_labels")?,
                    record
                        .screen
                        .as_ref()
                        .map(|labels| to_json(labels, "screen_labels"))
                        .transpose()?,
                    record.camera_primary(),
                    record.screen_primary(),
                    record.fallback as i64,
                ],
            )?;
            clear_pending(tx, &record.sample_id)
        })
        .await
    }

    /// All classified samples of a session, oldest capture first.
    pub async fn get_samples_for_session(&self, session_id: &str) -> Result<Vec<ClassificationResult>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT sample_id, session_id, captured_at, processed_at, latency_ms, camera_labels, screen_labels, fallback
                 FROM samples
                 WHERE session_id = ?1
                 ORDER BY captured_at ASC",
            )?;
            let mut rows = stmt.query(params![session_id])?;
            let mut samples = Vec::new();
            while let Some(row) = rows.next()? {
                samples.push(row_to_sample(row)?);
            }
            Ok(samples)
        })
        .await
    }

    /// Audits a dropped sample. A pair evicted before classification also
    /// leaves the spool here, so it is never resumed after a crash.
    pub async fn insert_dropped_sample(&self, dropped: &DroppedSample) -> Result<()> {
        let record = dropped.clone();
        self.transaction(move |tx| {
            tx.execute(
                "INSERT INTO dropped_samples (sample_id, session_id, stage, captured_at, dropped_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.sample_id,
                    record.session_id,
                    record.stage.as_str(),
                    format_datetime(&record.captured_at),
                    format_datetime(&record.dropped_at),
                ],
            )?;
            clear_pending(tx, &record.sample_id)
        })
        .await
    }

    pub async fn get_dropped_samples(&self, session_id: &str) -> Result<Vec<DroppedSample>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT sample_id, session_id, stage, captured_at, dropped_at
                 FROM dropped_samples
                 WHERE session_id = ?1
                 ORDER BY id ASC",
            )?;
            let mut rows = stmt.query(params![session_id])?;
            let mut dropped = Vec::new();
            while let Some(row) = rows.next()? {
                dropped.push(row_to_dropped(row)?);
            }
            Ok(dropped)
        })
        .await
    }

    /// Write-ahead record of a captured pair, taken before it is queued for
    /// upload. The row lives until the pair's sample or drop audit commits.
    pub async fn insert_pending_sample(&self, pair: &SamplePair, spooled_at: DateTime<Utc>) -> Result<()> {
        let pair = pair.clone();
        self.execute(move |conn| spool_pending(conn, &pair, &spooled_at))
            .await
    }

    /// Spools several pairs in one transaction. Pairs already spooled keep
    /// their original row.
    pub async fn insert_pending_samples(
        &self,
        pairs: &[SamplePair],
        spooled_at: DateTime<Utc>,
    ) -> Result<usize> {
        let pairs = pairs.to_vec();
        self.transaction(move |tx| {
            for pair in &pairs {
                spool_pending(tx, pair, &spooled_at)?;
            }
            Ok(pairs.len())
        })
        .await
    }

    pub async fn get_pending_samples(&self) -> Result<Vec<SamplePair>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT sample_id, session_id, seq, captured_at, camera_uri, screen_uri
                 FROM pending_samples
                 ORDER BY session_id, captured_at ASC",
            )?;
            let mut rows = stmt.query([])?;
            let mut pairs = Vec::new();
            while let Some(row) = rows.next()? {
                pairs.push(row_to_pending(row)?);
            }
            Ok(pairs)
        })
        .await
    }

    pub async fn discard_pending_samples(&self) -> Result<usize> {
        self.execute(|conn| Ok(conn.execute("DELETE FROM pending_samples", [])?))
            .await
    }
}
