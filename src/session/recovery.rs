use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    classify::{classify_pair, Classifier, RetryPolicy, TokenBucket},
    db::Database,
    models::SessionStatus,
};

/// What to do on startup with samples spooled by an interrupted session.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RecoveryPolicy {
    /// Classify them through the normal retry/fallback path and store the results.
    #[default]
    Resume,
    Discard,
}

/// Classification path used to resume spooled samples.
pub struct ResumeClassifier {
    pub classifier: Arc<dyn Classifier>,
    pub limiter: Arc<TokenBucket>,
    pub policy: RetryPolicy,
    pub fallback_confidence: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    /// Sessions that had not ended cleanly and are now marked Failed.
    pub failed_sessions: Vec<String>,
    pub resumed: usize,
    pub discarded: usize,
    /// Still spooled, e.g. resume was interrupted or no classifier was available.
    pub remaining: usize,
}

const INTERRUPTED_REASON: &str = "session did not end cleanly";

/// Startup pass over whatever a crash or forced shutdown left behind.
pub async fn recover(
    db: &Database,
    policy: RecoveryPolicy,
    resume: Option<&ResumeClassifier>,
    cancel: &CancellationToken,
) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();

    for session in db.get_open_sessions().await? {
        let now = Utc::now();
        warn!(
            "session {} was left {} (last update {}); marking it failed",
            session.id,
            session.status.as_str(),
            session.updated_at
        );
        db.mark_session_status(
            &session.id,
            SessionStatus::Failed,
            Some(session.updated_at),
            Some(INTERRUPTED_REASON.to_string()),
            now,
        )
        .await
        .with_context(|| format!("failed to close interrupted session {}", session.id))?;
        report.failed_sessions.push(session.id);
    }

    let pending = db.get_pending_samples().await?;
    if pending.is_empty() {
        return Ok(report);
    }

    match (policy, resume) {
        (RecoveryPolicy::Discard, _) => {
            report.discarded = db.discard_pending_samples().await?;
            info!("discarded {} spooled samples", report.discarded);
        }
        (RecoveryPolicy::Resume, None) => {
            warn!(
                "{} spooled samples kept; no classifier available to resume them",
                pending.len()
            );
            report.remaining = pending.len();
        }
        (RecoveryPolicy::Resume, Some(resume)) => {
            info!("resuming {} spooled samples", pending.len());
            let total = pending.len();
            for pair in pending {
                if cancel.is_cancelled() {
                    break;
                }
                let result = classify_pair(
                    resume.classifier.as_ref(),
                    &resume.limiter,
                    &resume.policy,
                    cancel,
                    &pair,
                    resume.fallback_confidence,
                )
                .await;
                // Storing the result also removes the spooled pair.
                db.insert_sample(&result)
                    .await
                    .with_context(|| format!("failed to store resumed sample {}", pair.id))?;
                report.resumed += 1;
            }
            report.remaining = total - report.resumed;
        }
    }
    Ok(report)
}
