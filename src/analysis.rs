//! Polling for the two late-arriving post-session analyses.
//!
//! Both providers are optional. A provider that never becomes ready, or that
//! keeps failing, yields `None` so reconciliation runs on what is available.

use anyhow::Result;
use async_trait::async_trait;
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::{
    classify::RetryPolicy,
    models::{EmotionTimeline, PatternSummary},
};

#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisPoll<T> {
    Ready(T),
    Pending,
}

/// A remote job that finishes some time after the session ends.
#[async_trait]
pub trait AnalysisSource<T>: Send + Sync {
    /// Short name for logs, e.g. `emotion`.
    fn name(&self) -> &'static str;

    async fn poll(&self, session_id: &str) -> Result<AnalysisPoll<T>>;
}

/// Polls until ready, sleeping on `schedule` between attempts.
pub async fn fetch_when_ready<T>(
    source: &dyn AnalysisSource<T>,
    session_id: &str,
    schedule: &RetryPolicy,
    cancel: &CancellationToken,
) -> Option<T> {
    let mut attempt = 1;
    loop {
        match source.poll(session_id).await {
            Ok(AnalysisPoll::Ready(value)) => {
                info!(
                    "{} analysis for session {} ready after {} poll(s)",
                    source.name(),
                    session_id,
                    attempt
                );
                return Some(value);
            }
            Ok(AnalysisPoll::Pending) => {}
            Err(err) => warn!(
                "{} analysis poll {} for session {} failed: {err:#}",
                source.name(),
                attempt,
                session_id
            ),
        }

        let Some(delay) = schedule.delay_after(attempt) else {
            warn!(
                "{} analysis for session {} not ready after {} poll(s); continuing without it",
                source.name(),
                session_id,
                attempt
            );
            return None;
        };
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionAnalyses {
    pub emotion: Option<EmotionTimeline>,
    pub pattern: Option<PatternSummary>,
}

/// Polls both providers concurrently. A missing provider is simply skipped.
pub async fn fetch_analyses(
    emotion: Option<&dyn AnalysisSource<EmotionTimeline>>,
    pattern: Option<&dyn AnalysisSource<PatternSummary>>,
    session_id: &str,
    schedule: &RetryPolicy,
    cancel: &CancellationToken,
) -> SessionAnalyses {
    let emotion = async {
        match emotion {
            Some(source) => fetch_when_ready(source, session_id, schedule, cancel).await,
            None => None,
        }
    };
    let pattern = async {
        match pattern {
            Some(source) => fetch_when_ready(source, session_id, schedule, cancel).await,
            None => None,
        }
    };
    let (emotion, pattern) = tokio::join!(emotion, pattern);
    SessionAnalyses { emotion, pattern }
}
