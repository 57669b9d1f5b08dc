//! Classification of sample images through an external, rate-limited service.

pub mod http;
pub mod pool;
pub mod rate_limit;
pub mod retry;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{ImageRef, SourceKind, SourceLabels};

pub use http::HttpClassifier;
pub use pool::{classify_pair, PoolContext, PoolStats, WorkerPool};
pub use rate_limit::TokenBucket;
pub use retry::{with_retry, RetryOutcome, RetryPolicy};

/// Labels for one image plus the service's own pick, if it gave one.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub labels: SourceLabels,
    pub primary: Option<String>,
}

impl Classification {
    /// Rejects responses that carry nothing usable.
    pub fn validated(self) -> Result<Self, ClassifyError> {
        if self.labels.is_empty() {
            return Err(ClassifyError::ParseError("response has no labels".into()));
        }
        if let Some(primary) = &self.primary {
            if self.labels.get(primary).is_none() {
                return Err(ClassifyError::ParseError(format!(
                    "primary label {primary} missing from labels"
                )));
            }
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClassifyError {
    #[error("rate limited by classifier")]
    RateLimited { retry_after: Option<Duration> },
    #[error("classifier request timed out")]
    Timeout,
    #[error("classifier returned server error {0}")]
    Server(u16),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unparseable classifier response: {0}")]
    ParseError(String),
    #[error("classifier rejected request: {0}")]
    Rejected(String),
}

impl ClassifyError {
    /// Worth another attempt after backing off.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClassifyError::RateLimited { .. }
                | ClassifyError::Timeout
                | ClassifyError::Server(_)
                | ClassifyError::Transport(_)
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ClassifyError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// The external vision classifier.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, image: &ImageRef, kind: SourceKind) -> Result<Classification, ClassifyError>;
}
