use chrono::{DateTime, TimeDelta, Utc};
use tokio::time::Instant;

/// Wall-clock time derived from a monotonic anchor taken at session start.
///
/// Every stage of a session stamps times through the same clock, so capture
/// and processing timestamps never disagree because of a wall-clock jump.
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    wall: DateTime<Utc>,
    anchor: Instant,
}

impl SessionClock {
    pub fn start() -> Self {
        Self::anchored_at(Utc::now())
    }

    pub fn anchored_at(wall: DateTime<Utc>) -> Self {
        Self {
            wall,
            anchor: Instant::now(),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.wall
    }

    /// Monotonic instant matching `started_at`.
    pub fn anchor(&self) -> Instant {
        self.anchor
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = self.anchor.elapsed();
        chrono::Duration::from_std(elapsed)
            .map(|offset| self.wall + offset)
            .unwrap_or(self.wall)
    }
}

/// Configured whole seconds as a chrono span. Values past chrono's range
/// saturate to `TimeDelta::MAX`.
pub fn span_secs(value: u64) -> TimeDelta {
    i64::try_from(value)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}
