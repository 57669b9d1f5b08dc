//! Durable hand-off of pipeline records to storage.
//!
//! Producers push into a blocking queue so nothing is dropped; a single
//! writer commits records in order and raises a fatal fault when storage
//! stays unavailable. A captured pair is spooled as [`PersistRecord::Pending`]
//! before it is queued for upload; because the writer is FIFO, that row is
//! always on disk before the sample or drop audit that clears it.

pub mod fault;
pub mod sink;
pub mod writer;

use chrono::{DateTime, Utc};

use crate::models::{
    ClassificationResult, DistractionEvent, DroppedSample, SamplePair, SessionCounts, StateTransition,
};

pub use fault::{spawn_stage, FaultSignal, PipelineFault};
pub use sink::RecordSink;
pub use writer::{PersistHandle, PersistenceWriter, WriterStats};

#[derive(Debug, Clone, PartialEq)]
pub enum PersistRecord {
    /// Write-ahead copy of a captured pair that has no result yet.
    Pending(SamplePair),
    Sample(ClassificationResult),
    Dropped(DroppedSample),
    Transition(StateTransition),
    Event(DistractionEvent),
    Counts {
        session_id: String,
        counts: SessionCounts,
        at: DateTime<Utc>,
    },
}

impl PersistRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            PersistRecord::Pending(_) => "pending-sample",
            PersistRecord::Sample(_) => "sample",
            PersistRecord::Dropped(_) => "dropped-sample",
            PersistRecord::Transition(_) => "transition",
            PersistRecord::Event(_) => "event",
            PersistRecord::Counts { .. } => "session-counts",
        }
    }
}
