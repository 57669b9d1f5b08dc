use anyhow::Result;
use async_trait::async_trait;

use crate::db::Database;

use super::PersistRecord;

/// Storage seam for the persistence writer. Each commit is atomic per record.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn commit(&self, record: &PersistRecord) -> Result<()>;
}

#[async_trait]
impl RecordSink for Database {
    async fn commit(&self, record: &PersistRecord) -> Result<()> {
        match record {
            PersistRecord::Pending(pair) => self.insert_pending_sample(pair, pair.captured_at).await,
            PersistRecord::Sample(result) => self.insert_sample(result).await,
            PersistRecord::Dropped(dropped) => self.insert_dropped_sample(dropped).await,
            PersistRecord::Transition(transition) => self.insert_transition(transition).await,
            PersistRecord::Event(event) => self.insert_distraction_event(event).await,
            PersistRecord::Counts {
                session_id,
                counts,
                at,
            } => self.update_session_counts(session_id, *counts, *at).await,
        }
    }
}
