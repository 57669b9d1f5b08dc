use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;

use crate::{
    config::PersistenceConfig,
    queue::{BoundedQueue, OverflowPolicy},
};
use crate::{log_error, log_info, log_warn};

use super::{spawn_stage, FaultSignal, PersistRecord, PipelineFault, RecordSink};

const ENABLE_LOGS: bool = true;

/// Producer side of the persistence queue.
#[derive(Clone)]
pub struct PersistHandle {
    queue: Arc<BoundedQueue<PersistRecord>>,
}

impl PersistHandle {
    pub fn new(queue: Arc<BoundedQueue<PersistRecord>>) -> Self {
        Self { queue }
    }

    /// Waits for room. Fails only once the writer has given up.
    pub async fn push(&self, record: PersistRecord) -> Result<(), PipelineFault> {
        self.queue
            .push(record)
            .await
            .map(|_| ())
            .map_err(|_| PipelineFault::QueueClosed(self.queue.name()))
    }

    pub fn queue(&self) -> &Arc<BoundedQueue<PersistRecord>> {
        &self.queue
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub committed: u64,
    pub retried: u64,
    /// Records left uncommitted after a fatal fault.
    pub abandoned: u64,
}

pub struct PersistenceWriter {
    queue: Arc<BoundedQueue<PersistRecord>>,
    sink: Arc<dyn RecordSink>,
    config: PersistenceConfig,
    faults: FaultSignal,
}

impl PersistenceWriter {
    pub fn new(
        capacity: usize,
        sink: Arc<dyn RecordSink>,
        config: PersistenceConfig,
        faults: FaultSignal,
    ) -> Self {
        let queue = Arc::new(BoundedQueue::new(
            "persistence",
            capacity,
            OverflowPolicy::Block,
        ));
        Self {
            queue,
            sink,
            config,
            faults,
        }
    }

    pub fn handle(&self) -> PersistHandle {
        PersistHandle::new(self.queue.clone())
    }

    /// Runs until the queue is closed and drained, or a commit fails for good.
    pub fn spawn(self) -> JoinHandle<WriterStats> {
        let faults = self.faults.clone();
        spawn_stage("persistence", faults, self.run())
    }

    async fn run(self) -> WriterStats {
        let mut stats = WriterStats::default();
        let attempts = self.config.commit_attempts.max(1);

        while let Some(record) = self.queue.pop().await {
            let mut attempt = 1;
            loop {
                match self.sink.commit(&record).await {
                    Ok(()) => {
                        stats.committed += 1;
                        break;
                    }
                    Err(err) if attempt < attempts => {
                        log_warn!(
                            "commit of {} failed (attempt {}/{}): {:#}",
                            record.kind(),
                            attempt,
                            attempts,
                            err
                        );
                        stats.retried += 1;
                        let backoff = self.config.commit_backoff_ms * u64::from(attempt);
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                        attempt += 1;
                    }
                    Err(err) => {
                        let fault = PipelineFault::PersistenceFailed {
                            record: record.kind(),
                            attempts,
                            message: format!("{err:#}"),
                        };
                        log_error!("{fault}");
                        self.faults.report(fault);
                        self.queue.close();
                        stats.abandoned = self.queue.drain().len() as u64 + 1;
                        return stats;
                    }
                }
            }
        }

        log_info!(
            "persistence writer drained: {} committed, {} retries",
            stats.committed,
            stats.retried
        );
        stats
    }
}
