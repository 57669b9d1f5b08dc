use std::future::Future;

use log::error;
use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle};

/// Errors that cross a stage boundary. Any of them ends the session as Failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineFault {
    #[error("persisting {record} failed after {attempts} attempts: {message}")]
    PersistenceFailed {
        record: &'static str,
        attempts: u32,
        message: String,
    },
    #[error("all classification workers exited unexpectedly")]
    WorkerPoolExhausted,
    #[error("{0} queue closed while the pipeline was running")]
    QueueClosed(&'static str),
    #[error("{0} task crashed")]
    StageCrashed(&'static str),
}

/// First-fault-wins latch shared by every stage of one session.
#[derive(Clone)]
pub struct FaultSignal {
    sender: watch::Sender<Option<PipelineFault>>,
}

impl Default for FaultSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultSignal {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self { sender }
    }

    /// Records `fault` unless an earlier one is already latched.
    pub fn report(&self, fault: PipelineFault) -> bool {
        self.sender.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(fault);
            true
        })
    }

    pub fn current(&self) -> Option<PipelineFault> {
        self.sender.borrow().clone()
    }

    /// Resolves once a fault is latched.
    pub async fn wait(&self) -> PipelineFault {
        let mut receiver = self.sender.subscribe();
        loop {
            if let Some(fault) = receiver.borrow_and_update().clone() {
                return fault;
            }
            if receiver.changed().await.is_err() {
                // Unreachable while `self` holds the sender.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Spawns one pipeline stage. A panic inside it is latched as
/// [`PipelineFault::StageCrashed`] and the stage yields `T::default()`.
pub fn spawn_stage<F>(stage: &'static str, faults: FaultSignal, task: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Default + Send + 'static,
{
    let inner = tokio::spawn(task);
    tokio::spawn(async move {
        match inner.await {
            Ok(output) => output,
            Err(err) => {
                if err.is_panic() {
                    error!("{stage} task panicked");
                    faults.report(PipelineFault::StageCrashed(stage));
                }
                <F::Output as Default>::default()
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn first_fault_wins() {
        let signal = FaultSignal::new();
        assert!(signal.report(PipelineFault::WorkerPoolExhausted));
        assert!(!signal.report(PipelineFault::QueueClosed("fusion")));
        assert_eq!(signal.current(), Some(PipelineFault::WorkerPoolExhausted));
    }

    #[tokio::test]
    async fn waiters_wake_on_report() {
        let signal = FaultSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.report(PipelineFault::QueueClosed("persistence"));
        assert_eq!(waiter.await.unwrap(), PipelineFault::QueueClosed("persistence"));
    }

    #[tokio::test]
    async fn panicking_stage_latches_a_fault() {
        let signal = FaultSignal::new();
        let task = spawn_stage("fusion", signal.clone(), async {
            let spans: Vec<u64> = Vec::new();
            spans[0]
        });
        assert_eq!(task.await.unwrap(), 0);
        assert_eq!(signal.current(), Some(PipelineFault::StageCrashed("fusion")));
    }

    #[tokio::test]
    async fn finished_stage_returns_its_output() {
        let signal = FaultSignal::new();
        let task = spawn_stage("writer", signal.clone(), async { 3_u64 });
        assert_eq!(task.await.unwrap(), 3);
        assert!(signal.current().is_none());
    }
}
