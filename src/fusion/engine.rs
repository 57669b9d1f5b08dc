use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{Duration, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{DetectorConfig, FusionConfig},
    detector::AlertDetector,
    events::{EventBus, PipelineEvent},
    labels::LabelCatalog,
    models::{AttentionState, ClassificationResult, DistractionEvent, FocusSnapshot, StateTransition},
    persistence::{spawn_stage, FaultSignal, PersistHandle, PersistRecord, PipelineFault},
    queue::BoundedQueue,
    utils::SessionClock,
};
use crate::{log_debug, log_error, log_info};

use super::tracker::{FocusTracker, UpdateOutcome};

const ENABLE_LOGS: bool = true;
const COMMAND_BUFFER: usize = 16;

enum FusionCommand {
    Pause {
        reply: oneshot::Sender<FocusSnapshot>,
    },
    Resume {
        reply: oneshot::Sender<FocusSnapshot>,
    },
    Override {
        target: AttentionState,
        reason: String,
        reply: oneshot::Sender<FocusSnapshot>,
    },
}

/// Control surface of a running fusion engine.
#[derive(Clone)]
pub struct FusionHandle {
    commands: mpsc::Sender<FusionCommand>,
    snapshot: watch::Receiver<FocusSnapshot>,
}

impl FusionHandle {
    async fn request(
        &self,
        build: impl FnOnce(oneshot::Sender<FocusSnapshot>) -> FusionCommand,
    ) -> Result<FocusSnapshot> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| anyhow!("fusion engine is not running"))?;
        response
            .await
            .map_err(|_| anyhow!("fusion engine stopped before replying"))
    }

    pub async fn pause(&self) -> Result<FocusSnapshot> {
        self.request(|reply| FusionCommand::Pause { reply }).await
    }

    pub async fn resume(&self) -> Result<FocusSnapshot> {
        self.request(|reply| FusionCommand::Resume { reply }).await
    }

    pub async fn manual_override(
        &self,
        target: AttentionState,
        reason: impl Into<String>,
    ) -> Result<FocusSnapshot> {
        let reason = reason.into();
        self.request(|reply| FusionCommand::Override {
            target,
            reason,
            reply,
        })
        .await
    }

    /// Latest published state; never blocks on the engine.
    pub fn snapshot(&self) -> FocusSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<FocusSnapshot> {
        self.snapshot.clone()
    }
}

pub struct FusionContext {
    pub session_id: String,
    pub fusion: FusionConfig,
    pub detector: DetectorConfig,
    pub catalog: Arc<LabelCatalog>,
    pub input: Arc<BoundedQueue<ClassificationResult>>,
    pub persist: PersistHandle,
    pub events: EventBus,
    pub faults: FaultSignal,
    pub clock: SessionClock,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FusionStats {
    pub accepted: u64,
    pub rejected: u64,
    pub transitions: u64,
    pub alerts: u64,
}

struct FusionEngine {
    ctx: FusionContext,
    tracker: FocusTracker,
    detector: AlertDetector,
    snapshot: watch::Sender<FocusSnapshot>,
    stats: FusionStats,
}

/// Starts the single fusion task of a session.
///
/// The task exits when the input queue is closed and drained, when `cancel`
/// fires, or when persistence is no longer possible. A panic in the engine
/// latches a fault so the session fails instead of running without fusion.
pub fn spawn_fusion(
    ctx: FusionContext,
    cancel: CancellationToken,
) -> (FusionHandle, JoinHandle<FusionStats>) {
    let tracker = FocusTracker::new(
        ctx.session_id.clone(),
        ctx.fusion.clone(),
        ctx.catalog.clone(),
        ctx.clock.started_at(),
    );
    let detector = AlertDetector::new(
        ctx.session_id.clone(),
        ctx.detector.clone(),
        ctx.catalog.clone(),
    );
    let (snapshot_tx, snapshot_rx) = watch::channel(tracker.snapshot());
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
    let faults = ctx.faults.clone();

    let engine = FusionEngine {
        ctx,
        tracker,
        detector,
        snapshot: snapshot_tx,
        stats: FusionStats::default(),
    };
    let task = spawn_stage("fusion", faults, engine.run(commands_rx, cancel));
    (
        FusionHandle {
            commands: commands_tx,
            snapshot: snapshot_rx,
        },
        task,
    )
}

impl FusionEngine {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<FusionCommand>,
        cancel: CancellationToken,
    ) -> FusionStats {
        let tick_every = Duration::from_secs(self.ctx.fusion.tick_secs.max(1));
        let mut ticker = tokio::time::interval(tick_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let input = self.ctx.input.clone();

        log_info!("fusion engine started for session {}", self.ctx.session_id);
        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(command) = commands.recv() => self.handle_command(command).await,
                next = input.pop() => match next {
                    Some(result) => self.on_result(result).await,
                    None => break,
                },
                _ = ticker.tick() => self.on_tick().await,
            };

            if let Err(fault) = step {
                log_error!("fusion engine stopping: {}", fault);
                self.ctx.faults.report(fault);
                break;
            }
            self.snapshot.send_replace(self.tracker.snapshot());
        }

        self.snapshot.send_replace(self.tracker.snapshot());
        log_info!(
            "fusion engine stopped: {} accepted, {} rejected, {} transitions, {} alerts",
            self.stats.accepted,
            self.stats.rejected,
            self.stats.transitions,
            self.stats.alerts
        );
        self.stats
    }

    async fn on_result(&mut self, result: ClassificationResult) -> Result<(), PipelineFault> {
        let now = self.ctx.clock.now();
        let outcome = self.tracker.update(result.clone(), now);
        if matches!(outcome, UpdateOutcome::Rejected(_)) {
            self.stats.rejected += 1;
            return Ok(());
        }
        self.stats.accepted += 1;

        if let Some(alert) = self.detector.on_sample(&result) {
            self.raise(alert).await?;
        }

        match outcome {
            UpdateOutcome::Transitioned(transition) => self.record_transition(transition).await,
            other => {
                log_debug!("sample {} fused: {:?}", result.sample_id, other);
                Ok(())
            }
        }
    }

    async fn handle_command(&mut self, command: FusionCommand) -> Result<(), PipelineFault> {
        let now = self.ctx.clock.now();
        let (transition, reply) = match command {
            FusionCommand::Pause { reply } => (self.tracker.pause(now), reply),
            FusionCommand::Resume { reply } => (self.tracker.resume(now), reply),
            FusionCommand::Override {
                target,
                reason,
                reply,
            } => (self.tracker.manual_override(target, reason, now), reply),
        };
        if let Some(transition) = transition {
            self.record_transition(transition).await?;
        }
        let _ = reply.send(self.tracker.snapshot());
        Ok(())
    }

    async fn on_tick(&mut self) -> Result<(), PipelineFault> {
        match self.detector.poll(self.ctx.clock.now()) {
            Some(alert) => self.raise(alert).await,
            None => Ok(()),
        }
    }

    async fn record_transition(&mut self, transition: StateTransition) -> Result<(), PipelineFault> {
        self.stats.transitions += 1;
        log_info!(
            "session {}: {} -> {} at {} (confidence {:.2}, {})",
            transition.session_id,
            transition.from_state.as_str(),
            transition.to_state.as_str(),
            transition.at,
            transition.confidence,
            transition.trigger.as_str()
        );

        let sample_ids = self
            .tracker
            .history()
            .map(|result| result.sample_id.clone())
            .collect();
        let pattern = self
            .detector
            .on_transition(&transition, sample_ids, self.ctx.clock.now());

        self.ctx
            .persist
            .push(PersistRecord::Transition(transition.clone()))
            .await?;
        self.ctx.events.publish_transition(&transition);

        match pattern {
            Some(alert) => self.raise(alert).await,
            None => Ok(()),
        }
    }

    async fn raise(&mut self, alert: DistractionEvent) -> Result<(), PipelineFault> {
        self.stats.alerts += 1;
        log_info!(
            "{} alert for session {}: {} ({}s)",
            alert.kind.as_str(),
            alert.session_id,
            alert.distraction_type,
            alert.duration_secs
        );
        self.ctx.persist.push(PersistRecord::Event(alert.clone())).await?;
        self.ctx.events.publish(PipelineEvent::DistractionDetected {
            at: alert.ended_at,
            event: alert,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::PersistenceConfig,
        labels::LabelConfig,
        models::{AlertKind, SourceLabels},
        persistence::{PersistenceWriter, RecordSink, WriterStats},
        queue::OverflowPolicy,
    };
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemorySink(Mutex<Vec<PersistRecord>>);

    #[async_trait]
    impl RecordSink for MemorySink {
        async fn commit(&self, record: &PersistRecord) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    struct Harness {
        input: Arc<BoundedQueue<ClassificationResult>>,
        events: EventBus,
        clock: SessionClock,
        sink: Arc<MemorySink>,
        persist: PersistHandle,
        writer: JoinHandle<WriterStats>,
        handle: FusionHandle,
        task: JoinHandle<FusionStats>,
    }

    impl Harness {
        async fn finish(self) -> (FusionStats, Vec<PersistRecord>) {
            self.input.close();
            let stats = self.task.await.unwrap();
            self.persist.queue().close();
            self.writer.await.unwrap();
            let records = self.sink.0.lock().unwrap().clone();
            (stats, records)
        }
    }

    fn harness() -> Harness {
        let sink = Arc::new(MemorySink::default());
        let faults = FaultSignal::new();
        let writer = PersistenceWriter::new(64, sink.clone(), PersistenceConfig::default(), faults.clone());
        let persist = writer.handle();
        let input = Arc::new(BoundedQueue::new("fusion", 16, OverflowPolicy::DropOldest));
        let events = EventBus::new(64);
        let clock = SessionClock::start();
        let ctx = FusionContext {
            session_id: "session".into(),
            fusion: FusionConfig::default(),
            detector: DetectorConfig::default(),
            catalog: Arc::new(LabelCatalog::from_config(&LabelConfig::default()).unwrap()),
            input: input.clone(),
            persist: persist.clone(),
            events: events.clone(),
            faults,
            clock,
        };
        let (handle, task) = spawn_fusion(ctx, CancellationToken::new());
        Harness {
            input,
            events,
            clock,
            sink,
            persist,
            writer: writer.spawn(),
            handle,
            task,
        }
    }

    fn result(id: &str, captured_at: DateTime<Utc>, camera: &str) -> ClassificationResult {
        ClassificationResult {
            sample_id: id.into(),
            session_id: "session".into(),
            captured_at,
            processed_at: captured_at,
            latency_ms: 0,
            camera: SourceLabels::single(camera, 0.9),
            screen: None,
            fallback: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn distraction_transitions_and_raises_sustained_alert() {
        let h = harness();
        let mut events = h.events.subscribe();

        h.input
            .push(result("s1", h.clock.now(), "PhoneLikely"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.handle.snapshot().state, AttentionState::Distracted);

        let (stats, records) = h.finish().await;
        assert_eq!(stats.transitions, 1);
        assert_eq!(stats.alerts, 1);

        let alert = records
            .iter()
            .find_map(|record| match record {
                PersistRecord::Event(event) => Some(event.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(alert.kind, AlertKind::Sustained);
        assert_eq!(alert.distraction_type, "PhoneLikely");

        let mut names = Vec::new();
        while let Ok(event) = events.try_recv() {
            names.push(event.name());
        }
        assert_eq!(names, vec!["state-changed", "distraction-detected"]);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_holds_break_until_resume() {
        let h = harness();

        let paused = h.handle.pause().await.unwrap();
        assert_eq!(paused.state, AttentionState::Break);
        assert!(paused.paused);

        tokio::time::sleep(Duration::from_secs(5)).await;
        h.input
            .push(result("s1", h.clock.now(), "PhoneLikely"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.handle.snapshot().state, AttentionState::Break);

        let resumed = h.handle.resume().await.unwrap();
        assert_eq!(resumed.state, AttentionState::Focused);
        assert_eq!(resumed.confidence, 0.3);

        let (stats, records) = h.finish().await;
        assert_eq!(stats.transitions, 2);
        let transitions = records
            .iter()
            .filter(|record| matches!(record, PersistRecord::Transition(_)))
            .count();
        assert_eq!(transitions, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_override_suppresses_votes() {
        let h = harness();
        let snapshot = h
            .handle
            .manual_override(AttentionState::Absent, "stepped out")
            .await
            .unwrap();
        assert_eq!(snapshot.state, AttentionState::Absent);
        assert_eq!(snapshot.override_reason.as_deref(), Some("stepped out"));

        tokio::time::sleep(Duration::from_secs(1)).await;
        h.input
            .push(result("s1", h.clock.now(), "Focused"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.handle.snapshot().state, AttentionState::Absent);

        let (stats, _) = h.finish().await;
        assert_eq!(stats.accepted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_order_results_are_counted_as_rejected() {
        let h = harness();
        let now = h.clock.now();
        h.input.push(result("s2", now, "Focused")).await.unwrap();
        h.input
            .push(result("s1", now - chrono::Duration::seconds(30), "Focused"))
            .await
            .unwrap();

        let (stats, _) = h.finish().await;
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn commands_fail_after_engine_stops() {
        let h = harness();
        let handle = h.handle.clone();
        h.finish().await;
        assert!(handle.pause().await.is_err());
    }
}
