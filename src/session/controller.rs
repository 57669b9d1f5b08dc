use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use log::{error, info, warn};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    analysis::{fetch_analyses, AnalysisSource},
    classify::{Classifier, PoolContext, RetryPolicy, TokenBucket, WorkerPool},
    config::VigilConfig,
    db::Database,
    events::{EventBus, PipelineEvent},
    fusion::{spawn_fusion, FusionContext, FusionHandle, FusionStats},
    labels::LabelCatalog,
    models::{
        AttentionState, ClassificationResult, EmotionTimeline, FocusSnapshot, PatternSummary,
        ReconciledSegment, SamplePair, Session, SessionCounts, SessionInfo, SessionStatus,
    },
    persistence::{FaultSignal, PersistHandle, PersistenceWriter, PipelineFault, RecordSink, WriterStats},
    queue::{BoundedQueue, OverflowPolicy},
    reconcile::{reconcile, ReconcileInput},
    scheduler::{CaptureScheduler, FrameSource, SchedulerContext},
    utils::SessionClock,
};

use super::recovery::{self, RecoveryReport, ResumeClassifier};

const SHUTDOWN_REASON: &str = "interrupted by shutdown";

/// Everything owned by the session that is currently running.
struct RunningSession {
    session: Session,
    clock: SessionClock,
    cancel: CancellationToken,
    scheduler: CaptureScheduler,
    upload: Arc<BoundedQueue<SamplePair>>,
    fusion_queue: Arc<BoundedQueue<ClassificationResult>>,
    pool: WorkerPool,
    fusion: FusionHandle,
    fusion_task: JoinHandle<FusionStats>,
    persist: PersistHandle,
    writer_task: JoinHandle<WriterStats>,
    faults: FaultSignal,
    fault_watch: JoinHandle<()>,
}

/// How the pipeline of a session is being brought down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    /// Every queued sample is classified, fused and committed.
    Drain,
    /// In-flight items finish; samples still waiting for upload stay spooled.
    Abort,
}

#[derive(Clone)]
pub struct SessionController {
    config: Arc<VigilConfig>,
    db: Database,
    sink: Arc<dyn RecordSink>,
    classifier: Arc<dyn Classifier>,
    source: Arc<dyn FrameSource>,
    catalog: Arc<LabelCatalog>,
    events: EventBus,
    running: Arc<Mutex<Option<RunningSession>>>,
}

impl SessionController {
    pub fn new(
        config: VigilConfig,
        db: Database,
        classifier: Arc<dyn Classifier>,
        source: Arc<dyn FrameSource>,
    ) -> Result<Self> {
        let sink: Arc<dyn RecordSink> = Arc::new(db.clone());
        Self::with_sink(config, db, sink, classifier, source)
    }

    /// Like [`SessionController::new`] but commits pipeline records to `sink`.
    pub fn with_sink(
        config: VigilConfig,
        db: Database,
        sink: Arc<dyn RecordSink>,
        classifier: Arc<dyn Classifier>,
        source: Arc<dyn FrameSource>,
    ) -> Result<Self> {
        config.validate().context("invalid pipeline configuration")?;
        let catalog = Arc::new(LabelCatalog::from_config(&config.labels)?);
        let events = EventBus::new(config.queues.event_capacity);
        Ok(Self {
            config: Arc::new(config),
            db,
            sink,
            classifier,
            source,
            catalog,
            events,
            running: Arc::new(Mutex::new(None)),
        })
    }

    pub fn config(&self) -> &VigilConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub async fn start_session(&self) -> Result<SessionInfo> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(anyhow!("a session is already running"));
        }

        let config = &self.config;
        let clock = SessionClock::start();
        let session = Session::start(config.scheduler.sample_interval_secs, clock.started_at());
        self.db
            .insert_session(&session)
            .await
            .context("failed to create session")?;

        let cancel = CancellationToken::new();
        let faults = FaultSignal::new();
        let upload = Arc::new(BoundedQueue::new(
            "upload",
            config.queues.upload_capacity,
            OverflowPolicy::DropOldest,
        ));
        let fusion_queue = Arc::new(BoundedQueue::new(
            "fusion",
            config.queues.fusion_capacity,
            OverflowPolicy::DropOldest,
        ));

        let writer = PersistenceWriter::new(
            config.queues.persistence_capacity,
            self.sink.clone(),
            config.persistence.clone(),
            faults.clone(),
        );
        let persist = writer.handle();
        let writer_task = writer.spawn();

        let (fusion, fusion_task) = spawn_fusion(
            FusionContext {
                session_id: session.id.clone(),
                fusion: config.fusion.clone(),
                detector: config.detector.clone(),
                catalog: self.catalog.clone(),
                input: fusion_queue.clone(),
                persist: persist.clone(),
                events: self.events.clone(),
                faults: faults.clone(),
                clock,
            },
            cancel.clone(),
        );

        let pool = WorkerPool::spawn(
            config.workers.pool_size,
            Arc::new(PoolContext {
                classifier: self.classifier.clone(),
                limiter: Arc::new(TokenBucket::per_minute(
                    config.workers.rate_limit_per_minute,
                    config.workers.rate_limit_burst,
                )),
                policy: RetryPolicy::from_secs(&config.workers.backoff_secs),
                fallback_confidence: config.workers.fallback_confidence,
                upload: upload.clone(),
                fusion: fusion_queue.clone(),
                persist: persist.clone(),
                events: self.events.clone(),
                faults: faults.clone(),
            }),
            cancel.clone(),
        );

        let mut scheduler = CaptureScheduler::new();
        let scheduled = scheduler.start(SchedulerContext {
            session_id: session.id.clone(),
            config: config.scheduler.clone(),
            source: self.source.clone(),
            upload: upload.clone(),
            persist: persist.clone(),
            faults: faults.clone(),
            clock,
        });

        let fault_watch = {
            let controller = self.clone();
            let faults = faults.clone();
            let session_id = session.id.clone();
            tokio::spawn(async move {
                let fault = faults.wait().await;
                controller.fail(&session_id, fault).await;
            })
        };

        let started = RunningSession {
            session: session.clone(),
            clock,
            cancel,
            scheduler,
            upload,
            fusion_queue,
            pool,
            fusion,
            fusion_task,
            persist,
            writer_task,
            faults,
            fault_watch,
        };

        if let Err(err) = scheduled {
            started.fault_watch.abort();
            let reason = format!("{err:#}");
            self.teardown(started, Teardown::Abort, Some(reason)).await;
            return Err(err.context("failed to start capture scheduler"));
        }

        info!(
            "session {} started; sampling every {}s with {} workers",
            session.id,
            session.sample_interval_secs,
            started.pool.size()
        );
        *running = Some(started);
        Ok(session.into())
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn current_session(&self) -> Result<Option<SessionInfo>> {
        let session_id = match self.running.lock().await.as_ref() {
            Some(running) => running.session.id.clone(),
            None => return Ok(None),
        };
        Ok(self.db.get_session(&session_id).await?.map(SessionInfo::from))
    }

    /// Stops sampling and holds the state at Break until [`Self::resume`].
    pub async fn pause(&self) -> Result<FocusSnapshot> {
        let guard = self.running.lock().await;
        let running = guard.as_ref().ok_or_else(|| anyhow!("no session is running"))?;
        running.scheduler.pause();
        let snapshot = running.fusion.pause().await?;
        self.db
            .mark_session_status(&running.session.id, SessionStatus::Paused, None, None, running.clock.now())
            .await?;
        info!("session {} paused", running.session.id);
        Ok(snapshot)
    }

    pub async fn resume(&self) -> Result<FocusSnapshot> {
        let guard = self.running.lock().await;
        let running = guard.as_ref().ok_or_else(|| anyhow!("no session is running"))?;
        let snapshot = running.fusion.resume().await?;
        self.db
            .mark_session_status(&running.session.id, SessionStatus::Active, None, None, running.clock.now())
            .await?;
        running.scheduler.resume();
        info!("session {} resumed", running.session.id);
        Ok(snapshot)
    }

    /// User-declared state. Break holds sampling like [`Self::pause`]; any
    /// other target restarts it like [`Self::resume`].
    pub async fn manual_override(
        &self,
        target: AttentionState,
        reason: impl Into<String>,
    ) -> Result<FocusSnapshot> {
        let guard = self.running.lock().await;
        let running = guard.as_ref().ok_or_else(|| anyhow!("no session is running"))?;
        let holds_break = target == AttentionState::Break;
        if holds_break {
            running.scheduler.pause();
        }
        let snapshot = running.fusion.manual_override(target, reason).await?;
        let status = if holds_break {
            SessionStatus::Paused
        } else {
            SessionStatus::Active
        };
        self.db
            .mark_session_status(&running.session.id, status, None, None, running.clock.now())
            .await?;
        if !holds_break {
            running.scheduler.resume();
        }
        Ok(snapshot)
    }

    /// Latest fusion state, or `None` when no session is running.
    pub async fn snapshot(&self) -> Option<FocusSnapshot> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|running| running.fusion.snapshot())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub async fn acknowledge_event(&self, event_id: &str) -> Result<bool> {
        self.db.acknowledge_event(event_id).await
    }

    /// Graceful end: every sample already captured is classified, fused and
    /// committed before the session is marked Completed.
    pub async fn end_session(&self) -> Result<SessionInfo> {
        let running = self
            .running
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("no session is running"))?;
        running.fault_watch.abort();
        let session_id = running.session.id.clone();

        info!("ending session {}", session_id);
        self.teardown(running, Teardown::Drain, None).await;
        self.load_info(&session_id).await
    }

    /// Forced stop. Samples that never reached a worker keep their spooled
    /// rows for crash recovery to resume on the next start.
    pub async fn shutdown(&self) -> Result<Option<SessionInfo>> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(None);
        };
        running.fault_watch.abort();
        let session_id = running.session.id.clone();

        warn!("shutting down session {} before it ended", session_id);
        self.teardown(running, Teardown::Abort, Some(SHUTDOWN_REASON.to_string()))
            .await;
        self.load_info(&session_id).await.map(Some)
    }

    async fn fail(&self, session_id: &str, fault: PipelineFault) {
        let running = {
            let mut guard = self.running.lock().await;
            match guard.as_ref() {
                Some(running) if running.session.id == session_id => guard.take(),
                _ => None,
            }
        };
        let Some(running) = running else {
            return;
        };

        error!("session {} failed: {}", session_id, fault);
        self.teardown(running, Teardown::Abort, Some(fault.to_string()))
            .await;
    }

    /// Brings every stage down in pipeline order and records the outcome.
    ///
    /// With `Drain` the session ends Completed unless a fault was latched on
    /// the way; otherwise it ends Failed with `reason`.
    async fn teardown(&self, running: RunningSession, mode: Teardown, reason: Option<String>) {
        let RunningSession {
            session,
            clock,
            cancel,
            mut scheduler,
            upload,
            fusion_queue,
            pool,
            fusion: _,
            fusion_task,
            persist,
            writer_task,
            faults,
            fault_watch: _,
        } = running;

        if mode == Teardown::Abort {
            cancel.cancel();
        }

        let counts = scheduler.stats();
        if let Err(err) = scheduler.stop().await {
            warn!("session {}: {:#}", session.id, err);
        }

        upload.close();
        let pool_stats = pool.stats();
        pool.join().await;

        let leftovers = upload.drain();
        if !leftovers.is_empty() {
            warn!(
                "session {}: {} unclassified samples stay spooled for recovery",
                session.id,
                leftovers.len()
            );
        }

        fusion_queue.close();
        match fusion_task.await {
            Ok(stats) => info!(
                "session {} fusion: {} accepted, {} rejected, {} transitions, {} alerts",
                session.id, stats.accepted, stats.rejected, stats.transitions, stats.alerts
            ),
            Err(err) => {
                error!("session {}: fusion task failed: {}", session.id, err);
                faults.report(PipelineFault::StageCrashed("fusion"));
            }
        }

        persist.queue().close();
        let abandoned = match writer_task.await {
            Ok(stats) => stats.abandoned,
            Err(err) => {
                error!("session {}: persistence writer failed: {}", session.id, err);
                1
            }
        };
        if abandoned > 0 {
            error!(
                "session {}: {} records were never committed",
                session.id, abandoned
            );
            // The writer may have given up before their write-ahead rows landed.
            if !leftovers.is_empty() {
                if let Err(err) = self.db.insert_pending_samples(&leftovers, clock.now()).await {
                    error!(
                        "session {}: lost {} unclassified samples: {:#}",
                        session.id,
                        leftovers.len(),
                        err
                    );
                }
            }
        }

        let mut final_counts: SessionCounts = counts.counts();
        final_counts.samples_dropped += pool_stats.fusion_dropped();

        let (status, reason) = match (mode, faults.current()) {
            (_, Some(fault)) => (SessionStatus::Failed, Some(fault.to_string())),
            (Teardown::Drain, None) => (SessionStatus::Completed, None),
            (Teardown::Abort, None) => (SessionStatus::Failed, reason),
        };

        let ended_at = clock.now();
        if let Err(err) = self
            .db
            .update_session_counts(&session.id, final_counts, ended_at)
            .await
        {
            error!("session {}: failed to store final counts: {:#}", session.id, err);
        }
        if let Err(err) = self
            .db
            .mark_session_status(&session.id, status, Some(ended_at), reason, ended_at)
            .await
        {
            error!("session {}: failed to mark {}: {:#}", session.id, status.as_str(), err);
        }

        info!(
            "session {} ended {}: {} captured, {} dropped, {} overruns",
            session.id,
            status.as_str(),
            final_counts.samples_captured,
            final_counts.samples_dropped,
            final_counts.overruns
        );
    }

    async fn load_info(&self, session_id: &str) -> Result<SessionInfo> {
        self.db
            .get_session(session_id)
            .await?
            .map(SessionInfo::from)
            .ok_or_else(|| anyhow!("session {session_id} not found"))
    }

    /// Startup pass over sessions and samples left by an earlier crash.
    /// Refused while a session runs; its open row and spool are live.
    pub async fn recover(&self, cancel: &CancellationToken) -> Result<RecoveryReport> {
        let running = self.running.lock().await;
        if running.is_some() {
            return Err(anyhow!("cannot recover while a session is running"));
        }
        let workers = &self.config.workers;
        let resume = ResumeClassifier {
            classifier: self.classifier.clone(),
            limiter: Arc::new(TokenBucket::per_minute(
                workers.rate_limit_per_minute,
                workers.rate_limit_burst,
            )),
            policy: RetryPolicy::from_secs(&workers.backoff_secs),
            fallback_confidence: workers.fallback_confidence,
        };
        let report =
            recovery::recover(&self.db, self.config.storage.recovery, Some(&resume), cancel).await;
        drop(running);
        report
    }

    /// Builds and stores the segment report of a finished session. Running it
    /// again replaces the earlier segments.
    pub async fn reconcile_session(
        &self,
        session_id: &str,
        emotion: Option<&EmotionTimeline>,
        pattern: Option<&PatternSummary>,
    ) -> Result<Vec<ReconciledSegment>> {
        let session = self
            .db
            .get_session(session_id)
            .await?
            .ok_or_else(|| anyhow!("session {session_id} not found"))?;
        if session.status.is_open() {
            return Err(anyhow!("session {session_id} has not ended yet"));
        }

        let samples = self.db.get_samples_for_session(session_id).await?;
        let transitions = self.db.get_transitions_for_session(session_id).await?;
        let input = ReconcileInput {
            session: &session,
            samples: &samples,
            transitions: &transitions,
            emotion,
            pattern,
        };
        let segments = reconcile(&input, &self.config.reconciliation, &self.catalog);

        self.db
            .replace_segments(session_id, &segments)
            .await
            .with_context(|| format!("failed to store segments of session {session_id}"))?;
        info!(
            "session {} reconciled into {} segments (emotion: {}, pattern: {})",
            session_id,
            segments.len(),
            emotion.is_some(),
            pattern.is_some()
        );
        Ok(segments)
    }

    /// Waits for whichever analysis providers are given, then reconciles.
    pub async fn reconcile_with_sources(
        &self,
        session_id: &str,
        emotion: Option<&dyn AnalysisSource<EmotionTimeline>>,
        pattern: Option<&dyn AnalysisSource<PatternSummary>>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ReconciledSegment>> {
        let schedule = RetryPolicy::from_secs(&self.config.analysis.poll_backoff_secs);
        let analyses = fetch_analyses(emotion, pattern, session_id, &schedule, cancel).await;
        self.reconcile_session(session_id, analyses.emotion.as_ref(), analyses.pattern.as_ref())
            .await
    }
}
