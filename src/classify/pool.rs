use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use chrono::Utc;
use tokio::{
    task::{JoinHandle, JoinSet},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    events::{EventBus, PipelineEvent, UploadProgress},
    models::{ClassificationResult, DropStage, DroppedSample, SamplePair, SourceKind},
    persistence::{FaultSignal, PersistHandle, PersistRecord, PipelineFault},
    queue::{BoundedQueue, PushOutcome, QueueClosed},
};
use crate::{log_debug, log_error, log_info, log_warn};

use super::{
    retry::{with_retry, RetryOutcome, RetryPolicy},
    Classification, Classifier, TokenBucket,
};

const ENABLE_LOGS: bool = true;

/// Shared by every worker of one session.
pub struct PoolContext {
    pub classifier: Arc<dyn Classifier>,
    pub limiter: Arc<TokenBucket>,
    pub policy: RetryPolicy,
    pub fallback_confidence: f64,
    pub upload: Arc<BoundedQueue<SamplePair>>,
    pub fusion: Arc<BoundedQueue<ClassificationResult>>,
    pub persist: PersistHandle,
    pub events: EventBus,
    pub faults: FaultSignal,
}

#[derive(Debug, Default)]
pub struct PoolStats {
    processed: AtomicU64,
    fallbacks: AtomicU64,
    fusion_dropped: AtomicU64,
}

impl PoolStats {
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn fallbacks(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    pub fn fusion_dropped(&self) -> u64 {
        self.fusion_dropped.load(Ordering::Relaxed)
    }
}

async fn classify_source(
    classifier: &dyn Classifier,
    limiter: &TokenBucket,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    image: &crate::models::ImageRef,
    kind: SourceKind,
) -> RetryOutcome<Classification> {
    with_retry(policy, limiter, cancel, || async move {
        classifier
            .classify(image, kind)
            .await
            .and_then(Classification::validated)
    })
    .await
}

/// Classifies both images of a pair. Any source that still fails after the
/// retry schedule turns the whole pair into a fallback result.
pub async fn classify_pair(
    classifier: &dyn Classifier,
    limiter: &TokenBucket,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    pair: &SamplePair,
    fallback_confidence: f64,
) -> ClassificationResult {
    let started = Instant::now();
    let camera = classify_source(classifier, limiter, policy, cancel, &pair.camera, SourceKind::Camera);
    let screen = async {
        match &pair.screen {
            Some(image) => {
                Some(classify_source(classifier, limiter, policy, cancel, image, SourceKind::Screen).await)
            }
            None => None,
        }
    };
    let (camera, screen) = tokio::join!(camera, screen);

    let latency_ms = started.elapsed().as_millis() as u64;
    let processed_at = Utc::now();
    let camera = camera.into_result();
    let screen = screen.map(RetryOutcome::into_result).transpose();

    match (camera, screen) {
        (Ok(camera), Ok(screen)) => ClassificationResult::from_pair(
            pair,
            camera.labels,
            screen.map(|screen| screen.labels),
            processed_at,
            latency_ms,
        ),
        (Err(error), _) | (_, Err(error)) => {
            log::warn!(
                "sample {} captured at {} falls back after classifier error: {}",
                pair.id,
                pair.captured_at,
                error
            );
            ClassificationResult::fallback(pair, fallback_confidence, processed_at, latency_ms)
        }
    }
}

async fn process(
    ctx: &PoolContext,
    stats: &PoolStats,
    cancel: &CancellationToken,
    pair: SamplePair,
) -> Result<(), PipelineFault> {
    let result = classify_pair(
        ctx.classifier.as_ref(),
        &ctx.limiter,
        &ctx.policy,
        cancel,
        &pair,
        ctx.fallback_confidence,
    )
    .await;

    stats.processed.fetch_add(1, Ordering::Relaxed);
    if result.fallback {
        stats.fallbacks.fetch_add(1, Ordering::Relaxed);
    }
    log_debug!(
        "sample {} classified in {}ms (fallback: {})",
        result.sample_id,
        result.latency_ms,
        result.fallback
    );

    let session_id = result.session_id.clone();
    ctx.persist.push(PersistRecord::Sample(result.clone())).await?;

    match ctx.fusion.push(result).await {
        Ok(PushOutcome::Accepted) => {}
        Ok(PushOutcome::Evicted(evicted)) => {
            stats.fusion_dropped.fetch_add(1, Ordering::Relaxed);
            log_warn!(
                "fusion queue full; dropped sample {} captured at {}",
                evicted.sample_id,
                evicted.captured_at
            );
            ctx.persist
                .push(PersistRecord::Dropped(DroppedSample {
                    sample_id: evicted.sample_id,
                    session_id: evicted.session_id,
                    stage: DropStage::Fusion,
                    captured_at: evicted.captured_at,
                    dropped_at: Utc::now(),
                }))
                .await?;
        }
        Err(QueueClosed(_)) => return Err(PipelineFault::QueueClosed(ctx.fusion.name())),
    }

    ctx.events.publish(PipelineEvent::UploadProgress {
        at: Utc::now(),
        progress: UploadProgress {
            session_id,
            processed: stats.processed(),
            fallbacks: stats.fallbacks(),
            queue_depth: ctx.upload.len(),
        },
    });
    Ok(())
}

async fn run_worker(
    id: usize,
    ctx: Arc<PoolContext>,
    stats: Arc<PoolStats>,
    cancel: CancellationToken,
) {
    log_info!("classification worker {} started", id);
    loop {
        let pair = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = ctx.upload.pop() => match next {
                Some(pair) => pair,
                None => break,
            },
        };

        // The popped item is always finished, even if cancellation arrives meanwhile.
        if let Err(fault) = process(&ctx, &stats, &cancel, pair).await {
            log_error!("classification worker {} stopping: {}", id, fault);
            ctx.faults.report(fault);
            break;
        }
    }
    log_info!("classification worker {} stopped", id);
}

async fn supervise(mut workers: JoinSet<()>, ctx: Arc<PoolContext>, cancel: CancellationToken) {
    let mut alive = workers.len();
    while let Some(joined) = workers.join_next().await {
        alive -= 1;
        if let Err(err) = joined {
            if err.is_panic() {
                log_error!("classification worker panicked; {} still running", alive);
            }
        }
        if alive == 0 && !cancel.is_cancelled() && !ctx.upload.is_closed() {
            ctx.faults.report(PipelineFault::WorkerPoolExhausted);
        }
    }
}

/// Fixed-size pool draining the upload queue.
pub struct WorkerPool {
    supervisor: JoinHandle<()>,
    stats: Arc<PoolStats>,
    size: usize,
}

impl WorkerPool {
    /// Workers stop when `cancel` fires (after their current item) or when
    /// the upload queue is closed and empty.
    pub fn spawn(size: usize, ctx: Arc<PoolContext>, cancel: CancellationToken) -> Self {
        let size = size.max(1);
        let stats = Arc::new(PoolStats::default());
        let mut workers = JoinSet::new();
        for id in 0..size {
            workers.spawn(run_worker(id, ctx.clone(), stats.clone(), cancel.clone()));
        }
        let supervisor = tokio::spawn(supervise(workers, ctx, cancel));
        Self {
            supervisor,
            stats,
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        self.stats.clone()
    }

    /// Waits for every worker to exit.
    pub async fn join(self) {
        if let Err(err) = self.supervisor.await {
            log_error!("worker pool supervisor failed: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::PersistenceConfig,
        models::{ImageRef, SourceLabels},
        persistence::{PersistenceWriter, RecordSink},
        queue::OverflowPolicy,
        classify::ClassifyError,
    };
    use async_trait::async_trait;
    use std::{collections::HashSet, sync::Mutex, time::Duration};

    struct ScriptedClassifier {
        fail_uri: Option<String>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Classifier for ScriptedClassifier {
        async fn classify(&self, image: &ImageRef, kind: SourceKind) -> Result<Classification, ClassifyError> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            self.seen.lock().unwrap().push(image.uri.clone());
            if self.fail_uri.as_deref() == Some(image.uri.as_str()) {
                return Err(ClassifyError::Server(503));
            }
            let label = match kind {
                SourceKind::Camera => "Focused",
                SourceKind::Screen => "Code",
            };
            Ok(Classification {
                labels: SourceLabels::single(label, 0.9),
                primary: Some(label.into()),
            })
        }
    }

    #[derive(Default)]
    struct MemorySink(Mutex<Vec<PersistRecord>>);

    #[async_trait]
    impl RecordSink for MemorySink {
        async fn commit(&self, record: &PersistRecord) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    fn pair(seq: u64) -> SamplePair {
        SamplePair::new(
            "session",
            seq,
            Utc::now(),
            ImageRef::new(format!("camera-{seq}.jpg")),
            Some(ImageRef::new(format!("screen-{seq}.png"))),
        )
    }

    struct Harness {
        ctx: Arc<PoolContext>,
        sink: Arc<MemorySink>,
        writer: JoinHandle<crate::persistence::WriterStats>,
        classifier: Arc<ScriptedClassifier>,
    }

    fn harness(fail_uri: Option<&str>, fusion_capacity: usize) -> Harness {
        let classifier = Arc::new(ScriptedClassifier {
            fail_uri: fail_uri.map(str::to_string),
            seen: Mutex::new(Vec::new()),
        });
        let sink = Arc::new(MemorySink::default());
        let faults = FaultSignal::new();
        let writer = PersistenceWriter::new(64, sink.clone(), PersistenceConfig::default(), faults.clone());
        let persist = writer.handle();
        let ctx = Arc::new(PoolContext {
            classifier: classifier.clone(),
            limiter: Arc::new(TokenBucket::new(100, 100.0)),
            policy: RetryPolicy::from_secs(&[1, 5, 15]),
            fallback_confidence: 0.2,
            upload: Arc::new(BoundedQueue::new("upload", 16, OverflowPolicy::DropOldest)),
            fusion: Arc::new(BoundedQueue::new("fusion", fusion_capacity, OverflowPolicy::DropOldest)),
            persist,
            events: EventBus::new(16),
            faults,
        });
        Harness {
            ctx,
            sink,
            writer: writer.spawn(),
            classifier,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn every_sample_is_classified_exactly_once() {
        let h = harness(None, 16);
        for seq in 1..=6 {
            h.ctx.upload.push(pair(seq)).await.unwrap();
        }
        h.ctx.upload.close();

        let pool = WorkerPool::spawn(3, h.ctx.clone(), CancellationToken::new());
        let stats = pool.stats();
        pool.join().await;

        assert_eq!(stats.processed(), 6);
        let seen = h.classifier.seen.lock().unwrap().clone();
        let unique: HashSet<_> = seen.iter().collect();
        assert_eq!(seen.len(), 12);
        assert_eq!(unique.len(), 12);

        h.ctx.fusion.close();
        let mut ids = HashSet::new();
        while let Some(result) = h.ctx.fusion.pop().await {
            assert!(ids.insert(result.sample_id));
        }
        assert_eq!(ids.len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_yield_fallback_and_pipeline_continues() {
        let h = harness(Some("camera-1.jpg"), 16);
        h.ctx.upload.push(pair(1)).await.unwrap();
        h.ctx.upload.push(pair(2)).await.unwrap();
        h.ctx.upload.close();

        let pool = WorkerPool::spawn(1, h.ctx.clone(), CancellationToken::new());
        let stats = pool.stats();
        pool.join().await;

        assert_eq!(stats.processed(), 2);
        assert_eq!(stats.fallbacks(), 1);
        let first = h.ctx.fusion.pop().await.unwrap();
        assert!(first.fallback);
        assert_eq!(first.camera_primary(), Some("Uncertain"));
        let second = h.ctx.fusion.pop().await.unwrap();
        assert!(!second.fallback);

        let attempts = h
            .classifier
            .seen
            .lock()
            .unwrap()
            .iter()
            .filter(|uri| uri.as_str() == "camera-1.jpg")
            .count();
        assert_eq!(attempts, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn fusion_overflow_is_audited() {
        let h = harness(None, 1);
        for seq in 1..=3 {
            h.ctx.upload.push(pair(seq)).await.unwrap();
        }
        h.ctx.upload.close();

        let pool = WorkerPool::spawn(1, h.ctx.clone(), CancellationToken::new());
        let stats = pool.stats();
        pool.join().await;
        h.ctx.persist.queue().close();
        h.writer.await.unwrap();

        assert_eq!(stats.fusion_dropped(), 2);
        let records = h.sink.0.lock().unwrap();
        let dropped = records
            .iter()
            .filter(|record| matches!(record, PersistRecord::Dropped(d) if d.stage == DropStage::Fusion))
            .count();
        let samples = records
            .iter()
            .filter(|record| matches!(record, PersistRecord::Sample(_)))
            .count();
        assert_eq!(dropped, 2);
        assert_eq!(samples, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_finishes_in_flight_item() {
        let h = harness(None, 16);
        for seq in 1..=4 {
            h.ctx.upload.push(pair(seq)).await.unwrap();
        }
        let cancel = CancellationToken::new();
        let pool = WorkerPool::spawn(1, h.ctx.clone(), cancel.clone());
        let stats = pool.stats();

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        pool.join().await;

        assert_eq!(stats.processed(), 1);
        assert_eq!(h.ctx.upload.len(), 3);
    }
}
