use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::{
    sync::watch,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::SchedulerConfig,
    models::{DropStage, DroppedSample, ImageRef, SamplePair, SessionCounts, SourceKind},
    persistence::{FaultSignal, PersistHandle, PersistRecord, PipelineFault},
    queue::{BoundedQueue, PushOutcome},
    utils::SessionClock,
};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

use super::source::FrameSource;

pub struct SchedulerContext {
    pub session_id: String,
    pub config: SchedulerConfig,
    pub source: Arc<dyn FrameSource>,
    pub upload: Arc<BoundedQueue<SamplePair>>,
    pub persist: PersistHandle,
    pub faults: FaultSignal,
    pub clock: SessionClock,
}

#[derive(Debug, Default)]
pub struct SchedulerStats {
    captured: AtomicU64,
    dropped: AtomicU64,
    overruns: AtomicU64,
    skipped: AtomicU64,
}

impl SchedulerStats {
    pub fn counts(&self) -> SessionCounts {
        SessionCounts {
            samples_captured: self.captured.load(Ordering::Relaxed),
            samples_dropped: self.dropped.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
        }
    }

    /// Slots that produced no pair (no camera frame, capture error or timeout).
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

enum SlotOutcome {
    Captured,
    Skipped,
    /// Upload queue closed or persistence gone; the loop must stop.
    Stop,
}

/// Sleeps until `due`, waking at least every `slice` to observe `cancel`.
/// Returns false when cancelled.
async fn wait_until(due: Instant, slice: Duration, cancel: &CancellationToken) -> bool {
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= due {
            return true;
        }
        let nap = (due - now).min(slice);
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(nap) => {}
        }
    }
}

/// Emits one sample pair per slot `start + n * interval` (n = 1, 2, ...).
///
/// Slots are computed from the session anchor, never from the previous
/// capture, so slow captures or a slow pipeline do not shift the cadence.
pub async fn capture_loop(
    ctx: SchedulerContext,
    stats: Arc<SchedulerStats>,
    paused: watch::Receiver<bool>,
    cancel: CancellationToken,
) {
    let interval = Duration::from_secs(ctx.config.sample_interval_secs.max(1));
    let slice = Duration::from_millis(ctx.config.poll_slice_ms.max(1));
    let anchor = ctx.clock.anchor();
    let mut slot: u32 = 1;

    log_info!(
        "capture loop started for session {} (every {}s)",
        ctx.session_id,
        interval.as_secs()
    );

    loop {
        let due = anchor + interval * slot;
        if !wait_until(due, slice, &cancel).await {
            break;
        }

        let lateness = Instant::now().saturating_duration_since(due);
        let overran = lateness > slice;
        if overran {
            stats.overruns.fetch_add(1, Ordering::Relaxed);
            log_warn!(
                "capture slot {} for session {} is {}ms late; capturing now",
                slot,
                ctx.session_id,
                lateness.as_millis()
            );
        }

        if *paused.borrow() {
            log_debug!("slot {} skipped while paused", slot);
        } else {
            match capture_slot(&ctx, &stats, u64::from(slot)).await {
                SlotOutcome::Captured => {}
                SlotOutcome::Skipped => {
                    stats.skipped.fetch_add(1, Ordering::Relaxed);
                }
                SlotOutcome::Stop => break,
            }
        }

        slot = if overran {
            // One late capture stands in for every missed slot; resume at the next future one.
            let elapsed = Instant::now().saturating_duration_since(anchor);
            let next = (elapsed.as_secs_f64() / interval.as_secs_f64()).floor() as u32 + 1;
            next.max(slot + 1)
        } else {
            slot + 1
        };
    }

    log_info!("capture loop for session {} shutting down", ctx.session_id);
}

impl SchedulerContext {
    fn report(&self, fault: PipelineFault) -> SlotOutcome {
        log_error!("capture loop stopping: {}", fault);
        self.faults.report(fault);
        SlotOutcome::Stop
    }
}

async fn capture_frames(
    ctx: &SchedulerContext,
    at: DateTime<Utc>,
) -> Result<Option<(ImageRef, Option<ImageRef>)>> {
    let Some(camera) = ctx
        .source
        .capture(SourceKind::Camera, at)
        .await
        .context("camera capture failed")?
    else {
        return Ok(None);
    };

    let screen = if ctx.config.capture_screen {
        match ctx.source.capture(SourceKind::Screen, at).await {
            Ok(screen) => screen,
            Err(err) => {
                log_warn!("screen capture failed, continuing camera-only: {err:#}");
                None
            }
        }
    } else {
        None
    };
    Ok(Some((camera, screen)))
}

async fn capture_slot(ctx: &SchedulerContext, stats: &SchedulerStats, seq: u64) -> SlotOutcome {
    let captured_at = ctx.clock.now();
    let timeout = Duration::from_secs(ctx.config.capture_timeout_secs.max(1));

    let frames = match tokio::time::timeout(timeout, capture_frames(ctx, captured_at)).await {
        Ok(Ok(Some(frames))) => frames,
        Ok(Ok(None)) => {
            log_warn!(
                "no camera frame for slot {} of session {}; skipping",
                seq,
                ctx.session_id
            );
            return SlotOutcome::Skipped;
        }
        Ok(Err(err)) => {
            log_error!("capture failed for session {}: {err:?}", ctx.session_id);
            return SlotOutcome::Skipped;
        }
        Err(_) => {
            log_warn!(
                "capture timeout (> {}s) session {}",
                timeout.as_secs(),
                ctx.session_id
            );
            return SlotOutcome::Skipped;
        }
    };

    let (camera, screen) = frames;
    let pair = SamplePair::new(ctx.session_id.clone(), seq, captured_at, camera, screen);
    let sample_id = pair.id.clone();

    if let Err(fault) = ctx.persist.push(PersistRecord::Pending(pair.clone())).await {
        return ctx.report(fault);
    }
    match ctx.upload.push(pair).await {
        Ok(PushOutcome::Accepted) => {}
        Ok(PushOutcome::Evicted(evicted)) => {
            stats.dropped.fetch_add(1, Ordering::Relaxed);
            log_warn!(
                "upload queue full; dropped sample {} captured at {}",
                evicted.id,
                evicted.captured_at
            );
            let audit = PersistRecord::Dropped(DroppedSample {
                sample_id: evicted.id,
                session_id: evicted.session_id,
                stage: DropStage::Upload,
                captured_at: evicted.captured_at,
                dropped_at: ctx.clock.now(),
            });
            if let Err(fault) = ctx.persist.push(audit).await {
                return ctx.report(fault);
            }
        }
        Err(_) => {
            log_info!("upload queue closed; capture loop stops");
            return SlotOutcome::Stop;
        }
    }
    stats.captured.fetch_add(1, Ordering::Relaxed);
    log_debug!("sample {} (slot {}) queued for upload", sample_id, seq);

    let counts = PersistRecord::Counts {
        session_id: ctx.session_id.clone(),
        counts: stats.counts(),
        at: ctx.clock.now(),
    };
    if let Err(fault) = ctx.persist.push(counts).await {
        return ctx.report(fault);
    }
    SlotOutcome::Captured
}
