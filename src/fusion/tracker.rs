//! Hysteresis state machine over a rolling window of classification results.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{info, warn};

use crate::{
    config::FusionConfig,
    labels::{LabelCatalog, SampleVote},
    models::{AttentionState, ClassificationResult, FocusSnapshot, StateTransition, TransitionTrigger},
    utils::clock::span_secs,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Captured further in the future than the allowed clock skew.
    FutureTimestamp,
    /// Older than the most recently accepted sample.
    OutOfOrder,
    /// Captured before the last pause, resume or manual override.
    BeforeReset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetainReason {
    /// The winning category matches the current state.
    Confirmed,
    /// No category reached the majority threshold.
    NoMajority,
    /// Full window, but it spans less than the debounce minimum.
    Debounce,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Rejected(RejectReason),
    /// Buffered, but a pause or a fresh manual override holds the state.
    Held,
    Retained { reason: RetainReason, confidence: f64 },
    Transitioned(StateTransition),
}

#[derive(Debug, Clone)]
struct ManualOverride {
    reason: String,
    at: DateTime<Utc>,
}

/// Owns the attention state of one session. Mutated only through `update`,
/// `pause`, `resume` and `manual_override`.
pub struct FocusTracker {
    session_id: String,
    config: FusionConfig,
    catalog: Arc<LabelCatalog>,
    state: AttentionState,
    entered_at: DateTime<Utc>,
    confidence: f64,
    history: VecDeque<ClassificationResult>,
    last_accepted: Option<DateTime<Utc>>,
    evidence_floor: Option<DateTime<Utc>>,
    paused: bool,
    manual_override: Option<ManualOverride>,
    accepted_samples: u64,
    rejected_samples: u64,
    /// Accepted samples that were already older than `stale_after_secs`.
    stale_samples: u64,
}

fn vote_state(vote: SampleVote) -> Option<AttentionState> {
    match vote {
        SampleVote::Focus => Some(AttentionState::Focused),
        SampleVote::Distraction => Some(AttentionState::Distracted),
        SampleVote::Absence => Some(AttentionState::Absent),
        SampleVote::Neutral => None,
    }
}

impl FocusTracker {
    pub fn new(
        session_id: impl Into<String>,
        config: FusionConfig,
        catalog: Arc<LabelCatalog>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let confidence = config.initial_confidence;
        let capacity = config.window_size.max(1);
        Self {
            session_id: session_id.into(),
            config,
            catalog,
            state: AttentionState::Focused,
            entered_at: started_at,
            confidence,
            history: VecDeque::with_capacity(capacity + 1),
            last_accepted: None,
            evidence_floor: None,
            paused: false,
            manual_override: None,
            accepted_samples: 0,
            rejected_samples: 0,
            stale_samples: 0,
        }
    }

    pub fn state(&self) -> AttentionState {
        self.state
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn entered_at(&self) -> DateTime<Utc> {
        self.entered_at
    }

    pub fn history(&self) -> impl Iterator<Item = &ClassificationResult> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Primary label → number of buffered samples it was primary in, both sources.
    pub fn evidence(&self) -> BTreeMap<String, u32> {
        let mut evidence = BTreeMap::new();
        for result in &self.history {
            let primaries = [result.camera_primary(), result.screen_primary()];
            for label in primaries.into_iter().flatten() {
                *evidence.entry(label.to_string()).or_insert(0) += 1;
            }
        }
        evidence
    }

    pub fn snapshot(&self) -> FocusSnapshot {
        FocusSnapshot {
            state: self.state,
            entered_at: self.entered_at,
            confidence: self.confidence,
            history: self.history.iter().cloned().collect(),
            evidence: self.evidence(),
            paused: self.paused,
            override_reason: self.manual_override.as_ref().map(|o| o.reason.clone()),
            accepted_samples: self.accepted_samples,
            rejected_samples: self.rejected_samples,
            stale_samples: self.stale_samples,
        }
    }

    /// Feed one classification result. `now` is the processing wall-clock time.
    pub fn update(&mut self, result: ClassificationResult, now: DateTime<Utc>) -> UpdateOutcome {
        if let Some(reason) = self.validate_timestamp(&result, now) {
            self.rejected_samples += 1;
            warn!(
                "rejected sample {} captured at {} ({:?})",
                result.sample_id, result.captured_at, reason
            );
            return UpdateOutcome::Rejected(reason);
        }

        if now - result.captured_at > span_secs(self.config.stale_after_secs) {
            self.stale_samples += 1;
            warn!(
                "sample {} is {}s old; accepted but may distort the debounce span",
                result.sample_id,
                (now - result.captured_at).num_seconds()
            );
        }

        self.accepted_samples += 1;
        self.last_accepted = Some(result.captured_at);
        self.push_history(result);

        if self.paused {
            return UpdateOutcome::Held;
        }
        if self.override_holds(now) {
            return UpdateOutcome::Held;
        }

        self.evaluate()
    }

    fn validate_timestamp(
        &self,
        result: &ClassificationResult,
        now: DateTime<Utc>,
    ) -> Option<RejectReason> {
        let latest = now.checked_add_signed(span_secs(self.config.max_future_skew_secs));
        if latest.is_some_and(|latest| result.captured_at > latest) {
            return Some(RejectReason::FutureTimestamp);
        }
        if self.evidence_floor.is_some_and(|floor| result.captured_at < floor) {
            return Some(RejectReason::BeforeReset);
        }
        if self.last_accepted.is_some_and(|last| result.captured_at < last) {
            return Some(RejectReason::OutOfOrder);
        }
        None
    }

    fn push_history(&mut self, result: ClassificationResult) {
        self.history.push_back(result);
        while self.history.len() > self.config.window_size.max(1) {
            self.history.pop_front();
        }
        self.history
            .make_contiguous()
            .sort_by_key(|entry| entry.captured_at);
    }

    /// A manual override suppresses voting while it is young and trusted.
    fn override_holds(&mut self, now: DateTime<Utc>) -> bool {
        let Some(active) = &self.manual_override else {
            return false;
        };
        let grace = span_secs(self.config.override_grace_secs);
        if now - active.at < grace && self.confidence > self.config.override_min_confidence {
            return true;
        }
        info!("manual override '{}' expired; voting resumes", active.reason);
        self.manual_override = None;
        false
    }

    fn evaluate(&mut self) -> UpdateOutcome {
        let window = self.config.window_size.max(1);
        let buffered = self.history.len();

        let mut tally: BTreeMap<AttentionState, usize> = BTreeMap::new();
        for result in &self.history {
            if let Some(state) = vote_state(self.catalog.vote(result)) {
                *tally.entry(state).or_insert(0) += 1;
            }
        }

        let (threshold, scale) = if buffered < window {
            (
                buffered / 2 + 1,
                (buffered as f64 / window as f64) * self.config.partial_buffer_scale,
            )
        } else {
            if !self.debounce_span_met() {
                self.confidence = self.config.debounce_hold_confidence;
                return UpdateOutcome::Retained {
                    reason: RetainReason::Debounce,
                    confidence: self.confidence,
                };
            }
            (self.config.majority_threshold(), 1.0)
        };

        let winner = tally
            .into_iter()
            .find(|(_, votes)| *votes >= threshold)
            .map(|(state, _)| state);

        let Some(target) = winner else {
            self.confidence = self.config.tie_confidence;
            return UpdateOutcome::Retained {
                reason: RetainReason::NoMajority,
                confidence: self.confidence,
            };
        };

        let confidence = scale;
        if target == self.state {
            self.confidence = confidence;
            return UpdateOutcome::Retained {
                reason: RetainReason::Confirmed,
                confidence,
            };
        }

        let at = self
            .history
            .back()
            .map(|newest| newest.captured_at)
            .unwrap_or(self.entered_at);
        UpdateOutcome::Transitioned(self.transition(target, at, confidence, TransitionTrigger::Vote))
    }

    fn debounce_span_met(&self) -> bool {
        match (self.history.front(), self.history.back()) {
            (Some(oldest), Some(newest)) => {
                newest.captured_at - oldest.captured_at
                    >= span_secs(self.config.debounce_span_secs)
            }
            _ => false,
        }
    }

    fn transition(
        &mut self,
        to_state: AttentionState,
        at: DateTime<Utc>,
        confidence: f64,
        trigger: TransitionTrigger,
    ) -> StateTransition {
        let transition = StateTransition::new(
            self.session_id.clone(),
            self.state,
            to_state,
            at,
            confidence,
            self.evidence(),
            trigger,
        );
        self.state = to_state;
        self.entered_at = at;
        self.confidence = confidence;
        transition
    }

    /// Evidence gathered before a reset must not vote afterwards.
    fn reset_evidence(&mut self, now: DateTime<Utc>) {
        self.history.clear();
        self.evidence_floor = Some(now);
    }

    /// Explicit user pause: Break at full confidence until `resume`.
    pub fn pause(&mut self, now: DateTime<Utc>) -> Option<StateTransition> {
        self.paused = true;
        self.manual_override = None;
        let confidence = self.config.pause_confidence;
        let transition = (self.state != AttentionState::Break)
            .then(|| self.transition(AttentionState::Break, now, confidence, TransitionTrigger::Pause));
        self.confidence = confidence;
        self.reset_evidence(now);
        transition
    }

    pub fn resume(&mut self, now: DateTime<Utc>) -> Option<StateTransition> {
        self.paused = false;
        self.manual_override = None;
        self.reset_evidence(now);
        let confidence = self.config.resume_confidence;
        let transition = (self.state != AttentionState::Focused)
            .then(|| self.transition(AttentionState::Focused, now, confidence, TransitionTrigger::Resume));
        self.confidence = confidence;
        transition
    }

    /// User-declared state. Holds off automatic voting for the grace window.
    pub fn manual_override(
        &mut self,
        target: AttentionState,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Option<StateTransition> {
        let reason = reason.into();
        info!(
            "manual override to {} for session {}: {}",
            target.as_str(),
            self.session_id,
            reason
        );
        self.paused = false;
        self.reset_evidence(now);
        let confidence = self.config.override_confidence;
        let transition = (self.state != target).then(|| {
            self.transition(
                target,
                now,
                confidence,
                TransitionTrigger::ManualOverride {
                    reason: reason.clone(),
                },
            )
        });
        self.confidence = confidence;
        self.entered_at = now;
        self.manual_override = Some(ManualOverride { reason, at: now });
        transition
    }
}
