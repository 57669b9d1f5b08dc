//! Threshold rules that turn fusion output into user-facing alerts.
//!
//! Three independent rules: a sustained-distraction alert after a grace
//! period, a pattern alert on frequent Distracted transitions and an
//! ergonomic alert when absence/fatigue dominates the recent samples.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::info;

use crate::{
    config::DetectorConfig,
    labels::{LabelCatalog, LabelCategory},
    models::{AlertKind, AttentionState, ClassificationResult, DistractionEvent, StateTransition},
    utils::clock::span_secs,
};

const PATTERN_TYPE: &str = "RepeatedDistraction";
const SUSTAINED_FALLBACK_TYPE: &str = "Distracted";

struct PendingDistraction {
    entered_at: DateTime<Utc>,
    observed_at: DateTime<Utc>,
    evidence: BTreeMap<String, u32>,
    sample_ids: Vec<String>,
    fired: bool,
}

struct RecentSample {
    captured_at: DateTime<Utc>,
    sample_id: String,
    /// Camera primary label when it is in the absence or fatigue set.
    flagged: Option<String>,
}

pub struct AlertDetector {
    session_id: String,
    config: DetectorConfig,
    catalog: Arc<LabelCatalog>,
    pending: Option<PendingDistraction>,
    distracted_transitions: VecDeque<DateTime<Utc>>,
    last_pattern_alert: Option<DateTime<Utc>>,
    recent: VecDeque<RecentSample>,
    last_ergonomic_alert: Option<DateTime<Utc>>,
}

impl AlertDetector {
    pub fn new(session_id: impl Into<String>, config: DetectorConfig, catalog: Arc<LabelCatalog>) -> Self {
        Self {
            session_id: session_id.into(),
            config,
            catalog,
            pending: None,
            distracted_transitions: VecDeque::new(),
            last_pattern_alert: None,
            recent: VecDeque::new(),
            last_ergonomic_alert: None,
        }
    }

    /// Highest-count distraction label in `evidence`.
    fn dominant_distraction(&self, evidence: &BTreeMap<String, u32>) -> Option<String> {
        evidence
            .iter()
            .filter(|(label, _)| self.catalog.category_any(label) == LabelCategory::Distraction)
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(label, _)| label.clone())
    }

    /// `now` is the processing time the transition was observed at.
    pub fn on_transition(
        &mut self,
        transition: &StateTransition,
        sample_ids: Vec<String>,
        now: DateTime<Utc>,
    ) -> Option<DistractionEvent> {
        if transition.to_state != AttentionState::Distracted {
            self.pending = None;
            return None;
        }

        self.pending = Some(PendingDistraction {
            entered_at: transition.at,
            observed_at: now,
            evidence: transition.evidence.clone(),
            sample_ids: sample_ids.clone(),
            fired: false,
        });

        let window = span_secs(self.config.pattern_window_secs);
        let cutoff = transition.at.checked_sub_signed(window);
        self.distracted_transitions.push_back(transition.at);
        while self
            .distracted_transitions
            .front()
            .zip(cutoff)
            .is_some_and(|(at, cutoff)| *at < cutoff)
        {
            self.distracted_transitions.pop_front();
        }

        let count = self.distracted_transitions.len();
        let cooled_down = self
            .last_pattern_alert
            .map_or(true, |last| transition.at - last >= window);
        if count <= self.config.pattern_max_transitions || !cooled_down {
            return None;
        }

        self.last_pattern_alert = Some(transition.at);
        let started_at = self
            .distracted_transitions
            .front()
            .copied()
            .unwrap_or(transition.at);
        info!(
            "pattern alert: {} distracted transitions within {} minutes",
            count,
            self.config.pattern_window_secs / 60
        );
        let mut evidence = transition.evidence.clone();
        evidence.insert("distractedTransitions".to_string(), count as u32);
        Some(DistractionEvent::new(
            self.session_id.clone(),
            AlertKind::Pattern,
            PATTERN_TYPE,
            started_at,
            transition.at,
            evidence,
            sample_ids,
        ))
    }

    /// Feeds the ergonomic window with an accepted sample.
    pub fn on_sample(&mut self, result: &ClassificationResult) -> Option<DistractionEvent> {
        let flagged = self
            .catalog
            .is_absence_or_fatigue(result)
            .then(|| result.camera_primary().map(str::to_string))
            .flatten();
        self.recent.push_back(RecentSample {
            captured_at: result.captured_at,
            sample_id: result.sample_id.clone(),
            flagged,
        });

        let window = span_secs(self.config.ergonomic_window_secs);
        let newest = result.captured_at;
        let cutoff = newest.checked_sub_signed(window);
        while self
            .recent
            .front()
            .zip(cutoff)
            .is_some_and(|(sample, cutoff)| sample.captured_at < cutoff)
        {
            self.recent.pop_front();
        }

        let total = self.recent.len();
        let flagged: Vec<&RecentSample> = self.recent.iter().filter(|s| s.flagged.is_some()).collect();
        if total < self.config.ergonomic_min_samples
            || (flagged.len() as f64) / (total as f64) <= self.config.ergonomic_ratio
        {
            return None;
        }
        if self
            .last_ergonomic_alert
            .is_some_and(|last| newest - last < window)
        {
            return None;
        }

        let mut evidence: BTreeMap<String, u32> = BTreeMap::new();
        for sample in &flagged {
            if let Some(label) = &sample.flagged {
                *evidence.entry(label.clone()).or_insert(0) += 1;
            }
        }
        let distraction_type = evidence
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(label, _)| label.clone())
            .unwrap_or_default();
        let started_at = flagged.first().map_or(newest, |s| s.captured_at);
        let sample_ids = flagged.iter().map(|s| s.sample_id.clone()).collect();

        self.last_ergonomic_alert = Some(newest);
        info!(
            "ergonomic alert: {}/{} recent samples show {}",
            evidence.values().sum::<u32>(),
            total,
            distraction_type
        );
        Some(DistractionEvent::new(
            self.session_id.clone(),
            AlertKind::Ergonomic,
            distraction_type,
            started_at,
            newest,
            evidence,
            sample_ids,
        ))
    }

    /// Fires the sustained alert once the grace period has passed.
    pub fn poll(&mut self, now: DateTime<Utc>) -> Option<DistractionEvent> {
        let grace = span_secs(self.config.sustained_grace_secs);
        let pending = self.pending.as_ref()?;
        if pending.fired || now - pending.observed_at < grace {
            return None;
        }

        let distraction_type = self
            .dominant_distraction(&pending.evidence)
            .unwrap_or_else(|| SUSTAINED_FALLBACK_TYPE.to_string());
        let event = DistractionEvent::new(
            self.session_id.clone(),
            AlertKind::Sustained,
            distraction_type,
            pending.entered_at,
            now,
            pending.evidence.clone(),
            pending.sample_ids.clone(),
        );
        if let Some(pending) = self.pending.as_mut() {
            pending.fired = true;
        }
        Some(event)
    }
}
