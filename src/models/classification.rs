use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::sample::SamplePair;

/// Label assigned to both sources of a synthesized fallback result.
pub const FALLBACK_LABEL: &str = "Uncertain";

/// Label → confidence for one image, confidences clamped to `0.0..=1.0`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct SourceLabels(BTreeMap<String, f64>);

impl SourceLabels {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        Self(
            labels
                .into_iter()
                .filter(|(_, confidence)| confidence.is_finite())
                .map(|(label, confidence)| (label.into(), confidence.clamp(0.0, 1.0)))
                .collect(),
        )
    }

    pub fn single(label: impl Into<String>, confidence: f64) -> Self {
        Self::new([(label.into(), confidence)])
    }

    /// Highest-confidence label. Ties go to the lexicographically smallest label
    /// so the choice is stable across runs.
    pub fn primary(&self) -> Option<(&str, f64)> {
        let mut best: Option<(&str, f64)> = None;
        for (label, &confidence) in &self.0 {
            match best {
                Some((_, current)) if confidence <= current => {}
                _ => best = Some((label.as_str(), confidence)),
            }
        }
        best
    }

    pub fn primary_label(&self) -> Option<&str> {
        self.primary().map(|(label, _)| label)
    }

    pub fn get(&self, label: &str) -> Option<f64> {
        self.0.get(label).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(label, confidence)| (label.as_str(), *confidence))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> BTreeMap<String, f64> {
        self.0
    }
}

/// Outcome of classifying one `SamplePair`. The unit the fusion engine buffers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationResult {
    pub sample_id: String,
    pub session_id: String,
    pub captured_at: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
    pub latency_ms: u64,
    pub camera: SourceLabels,
    pub screen: Option<SourceLabels>,
    /// Synthesized after retries were exhausted or the response could not be parsed.
    pub fallback: bool,
}

impl ClassificationResult {
    pub fn from_pair(
        pair: &SamplePair,
        camera: SourceLabels,
        screen: Option<SourceLabels>,
        processed_at: DateTime<Utc>,
        latency_ms: u64,
    ) -> Self {
        Self {
            sample_id: pair.id.clone(),
            session_id: pair.session_id.clone(),
            captured_at: pair.captured_at,
            processed_at,
            latency_ms,
            camera,
            screen,
            fallback: false,
        }
    }

    /// Low-confidence stand-in so fusion sees exactly one result per sample.
    pub fn fallback(
        pair: &SamplePair,
        confidence: f64,
        processed_at: DateTime<Utc>,
        latency_ms: u64,
    ) -> Self {
        Self {
            sample_id: pair.id.clone(),
            session_id: pair.session_id.clone(),
            captured_at: pair.captured_at,
            processed_at,
            latency_ms,
            camera: SourceLabels::single(FALLBACK_LABEL, confidence),
            screen: pair
                .screen
                .as_ref()
                .map(|_| SourceLabels::single(FALLBACK_LABEL, confidence)),
            fallback: true,
        }
    }

    pub fn camera_primary(&self) -> Option<&str> {
        self.camera.primary_label()
    }

    pub fn screen_primary(&self) -> Option<&str> {
        self.screen.as_ref().and_then(|labels| labels.primary_label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_is_argmax() {
        let labels = SourceLabels::new([("Focused", 0.3), ("HeadAway", 0.9), ("NoFace", 0.1)]);
        assert_eq!(labels.primary(), Some(("HeadAway", 0.9)));
    }

    #[test]
    fn primary_tie_prefers_smallest_label() {
        let labels = SourceLabels::new([("Video", 0.5), ("Code", 0.5)]);
        assert_eq!(labels.primary_label(), Some("Code"));
    }

    #[test]
    fn confidences_are_clamped_and_nan_dropped() {
        let labels = SourceLabels::new([("A", 1.7), ("B", -0.2), ("C", f64::NAN)]);
        assert_eq!(labels.get("A"), Some(1.0));
        assert_eq!(labels.get("B"), Some(0.0));
        assert_eq!(labels.get("C"), None);
    }

    #[test]
    fn empty_labels_have_no_primary() {
        assert_eq!(SourceLabels::default().primary(), None);
    }
}
