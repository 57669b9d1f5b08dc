use std::collections::BTreeMap;

use crate::labels::{LabelCatalog, LabelCategory};

use super::config::ReconciliationConfig;

/// Which emotion boosts were applied to a segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmotionModulation {
    pub distraction_boosted: bool,
    pub focus_boosted: bool,
}

impl EmotionModulation {
    pub fn applied(&self) -> bool {
        self.distraction_boosted || self.focus_boosted
    }
}

fn boost_category(
    labels: &mut BTreeMap<String, f64>,
    catalog: &LabelCatalog,
    category: LabelCategory,
    factor: f64,
) -> bool {
    let mut touched = false;
    for (label, confidence) in labels.iter_mut() {
        if catalog.category_any(label) == category {
            *confidence = (*confidence * factor).min(1.0);
            touched = true;
        }
    }
    touched
}

/// Frustration boosts distraction labels, concentration boosts focus labels.
/// Scores are mean affect over the segment; `None` means no emotion data.
pub fn apply_emotion_boost(
    labels: &mut BTreeMap<String, f64>,
    catalog: &LabelCatalog,
    frustration: Option<f64>,
    concentration: Option<f64>,
    config: &ReconciliationConfig,
) -> EmotionModulation {
    let mut modulation = EmotionModulation::default();
    if frustration.is_some_and(|score| score > config.frustration_threshold) {
        modulation.distraction_boosted = boost_category(
            labels,
            catalog,
            LabelCategory::Distraction,
            config.boost_factor,
        );
    }
    if concentration.is_some_and(|score| score > config.concentration_threshold) {
        modulation.focus_boosted =
            boost_category(labels, catalog, LabelCategory::Focus, config.boost_factor);
    }
    modulation
}

fn category_max(
    labels: &BTreeMap<String, f64>,
    catalog: &LabelCatalog,
    category: LabelCategory,
) -> f64 {
    labels
        .iter()
        .filter(|(label, _)| catalog.category_any(label) == category)
        .map(|(_, confidence)| *confidence)
        .fold(0.0, f64::max)
}

/// Halves every label of the weaker side when focus and distraction both
/// exceed the threshold. On a tie focus stands. Returns the halved category.
pub fn resolve_conflict(
    labels: &mut BTreeMap<String, f64>,
    catalog: &LabelCatalog,
    threshold: f64,
) -> Option<LabelCategory> {
    let focus = category_max(labels, catalog, LabelCategory::Focus);
    let distraction = category_max(labels, catalog, LabelCategory::Distraction);
    if focus <= threshold || distraction <= threshold {
        return None;
    }

    let loser = if distraction > focus {
        LabelCategory::Focus
    } else {
        LabelCategory::Distraction
    };
    for (label, confidence) in labels.iter_mut() {
        if catalog.category_any(label) == loser {
            *confidence /= 2.0;
        }
    }
    Some(loser)
}

/// Mean of the `top` highest confidences (fewer if fewer labels exist).
pub fn segment_confidence(labels: &BTreeMap<String, f64>, top: usize) -> f64 {
    let mut values: Vec<f64> = labels.values().copied().collect();
    if values.is_empty() || top == 0 {
        return 0.0;
    }
    values.sort_by(|a, b| b.total_cmp(a));
    values.truncate(top);
    values.iter().sum::<f64>() / values.len() as f64
}
