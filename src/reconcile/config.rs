use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use super::keywords::{default_keyword_rules, KeywordRule};

/// Tunables for the post-session merge of realtime and external analyses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconciliationConfig {
    /// Voting weights. Only sources present in a segment enter the normalisation.
    pub realtime_weight: f64,
    pub pattern_weight: f64,

    /// Confidence given to a label inferred from a pattern description.
    pub keyword_confidence: f64,
    pub keywords: Vec<KeywordRule>,

    /// Emotion signals modulate instead of voting.
    pub frustration_affect: String,
    pub concentration_affect: String,
    pub frustration_threshold: f64,
    pub concentration_threshold: f64,
    pub boost_factor: f64,

    /// Focus and distraction both above this after weighting is a conflict.
    pub conflict_threshold: f64,
    pub top_labels: usize,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            realtime_weight: 0.7,
            pattern_weight: 0.2,
            keyword_confidence: 0.8,
            keywords: default_keyword_rules(),
            frustration_affect: "frustration".to_string(),
            concentration_affect: "concentration".to_string(),
            frustration_threshold: 0.6,
            concentration_threshold: 0.6,
            boost_factor: 1.2,
            conflict_threshold: 0.5,
            top_labels: 3,
        }
    }
}

impl ReconciliationConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, weight) in [
            ("realtimeWeight", self.realtime_weight),
            ("patternWeight", self.pattern_weight),
        ] {
            if !(weight > 0.0 && weight <= 1.0) {
                bail!("{name} must be in (0, 1], got {weight}");
            }
        }
        for (name, value) in [
            ("keywordConfidence", self.keyword_confidence),
            ("frustrationThreshold", self.frustration_threshold),
            ("concentrationThreshold", self.concentration_threshold),
            ("conflictThreshold", self.conflict_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("{name} must be in [0, 1], got {value}");
            }
        }
        if self.boost_factor < 1.0 {
            bail!("boostFactor must be at least 1.0, got {}", self.boost_factor);
        }
        if self.top_labels == 0 {
            bail!("topLabels must be at least 1");
        }
        if self.keywords.iter().any(|rule| rule.keyword.trim().is_empty()) {
            bail!("keyword rules must not have empty keywords");
        }
        Ok(())
    }
}
