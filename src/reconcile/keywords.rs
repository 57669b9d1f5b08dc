//! Keyword mapping from free-form pattern descriptions to classifier labels.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeywordRule {
    /// Matched case-insensitively as a substring.
    pub keyword: String,
    pub label: String,
}

impl KeywordRule {
    pub fn new(keyword: &str, label: &str) -> Self {
        Self {
            keyword: keyword.to_lowercase(),
            label: label.to_string(),
        }
    }
}

pub fn default_keyword_rules() -> Vec<KeywordRule> {
    [
        ("phone", "PhoneLikely"),
        ("looking away", "HeadAway"),
        ("distracted", "HeadAway"),
        ("talking", "Talking"),
        ("conversation", "Talking"),
        ("eating", "Eating"),
        ("social media", "SocialMedia"),
        ("youtube", "Video"),
        ("video", "Video"),
        ("gaming", "Game"),
        ("shopping", "Shopping"),
        ("away from desk", "Away"),
        ("left the desk", "Away"),
        ("no one", "NoFace"),
        ("yawn", "Yawning"),
        ("tired", "EyesClosed"),
        ("coding", "Code"),
        ("programming", "Code"),
        ("terminal", "Terminal"),
        ("documentation", "Documentation"),
        ("reading", "Reading"),
        ("typing", "Typing"),
        ("focused", "Focused"),
        ("concentrat", "Focused"),
    ]
    .into_iter()
    .map(|(keyword, label)| KeywordRule::new(keyword, label))
    .collect()
}

/// Labels inferable from one description, each at `confidence * weight`.
/// A label hit by several keywords is counted once.
pub fn extract_labels(
    description: &str,
    rules: &[KeywordRule],
    confidence: f64,
    weight: f64,
) -> BTreeMap<String, f64> {
    let text = description.to_lowercase();
    let score = (confidence * weight).clamp(0.0, 1.0);
    let mut labels = BTreeMap::new();
    for rule in rules {
        if text.contains(&rule.keyword.to_lowercase()) {
            labels.insert(rule.label.clone(), score);
        }
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_are_case_insensitive() {
        let labels = extract_labels(
            "User was on the Phone, then scrolled Social Media",
            &default_keyword_rules(),
            0.8,
            1.0,
        );
        assert_eq!(labels.get("PhoneLikely"), Some(&0.8));
        assert_eq!(labels.get("SocialMedia"), Some(&0.8));
    }

    #[test]
    fn overlap_weight_scales_confidence() {
        let labels = extract_labels("deep coding session", &default_keyword_rules(), 0.8, 0.5);
        assert!((labels["Code"] - 0.4).abs() < 1e-9);
    }

    #[test]
    fn unrelated_text_yields_nothing() {
        assert!(extract_labels("lorem ipsum", &default_keyword_rules(), 0.8, 1.0).is_empty());
    }
}
