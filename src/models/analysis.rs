//! Payloads of the two late-arriving post-session analyses.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Affect scores for one second of the session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EmotionSample {
    /// Session-relative second (the timeline is sampled at 1 Hz).
    pub second: u64,
    /// Named affect → score in `0.0..=1.0`, e.g. `frustration`, `concentration`.
    pub scores: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EmotionTimeline {
    pub samples: Vec<EmotionSample>,
}

impl EmotionTimeline {
    /// Mean score of `affect` over `[start_secs, end_secs)`, if any sample covers it.
    pub fn mean_score(&self, affect: &str, start_secs: f64, end_secs: f64) -> Option<f64> {
        let mut total = 0.0;
        let mut count = 0usize;
        for sample in &self.samples {
            let second = sample.second as f64;
            if second < start_secs || second >= end_secs {
                continue;
            }
            if let Some(score) = sample.scores.get(affect) {
                total += score;
                count += 1;
            }
        }
        (count > 0).then(|| total / count as f64)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Free-form description of what the user was doing over a span.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatternSegment {
    pub start_secs: f64,
    pub end_secs: f64,
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatternSummary {
    pub segments: Vec<PatternSegment>,
}

impl PatternSummary {
    /// Descriptions whose span overlaps `[start_secs, end_secs)`.
    pub fn overlapping(&self, start_secs: f64, end_secs: f64) -> impl Iterator<Item = &PatternSegment> {
        self.segments
            .iter()
            .filter(move |segment| segment.start_secs < end_secs && segment.end_secs > start_secs)
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(second: u64, frustration: f64) -> EmotionSample {
        EmotionSample {
            second,
            scores: BTreeMap::from([("frustration".to_string(), frustration)]),
        }
    }

    #[test]
    fn mean_score_only_covers_window() {
        let timeline = EmotionTimeline {
            samples: vec![sample(0, 0.2), sample(1, 0.8), sample(2, 1.0), sample(10, 0.0)],
        };
        let mean = timeline.mean_score("frustration", 1.0, 3.0).unwrap();
        assert!((mean - 0.9).abs() < 1e-9);
        assert_eq!(timeline.mean_score("concentration", 0.0, 3.0), None);
        assert_eq!(timeline.mean_score("frustration", 20.0, 30.0), None);
    }

    #[test]
    fn overlapping_excludes_touching_spans() {
        let summary = PatternSummary {
            segments: vec![
                PatternSegment { start_secs: 0.0, end_secs: 60.0, description: "coding".into() },
                PatternSegment { start_secs: 60.0, end_secs: 120.0, description: "phone".into() },
            ],
        };
        let hits: Vec<_> = summary.overlapping(60.0, 90.0).map(|s| s.description.as_str()).collect();
        assert_eq!(hits, vec!["phone"]);
    }
}
