use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::{
    labels::LabelCatalog,
    models::{
        AnalysisSourceKind, AttentionState, ClassificationResult, EmotionTimeline, PatternSummary,
        ReconciledSegment, Session, StateTransition,
    },
};

use super::{
    config::ReconciliationConfig,
    keywords::extract_labels,
    scoring::{apply_emotion_boost, resolve_conflict, segment_confidence},
};

/// Everything persisted for one session plus the optional late analyses.
pub struct ReconcileInput<'a> {
    pub session: &'a Session,
    pub samples: &'a [ClassificationResult],
    pub transitions: &'a [StateTransition],
    pub emotion: Option<&'a EmotionTimeline>,
    pub pattern: Option<&'a PatternSummary>,
}

/// A span of constant attention state, bounded by transitions.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSpan {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub state: AttentionState,
}

fn session_end(input: &ReconcileInput) -> DateTime<Utc> {
    let last_sample = input.samples.iter().map(|s| s.captured_at).max();
    let last_transition = input.transitions.iter().map(|t| t.at).max();
    input
        .session
        .ended_at
        .into_iter()
        .chain(last_sample)
        .chain(last_transition)
        .max()
        .unwrap_or(input.session.started_at)
}

/// Session start → each transition → session end. Zero-length spans are skipped.
pub fn state_spans(input: &ReconcileInput) -> Vec<StateSpan> {
    let start = input.session.started_at;
    let end = session_end(input);

    let mut transitions: Vec<&StateTransition> = input
        .transitions
        .iter()
        .filter(|t| t.at >= start && t.at <= end)
        .collect();
    transitions.sort_by_key(|t| t.at);

    let mut spans = Vec::with_capacity(transitions.len() + 1);
    let mut cursor = start;
    let mut state = transitions
        .first()
        .map(|t| t.from_state)
        .unwrap_or(AttentionState::Focused);
    for transition in transitions {
        if transition.at > cursor {
            spans.push(StateSpan {
                start: cursor,
                end: transition.at,
                state,
            });
        }
        cursor = transition.at;
        state = transition.to_state;
    }
    if end > cursor || spans.is_empty() {
        spans.push(StateSpan {
            start: cursor,
            end,
            state,
        });
    }
    spans
}

/// Averaged realtime confidences over the non-fallback samples of a span.
fn realtime_labels<'a, I>(samples: I) -> Option<BTreeMap<String, f64>>
where
    I: IntoIterator<Item = &'a ClassificationResult>,
{
    let mut sums: BTreeMap<String, f64> = BTreeMap::new();
    let mut count = 0usize;
    for sample in samples.into_iter().filter(|s| !s.fallback) {
        count += 1;
        let sources = std::iter::once(&sample.camera).chain(sample.screen.as_ref());
        for labels in sources {
            for (label, confidence) in labels.iter() {
                *sums.entry(label.to_string()).or_insert(0.0) += confidence;
            }
        }
    }
    if count == 0 {
        return None;
    }
    Some(
        sums.into_iter()
            .map(|(label, total)| (label, (total / count as f64).min(1.0)))
            .collect(),
    )
}

/// Keyword labels from pattern descriptions overlapping the span, scaled by
/// how much of each description's span falls inside it.
fn pattern_labels(
    pattern: &PatternSummary,
    start_secs: f64,
    end_secs: f64,
    config: &ReconciliationConfig,
) -> Option<BTreeMap<String, f64>> {
    let mut merged: BTreeMap<String, f64> = BTreeMap::new();
    for segment in pattern.overlapping(start_secs, end_secs) {
        let span = segment.end_secs - segment.start_secs;
        let overlap = segment.end_secs.min(end_secs) - segment.start_secs.max(start_secs);
        let weight = if span > 0.0 { (overlap / span).clamp(0.0, 1.0) } else { 1.0 };
        let labels = extract_labels(
            &segment.description,
            &config.keywords,
            config.keyword_confidence,
            weight,
        );
        for (label, confidence) in labels {
            let entry = merged.entry(label).or_insert(0.0);
            *entry = entry.max(confidence);
        }
    }
    (!merged.is_empty()).then_some(merged)
}

fn weighted_merge(sources: &[(f64, &BTreeMap<String, f64>)]) -> BTreeMap<String, f64> {
    let total_weight: f64 = sources.iter().map(|(weight, _)| weight).sum();
    let mut merged: BTreeMap<String, f64> = BTreeMap::new();
    if total_weight <= 0.0 {
        return merged;
    }
    for (weight, labels) in sources {
        for (label, confidence) in labels.iter() {
            *merged.entry(label.clone()).or_insert(0.0) += weight * confidence;
        }
    }
    for confidence in merged.values_mut() {
        *confidence /= total_weight;
    }
    merged
}

fn relative_secs(at: DateTime<Utc>, origin: DateTime<Utc>) -> f64 {
    (at - origin).num_milliseconds() as f64 / 1000.0
}

/// Merge realtime samples with the optional pattern and emotion analyses
/// into one segment per state span.
pub fn reconcile(
    input: &ReconcileInput,
    config: &ReconciliationConfig,
    catalog: &LabelCatalog,
) -> Vec<ReconciledSegment> {
    let origin = input.session.started_at;
    let spans = state_spans(input);
    let last_index = spans.len().saturating_sub(1);

    spans
        .iter()
        .enumerate()
        .map(|(index, span)| {
            let start_secs = relative_secs(span.start, origin);
            let end_secs = relative_secs(span.end, origin);

            let in_span = input.samples.iter().filter(|sample| {
                sample.captured_at >= span.start
                    && (sample.captured_at < span.end
                        || (index == last_index && sample.captured_at == span.end))
            });
            let realtime = realtime_labels(in_span);
            let pattern = input
                .pattern
                .and_then(|pattern| pattern_labels(pattern, start_secs, end_secs, config));

            let mut sources = Vec::new();
            let mut voting = Vec::new();
            if let Some(labels) = &realtime {
                sources.push(AnalysisSourceKind::Realtime);
                voting.push((config.realtime_weight, labels));
            }
            if let Some(labels) = &pattern {
                sources.push(AnalysisSourceKind::Pattern);
                voting.push((config.pattern_weight, labels));
            }
            let mut labels = weighted_merge(&voting);

            if let Some(emotion) = input.emotion {
                let frustration =
                    emotion.mean_score(&config.frustration_affect, start_secs, end_secs);
                let concentration =
                    emotion.mean_score(&config.concentration_affect, start_secs, end_secs);
                let modulation =
                    apply_emotion_boost(&mut labels, catalog, frustration, concentration, config);
                if modulation.applied() {
                    sources.push(AnalysisSourceKind::Emotion);
                }
            }

            resolve_conflict(&mut labels, catalog, config.conflict_threshold);
            let confidence = segment_confidence(&labels, config.top_labels);

            ReconciledSegment::new(
                input.session.id.clone(),
                start_secs,
                end_secs,
                span.state,
                labels,
                confidence,
                sources,
            )
        })
        .collect()
}
