mod common;

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use common::{config, controller, database, BrokenSink, CountingSource, FixedClassifier};
use vigil_lib::{
    analysis::{AnalysisPoll, AnalysisSource},
    models::{
        AlertKind, AnalysisSourceKind, AttentionState, PatternSegment, PatternSummary,
        SessionStatus,
    },
    session::SessionController,
};

#[tokio::test(start_paused = true)]
async fn completed_session_commits_every_stage() {
    let (_dir, db) = database();
    let controller = controller(config(), &db, FixedClassifier::new("PhoneLikely"));
    let mut events = controller.subscribe();

    let started = controller.start_session().await.unwrap();
    assert_eq!(started.status, SessionStatus::Active);
    tokio::time::sleep(Duration::from_secs(185)).await;
    let ended = controller.end_session().await.unwrap();

    assert_eq!(ended.id, started.id);
    assert_eq!(ended.status, SessionStatus::Completed);
    assert_eq!(ended.samples_captured, 3);
    assert_eq!(ended.samples_dropped, 0);
    assert!(!controller.is_running().await);
    assert!(db.get_pending_samples().await.unwrap().is_empty());

    let samples = db.get_samples_for_session(&started.id).await.unwrap();
    assert_eq!(samples.len(), 3);
    assert!(samples.iter().all(|sample| !sample.fallback));
    assert!(samples.windows(2).all(|pair| pair[0].captured_at < pair[1].captured_at));

    let transitions = db.get_transitions_for_session(&started.id).await.unwrap();
    let first = transitions.first().unwrap();
    assert_eq!(first.from_state, AttentionState::Focused);
    assert_eq!(first.to_state, AttentionState::Distracted);
    assert_eq!(first.at, samples[0].captured_at);

    let alerts = db.get_events_for_session(&started.id).await.unwrap();
    let sustained: Vec<_> = alerts
        .iter()
        .filter(|alert| alert.kind == AlertKind::Sustained)
        .collect();
    assert_eq!(sustained.len(), 1);
    assert!(!sustained[0].acknowledged);
    assert!(controller.acknowledge_event(&sustained[0].id).await.unwrap());

    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        names.push(event.name());
    }
    assert!(names.contains(&"state-changed"));
    assert!(names.contains(&"distraction-detected"));
    assert_eq!(names.iter().filter(|name| **name == "upload-progress").count(), 3);
    let changed = names.iter().position(|name| *name == "state-changed").unwrap();
    let detected = names.iter().position(|name| *name == "distraction-detected").unwrap();
    assert!(changed < detected);
}

#[tokio::test(start_paused = true)]
async fn only_one_session_runs_at_a_time() {
    let (_dir, db) = database();
    let controller = controller(config(), &db, FixedClassifier::new("Focused"));

    controller.start_session().await.unwrap();
    assert!(controller.start_session().await.is_err());
    controller.end_session().await.unwrap();
    assert!(controller.end_session().await.is_err());
    assert!(controller.snapshot().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn pause_holds_break_and_skips_slots() {
    let (_dir, db) = database();
    let controller = controller(config(), &db, FixedClassifier::new("Focused"));

    let started = controller.start_session().await.unwrap();
    tokio::time::sleep(Duration::from_secs(65)).await;

    let paused = controller.pause().await.unwrap();
    assert_eq!(paused.state, AttentionState::Break);
    assert!(paused.paused);
    let current = controller.current_session().await.unwrap().unwrap();
    assert_eq!(current.status, SessionStatus::Paused);

    tokio::time::sleep(Duration::from_secs(180)).await;
    let resumed = controller.resume().await.unwrap();
    assert_eq!(resumed.state, AttentionState::Focused);
    assert!(!resumed.paused);
    let current = controller.current_session().await.unwrap().unwrap();
    assert_eq!(current.status, SessionStatus::Active);

    let ended = controller.end_session().await.unwrap();
    assert_eq!(ended.samples_captured, 1);

    let transitions = db.get_transitions_for_session(&started.id).await.unwrap();
    let states: Vec<_> = transitions
        .iter()
        .map(|transition| (transition.from_state, transition.to_state))
        .collect();
    assert!(states.contains(&(AttentionState::Focused, AttentionState::Break)));
    assert!(states.contains(&(AttentionState::Break, AttentionState::Focused)));
}

#[tokio::test(start_paused = true)]
async fn manual_override_is_recorded() {
    let (_dir, db) = database();
    let controller = controller(config(), &db, FixedClassifier::new("Focused"));

    let started = controller.start_session().await.unwrap();
    let snapshot = controller
        .manual_override(AttentionState::Break, "coffee")
        .await
        .unwrap();
    assert_eq!(snapshot.state, AttentionState::Break);
    assert_eq!(snapshot.override_reason.as_deref(), Some("coffee"));
    assert_eq!(
        controller.snapshot().await.map(|snapshot| snapshot.state),
        Some(AttentionState::Break)
    );
    let current = controller.current_session().await.unwrap().unwrap();
    assert_eq!(current.status, SessionStatus::Paused);

    tokio::time::sleep(Duration::from_secs(125)).await;
    let ended = controller.end_session().await.unwrap();
    assert_eq!(ended.samples_captured, 0);

    let transitions = db.get_transitions_for_session(&started.id).await.unwrap();
    let last = transitions.last().unwrap();
    assert_eq!(last.to_state, AttentionState::Break);
    assert_eq!(last.trigger.reason(), Some("coffee"));
}

#[tokio::test(start_paused = true)]
async fn override_out_of_pause_restarts_sampling() {
    let (_dir, db) = database();
    let controller = controller(config(), &db, FixedClassifier::new("Focused"));

    let started = controller.start_session().await.unwrap();
    tokio::time::sleep(Duration::from_secs(65)).await;
    controller.pause().await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;

    let snapshot = controller
        .manual_override(AttentionState::Focused, "back at the desk")
        .await
        .unwrap();
    assert_eq!(snapshot.state, AttentionState::Focused);
    assert!(!snapshot.paused);
    let current = controller.current_session().await.unwrap().unwrap();
    assert_eq!(current.status, SessionStatus::Active);

    tokio::time::sleep(Duration::from_secs(60)).await;
    let ended = controller.end_session().await.unwrap();
    assert_eq!(ended.samples_captured, 2);

    let samples = db.get_samples_for_session(&started.id).await.unwrap();
    assert_eq!(samples.len(), 2);
    let transitions = db.get_transitions_for_session(&started.id).await.unwrap();
    let back = transitions
        .iter()
        .find(|transition| transition.trigger.reason() == Some("back at the desk"))
        .unwrap();
    assert_eq!(back.from_state, AttentionState::Break);
    assert_eq!(back.to_state, AttentionState::Focused);
}

#[tokio::test(start_paused = true)]
async fn storage_failure_fails_the_session() {
    let (_dir, db) = database();
    let controller = SessionController::with_sink(
        config(),
        db.clone(),
        Arc::new(BrokenSink),
        Arc::new(FixedClassifier::new("Focused")),
        Arc::new(CountingSource::default()),
    )
    .unwrap();

    let started = controller.start_session().await.unwrap();
    tokio::time::sleep(Duration::from_secs(70)).await;

    let mut session = None;
    for _ in 0..200 {
        let stored = db.get_session(&started.id).await.unwrap().unwrap();
        if stored.status == SessionStatus::Failed {
            session = Some(stored);
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let session = session.expect("session should fail");

    assert!(!controller.is_running().await);
    assert!(session.ended_at.is_some());
    assert!(session
        .failure_reason
        .as_deref()
        .unwrap_or_default()
        .starts_with("persisting"));
    assert!(controller.end_session().await.is_err());
}

struct ReadyPattern;

#[async_trait]
impl AnalysisSource<PatternSummary> for ReadyPattern {
    fn name(&self) -> &'static str {
        "pattern"
    }

    async fn poll(&self, _session_id: &str) -> Result<AnalysisPoll<PatternSummary>> {
        Ok(AnalysisPoll::Ready(PatternSummary {
            segments: vec![PatternSegment {
                start_secs: 0.0,
                end_secs: 10_000.0,
                description: "user picks up the phone".into(),
            }],
        }))
    }
}

#[tokio::test(start_paused = true)]
async fn reconciliation_replaces_earlier_segments() {
    let (_dir, db) = database();
    let controller = controller(config(), &db, FixedClassifier::new("PhoneLikely"));

    let started = controller.start_session().await.unwrap();
    assert!(controller
        .reconcile_session(&started.id, None, None)
        .await
        .is_err());
    tokio::time::sleep(Duration::from_secs(185)).await;
    controller.end_session().await.unwrap();

    let realtime_only = controller
        .reconcile_session(&started.id, None, None)
        .await
        .unwrap();
    assert!(!realtime_only.is_empty());
    assert!(realtime_only
        .windows(2)
        .all(|pair| pair[0].end_secs <= pair[1].start_secs));
    assert!(realtime_only
        .iter()
        .any(|segment| segment.state == AttentionState::Distracted));

    let with_pattern = controller
        .reconcile_with_sources(&started.id, None, Some(&ReadyPattern), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(with_pattern.len(), realtime_only.len());
    assert!(with_pattern
        .iter()
        .all(|segment| segment.sources.contains(&AnalysisSourceKind::Pattern)));

    let stored = db.get_segments_for_session(&started.id).await.unwrap();
    assert_eq!(stored.len(), with_pattern.len());
    assert!(stored
        .iter()
        .all(|segment| segment.sources.contains(&AnalysisSourceKind::Pattern)));
}
