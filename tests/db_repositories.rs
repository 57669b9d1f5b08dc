mod common;

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, TimeZone, Utc};

use common::database;
use vigil_lib::{
    models::{
        AlertKind, AnalysisSourceKind, AttentionState, ClassificationResult, DistractionEvent,
        DropStage, DroppedSample, ImageRef, ReconciledSegment, SamplePair, Session, SessionCounts,
        SessionStatus, SourceLabels, StateTransition, TransitionTrigger,
    },
    persistence::{PersistRecord, RecordSink},
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 4, 9, 30, 0).unwrap()
}

fn at(secs: i64) -> DateTime<Utc> {
    t0() + Duration::seconds(secs)
}

fn pair(session: &Session, seq: u64) -> SamplePair {
    SamplePair::new(
        session.id.clone(),
        seq,
        at(60 * seq as i64),
        ImageRef::new(format!("camera-{seq}.jpg")),
        Some(ImageRef::new(format!("screen-{seq}.png"))),
    )
}

fn result(pair: &SamplePair, camera: &str) -> ClassificationResult {
    ClassificationResult::from_pair(
        pair,
        SourceLabels::new([(camera, 0.8), ("Typing", 0.1)]),
        Some(SourceLabels::single("Code", 0.7)),
        pair.captured_at + Duration::seconds(2),
        1_850,
    )
}

#[tokio::test]
async fn session_lifecycle_round_trips() {
    let (_dir, db) = database();
    let session = Session::start(60, t0());
    db.insert_session(&session).await.unwrap();

    db.update_session_counts(
        &session.id,
        SessionCounts {
            samples_captured: 7,
            samples_dropped: 2,
            overruns: 1,
        },
        at(420),
    )
    .await
    .unwrap();
    db.mark_session_status(&session.id, SessionStatus::Completed, Some(at(450)), None, at(450))
        .await
        .unwrap();

    let stored = db.get_session(&session.id).await.unwrap().unwrap();
    assert_eq!(stored.started_at, t0());
    assert_eq!(stored.ended_at, Some(at(450)));
    assert_eq!(stored.status, SessionStatus::Completed);
    assert_eq!(stored.samples_captured, 7);
    assert_eq!(stored.samples_dropped, 2);
    assert_eq!(stored.overruns, 1);
    assert_eq!(stored.failure_reason, None);
    assert!(db.get_open_sessions().await.unwrap().is_empty());
    assert!(db.get_session("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn samples_are_idempotent_and_ordered_by_capture() {
    let (_dir, db) = database();
    let session = Session::start(60, t0());
    db.insert_session(&session).await.unwrap();

    let later = result(&pair(&session, 2), "HeadAway");
    let earlier = result(&pair(&session, 1), "Focused");
    db.insert_sample(&later).await.unwrap();
    db.insert_sample(&earlier).await.unwrap();
    db.insert_sample(&earlier).await.unwrap();

    let samples = db.get_samples_for_session(&session.id).await.unwrap();
    assert_eq!(samples, vec![earlier, later]);
}

#[tokio::test]
async fn records_commit_through_the_sink() {
    let (_dir, db) = database();
    let session = Session::start(60, t0());
    db.insert_session(&session).await.unwrap();

    let mut evidence = BTreeMap::new();
    evidence.insert("PhoneLikely".to_string(), 2);
    let transition = StateTransition::new(
        session.id.clone(),
        AttentionState::Focused,
        AttentionState::Distracted,
        at(120),
        1.0,
        evidence.clone(),
        TransitionTrigger::Vote,
    );
    let override_transition = StateTransition::new(
        session.id.clone(),
        AttentionState::Distracted,
        AttentionState::Break,
        at(150),
        1.0,
        BTreeMap::new(),
        TransitionTrigger::ManualOverride {
            reason: "lunch".into(),
        },
    );
    let event = DistractionEvent::new(
        session.id.clone(),
        AlertKind::Sustained,
        "PhoneLikely",
        at(120),
        at(128),
        evidence,
        vec!["sample-1".into(), "sample-2".into()],
    );
    let dropped = DroppedSample {
        sample_id: "sample-0".into(),
        session_id: session.id.clone(),
        stage: DropStage::Upload,
        captured_at: at(60),
        dropped_at: at(61),
    };

    let sink: &dyn RecordSink = &db;
    for record in [
        PersistRecord::Transition(transition.clone()),
        PersistRecord::Transition(override_transition.clone()),
        PersistRecord::Event(event.clone()),
        PersistRecord::Dropped(dropped.clone()),
    ] {
        sink.commit(&record).await.unwrap();
    }

    assert_eq!(
        db.get_transitions_for_session(&session.id).await.unwrap(),
        vec![transition, override_transition]
    );
    assert_eq!(db.get_dropped_samples(&session.id).await.unwrap(), vec![dropped]);

    let events = db.get_events_for_session(&session.id).await.unwrap();
    assert_eq!(events, vec![event.clone()]);
    assert!(db.acknowledge_event(&event.id).await.unwrap());
    assert!(!db.acknowledge_event("missing").await.unwrap());
    let events = db.get_events_for_session(&session.id).await.unwrap();
    assert!(events[0].acknowledged);
}

#[tokio::test]
async fn pending_samples_spool_and_drain() {
    let (_dir, db) = database();
    let session = Session::start(60, t0());
    db.insert_session(&session).await.unwrap();

    let pairs = vec![pair(&session, 1), pair(&session, 2)];
    assert_eq!(db.insert_pending_samples(&pairs, at(130)).await.unwrap(), 2);
    assert_eq!(db.get_pending_samples().await.unwrap(), pairs);

    db.insert_sample(&result(&pairs[0], "Focused")).await.unwrap();
    assert_eq!(db.get_pending_samples().await.unwrap(), vec![pairs[1].clone()]);
    assert_eq!(db.discard_pending_samples().await.unwrap(), 1);
    assert!(db.get_pending_samples().await.unwrap().is_empty());
}

#[tokio::test]
async fn committing_a_result_or_drop_clears_the_spool() {
    let (_dir, db) = database();
    let session = Session::start(60, t0());
    db.insert_session(&session).await.unwrap();

    let classified = pair(&session, 1);
    let evicted = pair(&session, 2);
    let waiting = pair(&session, 3);
    let sink: &dyn RecordSink = &db;
    for spooled in [&classified, &evicted, &waiting] {
        sink.commit(&PersistRecord::Pending(spooled.clone())).await.unwrap();
    }
    sink.commit(&PersistRecord::Pending(classified.clone())).await.unwrap();
    assert_eq!(db.get_pending_samples().await.unwrap().len(), 3);

    sink.commit(&PersistRecord::Sample(result(&classified, "Focused")))
        .await
        .unwrap();
    sink.commit(&PersistRecord::Dropped(DroppedSample {
        sample_id: evicted.id.clone(),
        session_id: session.id.clone(),
        stage: DropStage::Upload,
        captured_at: evicted.captured_at,
        dropped_at: at(130),
    }))
    .await
    .unwrap();

    assert_eq!(db.get_pending_samples().await.unwrap(), vec![waiting]);
    assert_eq!(db.get_samples_for_session(&session.id).await.unwrap().len(), 1);
    assert_eq!(db.get_dropped_samples(&session.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn segments_are_replaced_as_a_whole() {
    let (_dir, db) = database();
    let session = Session::start(60, t0());
    db.insert_session(&session).await.unwrap();

    let labels: BTreeMap<String, f64> = [("Focused".to_string(), 0.8)].into_iter().collect();
    let first = vec![
        ReconciledSegment::new(
            session.id.clone(),
            0.0,
            120.0,
            AttentionState::Focused,
            labels.clone(),
            0.8,
            vec![AnalysisSourceKind::Realtime],
        ),
        ReconciledSegment::new(
            session.id.clone(),
            120.0,
            300.0,
            AttentionState::Distracted,
            BTreeMap::new(),
            0.0,
            vec![],
        ),
    ];
    db.replace_segments(&session.id, &first).await.unwrap();
    assert_eq!(db.get_segments_for_session(&session.id).await.unwrap(), first);

    let second = vec![ReconciledSegment::new(
        session.id.clone(),
        0.0,
        300.0,
        AttentionState::Focused,
        labels,
        0.9,
        vec![AnalysisSourceKind::Realtime, AnalysisSourceKind::Pattern],
    )];
    db.replace_segments(&session.id, &second).await.unwrap();
    assert_eq!(db.get_segments_for_session(&session.id).await.unwrap(), second);
}
