mod common;

use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use common::{config, controller, database, FixedClassifier};
use vigil_lib::{
    models::{Session, SessionStatus},
    session::{recover, RecoveryPolicy},
};

#[tokio::test(start_paused = true)]
async fn shutdown_spools_backlog_and_recovery_resumes_it() {
    let (_dir, db) = database();
    let mut slow = config();
    slow.workers.pool_size = 1;
    slow.queues.upload_capacity = 8;
    let first = controller(
        slow,
        &db,
        FixedClassifier::slow("Focused", Duration::from_secs(150)),
    );

    let started = first.start_session().await.unwrap();
    tokio::time::sleep(Duration::from_secs(305)).await;
    let stopped = first.shutdown().await.unwrap().unwrap();

    assert_eq!(stopped.status, SessionStatus::Failed);
    assert_eq!(stopped.samples_captured, 5);
    let session = db.get_session(&started.id).await.unwrap().unwrap();
    assert_eq!(session.failure_reason.as_deref(), Some("interrupted by shutdown"));

    let classified = db.get_samples_for_session(&started.id).await.unwrap().len();
    let pending = db.get_pending_samples().await.unwrap();
    assert!(!pending.is_empty());
    assert_eq!(classified + pending.len(), 5);
    assert!(pending.iter().all(|pair| pair.session_id == started.id));
    assert!(first.shutdown().await.unwrap().is_none());

    let second = controller(config(), &db, FixedClassifier::new("Focused"));
    let report = second.recover(&CancellationToken::new()).await.unwrap();
    assert!(report.failed_sessions.is_empty());
    assert_eq!(report.resumed, pending.len());
    assert_eq!(report.remaining, 0);

    assert!(db.get_pending_samples().await.unwrap().is_empty());
    let samples = db.get_samples_for_session(&started.id).await.unwrap();
    assert_eq!(samples.len(), 5);
    assert!(samples.windows(2).all(|pair| pair[0].captured_at < pair[1].captured_at));
}

#[tokio::test(start_paused = true)]
async fn queued_pairs_are_durable_before_classification() {
    let (_dir, db) = database();
    let mut slow = config();
    slow.workers.pool_size = 1;
    let controller = controller(
        slow,
        &db,
        FixedClassifier::slow("Focused", Duration::from_secs(10_000)),
    );

    let started = controller.start_session().await.unwrap();
    tokio::time::sleep(Duration::from_secs(185)).await;

    let mut pending = Vec::new();
    for _ in 0..100 {
        pending = db.get_pending_samples().await.unwrap();
        if pending.len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(pending.len(), 3);
    assert!(pending.iter().all(|pair| pair.session_id == started.id));
    let seqs: Vec<u64> = pending.iter().map(|pair| pair.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    assert!(db.get_samples_for_session(&started.id).await.unwrap().is_empty());

    assert!(controller.recover(&CancellationToken::new()).await.is_err());
    let live = db.get_session(&started.id).await.unwrap().unwrap();
    assert_eq!(live.status, SessionStatus::Active);
    assert_eq!(db.get_pending_samples().await.unwrap().len(), 3);

    controller.shutdown().await.unwrap();
    let classified = db.get_samples_for_session(&started.id).await.unwrap();
    let pending = db.get_pending_samples().await.unwrap();
    assert_eq!(classified.len() + pending.len(), 3);
    assert!(classified
        .iter()
        .all(|sample| pending.iter().all(|pair| pair.id != sample.sample_id)));
}

#[tokio::test]
async fn open_sessions_are_failed_on_startup() {
    let (_dir, db) = database();
    let active = Session::start(60, Utc::now());
    let mut paused = Session::start(60, Utc::now());
    paused.status = SessionStatus::Paused;
    let mut done = Session::start(60, Utc::now());
    done.status = SessionStatus::Completed;
    for session in [&active, &paused, &done] {
        db.insert_session(session).await.unwrap();
    }

    let report = recover(&db, RecoveryPolicy::Discard, None, &CancellationToken::new())
        .await
        .unwrap();

    let mut failed = report.failed_sessions.clone();
    failed.sort();
    let mut expected = vec![active.id.clone(), paused.id.clone()];
    expected.sort();
    assert_eq!(failed, expected);

    for id in [&active.id, &paused.id] {
        let session = db.get_session(id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(session.failure_reason.as_deref(), Some("session did not end cleanly"));
        assert!(session.ended_at.is_some());
    }
    let untouched = db.get_session(&done.id).await.unwrap().unwrap();
    assert_eq!(untouched.status, SessionStatus::Completed);
    assert!(db.get_open_sessions().await.unwrap().is_empty());
}
