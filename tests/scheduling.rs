mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use common::{FakeBackend, commit, descriptor, entry, eventually, orchestrator};
use drommage::analysis::{AnalysisMode, AnalysisPayload, Session};
use drommage::error::{DrommageError, FailureReason};
use drommage::orchestrator::ModeStatus;
use drommage::scheduler::{Poll, RequestOptions};

fn refresh() -> RequestOptions {
    RequestOptions {
        force_refresh: true,
        template: None,
    }
}

#[tokio::test]
async fn simultaneous_requests_share_one_computation() {
    let fake = FakeBackend::slow(Duration::from_millis(200));
    let o = orchestrator(vec![entry(descriptor("local", 1), fake.clone())], 4);
    let c = commit("abc123");

    let a = o.trigger(&c, AnalysisMode::Brief, RequestOptions::default()).unwrap();
    let b = o.trigger(&c, AnalysisMode::Brief, RequestOptions::default()).unwrap();
    assert!(!a.is_cached());
    assert!(!b.is_cached());
    assert!(matches!(o.poll(&b), Poll::Pending));

    let snapshot = o.status_snapshot("abc123").unwrap();
    assert_eq!(snapshot[&AnalysisMode::Brief], ModeStatus::Pending);
    assert_eq!(snapshot[&AnalysisMode::Deep], ModeStatus::Absent);

    let (va, vb) = tokio::join!(a.wait(), b.wait());
    let (va, vb) = (va.unwrap(), vb.unwrap());
    assert_eq!(va, vb);
    assert_eq!(va.number, 1);
    assert_eq!(va.provider, "local");
    assert_eq!(fake.sent(), 1, "exactly one background computation");

    let snapshot = o.status_snapshot("abc123").unwrap();
    assert_eq!(snapshot[&AnalysisMode::Brief], ModeStatus::Cached { version: 1 });
    assert_eq!(o.scheduler().in_flight_count(), 0);
}

#[tokio::test]
async fn joined_waiters_see_the_same_failure() {
    let fake = FakeBackend::failing(FailureReason::Unreachable);
    let o = orchestrator(vec![entry(descriptor("only", 1), fake.clone())], 2);
    let c = commit("def456");

    let a = o.trigger(&c, AnalysisMode::Deep, RequestOptions::default()).unwrap();
    let b = o.trigger(&c, AnalysisMode::Deep, RequestOptions::default()).unwrap();
    let (ra, rb) = tokio::join!(a.wait(), b.wait());
    let (ea, eb) = (ra.unwrap_err(), rb.unwrap_err());

    assert!(Arc::ptr_eq(&ea, &eb));
    assert_eq!(ea.reason_code(), "all_providers_exhausted");
    assert_eq!(fake.sent(), 1);
    assert!(o.get_latest("def456", AnalysisMode::Deep).unwrap().is_none());
}

#[tokio::test]
async fn timeout_falls_back_to_next_provider() {
    let mut slow = descriptor("ollama", 1);
    slow.timeout_secs = 1;
    let o = orchestrator(
        vec![
            entry(slow, FakeBackend::slow(Duration::from_secs(5))),
            entry(descriptor("fallback", 2), FakeBackend::healthy()),
        ],
        2,
    );

    let started = Instant::now();
    let handle = o
        .trigger(&commit("abc123"), AnalysisMode::Brief, RequestOptions::default())
        .unwrap();
    let version = handle.wait().await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(version.provider, "fallback");
    match o.poll(&handle) {
        Poll::Done(v) => assert_eq!(v.provider, "fallback"),
        other => panic!("expected Done, got {other:?}"),
    }
    let attempts = &version.metadata["failed_attempts"];
    assert_eq!(attempts[0]["provider"], "ollama");
    assert_eq!(attempts[0]["reason"], "timeout");
}

#[tokio::test]
async fn no_available_provider_is_a_reportable_outcome() {
    let o = orchestrator(vec![entry(descriptor("offline", 1), FakeBackend::down())], 2);
    let err = o
        .resolve(&commit("abc123"), AnalysisMode::Brief, RequestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(*err, DrommageError::NoProviderAvailable { mode: AnalysisMode::Brief }));
    assert_eq!(err.reason_code(), "no_provider_available");
}

#[tokio::test]
async fn pattern_mode_needs_no_provider() {
    let o = orchestrator(vec![], 1);
    let v = o
        .resolve(&commit("abc123"), AnalysisMode::Pattern, RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(v.provider, "pattern_analyzer");
    assert!(v.metadata.contains_key("change_type"));
}

#[tokio::test]
async fn abandon_before_send_cancels_and_frees_the_key() {
    let hold = Arc::new(Notify::new());
    let fake = FakeBackend::held(hold.clone());
    let o = orchestrator(vec![entry(descriptor("cloud", 1), fake.clone())], 2);
    let c = commit("abc123");

    let handle = o.trigger(&c, AnalysisMode::Deep, RequestOptions::default()).unwrap();
    assert!(eventually(Duration::from_secs(2), || fake.entered() == 1).await);

    assert!(o.abandon(&handle));
    match o.poll(&handle) {
        Poll::Failed(e) => assert!(matches!(*e, DrommageError::Cancelled)),
        other => panic!("expected Failed(Cancelled), got {other:?}"),
    }
    assert!(!o.scheduler().in_flight("abc123", AnalysisMode::Deep));
    assert_eq!(
        o.status_snapshot("abc123").unwrap()[&AnalysisMode::Deep],
        ModeStatus::Absent
    );

    hold.notify_one();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fake.sent(), 0, "nothing went over the wire");
    assert!(o.get_latest("abc123", AnalysisMode::Deep).unwrap().is_none());
}

#[tokio::test]
async fn abandon_with_other_waiters_keeps_running() {
    let hold = Arc::new(Notify::new());
    let fake = FakeBackend::held(hold.clone());
    let o = orchestrator(vec![entry(descriptor("cloud", 1), fake.clone())], 2);
    let c = commit("abc123");

    let first = o.trigger(&c, AnalysisMode::Brief, RequestOptions::default()).unwrap();
    let second = o.trigger(&c, AnalysisMode::Brief, RequestOptions::default()).unwrap();
    assert!(eventually(Duration::from_secs(2), || fake.entered() == 1).await);

    assert!(!o.abandon(&first));
    hold.notify_one();

    let v = second.wait().await.unwrap();
    assert_eq!(v.number, 1);
    assert_eq!(fake.sent(), 1);
}

#[tokio::test]
async fn abandon_after_send_lets_the_work_finish() {
    let fake = FakeBackend::slow(Duration::from_millis(200));
    let o = orchestrator(vec![entry(descriptor("cloud", 1), fake.clone())], 2);
    let c = commit("abc123");

    let handle = o.trigger(&c, AnalysisMode::Brief, RequestOptions::default()).unwrap();
    assert!(eventually(Duration::from_secs(2), || fake.sent() == 1).await);
    assert!(!o.abandon(&handle));

    assert!(
        eventually(Duration::from_secs(2), || {
            o.get_latest("abc123", AnalysisMode::Brief).unwrap().is_some()
        })
        .await
    );
}

#[tokio::test]
async fn force_refresh_joins_an_in_flight_ticket() {
    let fake = FakeBackend::slow(Duration::from_millis(150));
    let o = orchestrator(vec![entry(descriptor("local", 1), fake.clone())], 2);
    let c = commit("abc123");

    let a = o.trigger(&c, AnalysisMode::Brief, RequestOptions::default()).unwrap();
    let b = o.trigger(&c, AnalysisMode::Brief, refresh()).unwrap();
    let (va, vb) = tokio::join!(a.wait(), b.wait());
    assert_eq!(va.unwrap().number, vb.unwrap().number);
    assert_eq!(fake.sent(), 1);
}

#[tokio::test]
async fn force_refresh_appends_a_new_version() {
    let fake = FakeBackend::healthy();
    let o = orchestrator(vec![entry(descriptor("local", 1), fake.clone())], 2);
    let c = commit("abc123");

    let v1 = o.resolve(&c, AnalysisMode::Brief, RequestOptions::default()).await.unwrap();
    let cached = o.trigger(&c, AnalysisMode::Brief, RequestOptions::default()).unwrap();
    assert!(cached.is_cached());
    let v2 = o.resolve(&c, AnalysisMode::Brief, refresh()).await.unwrap();

    assert_eq!((v1.number, v2.number), (1, 2));
    assert_eq!(fake.sent(), 2);
    let history = o.list_versions("abc123", AnalysisMode::Brief).unwrap();
    assert_eq!(history.iter().map(|v| v.number).collect::<Vec<_>>(), vec![1, 2]);
}

#[tokio::test]
async fn failed_refresh_keeps_the_previous_version() {
    let fake = FakeBackend::failing(FailureReason::RateLimited);
    let o = orchestrator(vec![entry(descriptor("cloud", 1), fake)], 2);
    o.scheduler()
        .store()
        .append(
            "abc123",
            AnalysisMode::Brief,
            "earlier",
            &AnalysisPayload::summary_only("previous result"),
            None,
        )
        .unwrap();

    let err = o
        .resolve(&commit("abc123"), AnalysisMode::Brief, refresh())
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    let latest = o.get_latest("abc123", AnalysisMode::Brief).unwrap().unwrap();
    assert_eq!(latest.number, 1);
    assert_eq!(latest.summary, "previous result");
}

#[tokio::test]
async fn mode_toggle_is_independent_of_running_work() {
    let fake = FakeBackend::slow(Duration::from_millis(300));
    let o = orchestrator(vec![entry(descriptor("local", 1), fake)], 1);
    let _pending = o
        .trigger(&commit("abc123"), AnalysisMode::Brief, RequestOptions::default())
        .unwrap();

    let mut session = Session::default();
    let started = Instant::now();
    assert_eq!(o.current_mode(&session), AnalysisMode::Pattern);
    assert_eq!(o.advance_mode(&mut session), AnalysisMode::Brief);
    assert_eq!(o.advance_mode(&mut session), AnalysisMode::Deep);
    assert_eq!(o.advance_mode(&mut session), AnalysisMode::Pattern);
    assert!(started.elapsed() < Duration::from_millis(50));
    assert!(o.scheduler().in_flight("abc123", AnalysisMode::Brief));
}

#[tokio::test]
async fn usage_counters_follow_provider_calls() {
    let mut priced = descriptor("cloud", 1);
    priced.cost_per_1k_tokens = 2.0;
    let o = orchestrator(vec![entry(priced, FakeBackend::healthy())], 2);

    o.resolve(&commit("aaa111"), AnalysisMode::Brief, RequestOptions::default())
        .await
        .unwrap();
    o.resolve(&commit("bbb222"), AnalysisMode::Deep, RequestOptions::default())
        .await
        .unwrap();

    let usage = o.provider_usage().unwrap();
    let cloud = usage.iter().find(|u| u.provider == "cloud").unwrap();
    assert_eq!(cloud.calls, 2);
    assert_eq!(cloud.tokens, 300);
    assert!((cloud.cost - 0.6).abs() < 1e-9);
}

#[tokio::test]
async fn submit_checks_the_cache_off_the_executor() {
    let fake = FakeBackend::slow(Duration::from_millis(100));
    let o = orchestrator(vec![entry(descriptor("local", 1), fake.clone())], 2);
    let c = commit("abc123");

    let first = o.submit(&c, AnalysisMode::Brief, RequestOptions::default()).await.unwrap();
    let joined = o.submit(&c, AnalysisMode::Brief, RequestOptions::default()).await.unwrap();
    assert!(!first.is_cached());
    assert!(!joined.is_cached());
    let (a, b) = tokio::join!(first.wait(), joined.wait());
    assert_eq!(a.unwrap(), b.unwrap());

    let cached = o.submit(&c, AnalysisMode::Brief, RequestOptions::default()).await.unwrap();
    assert!(cached.is_cached());
    assert_eq!(cached.wait().await.unwrap().number, 1);
    assert_eq!(fake.sent(), 1);
}
