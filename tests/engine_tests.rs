/// Update engine tests
///
/// Conflict retry, mutator/codec/transport failures and TTL handling of the
/// read-modify-commit loop.
/// Run with: cargo test --test engine_tests
mod common;

use common::{Counter, Harness};
use kvsessions::{
    Aggregate, ConflictRetryPolicy, KeyTtl, KvOp, KvStore, LifespanRules, StoreConfig, StoreError,
    UpdateError,
};
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn increment(current: Option<Counter>) -> Result<Option<Counter>, Infallible> {
    Ok(current.map(|mut counter| {
        counter.field += 1;
        counter
    }))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_increments_are_not_lost() {
    let harness = Harness::with_config(LifespanRules::new(3600, 900), StoreConfig::new("t"));
    let counters = harness.counters();
    counters.create(Counter::new("c1", "r1", "u1", 0)).await.unwrap();

    let mut handles = vec![];
    for _ in 0..50 {
        let counters = counters.clone();
        handles.push(tokio::spawn(async move {
            counters.update("r1", "c1", increment).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let counter = counters.get("r1", "c1").await.unwrap().unwrap();
    assert_eq!(counter.field, 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_increments_survive_store_latency() {
    let harness = Harness::with_config(LifespanRules::new(3600, 900), StoreConfig::new("t"));
    let counters = harness.counters();
    counters.create(Counter::new("c1", "r1", "u1", 0)).await.unwrap();
    harness.flaky.set_latency(Duration::from_millis(1));

    let mut handles = vec![];
    for _ in 0..50 {
        let counters = counters.clone();
        handles.push(tokio::spawn(async move {
            counters.update("r1", "c1", increment).await
        }));
    }
    let mut failed = 0;
    for handle in handles {
        if handle.await.unwrap().is_err() {
            failed += 1;
        }
    }

    let counter = counters.get("r1", "c1").await.unwrap().unwrap();
    assert_eq!(failed, 0);
    assert_eq!(counter.field, 50);
    // Loads and commits interleaved, so some rounds were lost and retried
    assert!(harness.flaky.commits() > 51);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_session_scenario_ttl_and_indexes() {
    let harness = Harness::with_config(LifespanRules::new(10, 10), StoreConfig::new("t"));
    let counters = harness.counters();
    counters.create(Counter::new("s1", "r1", "u1", 0)).await.unwrap();

    let ttl = harness.kv.ttl("t:counters:r1:s1").await.unwrap();
    assert_eq!(ttl, KeyTtl::Expires(Duration::from_secs(10)));

    let mut handles = vec![];
    for _ in 0..10 {
        let counters = counters.clone();
        handles.push(tokio::spawn(async move {
            counters.update("r1", "s1", increment).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(counters.get("r1", "s1").await.unwrap().unwrap().field, 10);
    assert_eq!(harness.members("t:counters:r1:#realm:r1").await, vec!["s1"]);
    assert_eq!(harness.members("t:counters:r1:#user:u1").await, vec!["s1"]);

    match harness.kv.ttl("t:counters:r1:s1").await.unwrap() {
        KeyTtl::Expires(remaining) => {
            assert!(remaining > Duration::ZERO);
            assert!(remaining <= Duration::from_secs(10));
        }
        other => panic!("expected an expiring key, got {:?}", other),
    }
}

#[tokio::test]
async fn test_update_of_missing_key_to_none_is_noop() {
    let harness = Harness::new(LifespanRules::new(10, 10));
    let counters = harness.counters();

    let result = counters
        .update("r1", "s2", |_current: Option<Counter>| Ok::<_, Infallible>(None))
        .await
        .unwrap();

    assert!(result.is_none());
    assert_eq!(harness.flaky.commits(), 0);
    assert!(harness.kv.is_empty().unwrap());
}

#[tokio::test]
async fn test_mutator_sees_none_for_missing_and_can_create() {
    let harness = Harness::new(LifespanRules::new(10, 10));
    let counters = harness.counters();

    let created = counters
        .update("r1", "c1", |current: Option<Counter>| {
            assert!(current.is_none());
            Ok::<_, Infallible>(Some(Counter::new("c1", "r1", "u1", 0)))
        })
        .await
        .unwrap();

    assert_eq!(created.unwrap().id, "c1");
    assert!(harness.kv.exists("t:counters:r1:c1").await.unwrap());
}

#[tokio::test]
async fn test_retry_ceiling_is_fatal_and_leaves_value_unchanged() {
    let harness = Harness::new(LifespanRules::new(10, 10));
    let counters = harness.counters();
    counters.create(Counter::new("c1", "r1", "u1", 0)).await.unwrap();

    harness.flaky.reject_next_commits(9);
    let calls = AtomicUsize::new(0);
    let err = counters
        .update("r1", "c1", |current: Option<Counter>| {
            calls.fetch_add(1, Ordering::SeqCst);
            increment(current)
        })
        .await
        .unwrap_err();

    assert!(err.is_retries_exhausted());
    match err {
        UpdateError::Store(StoreError::RetriesExhausted { key, attempts }) => {
            assert_eq!(key, "t:counters:r1:c1");
            assert_eq!(attempts, 8);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 8);
    assert_eq!(harness.flaky.rejected(), 8);
    assert_eq!(counters.get("r1", "c1").await.unwrap().unwrap().field, 0);
}

#[tokio::test]
async fn test_last_attempt_can_still_succeed() {
    let harness = Harness::new(LifespanRules::new(10, 10));
    let counters = harness.counters();
    counters.create(Counter::new("c1", "r1", "u1", 0)).await.unwrap();

    harness.flaky.reject_next_commits(7);
    let calls = AtomicUsize::new(0);
    let updated = counters
        .update("r1", "c1", |current: Option<Counter>| {
            calls.fetch_add(1, Ordering::SeqCst);
            increment(current)
        })
        .await
        .unwrap()
        .unwrap();

    assert_eq!(updated.field, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 8);
}

#[tokio::test]
async fn test_mutator_error_is_returned_after_one_attempt() {
    let harness = Harness::new(LifespanRules::new(10, 10));
    let counters = harness.counters();
    counters.create(Counter::new("c1", "r1", "u1", 0)).await.unwrap();
    let commits_before = harness.flaky.commits();

    let calls = AtomicUsize::new(0);
    let err = counters
        .update("r1", "c1", |_current: Option<Counter>| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<Option<Counter>, _>("quota exceeded")
        })
        .await
        .unwrap_err();

    assert_eq!(err.into_mutator(), Some("quota exceeded"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.flaky.commits(), commits_before);
}

#[tokio::test]
async fn test_codec_error_is_not_retried() {
    let harness = Harness::new(LifespanRules::new(10, 10));
    let counters = harness.counters();
    harness
        .kv
        .commit(
            &[],
            vec![KvOp::Put {
                key: "t:counters:r1:c1".into(),
                value: vec![0xc1],
                ttl: None,
            }],
        )
        .await
        .unwrap();

    let calls = AtomicUsize::new(0);
    let err = counters
        .update("r1", "c1", |current: Option<Counter>| {
            calls.fetch_add(1, Ordering::SeqCst);
            increment(current)
        })
        .await
        .unwrap_err();

    assert!(matches!(err, UpdateError::Store(StoreError::Codec(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.flaky.commits(), 0);
    assert!(matches!(
        counters.get("r1", "c1").await,
        Err(StoreError::Codec(_))
    ));
}

#[tokio::test]
async fn test_transport_error_is_surfaced() {
    let harness = Harness::new(LifespanRules::new(10, 10));
    let counters = harness.counters();
    harness.flaky.set_transport_down(true);

    let err = counters.update("r1", "c1", increment).await.unwrap_err();
    match err {
        UpdateError::Store(err @ StoreError::Transport(_)) => assert!(err.is_retryable()),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_expired_on_write_deletes_record_and_indexes() {
    let harness = Harness::new(LifespanRules::new(10, 10));
    let counters = harness.counters();
    counters.create(Counter::new("c1", "r1", "u1", 0)).await.unwrap();

    // Shorter rules for the realm; the stored TTL is still the old one
    harness.set_realm_rules("r1", LifespanRules::new(5, 5));
    harness.advance_secs(6);
    assert!(harness.kv.exists("t:counters:r1:c1").await.unwrap());

    let result = counters.update("r1", "c1", increment).await.unwrap();
    assert!(result.is_none());
    assert!(harness.keys("t:counters:*").await.is_empty());
}

#[tokio::test]
async fn test_create_of_already_expired_snapshot_writes_nothing() {
    let harness = Harness::new(LifespanRules::new(10, 10));
    let counters = harness.counters();
    harness.advance_secs(20);

    let created = counters.create(Counter::new("c1", "r1", "u1", 0)).await.unwrap();
    assert!(created.is_none());
    assert_eq!(harness.flaky.commits(), 0);
}

#[tokio::test]
async fn test_create_fails_when_present() {
    let harness = Harness::new(LifespanRules::new(10, 10));
    let counters = harness.counters();
    counters.create(Counter::new("c1", "r1", "u1", 0)).await.unwrap();

    let err = counters
        .create(Counter::new("c1", "r1", "u2", 0))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists(key) if key == "t:counters:r1:c1"));
    assert_eq!(harness.members("t:counters:r1:#user:u2").await, Vec::<String>::new());
}

#[tokio::test]
async fn test_unbounded_rules_are_rejected_for_expiring_aggregates() {
    let harness = Harness::new(LifespanRules::unbounded());
    let counters = harness.counters();

    let err = counters
        .create(Counter::new("c1", "r1", "u1", 0))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::UnboundedLifespan(_)));
    assert!(Counter::REQUIRES_EXPIRY);
}

#[tokio::test]
async fn test_mutator_cannot_change_identity() {
    let harness = Harness::new(LifespanRules::new(10, 10));
    let counters = harness.counters();
    counters.create(Counter::new("c1", "r1", "u1", 0)).await.unwrap();

    let err = counters
        .update("r1", "c1", |current: Option<Counter>| {
            Ok::<_, Infallible>(current.map(|mut counter| {
                counter.id = "c2".into();
                counter
            }))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, UpdateError::Store(StoreError::InvalidKey(_))));
}

#[tokio::test]
async fn test_activity_extends_ttl() {
    let harness = Harness::new(LifespanRules::new(3600, 900));
    let counters = harness.counters();
    counters.create(Counter::new("c1", "r1", "u1", 0)).await.unwrap();
    assert_eq!(
        harness.kv.ttl("t:counters:r1:c1").await.unwrap(),
        KeyTtl::Expires(Duration::from_secs(900))
    );

    // Idle binds while activity keeps coming; lifespan takes over at 3000s
    for step in 1..=5 {
        harness.advance_secs(600);
        let now = counters.now_millis();
        counters
            .modify("r1", "c1", |counter| counter.last_activity_ms = now)
            .await
            .unwrap();
        let expected = if step < 5 { 900 } else { 600 };
        assert_eq!(
            harness.kv.ttl("t:counters:r1:c1").await.unwrap(),
            KeyTtl::Expires(Duration::from_secs(expected))
        );
    }
}

#[tokio::test]
async fn test_remove_reports_existence() {
    let harness = Harness::new(LifespanRules::new(10, 10));
    let counters = harness.counters();
    counters.create(Counter::new("c1", "r1", "u1", 0)).await.unwrap();

    assert!(counters.remove("r1", "c1").await.unwrap());
    assert!(!counters.remove("r1", "c1").await.unwrap());
    assert!(harness.keys("t:counters:*").await.is_empty());
}

#[tokio::test]
async fn test_store_rejects_invalid_config() {
    let harness = Harness::with_config(
        LifespanRules::new(10, 10),
        StoreConfig::new("t").max_attempts(0),
    );
    let result = kvsessions::AggregateStore::<Counter>::new(
        Arc::clone(&harness.kv) as Arc<dyn KvStore>,
        &harness.config,
        harness.lifespans.clone(),
        harness.clock.clone(),
    );
    assert!(matches!(result, Err(StoreError::InvalidConfig(_))));
    assert_eq!(ConflictRetryPolicy::default().max_attempts, 8);
}
