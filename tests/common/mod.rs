#![allow(dead_code)]

use async_trait::async_trait;
use futures::future::BoxFuture;
use kvsessions::{
    Aggregate, AggregateStore, IndexDimension, IndexMembership, InMemoryKvStore, KeyTtl, KvOp,
    KvStore, KvSessions, LifespanRules, Lifetime, ManualClock, RealmLifespans, Result, Revision,
    ScanCursor, ScanPage, StaticLifespanProvider, StoreConfig, StoreError, Versioned, Watch,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Minimal aggregate used to exercise the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Counter {
    pub id: String,
    pub realm: String,
    pub user: Option<String>,
    pub tags: Vec<String>,
    pub field: i64,
    pub created_ms: i64,
    pub last_activity_ms: i64,
}

impl Counter {
    pub fn new(id: &str, realm: &str, user: &str, now_ms: i64) -> Self {
        Self {
            id: id.to_string(),
            realm: realm.to_string(),
            user: Some(user.to_string()),
            tags: Vec::new(),
            field: 0,
            created_ms: now_ms,
            last_activity_ms: now_ms,
        }
    }
}

impl Aggregate for Counter {
    const SCOPE: &'static str = "counters";

    fn id(&self) -> &str {
        &self.id
    }

    fn realm_id(&self) -> &str {
        &self.realm
    }

    fn index_memberships(&self) -> Vec<IndexMembership> {
        let mut out: Vec<IndexMembership> = self
            .tags
            .iter()
            .map(|tag| IndexMembership::new(IndexDimension::Custom("tag".into()), tag.clone()))
            .collect();
        if let Some(user) = &self.user {
            out.push(IndexMembership::new(IndexDimension::User, user.clone()));
        }
        out
    }

    fn order_score(&self) -> Option<f64> {
        Some(self.created_ms as f64)
    }

    fn lifetime(&self) -> Lifetime {
        Lifetime::new(self.created_ms, self.last_activity_ms)
    }

    fn lifespan_rules(&self, lifespans: &RealmLifespans) -> LifespanRules {
        lifespans.sessions
    }
}

/// Store wrapper that can reject commits, fail round-trips, add latency and
/// run a hook on demand.
pub struct FlakyStore {
    inner: Arc<InMemoryKvStore>,
    reject_next: AtomicUsize,
    transport_down: AtomicBool,
    latency_ms: AtomicU64,
    index_scan_hook: Mutex<Option<BoxFuture<'static, ()>>>,
    commits: AtomicUsize,
    rejected: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<InMemoryKvStore>) -> Self {
        Self {
            inner,
            reject_next: AtomicUsize::new(0),
            transport_down: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
            index_scan_hook: Mutex::new(None),
            commits: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
        }
    }

    /// Make the next `n` commits report a conflict without applying anything.
    pub fn reject_next_commits(&self, n: usize) {
        self.reject_next.store(n, Ordering::SeqCst);
    }

    pub fn set_transport_down(&self, down: bool) {
        self.transport_down.store(down, Ordering::SeqCst);
    }

    /// Delay every `get` and `commit` by `latency`, so concurrent updates
    /// interleave between load and commit the way they do over a network.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Run `hook` once, right before the first scan over index keys.
    pub fn before_index_scan(&self, hook: BoxFuture<'static, ()>) {
        *self.index_scan_hook.lock().unwrap() = Some(hook);
    }

    /// Commits submitted, accepted or not.
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }

    async fn delay(&self) {
        let latency_ms = self.latency_ms.load(Ordering::SeqCst);
        if latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(latency_ms)).await;
        }
    }

    fn take_index_scan_hook(&self, pattern: &str) -> Option<BoxFuture<'static, ()>> {
        if !pattern.contains(":#") {
            return None;
        }
        self.index_scan_hook.lock().unwrap().take()
    }

    fn check_transport(&self) -> Result<()> {
        if self.transport_down.load(Ordering::SeqCst) {
            return Err(StoreError::Transport("connection reset by peer".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        self.check_transport()?;
        self.delay().await;
        self.inner.get(key).await
    }

    async fn revision(&self, key: &str) -> Result<Revision> {
        self.check_transport()?;
        self.inner.revision(key).await
    }

    async fn members(&self, key: &str) -> Result<Vec<String>> {
        self.check_transport()?;
        self.inner.members(key).await
    }

    async fn rank_range(&self, key: &str, start: usize, stop: usize) -> Result<Vec<String>> {
        self.check_transport()?;
        self.inner.rank_range(key, start, stop).await
    }

    async fn cardinality(&self, key: &str) -> Result<usize> {
        self.check_transport()?;
        self.inner.cardinality(key).await
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        self.check_transport()?;
        self.inner.ttl(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check_transport()?;
        self.inner.exists(key).await
    }

    async fn commit(&self, watches: &[Watch], ops: Vec<KvOp>) -> Result<bool> {
        self.check_transport()?;
        self.delay().await;
        self.commits.fetch_add(1, Ordering::SeqCst);
        let rejected = self
            .reject_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Ok(false);
        }
        self.inner.commit(watches, ops).await
    }

    async fn scan(&self, cursor: &ScanCursor, pattern: &str, count: usize) -> Result<ScanPage> {
        self.check_transport()?;
        if let Some(hook) = self.take_index_scan_hook(pattern) {
            hook.await;
        }
        self.inner.scan(cursor, pattern, count).await
    }

    async fn delete(&self, keys: &[String]) -> Result<usize> {
        self.check_transport()?;
        self.inner.delete(keys).await
    }
}

/// Everything a test needs, wired to one manual clock.
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub kv: Arc<InMemoryKvStore>,
    pub flaky: Arc<FlakyStore>,
    pub lifespans: Arc<StaticLifespanProvider>,
    pub config: StoreConfig,
}

impl Harness {
    /// Counters (and online user sessions) follow `rules`.
    pub fn new(rules: LifespanRules) -> Self {
        Self::with_config(rules, StoreConfig::new("t").backoff_ms(1, 2))
    }

    pub fn with_config(rules: LifespanRules, config: StoreConfig) -> Self {
        let clock = Arc::new(ManualClock::new(0));
        let kv = Arc::new(InMemoryKvStore::with_clock(clock.clone()));
        let flaky = Arc::new(FlakyStore::new(kv.clone()));
        let lifespans = Arc::new(StaticLifespanProvider::new(RealmLifespans {
            sessions: rules,
            ..RealmLifespans::default()
        }));
        Self {
            clock,
            kv,
            flaky,
            lifespans,
            config,
        }
    }

    pub fn counters(&self) -> AggregateStore<Counter> {
        AggregateStore::new(
            self.flaky.clone(),
            &self.config,
            self.lifespans.clone(),
            self.clock.clone(),
        )
        .unwrap()
    }

    /// Counters written straight to the inner store, bypassing the wrapper.
    pub fn direct_counters(&self) -> AggregateStore<Counter> {
        AggregateStore::new(
            self.kv.clone(),
            &self.config,
            self.lifespans.clone(),
            self.clock.clone(),
        )
        .unwrap()
    }

    pub fn sessions(&self) -> KvSessions {
        KvSessions::new(
            self.flaky.clone(),
            self.config.clone(),
            self.lifespans.clone(),
            self.clock.clone(),
        )
        .unwrap()
    }

    pub fn advance_secs(&self, secs: u64) {
        self.clock.advance(Duration::from_secs(secs));
    }

    /// Set the rules of one realm, keeping the other defaults.
    pub fn set_realm_rules(&self, realm: &str, rules: LifespanRules) {
        self.lifespans
            .set_realm(
                realm,
                RealmLifespans {
                    sessions: rules,
                    ..RealmLifespans::default()
                },
            )
            .unwrap();
    }

    pub async fn keys(&self, pattern: &str) -> Vec<String> {
        let mut cursor = ScanCursor::start();
        let mut keys = Vec::new();
        loop {
            let page = self.kv.scan(&cursor, pattern, 1000).await.unwrap();
            keys.extend(page.keys);
            match page.next {
                Some(next) => cursor = next,
                None => break,
            }
        }
        keys
    }

    pub async fn members(&self, key: &str) -> Vec<String> {
        self.kv.members(key).await.unwrap()
    }
}
