use super::engine::{KeyTtl, KvStore, ScanCursor, ScanPage, Versioned};
use crate::core::{Clock, Result, StoreError, SystemClock};
use crate::expression::glob_match;
use crate::transaction::{ABSENT_REVISION, KvOp, Revision, Watch};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
enum KvValue {
    Bytes(Vec<u8>),
    Set(BTreeSet<String>),
    Sorted(BTreeMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: KvValue,
    revision: Revision,
    expires_at_ms: Option<i64>,
}

impl Entry {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms.is_some_and(|at| at <= now_ms)
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    last_revision: Revision,
}

impl Inner {
    /// Look up a live entry, dropping it first if it has expired.
    fn live(&mut self, key: &str, now_ms: i64) -> Option<&mut Entry> {
        if self
            .entries
            .get(key)
            .is_some_and(|entry| entry.is_expired(now_ms))
        {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn revision_of(&mut self, key: &str, now_ms: i64) -> Revision {
        self.live(key, now_ms)
            .map(|entry| entry.revision)
            .unwrap_or(ABSENT_REVISION)
    }

    fn next_revision(&mut self) -> Revision {
        self.last_revision += 1;
        self.last_revision
    }

    fn apply(&mut self, op: KvOp, revision: Revision, now_ms: i64) -> Result<()> {
        match op {
            KvOp::Put { key, value, ttl } => {
                let expires_at_ms = ttl.map(|ttl| {
                    now_ms.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
                });
                self.entries.insert(
                    key,
                    Entry {
                        value: KvValue::Bytes(value),
                        revision,
                        expires_at_ms,
                    },
                );
            }
            KvOp::Delete { key } => {
                self.entries.remove(&key);
            }
            KvOp::SetAdd { key, member } => {
                let entry = self.live(&key, now_ms);
                match entry {
                    Some(Entry {
                        value: KvValue::Set(members),
                        revision: current,
                        ..
                    }) => {
                        if members.insert(member) {
                            *current = revision;
                        }
                    }
                    Some(_) => return Err(StoreError::WrongType(key)),
                    None => {
                        self.entries.insert(
                            key,
                            Entry {
                                value: KvValue::Set(BTreeSet::from([member])),
                                revision,
                                expires_at_ms: None,
                            },
                        );
                    }
                }
            }
            KvOp::SetRemove { key, member } => {
                let emptied = match self.live(&key, now_ms) {
                    Some(Entry {
                        value: KvValue::Set(members),
                        revision: current,
                        ..
                    }) => {
                        if members.remove(&member) {
                            *current = revision;
                        }
                        members.is_empty()
                    }
                    Some(_) => return Err(StoreError::WrongType(key)),
                    None => false,
                };
                if emptied {
                    self.entries.remove(&key);
                }
            }
            KvOp::SortedAdd { key, member, score } => match self.live(&key, now_ms) {
                Some(Entry {
                    value: KvValue::Sorted(members),
                    revision: current,
                    ..
                }) => {
                    if members.insert(member, score) != Some(score) {
                        *current = revision;
                    }
                }
                Some(_) => return Err(StoreError::WrongType(key)),
                None => {
                    self.entries.insert(
                        key,
                        Entry {
                            value: KvValue::Sorted(BTreeMap::from([(member, score)])),
                            revision,
                            expires_at_ms: None,
                        },
                    );
                }
            },
            KvOp::SortedRemove { key, member } => {
                let emptied = match self.live(&key, now_ms) {
                    Some(Entry {
                        value: KvValue::Sorted(members),
                        revision: current,
                        ..
                    }) => {
                        if members.remove(&member).is_some() {
                            *current = revision;
                        }
                        members.is_empty()
                    }
                    Some(_) => return Err(StoreError::WrongType(key)),
                    None => false,
                };
                if emptied {
                    self.entries.remove(&key);
                }
            }
        }
        Ok(())
    }
}

/// In-process `KvStore` with revision-based WATCH semantics.
///
/// All state lives behind one mutex that is never held across an `.await`,
/// so every trait method is a single atomic step. Expired keys are dropped
/// lazily when touched and are invisible to every read.
pub struct InMemoryKvStore {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store whose key expiry follows `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> Result<usize> {
        let now_ms = self.clock.now_millis();
        let inner = self.inner.lock()?;
        Ok(inner
            .entries
            .values()
            .filter(|entry| !entry.is_expired(now_ms))
            .count())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        let now_ms = self.clock.now_millis();
        let mut inner = self.inner.lock()?;
        match inner.live(key, now_ms) {
            Some(Entry {
                value: KvValue::Bytes(value),
                revision,
                ..
            }) => Ok(Some(Versioned {
                value: value.clone(),
                revision: *revision,
            })),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    async fn revision(&self, key: &str) -> Result<Revision> {
        let now_ms = self.clock.now_millis();
        let mut inner = self.inner.lock()?;
        Ok(inner.revision_of(key, now_ms))
    }

    async fn members(&self, key: &str) -> Result<Vec<String>> {
        let now_ms = self.clock.now_millis();
        let mut inner = self.inner.lock()?;
        match inner.live(key, now_ms) {
            Some(Entry {
                value: KvValue::Set(members),
                ..
            }) => Ok(members.iter().cloned().collect()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(Vec::new()),
        }
    }

    async fn rank_range(&self, key: &str, start: usize, stop: usize) -> Result<Vec<String>> {
        let now_ms = self.clock.now_millis();
        let mut inner = self.inner.lock()?;
        match inner.live(key, now_ms) {
            Some(Entry {
                value: KvValue::Sorted(members),
                ..
            }) => {
                let mut ranked: Vec<(&String, f64)> =
                    members.iter().map(|(member, score)| (member, *score)).collect();
                ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
                Ok(ranked
                    .into_iter()
                    .skip(start)
                    .take(stop.saturating_sub(start))
                    .map(|(member, _)| member.clone())
                    .collect())
            }
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(Vec::new()),
        }
    }

    async fn cardinality(&self, key: &str) -> Result<usize> {
        let now_ms = self.clock.now_millis();
        let mut inner = self.inner.lock()?;
        match inner.live(key, now_ms) {
            Some(Entry {
                value: KvValue::Set(members),
                ..
            }) => Ok(members.len()),
            Some(Entry {
                value: KvValue::Sorted(members),
                ..
            }) => Ok(members.len()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(0),
        }
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let now_ms = self.clock.now_millis();
        let mut inner = self.inner.lock()?;
        Ok(match inner.live(key, now_ms) {
            None => KeyTtl::Missing,
            Some(Entry {
                expires_at_ms: None,
                ..
            }) => KeyTtl::Persistent,
            Some(Entry {
                expires_at_ms: Some(at),
                ..
            }) => {
                let remaining = u64::try_from(at.saturating_sub(now_ms)).unwrap_or(0);
                KeyTtl::Expires(Duration::from_millis(remaining))
            }
        })
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let now_ms = self.clock.now_millis();
        let mut inner = self.inner.lock()?;
        Ok(inner.live(key, now_ms).is_some())
    }

    async fn commit(&self, watches: &[Watch], ops: Vec<KvOp>) -> Result<bool> {
        let now_ms = self.clock.now_millis();
        let mut inner = self.inner.lock()?;

        for watch in watches {
            if inner.revision_of(&watch.key, now_ms) != watch.revision {
                return Ok(false);
            }
        }

        let revision = inner.next_revision();
        let mut undo: Vec<(String, Option<Entry>)> = Vec::new();
        for op in ops {
            let key = op.key().to_string();
            if !undo.iter().any(|(touched, _)| *touched == key) {
                let previous = inner.entries.get(&key).cloned();
                undo.push((key, previous));
            }
            if let Err(err) = inner.apply(op, revision, now_ms) {
                for (key, previous) in undo.into_iter().rev() {
                    match previous {
                        Some(entry) => {
                            inner.entries.insert(key, entry);
                        }
                        None => {
                            inner.entries.remove(&key);
                        }
                    }
                }
                return Err(err);
            }
        }
        Ok(true)
    }

    async fn scan(&self, cursor: &ScanCursor, pattern: &str, count: usize) -> Result<ScanPage> {
        let now_ms = self.clock.now_millis();
        let inner = self.inner.lock()?;
        let lower = match cursor.position() {
            Some(after) => Bound::Excluded(after.to_string()),
            None => Bound::Unbounded,
        };

        let mut keys = Vec::new();
        let mut examined = 0usize;
        let mut last = None;
        for (key, entry) in inner
            .entries
            .range::<String, _>((lower, Bound::Unbounded))
            .take(count.max(1))
        {
            examined += 1;
            last = Some(key.clone());
            if !entry.is_expired(now_ms) && glob_match(key, pattern)? {
                keys.push(key.clone());
            }
        }

        let next = if examined == count.max(1) {
            last.map(ScanCursor::after)
        } else {
            None
        };
        Ok(ScanPage { keys, next })
    }

    async fn delete(&self, keys: &[String]) -> Result<usize> {
        let now_ms = self.clock.now_millis();
        let mut inner = self.inner.lock()?;
        let mut removed = 0;
        for key in keys {
            if inner.live(key, now_ms).is_some() {
                inner.entries.remove(key);
                removed += 1;
            }
        }
        Ok(removed)
    }
}
