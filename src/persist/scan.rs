//! Bulk operations driven by cursor scans over the key space.
//!
//! Scans never block the store: each round-trip examines at most
//! `scan_page_size` keys and hands back a cursor. Keys written or deleted
//! while a scan is running may or may not be visited.

use super::aggregate::Aggregate;
use super::engine::{AggregateStore, EntryCheck};
use super::index;
use super::index::{IndexDimension, IndexMembership};
use super::ttl::compute_expiry_seconds;
use crate::core::{Result, StoreError};
use crate::storage::{KvStore, ScanCursor};
use std::future::Future;
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};

/// Counters reported by a bulk operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Keys (or records) examined.
    pub visited: usize,
    /// Keys (or records) deleted.
    pub removed: usize,
}

/// Pages of keys matching one glob, fetched lazily.
pub struct KeyPages<'a> {
    store: &'a dyn KvStore,
    pattern: String,
    page_size: usize,
    cursor: Option<ScanCursor>,
}

impl KeyPages<'_> {
    /// Next page of matching keys, `None` once the scan is complete.
    /// A page can be empty while the scan is still running.
    pub async fn next_page(&mut self) -> Result<Option<Vec<String>>> {
        let Some(cursor) = self.cursor.take() else {
            return Ok(None);
        };
        let page = self.store.scan(&cursor, &self.pattern, self.page_size).await?;
        self.cursor = page.next;
        Ok(Some(page.keys))
    }
}

/// Pattern scans over a raw `KvStore`.
#[derive(Clone)]
pub struct KeyScanner {
    store: Arc<dyn KvStore>,
    page_size: usize,
}

impl KeyScanner {
    pub fn new(store: Arc<dyn KvStore>, page_size: usize) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
        }
    }

    pub fn pages(&self, pattern: &str) -> KeyPages<'_> {
        KeyPages {
            store: self.store.as_ref(),
            pattern: pattern.to_string(),
            page_size: self.page_size,
            cursor: Some(ScanCursor::start()),
        }
    }

    /// Call `visitor` once per matching key. Stops at the first error.
    /// Returns the number of keys visited.
    pub async fn for_each_matching<F, Fut>(&self, pattern: &str, mut visitor: F) -> Result<usize>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut pages = self.pages(pattern);
        let mut visited = 0;
        while let Some(keys) = pages.next_page().await? {
            for key in keys {
                visitor(key).await?;
                visited += 1;
            }
        }
        Ok(visited)
    }

    /// Delete every key matching `pattern`, one page per delete call.
    pub async fn delete_matching(&self, pattern: &str) -> Result<usize> {
        let mut pages = self.pages(pattern);
        let mut removed = 0;
        while let Some(keys) = pages.next_page().await? {
            if !keys.is_empty() {
                removed += self.store.delete(&keys).await?;
            }
        }
        Ok(removed)
    }
}

impl<A: Aggregate> AggregateStore<A> {
    pub fn scanner(&self) -> KeyScanner {
        KeyScanner::new(Arc::clone(&self.store), self.scan_page_size)
    }

    /// Visit every primary record of a realm, calling `remove` to decide
    /// (under the record's own conditional update) whether it goes.
    async fn remove_realm_records<P>(&self, realm_id: &str, mut remove: P) -> Result<ScanReport>
    where
        P: FnMut(&A) -> bool + Send,
    {
        let mut report = ScanReport::default();
        let scanner = self.scanner();
        let mut pages = scanner.pages(&self.keyspace.realm_pattern(realm_id));
        while let Some(keys) = pages.next_page().await? {
            for key in keys {
                let Some((key_realm, id)) = self.keyspace.parse_primary(&key) else {
                    continue;
                };
                if key_realm != realm_id {
                    continue;
                }
                report.visited += 1;
                if self.remove_if(realm_id, id, &mut remove).await? {
                    report.removed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Prune the stale members of every index set left in a realm.
    ///
    /// Each member is removed by a conditional commit watching its primary
    /// record, so entries of records written since the record pass survive.
    async fn prune_realm_indexes(&self, realm_id: &str) -> Result<usize> {
        let mut pruned = 0;
        let scanner = self.scanner();
        let mut pages = scanner.pages(&self.keyspace.realm_index_pattern(realm_id));
        while let Some(keys) = pages.next_page().await? {
            for index_key in keys {
                let Some((key_realm, dimension, value)) = self.keyspace.parse_index(&index_key)
                else {
                    continue;
                };
                if key_realm != realm_id {
                    continue;
                }
                let membership = IndexMembership::new(IndexDimension::from_tag(dimension), value);
                for id in self.store.members(&index_key).await? {
                    let record = self.load(realm_id, &id).await?;
                    if let EntryCheck::Pruned = self
                        .check_entry(realm_id, &id, &membership, &index_key, record)
                        .await?
                    {
                        pruned += 1;
                    }
                }
            }
        }
        Ok(pruned)
    }

    /// Delete every aggregate of a realm together with its index entries,
    /// then prune whatever stale entries the realm's index sets still hold.
    pub async fn remove_realm(&self, realm_id: &str) -> Result<ScanReport> {
        let span = info_span!("kvsessions.remove_realm", scope = A::SCOPE, realm = %realm_id);
        async {
            let mut report = self.remove_realm_records(realm_id, |_| true).await?;
            let leftover = self.prune_realm_indexes(realm_id).await?;
            report.removed += leftover;
            event!(
                Level::INFO,
                visited = report.visited,
                removed = report.removed,
                stale_index_entries = leftover,
                "realm removed"
            );
            Ok::<_, StoreError>(report)
        }
        .instrument(span)
        .await
    }

    /// Delete every aggregate of a realm that belongs to `membership`.
    pub async fn remove_by(&self, realm_id: &str, membership: &IndexMembership) -> Result<ScanReport> {
        let span = info_span!(
            "kvsessions.remove_by",
            scope = A::SCOPE,
            realm = %realm_id,
            dimension = %membership.dimension,
            value = %membership.value
        );
        async {
            let report = self
                .remove_realm_records(realm_id, |aggregate| {
                    index::memberships(aggregate).contains(membership)
                })
                .await?;
            event!(
                Level::INFO,
                visited = report.visited,
                removed = report.removed,
                "matching aggregates removed"
            );
            Ok::<_, StoreError>(report)
        }
        .instrument(span)
        .await
    }

    /// Delete aggregates whose deadline under the realm's current rules has
    /// passed, e.g. after the realm's lifespans were shortened.
    pub async fn sweep_expired(&self, realm_id: &str) -> Result<ScanReport> {
        let span = info_span!("kvsessions.sweep_expired", scope = A::SCOPE, realm = %realm_id);
        async {
            let lifespans = self.lifespans.lifespans(realm_id)?;
            let now_ms = self.clock.now_millis();
            let report = self
                .remove_realm_records(realm_id, |aggregate| {
                    compute_expiry_seconds(
                        &aggregate.lifespan_rules(&lifespans),
                        &aggregate.lifetime(),
                        now_ms,
                    )
                    .is_expired()
                })
                .await?;
            event!(
                Level::INFO,
                visited = report.visited,
                removed = report.removed,
                "expired aggregates swept"
            );
            Ok::<_, StoreError>(report)
        }
        .instrument(span)
        .await
    }

    /// Drop every key of the scope across all realms, without conditional
    /// commits. Concurrent writers may leave records behind.
    pub async fn clear(&self) -> Result<ScanReport> {
        let span = info_span!("kvsessions.clear", scope = A::SCOPE);
        async {
            let removed = self
                .scanner()
                .delete_matching(&self.keyspace.scope_pattern())
                .await?;
            event!(Level::INFO, removed, "scope cleared");
            Ok::<_, StoreError>(ScanReport {
                visited: removed,
                removed,
            })
        }
        .instrument(span)
        .await
    }
}
