//! Optimistic update engine.
//!
//! Every mutation of an aggregate is one read-modify-commit loop:
//!
//! 1. load the primary record and remember its revision (the watch),
//! 2. hand an owned copy of the decoded snapshot to the caller's mutator,
//! 3. stage the new payload (with its derived TTL) plus the index delta,
//! 4. submit everything as one conditional commit guarded by the watch.
//!
//! A rejected commit means another writer got there first; the loop reloads
//! and runs the mutator again, up to `ConflictRetryPolicy::max_attempts`.
//! A mutator error ends the call immediately and is never retried.

use super::aggregate::Aggregate;
use super::codec::RecordCodec;
use super::index::{self, IndexDimension, IndexMembership};
use super::keys::KeySpace;
use super::lifespan::{LifespanProvider, RealmLifespans};
use super::ttl::{Expiry, compute_expiry_seconds};
use crate::connection::{ConflictRetryPolicy, StoreConfig};
use crate::core::{Clock, Result, StoreError, UpdateError};
use crate::storage::KvStore;
use crate::transaction::{KvOp, Revision, UpdateAttempt, Watch};
use futures::future::try_join_all;
use log::{debug, error, warn};
use std::convert::Infallible;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// Mutator outcome used internally to end an update without writing.
struct Skipped;

/// Outcome of checking one index entry against the record it names.
pub(crate) enum EntryCheck<A> {
    /// The record exists and still belongs to the index.
    Live(A),
    /// The entry was stale and has been removed.
    Pruned,
    /// The entry was stale, but the record changed before it could be
    /// removed; left for the next reader.
    Kept,
}

/// Typed store for one aggregate kind.
///
/// Cheap to clone; clones share the underlying `KvStore`.
pub struct AggregateStore<A: Aggregate> {
    pub(crate) store: Arc<dyn KvStore>,
    pub(crate) keyspace: KeySpace,
    pub(crate) codec: RecordCodec,
    pub(crate) retry: ConflictRetryPolicy,
    pub(crate) scan_page_size: usize,
    pub(crate) lifespans: Arc<dyn LifespanProvider>,
    pub(crate) clock: Arc<dyn Clock>,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A: Aggregate> Clone for AggregateStore<A> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            keyspace: self.keyspace.clone(),
            codec: self.codec,
            retry: self.retry,
            scan_page_size: self.scan_page_size,
            lifespans: Arc::clone(&self.lifespans),
            clock: Arc::clone(&self.clock),
            _aggregate: PhantomData,
        }
    }
}

impl<A: Aggregate> AggregateStore<A> {
    pub fn new(
        store: Arc<dyn KvStore>,
        config: &StoreConfig,
        lifespans: Arc<dyn LifespanProvider>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            keyspace: KeySpace::new(config.namespace.as_str(), A::SCOPE)?,
            codec: config.codec,
            retry: config.retry,
            scan_page_size: config.scan_page_size,
            lifespans,
            clock,
            _aggregate: PhantomData,
        })
    }

    pub fn keyspace(&self) -> &KeySpace {
        &self.keyspace
    }

    pub fn kv_store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn retry_policy(&self) -> &ConflictRetryPolicy {
        &self.retry
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    pub fn realm_lifespans(&self, realm_id: &str) -> Result<RealmLifespans> {
        self.lifespans.lifespans(realm_id)
    }

    /// Read-modify-write one aggregate.
    ///
    /// `mutator` receives an owned copy of the current snapshot (`None` when
    /// absent) and returns the new snapshot, or `None` to delete. Returns the
    /// committed snapshot, or `None` when the record is absent afterwards
    /// (deleted, expired on write, or never existed).
    pub async fn update<F, E>(
        &self,
        realm_id: &str,
        id: &str,
        mut mutator: F,
    ) -> std::result::Result<Option<A>, UpdateError<E>>
    where
        F: FnMut(Option<A>) -> std::result::Result<Option<A>, E> + Send,
        E: Send,
    {
        let key = self.keyspace.primary_key(realm_id, id)?;
        let max_attempts = self.retry.max_attempts.max(1);

        for number in 1..=max_attempts {
            let loaded = self.store.get(&key).await?;
            let watch = match &loaded {
                Some(versioned) => Watch::new(key.as_str(), versioned.revision),
                None => Watch::absent(key.as_str()),
            };
            let previous: Option<A> = match loaded {
                Some(versioned) => Some(self.codec.decode(&versioned.value)?),
                None => None,
            };
            let mut attempt = UpdateAttempt::new(number, watch);

            let next = match mutator(previous.clone()) {
                Ok(next) => next,
                Err(err) => {
                    attempt.abandon();
                    return Err(UpdateError::Mutator(err));
                }
            };
            if let Some(next) = &next {
                check_identity(&key, realm_id, id, next)?;
            }

            let (ops, outcome) = self.plan_commit(&key, previous.as_ref(), next)?;
            attempt.stage(ops);
            if !attempt.has_writes() {
                attempt.abandon();
                return Ok(outcome);
            }

            let (watches, ops) = attempt.take_commit();
            let op_count = ops.len();
            let accepted = self.store.commit(&watches, ops).await?;
            attempt.finish(accepted);

            if accepted {
                debug!(
                    "Committed '{}' on attempt {} ({} ops, {:?})",
                    key,
                    attempt.number(),
                    op_count,
                    attempt.duration()
                );
                return Ok(outcome);
            }

            if number < max_attempts {
                let backoff_ms = self.retry.jittered_backoff_ms(number);
                warn!(
                    "AggregateStore.update retry on conflict for '{}' (attempt {} of {}, backoff={}ms)",
                    key, number, max_attempts, backoff_ms
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            }
        }

        error!(
            "AggregateStore.update gave up on '{}' after {} conflicting attempts",
            key, max_attempts
        );
        Err(StoreError::RetriesExhausted {
            key,
            attempts: max_attempts,
        }
        .into())
    }

    /// Stage the writes taking `previous` to `next`, and the value `update`
    /// reports once they are committed.
    fn plan_commit(
        &self,
        key: &str,
        previous: Option<&A>,
        next: Option<A>,
    ) -> Result<(Vec<KvOp>, Option<A>)> {
        let Some(next) = next else {
            return Ok((self.deletion_ops(key, previous)?, None));
        };

        let rules = next.lifespan_rules(&self.lifespans.lifespans(next.realm_id())?);
        let ttl = match compute_expiry_seconds(&rules, &next.lifetime(), self.clock.now_millis()) {
            Expiry::Expired => {
                debug!("Snapshot of '{}' is already expired, deleting", key);
                return Ok((self.deletion_ops(key, previous)?, None));
            }
            Expiry::Never if A::REQUIRES_EXPIRY => {
                return Err(StoreError::UnboundedLifespan(key.to_string()));
            }
            expiry => expiry.store_ttl(),
        };

        let mut ops = vec![KvOp::Put {
            key: key.to_string(),
            value: self.codec.encode(&next)?,
            ttl,
        }];
        ops.extend(index::diff(&self.keyspace, previous, Some(&next))?.into_ops());
        Ok((ops, Some(next)))
    }

    fn deletion_ops(&self, key: &str, previous: Option<&A>) -> Result<Vec<KvOp>> {
        let Some(previous) = previous else {
            return Ok(Vec::new());
        };
        let mut ops = vec![KvOp::Delete {
            key: key.to_string(),
        }];
        ops.extend(index::diff::<A>(&self.keyspace, Some(previous), None)?.into_ops());
        Ok(ops)
    }

    /// Insert a new aggregate; fails with `AlreadyExists` if the record is
    /// present. Returns `None` if the snapshot was already expired.
    pub async fn create(&self, aggregate: A) -> Result<Option<A>> {
        let realm_id = aggregate.realm_id().to_string();
        let id = aggregate.id().to_string();
        let key = self.keyspace.primary_key(&realm_id, &id)?;
        self.update(&realm_id, &id, |current: Option<A>| {
            if current.is_some() {
                return Err(StoreError::AlreadyExists(key.clone()));
            }
            Ok(Some(aggregate.clone()))
        })
        .await
        .map_err(StoreError::from)
    }

    /// Insert or replace an aggregate wholesale.
    pub async fn put(&self, aggregate: A) -> Result<Option<A>> {
        let realm_id = aggregate.realm_id().to_string();
        let id = aggregate.id().to_string();
        self.update(&realm_id, &id, |_current: Option<A>| {
            Ok::<_, Infallible>(Some(aggregate.clone()))
        })
        .await
        .map_err(StoreError::from)
    }

    /// Apply `change` to an existing aggregate; absent records stay absent.
    pub async fn modify<F>(&self, realm_id: &str, id: &str, mut change: F) -> Result<Option<A>>
    where
        F: FnMut(&mut A) + Send,
    {
        self.update(realm_id, id, |current: Option<A>| {
            Ok::<_, Infallible>(current.map(|mut aggregate| {
                change(&mut aggregate);
                aggregate
            }))
        })
        .await
        .map_err(StoreError::from)
    }

    /// Delete the aggregate if `predicate` holds for its current snapshot.
    /// Returns `true` if a record was deleted.
    pub async fn remove_if<P>(&self, realm_id: &str, id: &str, mut predicate: P) -> Result<bool>
    where
        P: FnMut(&A) -> bool + Send,
    {
        let result = self
            .update(realm_id, id, |current: Option<A>| match current {
                Some(aggregate) if predicate(&aggregate) => Ok(None),
                _ => Err(Skipped),
            })
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(UpdateError::Mutator(Skipped)) => Ok(false),
            Err(UpdateError::Store(err)) => Err(err),
        }
    }

    /// Delete the aggregate and its index entries. Returns `true` if it existed.
    pub async fn remove(&self, realm_id: &str, id: &str) -> Result<bool> {
        self.remove_if(realm_id, id, |_| true).await
    }

    pub async fn get(&self, realm_id: &str, id: &str) -> Result<Option<A>> {
        Ok(self.load(realm_id, id).await?.map(|(aggregate, _)| aggregate))
    }

    /// Decoded snapshot together with the revision it was read at.
    pub(crate) async fn load(&self, realm_id: &str, id: &str) -> Result<Option<(A, Revision)>> {
        let key = self.keyspace.primary_key(realm_id, id)?;
        match self.store.get(&key).await? {
            Some(versioned) => Ok(Some((self.codec.decode(&versioned.value)?, versioned.revision))),
            None => Ok(None),
        }
    }

    /// Whether the snapshot is past its deadline under the realm's current rules.
    pub fn is_expired(&self, aggregate: &A) -> Result<bool> {
        let rules = aggregate.lifespan_rules(&self.lifespans.lifespans(aggregate.realm_id())?);
        Ok(compute_expiry_seconds(&rules, &aggregate.lifetime(), self.clock.now_millis())
            .is_expired())
    }

    /// Load every aggregate indexed under `dimension = value` in a realm.
    ///
    /// Stale members are removed from the index on the way: those whose
    /// primary record no longer exists, and those whose record was re-created
    /// without this membership.
    pub async fn find_by(
        &self,
        realm_id: &str,
        dimension: &IndexDimension,
        value: &str,
    ) -> Result<Vec<A>> {
        let index_key = self.keyspace.index_key(realm_id, dimension.tag(), value)?;
        let membership = IndexMembership::new(dimension.clone(), value);
        let members = self.store.members(&index_key).await?;
        let loaded = try_join_all(members.iter().map(|id| self.load(realm_id, id))).await?;

        let mut found = Vec::with_capacity(loaded.len());
        for (id, record) in members.iter().zip(loaded) {
            if let EntryCheck::Live(aggregate) = self
                .check_entry(realm_id, id, &membership, &index_key, record)
                .await?
            {
                found.push(aggregate);
            }
        }
        Ok(found)
    }

    /// Check one member of the index set `index_key` against its loaded
    /// record. A stale member is removed under a watch on the primary key at
    /// the revision it was loaded at, so a concurrent write keeps the entry.
    pub(crate) async fn check_entry(
        &self,
        realm_id: &str,
        id: &str,
        membership: &IndexMembership,
        index_key: &str,
        record: Option<(A, Revision)>,
    ) -> Result<EntryCheck<A>> {
        let primary_key = self.keyspace.primary_key(realm_id, id)?;
        let watch = match record {
            Some((aggregate, _)) if index::memberships(&aggregate).contains(membership) => {
                return Ok(EntryCheck::Live(aggregate));
            }
            Some((_, revision)) => Watch::new(primary_key, revision),
            None => Watch::absent(primary_key),
        };
        let removal = KvOp::SetRemove {
            key: index_key.to_string(),
            member: id.to_string(),
        };
        if self.heal_entry(watch, removal).await? {
            Ok(EntryCheck::Pruned)
        } else {
            Ok(EntryCheck::Kept)
        }
    }

    /// Every aggregate of a realm, via the realm index.
    pub async fn list_realm(&self, realm_id: &str) -> Result<Vec<A>> {
        self.find_by(realm_id, &IndexDimension::Realm, realm_id).await
    }

    /// Raw size of an index set; may include orphans not yet healed.
    pub async fn count_by(
        &self,
        realm_id: &str,
        dimension: &IndexDimension,
        value: &str,
    ) -> Result<usize> {
        let index_key = self.keyspace.index_key(realm_id, dimension.tag(), value)?;
        self.store.cardinality(&index_key).await
    }

    /// Page through the scope-wide order index.
    ///
    /// Orphans found on the page are healed and skipped, so a page can be
    /// shorter than `limit` even when more records follow.
    pub async fn page(&self, offset: usize, limit: usize) -> Result<Vec<A>> {
        let order_key = self.keyspace.order_key();
        let members = self
            .store
            .rank_range(&order_key, offset, offset.saturating_add(limit))
            .await?;

        let mut found = Vec::with_capacity(members.len());
        for member in members {
            let Some((realm_id, id)) = self.keyspace.parse_order_member(&member) else {
                warn!("Skipping malformed order index member '{}'", member);
                continue;
            };
            match self.get(realm_id, id).await? {
                Some(aggregate) => found.push(aggregate),
                None => {
                    let primary_key = self.keyspace.primary_key(realm_id, id)?;
                    self.heal_entry(
                        Watch::absent(primary_key),
                        KvOp::SortedRemove {
                            key: order_key.clone(),
                            member: member.clone(),
                        },
                    )
                    .await?;
                }
            }
        }
        Ok(found)
    }

    /// Remove a stale index entry, provided the primary record is still at
    /// the watched revision (absent, for orphans).
    async fn heal_entry(&self, watch: Watch, removal: KvOp) -> Result<bool> {
        let index_key = removal.key().to_string();
        let primary_key = watch.key.clone();
        let healed = self.store.commit(&[watch], vec![removal]).await?;
        if healed {
            debug!(
                "Removed stale entry for '{}' from index '{}'",
                primary_key, index_key
            );
        }
        Ok(healed)
    }
}

fn check_identity<A: Aggregate>(key: &str, realm_id: &str, id: &str, next: &A) -> Result<()> {
    if next.realm_id() != realm_id || next.id() != id {
        return Err(StoreError::InvalidKey(format!(
            "mutation of '{}' returned a snapshot for '{}:{}'",
            key,
            next.realm_id(),
            next.id()
        )));
    }
    Ok(())
}
