//! Secondary index synchronization.
//!
//! Given the snapshot before and after a mutation, [`diff`] computes exactly
//! the index writes that bring every dimension in line with the new
//! snapshot. Memberships present on both sides produce no write.

use super::aggregate::Aggregate;
use super::keys::KeySpace;
use crate::core::Result;
use crate::transaction::KvOp;
use std::collections::BTreeMap;
use std::fmt;

/// One axis of lookup maintained alongside primary records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexDimension {
    Realm,
    User,
    Client,
    BrokerSession,
    BrokerUser,
    Resource,
    Workflow,
    Custom(String),
}

impl IndexDimension {
    pub fn tag(&self) -> &str {
        match self {
            IndexDimension::Realm => "realm",
            IndexDimension::User => "user",
            IndexDimension::Client => "client",
            IndexDimension::BrokerSession => "broker-session",
            IndexDimension::BrokerUser => "broker-user",
            IndexDimension::Resource => "resource",
            IndexDimension::Workflow => "workflow",
            IndexDimension::Custom(tag) => tag,
        }
    }

    /// Inverse of [`IndexDimension::tag`].
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "realm" => IndexDimension::Realm,
            "user" => IndexDimension::User,
            "client" => IndexDimension::Client,
            "broker-session" => IndexDimension::BrokerSession,
            "broker-user" => IndexDimension::BrokerUser,
            "resource" => IndexDimension::Resource,
            "workflow" => IndexDimension::Workflow,
            other => IndexDimension::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for IndexDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Membership of an aggregate in the index `dimension = value`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexMembership {
    pub dimension: IndexDimension,
    pub value: String,
}

impl IndexMembership {
    pub fn new(dimension: IndexDimension, value: impl Into<String>) -> Self {
        Self {
            dimension,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IndexKind {
    Set(IndexDimension),
    Order { score: f64 },
}

/// A single index write.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexOp {
    pub kind: IndexKind,
    pub index_key: String,
    pub member: String,
}

impl IndexOp {
    fn into_add(self) -> KvOp {
        match self.kind {
            IndexKind::Set(_) => KvOp::SetAdd {
                key: self.index_key,
                member: self.member,
            },
            IndexKind::Order { score } => KvOp::SortedAdd {
                key: self.index_key,
                member: self.member,
                score,
            },
        }
    }

    fn into_remove(self) -> KvOp {
        match self.kind {
            IndexKind::Set(_) => KvOp::SetRemove {
                key: self.index_key,
                member: self.member,
            },
            IndexKind::Order { .. } => KvOp::SortedRemove {
                key: self.index_key,
                member: self.member,
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexDelta {
    pub adds: Vec<IndexOp>,
    pub removes: Vec<IndexOp>,
}

impl IndexDelta {
    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.removes.is_empty()
    }

    /// Store operations for this delta, removals first.
    pub fn into_ops(self) -> Vec<KvOp> {
        self.removes
            .into_iter()
            .map(IndexOp::into_remove)
            .chain(self.adds.into_iter().map(IndexOp::into_add))
            .collect()
    }
}

/// Every set membership of a snapshot, the owning realm included.
pub fn memberships<A: Aggregate>(aggregate: &A) -> Vec<IndexMembership> {
    let mut all = aggregate.index_memberships();
    all.push(IndexMembership::new(
        IndexDimension::Realm,
        aggregate.realm_id(),
    ));
    all.sort();
    all.dedup();
    all
}

fn set_entries<A: Aggregate>(
    keyspace: &KeySpace,
    aggregate: Option<&A>,
) -> Result<BTreeMap<String, IndexDimension>> {
    let mut entries = BTreeMap::new();
    if let Some(aggregate) = aggregate {
        for membership in memberships(aggregate) {
            let key = keyspace.index_key(
                aggregate.realm_id(),
                membership.dimension.tag(),
                &membership.value,
            )?;
            entries.insert(key, membership.dimension);
        }
    }
    Ok(entries)
}

/// Compute the index writes that take `previous` to `new`.
///
/// `None` on either side means the record is absent. Both snapshots, when
/// present, must describe the same record.
pub fn diff<A: Aggregate>(
    keyspace: &KeySpace,
    previous: Option<&A>,
    new: Option<&A>,
) -> Result<IndexDelta> {
    let before = set_entries(keyspace, previous)?;
    let after = set_entries(keyspace, new)?;
    let mut delta = IndexDelta::default();

    if let Some(previous) = previous {
        for (key, dimension) in &before {
            if !after.contains_key(key) {
                delta.removes.push(IndexOp {
                    kind: IndexKind::Set(dimension.clone()),
                    index_key: key.clone(),
                    member: previous.id().to_string(),
                });
            }
        }
    }

    if let Some(new) = new {
        for (key, dimension) in after {
            if !before.contains_key(&key) {
                delta.adds.push(IndexOp {
                    kind: IndexKind::Set(dimension),
                    index_key: key,
                    member: new.id().to_string(),
                });
            }
        }
    }

    let previous_score = previous.and_then(|p| p.order_score().map(|score| (p, score)));
    let new_score = new.and_then(|n| n.order_score().map(|score| (n, score)));
    match (previous_score, new_score) {
        (Some((_, before)), Some((_, after))) if before == after => {}
        (_, Some((new, score))) => delta.adds.push(IndexOp {
            kind: IndexKind::Order { score },
            index_key: keyspace.order_key(),
            member: keyspace.order_member(new.realm_id(), new.id()),
        }),
        (Some((previous, score)), None) => delta.removes.push(IndexOp {
            kind: IndexKind::Order { score },
            index_key: keyspace.order_key(),
            member: keyspace.order_member(previous.realm_id(), previous.id()),
        }),
        (None, None) => {}
    }

    Ok(delta)
}
