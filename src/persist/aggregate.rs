use super::index::IndexMembership;
use super::lifespan::RealmLifespans;
use super::ttl::{LifespanRules, Lifetime};
use serde::{Serialize, de::DeserializeOwned};

/// A domain entity stored as one primary record plus its index entries.
///
/// Snapshots are plain owned values: the engine decodes a fresh copy for
/// every attempt, so a mutation function never shares an instance with
/// another caller.
pub trait Aggregate: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Key scope, e.g. `sessions`. Must not contain `:`.
    const SCOPE: &'static str;

    /// Whether a snapshot without any enabled lifespan rule is an error.
    const REQUIRES_EXPIRY: bool = true;

    fn id(&self) -> &str;

    fn realm_id(&self) -> &str;

    /// Secondary index memberships beyond the owning realm, which is always
    /// indexed.
    fn index_memberships(&self) -> Vec<IndexMembership> {
        Vec::new()
    }

    /// Score in the scope-wide order index, `None` to stay out of it.
    fn order_score(&self) -> Option<f64> {
        None
    }

    fn lifetime(&self) -> Lifetime;

    /// Pick the rules that apply to this snapshot from the realm's rule set.
    fn lifespan_rules(&self, lifespans: &RealmLifespans) -> LifespanRules;
}
