//! Aggregate persistence over a watch-capable key-value store.
//!
//! Layout of one aggregate scope:
//!
//! ```text
//! {ns}:{scope}:{realm}:{id}                 primary record (encoded snapshot, TTL)
//! {ns}:{scope}:{realm}:#{dimension}:{value} index set of entity ids
//! {ns}:{scope}:order                        sorted set of `{realm}:{id}` by creation time
//! ```

pub mod aggregate;
pub mod codec;
pub mod engine;
pub mod index;
pub mod keys;
pub mod lifespan;
pub mod scan;
pub mod ttl;

pub use aggregate::Aggregate;
pub use codec::RecordCodec;
pub use engine::AggregateStore;
pub use index::{IndexDelta, IndexDimension, IndexKind, IndexMembership, IndexOp, diff, memberships};
pub use keys::{INDEX_TAG, KeySpace};
pub use lifespan::{LifespanProvider, RealmLifespans, StaticLifespanProvider};
pub use scan::{KeyPages, KeyScanner, ScanReport};
pub use ttl::{Expiry, LifespanRules, Lifetime, compute_expiry_seconds, expiry_deadline_ms};
