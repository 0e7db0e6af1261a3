use crate::core::Result;
use crate::transaction::{KvOp, Revision, Watch};
use async_trait::async_trait;
use std::time::Duration;

/// A value read together with the revision that guards it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: Vec<u8>,
    pub revision: Revision,
}

/// Remaining lifetime of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist (or has already expired).
    Missing,
    /// The key exists without an expiry.
    Persistent,
    /// The key expires after the given duration.
    Expires(Duration),
}

/// Resumable scan position. The default value starts a new scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanCursor(Option<String>);

impl ScanCursor {
    pub fn start() -> Self {
        Self(None)
    }

    /// Cursor resuming strictly after `key`.
    pub fn after(key: impl Into<String>) -> Self {
        Self(Some(key.into()))
    }

    pub fn position(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

/// One round-trip of a cursor scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    /// Matching keys found in this page. May be empty even when the scan is
    /// not complete.
    pub keys: Vec<String>,
    /// Where to resume, or `None` once the scan is complete.
    pub next: Option<ScanCursor>,
}

/// Key-value store boundary - the remote store the engine runs against.
///
/// Implementations must make `commit` atomic: either every watched key still
/// has its watched revision and all ops are applied, or nothing is applied
/// and `false` is returned.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Load a plain value and its revision.
    async fn get(&self, key: &str) -> Result<Option<Versioned>>;

    /// Current revision of any key, `ABSENT_REVISION` when missing.
    async fn revision(&self, key: &str) -> Result<Revision>;

    /// Members of the set at `key` (empty when missing).
    async fn members(&self, key: &str) -> Result<Vec<String>>;

    /// Members of the sorted set at `key` by rank, `start` inclusive and
    /// `stop` exclusive, ordered by score then member.
    async fn rank_range(&self, key: &str, start: usize, stop: usize) -> Result<Vec<String>>;

    /// Number of members in the set or sorted set at `key`.
    async fn cardinality(&self, key: &str) -> Result<usize>;

    async fn ttl(&self, key: &str) -> Result<KeyTtl>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Apply `ops` atomically if none of `watches` changed.
    async fn commit(&self, watches: &[Watch], ops: Vec<KvOp>) -> Result<bool>;

    /// Examine at most `count` keys after `cursor` and return those matching
    /// the glob `pattern`.
    async fn scan(&self, cursor: &ScanCursor, pattern: &str, count: usize) -> Result<ScanPage>;

    /// Unconditionally remove keys; returns how many existed.
    async fn delete(&self, keys: &[String]) -> Result<usize>;
}
