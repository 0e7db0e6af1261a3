// ============================================================================
// Staged Store Operations
// ============================================================================
//
// Command Pattern for the writes of one conditional commit. An update attempt
// stages `KvOp`s; the store applies all of them or none.
//
// ============================================================================

use std::time::Duration;

/// A single write staged inside a conditional commit.
#[derive(Debug, Clone, PartialEq)]
pub enum KvOp {
    /// Replace the value at `key`; `ttl: None` stores it without expiry.
    Put {
        key: String,
        value: Vec<u8>,
        ttl: Option<Duration>,
    },

    /// Remove `key` regardless of its type.
    Delete { key: String },

    /// Add `member` to the set at `key`, creating the set if needed.
    SetAdd { key: String, member: String },

    /// Remove `member` from the set at `key`; an emptied set is removed.
    SetRemove { key: String, member: String },

    /// Add or re-score `member` in the sorted set at `key`.
    SortedAdd {
        key: String,
        member: String,
        score: f64,
    },

    /// Remove `member` from the sorted set at `key`; an emptied set is removed.
    SortedRemove { key: String, member: String },
}

impl KvOp {
    /// Get the key affected by this operation
    pub fn key(&self) -> &str {
        match self {
            KvOp::Put { key, .. } => key,
            KvOp::Delete { key } => key,
            KvOp::SetAdd { key, .. } => key,
            KvOp::SetRemove { key, .. } => key,
            KvOp::SortedAdd { key, .. } => key,
            KvOp::SortedRemove { key, .. } => key,
        }
    }

    /// Check if this operation maintains an index structure
    pub fn is_index_op(&self) -> bool {
        matches!(
            self,
            KvOp::SetAdd { .. }
                | KvOp::SetRemove { .. }
                | KvOp::SortedAdd { .. }
                | KvOp::SortedRemove { .. }
        )
    }

    /// Check if this operation writes or removes a primary record
    pub fn is_record_op(&self) -> bool {
        matches!(self, KvOp::Put { .. } | KvOp::Delete { .. })
    }
}
