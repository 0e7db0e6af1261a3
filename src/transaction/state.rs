// ============================================================================
// Update Attempt State
// ============================================================================
//
// One read-modify-commit cycle of the optimistic update engine. An attempt
// watches exactly one primary key, stages writes, and ends in exactly one
// terminal state:
//
//   Watching ──stage──> Staged ──commit ok──> Committed
//      │                  │
//      │                  └──commit rejected──> Rejected  (engine retries)
//      └──mutator error / no-op──> Abandoned
//
// ============================================================================

use super::KvOp;
use std::time::{Duration, Instant};

/// Store-assigned revision of a key. Absent (or expired) keys have revision 0.
pub type Revision = u64;

/// Revision reported for a key that does not exist.
pub const ABSENT_REVISION: Revision = 0;

/// A key and the revision observed when it was loaded.
///
/// A conditional commit carrying this watch is accepted only if the key's
/// revision is still `revision` when the commit is applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Watch {
    pub key: String,
    pub revision: Revision,
}

impl Watch {
    pub fn new(key: impl Into<String>, revision: Revision) -> Self {
        Self {
            key: key.into(),
            revision,
        }
    }

    /// Watch a key that was observed absent.
    pub fn absent(key: impl Into<String>) -> Self {
        Self::new(key, ABSENT_REVISION)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    /// Primary key loaded and watched; nothing staged yet
    Watching,

    /// Writes staged, commit not yet submitted
    Staged,

    /// Store accepted the conditional commit
    Committed,

    /// Store rejected the commit because a watched key changed
    Rejected,

    /// Released without submitting a commit
    Abandoned,
}

impl AttemptState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptState::Committed | AttemptState::Rejected | AttemptState::Abandoned
        )
    }
}

impl std::fmt::Display for AttemptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptState::Watching => write!(f, "WATCHING"),
            AttemptState::Staged => write!(f, "STAGED"),
            AttemptState::Committed => write!(f, "COMMITTED"),
            AttemptState::Rejected => write!(f, "REJECTED"),
            AttemptState::Abandoned => write!(f, "ABANDONED"),
        }
    }
}

/// A single, single-threaded execution of the read-modify-commit cycle.
#[derive(Debug)]
pub struct UpdateAttempt {
    number: usize,
    watch: Watch,
    ops: Vec<KvOp>,
    state: AttemptState,
    start_time: Instant,
}

impl UpdateAttempt {
    pub fn new(number: usize, watch: Watch) -> Self {
        Self {
            number,
            watch,
            ops: Vec::new(),
            state: AttemptState::Watching,
            start_time: Instant::now(),
        }
    }

    /// 1-based attempt number within one `update` call
    pub fn number(&self) -> usize {
        self.number
    }

    pub fn watch(&self) -> &Watch {
        &self.watch
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    pub fn ops(&self) -> &[KvOp] {
        &self.ops
    }

    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Stage writes for the commit. Ignored once the attempt is terminal.
    pub fn stage(&mut self, ops: impl IntoIterator<Item = KvOp>) {
        if self.state.is_terminal() {
            return;
        }
        self.ops.extend(ops);
        if !self.ops.is_empty() {
            self.state = AttemptState::Staged;
        }
    }

    /// Returns `true` when there is something to commit.
    pub fn has_writes(&self) -> bool {
        !self.ops.is_empty()
    }

    /// Take the watches and staged writes for submission.
    pub fn take_commit(&mut self) -> (Vec<Watch>, Vec<KvOp>) {
        (vec![self.watch.clone()], std::mem::take(&mut self.ops))
    }

    /// Record the store's verdict on the submitted commit.
    pub fn finish(&mut self, accepted: bool) {
        self.state = if accepted {
            AttemptState::Committed
        } else {
            AttemptState::Rejected
        };
    }

    pub fn abandon(&mut self) {
        self.ops.clear();
        self.state = AttemptState::Abandoned;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(key: &str) -> KvOp {
        KvOp::Put {
            key: key.to_string(),
            value: vec![0],
            ttl: None,
        }
    }

    #[test]
    fn test_attempt_lifecycle() {
        let mut attempt = UpdateAttempt::new(1, Watch::absent("k"));
        assert_eq!(attempt.state(), AttemptState::Watching);
        assert!(!attempt.has_writes());

        attempt.stage([put("k")]);
        assert_eq!(attempt.state(), AttemptState::Staged);

        let (watches, ops) = attempt.take_commit();
        assert_eq!(watches, vec![Watch::new("k", ABSENT_REVISION)]);
        assert_eq!(ops.len(), 1);

        attempt.finish(false);
        assert_eq!(attempt.state(), AttemptState::Rejected);
        assert!(attempt.state().is_terminal());
    }

    #[test]
    fn test_stage_after_abandon_is_ignored() {
        let mut attempt = UpdateAttempt::new(2, Watch::new("k", 7));
        attempt.abandon();
        attempt.stage([put("k")]);
        assert_eq!(attempt.state(), AttemptState::Abandoned);
        assert!(!attempt.has_writes());
    }
}
