// ============================================================================
// Conditional Commit Module
// ============================================================================
//
// Building blocks of the optimistic read-modify-commit protocol:
// - Watch: a key plus the revision observed at load time
// - KvOp: writes staged for one atomic commit (Command Pattern)
// - UpdateAttempt: state of one read-modify-commit cycle (State Pattern)
//
// ============================================================================

pub mod change;
pub mod state;

pub use change::KvOp;
pub use state::{ABSENT_REVISION, AttemptState, Revision, UpdateAttempt, Watch};
