// ============================================================================
// kvsessions Library
// ============================================================================

pub mod connection;
pub mod core;
pub mod model;
pub mod persist;
pub mod storage;
pub mod transaction;
mod expression;

// Re-export main types for convenience
pub use connection::{ConflictRetryPolicy, StoreConfig};
pub use core::{Clock, ManualClock, Result, StoreError, SystemClock, UpdateError};
pub use expression::{escape_glob, glob_match};
pub use model::{
    AuthenticationSessionStore, AuthenticationSessionTab, ClientSession, LoginFailure,
    LoginFailureStore, RootAuthenticationSession, SessionState, StateTransitionError, UserSession,
    UserSessionStore, WorkflowSchedule, WorkflowScheduleStore,
};
pub use persist::{
    Aggregate, AggregateStore, Expiry, IndexDimension, IndexMembership, KeySpace, KeyScanner,
    LifespanProvider, LifespanRules, Lifetime, RealmLifespans, RecordCodec, ScanReport,
    StaticLifespanProvider, compute_expiry_seconds,
};
pub use storage::{InMemoryKvStore, KeyTtl, KvStore, ScanCursor, ScanPage, Versioned};
pub use transaction::{KvOp, Revision, Watch};

use std::sync::Arc;

// ============================================================================
// High-level entry point
// ============================================================================

/// Shared handle to the typed aggregate stores of one namespace.
///
/// Every store built from the same `KvSessions` shares its key-value store,
/// configuration, lifespan rules and clock.
///
/// # Examples
///
/// ```
/// use kvsessions::{Clock, KvSessions, UserSession};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let sessions = KvSessions::in_memory()?;
/// let users = sessions.user_sessions()?;
///
/// let now = sessions.clock().now_millis();
/// users.create(UserSession::new("s1", "r1", "u1", now)).await?;
/// users.set_note("r1", "s1", "lang", "en").await?;
///
/// let found = users.by_user("r1", "u1").await?;
/// assert_eq!(found.len(), 1);
/// assert_eq!(found[0].notes["lang"], "en");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct KvSessions {
    store: Arc<dyn KvStore>,
    config: StoreConfig,
    lifespans: Arc<dyn LifespanProvider>,
    clock: Arc<dyn Clock>,
}

impl KvSessions {
    /// Build over an existing store.
    pub fn new(
        store: Arc<dyn KvStore>,
        config: StoreConfig,
        lifespans: Arc<dyn LifespanProvider>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            lifespans,
            clock,
        })
    }

    /// In-process store with default configuration, lifespans and system
    /// clock.
    pub fn in_memory() -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Arc::new(InMemoryKvStore::with_clock(Arc::clone(&clock)));
        Self::new(
            store,
            StoreConfig::default(),
            Arc::new(StaticLifespanProvider::default()),
            clock,
        )
    }

    /// Build from a connection string over an existing store.
    ///
    /// # Examples
    ///
    /// ```
    /// use kvsessions::{InMemoryKvStore, KvSessions, StaticLifespanProvider, SystemClock};
    /// use std::sync::Arc;
    ///
    /// let sessions = KvSessions::connect_url(
    ///     "kvsessions://localhost:6379/kc?max_attempts=4",
    ///     Arc::new(InMemoryKvStore::new()),
    ///     Arc::new(StaticLifespanProvider::default()),
    ///     Arc::new(SystemClock),
    /// )
    /// .unwrap();
    /// assert_eq!(sessions.config().retry.max_attempts, 4);
    /// ```
    pub fn connect_url(
        url: &str,
        store: Arc<dyn KvStore>,
        lifespans: Arc<dyn LifespanProvider>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Self::new(store, StoreConfig::from_url(url)?, lifespans, clock)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn kv_store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Engine for any aggregate type, including ones defined outside this crate.
    pub fn aggregate_store<A: Aggregate>(&self) -> Result<AggregateStore<A>> {
        AggregateStore::new(
            Arc::clone(&self.store),
            &self.config,
            Arc::clone(&self.lifespans),
            Arc::clone(&self.clock),
        )
    }

    pub fn user_sessions(&self) -> Result<UserSessionStore> {
        Ok(UserSessionStore::new(self.aggregate_store()?))
    }

    pub fn authentication_sessions(&self) -> Result<AuthenticationSessionStore> {
        Ok(AuthenticationSessionStore::new(self.aggregate_store()?))
    }

    pub fn login_failures(&self) -> Result<LoginFailureStore> {
        Ok(LoginFailureStore::new(self.aggregate_store()?))
    }

    pub fn workflow_schedules(&self) -> Result<WorkflowScheduleStore> {
        Ok(WorkflowScheduleStore::new(self.aggregate_store()?))
    }
}
