use crate::core::{Result, StoreError};
use crate::persist::{Aggregate, AggregateStore, LifespanRules, Lifetime, RealmLifespans, ScanReport};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;

/// Brute-force detection counters of one user, keyed by the user id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginFailure {
    pub user_id: String,
    pub realm_id: String,
    pub failed_login_not_before_ms: i64,
    pub num_failures: u32,
    pub num_temporary_lockouts: u32,
    pub last_failure_ms: i64,
    pub last_ip_failure: Option<String>,
}

impl LoginFailure {
    pub fn new(realm_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            realm_id: realm_id.into(),
            failed_login_not_before_ms: 0,
            num_failures: 0,
            num_temporary_lockouts: 0,
            last_failure_ms: 0,
            last_ip_failure: None,
        }
    }

    /// Whether logins are blocked at `now_ms`.
    pub fn is_locked_out(&self, now_ms: i64) -> bool {
        self.failed_login_not_before_ms > now_ms
    }
}

impl Aggregate for LoginFailure {
    const SCOPE: &'static str = "login-failures";

    fn id(&self) -> &str {
        &self.user_id
    }

    fn realm_id(&self) -> &str {
        &self.realm_id
    }

    fn lifetime(&self) -> Lifetime {
        Lifetime::new(self.last_failure_ms, self.last_failure_ms)
    }

    fn lifespan_rules(&self, lifespans: &RealmLifespans) -> LifespanRules {
        lifespans.login_failures
    }
}

#[derive(Clone)]
pub struct LoginFailureStore {
    engine: AggregateStore<LoginFailure>,
}

impl LoginFailureStore {
    pub fn new(engine: AggregateStore<LoginFailure>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &AggregateStore<LoginFailure> {
        &self.engine
    }

    pub async fn get(&self, realm_id: &str, user_id: &str) -> Result<Option<LoginFailure>> {
        self.engine.get(realm_id, user_id).await
    }

    /// Count one failed login, creating the record on the first failure.
    pub async fn record_failure(
        &self,
        realm_id: &str,
        user_id: &str,
        ip_address: Option<&str>,
    ) -> Result<Option<LoginFailure>> {
        let now_ms = self.engine.now_millis();
        self.engine
            .update(realm_id, user_id, |current: Option<LoginFailure>| {
                let mut failure = current.unwrap_or_else(|| LoginFailure::new(realm_id, user_id));
                failure.num_failures = failure.num_failures.saturating_add(1);
                failure.last_failure_ms = failure.last_failure_ms.max(now_ms);
                if let Some(ip) = ip_address {
                    failure.last_ip_failure = Some(ip.to_string());
                }
                Ok::<_, Infallible>(Some(failure))
            })
            .await
            .map_err(StoreError::from)
    }

    /// Block logins until `not_before_ms` and count the lockout.
    pub async fn lock_out_until(
        &self,
        realm_id: &str,
        user_id: &str,
        not_before_ms: i64,
    ) -> Result<Option<LoginFailure>> {
        self.engine
            .modify(realm_id, user_id, |failure| {
                failure.failed_login_not_before_ms = not_before_ms;
                failure.num_temporary_lockouts = failure.num_temporary_lockouts.saturating_add(1);
            })
            .await
    }

    /// Reset a user's counters after a successful login.
    pub async fn clear(&self, realm_id: &str, user_id: &str) -> Result<bool> {
        self.engine.remove(realm_id, user_id).await
    }

    pub async fn remove_realm(&self, realm_id: &str) -> Result<ScanReport> {
        self.engine.remove_realm(realm_id).await
    }

    pub async fn sweep_expired(&self, realm_id: &str) -> Result<ScanReport> {
        self.engine.sweep_expired(realm_id).await
    }
}
