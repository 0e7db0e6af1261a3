use crate::core::{Result, UpdateError};
use crate::persist::{
    Aggregate, AggregateStore, IndexDimension, IndexMembership, LifespanRules, Lifetime,
    RealmLifespans, ScanReport,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Started,
    LoggingIn,
    LoggedIn,
    LoggingOut,
    LoggedOut,
}

impl SessionState {
    /// Whether a session in this state may move to `next`.
    pub fn can_move_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (from, to) if from == to => true,
            (LoggedOut, _) => false,
            (LoggingOut, LoggedOut) => true,
            (LoggingOut, _) => false,
            _ => true,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Started => "STARTED",
            SessionState::LoggingIn => "LOGGING_IN",
            SessionState::LoggedIn => "LOGGED_IN",
            SessionState::LoggingOut => "LOGGING_OUT",
            SessionState::LoggedOut => "LOGGED_OUT",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("session cannot move from {from} to {to}")]
pub struct StateTransitionError {
    pub from: SessionState,
    pub to: SessionState,
}

/// Per-client part of a user session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSession {
    pub client_id: String,
    pub redirect_uri: Option<String>,
    pub action: Option<String>,
    pub timestamp_ms: i64,
    #[serde(default)]
    pub notes: BTreeMap<String, String>,
}

impl ClientSession {
    pub fn new(client_id: impl Into<String>, timestamp_ms: i64) -> Self {
        Self {
            client_id: client_id.into(),
            redirect_uri: None,
            action: None,
            timestamp_ms,
            notes: BTreeMap::new(),
        }
    }

    pub fn redirect_uri(mut self, uri: impl Into<String>) -> Self {
        self.redirect_uri = Some(uri.into());
        self
    }
}

/// A logged-in user's session, online or offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSession {
    pub id: String,
    pub realm_id: String,
    pub user_id: String,
    pub login_username: String,
    pub ip_address: Option<String>,
    pub auth_method: String,
    pub remember_me: bool,
    pub offline: bool,
    pub state: SessionState,
    pub started_ms: i64,
    pub last_refresh_ms: i64,
    pub broker_session_id: Option<String>,
    pub broker_user_id: Option<String>,
    #[serde(default)]
    pub notes: BTreeMap<String, String>,
    #[serde(default)]
    pub client_sessions: BTreeMap<String, ClientSession>,
}

impl UserSession {
    pub fn new(
        id: impl Into<String>,
        realm_id: impl Into<String>,
        user_id: impl Into<String>,
        now_ms: i64,
    ) -> Self {
        let user_id = user_id.into();
        Self {
            id: id.into(),
            realm_id: realm_id.into(),
            login_username: user_id.clone(),
            user_id,
            ip_address: None,
            auth_method: "openid-connect".to_string(),
            remember_me: false,
            offline: false,
            state: SessionState::Started,
            started_ms: now_ms,
            last_refresh_ms: now_ms,
            broker_session_id: None,
            broker_user_id: None,
            notes: BTreeMap::new(),
            client_sessions: BTreeMap::new(),
        }
    }

    pub fn remember_me(mut self, remember_me: bool) -> Self {
        self.remember_me = remember_me;
        self
    }

    pub fn offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    pub fn ip_address(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    pub fn broker(mut self, session_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        self.broker_session_id = Some(session_id.into());
        self.broker_user_id = Some(user_id.into());
        self
    }
}

impl Aggregate for UserSession {
    const SCOPE: &'static str = "sessions";

    fn id(&self) -> &str {
        &self.id
    }

    fn realm_id(&self) -> &str {
        &self.realm_id
    }

    fn index_memberships(&self) -> Vec<IndexMembership> {
        let mut out = vec![IndexMembership::new(IndexDimension::User, self.user_id.clone())];
        out.extend(
            self.client_sessions
                .keys()
                .map(|client_id| IndexMembership::new(IndexDimension::Client, client_id.clone())),
        );
        if let Some(broker_session_id) = &self.broker_session_id {
            out.push(IndexMembership::new(
                IndexDimension::BrokerSession,
                broker_session_id.clone(),
            ));
        }
        if let Some(broker_user_id) = &self.broker_user_id {
            out.push(IndexMembership::new(IndexDimension::BrokerUser, broker_user_id.clone()));
        }
        out
    }

    fn order_score(&self) -> Option<f64> {
        Some(self.started_ms as f64)
    }

    fn lifetime(&self) -> Lifetime {
        Lifetime::new(self.started_ms, self.last_refresh_ms).remember_me(self.remember_me)
    }

    fn lifespan_rules(&self, lifespans: &RealmLifespans) -> LifespanRules {
        if self.offline {
            lifespans.offline_sessions
        } else {
            lifespans.sessions
        }
    }
}

/// User session operations, all routed through the update engine.
#[derive(Clone)]
pub struct UserSessionStore {
    engine: AggregateStore<UserSession>,
}

impl UserSessionStore {
    pub fn new(engine: AggregateStore<UserSession>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &AggregateStore<UserSession> {
        &self.engine
    }

    pub async fn create(&self, session: UserSession) -> Result<Option<UserSession>> {
        self.engine.create(session).await
    }

    pub async fn get(&self, realm_id: &str, id: &str) -> Result<Option<UserSession>> {
        self.engine.get(realm_id, id).await
    }

    /// Record activity now, pushing the idle deadline forward.
    pub async fn touch(&self, realm_id: &str, id: &str) -> Result<Option<UserSession>> {
        let now_ms = self.engine.now_millis();
        self.engine
            .modify(realm_id, id, |session| {
                session.last_refresh_ms = session.last_refresh_ms.max(now_ms);
            })
            .await
    }

    pub async fn set_note(
        &self,
        realm_id: &str,
        id: &str,
        name: &str,
        value: &str,
    ) -> Result<Option<UserSession>> {
        self.engine
            .modify(realm_id, id, |session| {
                session.notes.insert(name.to_string(), value.to_string());
            })
            .await
    }

    pub async fn remove_note(&self, realm_id: &str, id: &str, name: &str) -> Result<Option<UserSession>> {
        self.engine
            .modify(realm_id, id, |session| {
                session.notes.remove(name);
            })
            .await
    }

    /// Attach (or replace) the session of one client.
    pub async fn attach_client(
        &self,
        realm_id: &str,
        id: &str,
        client: ClientSession,
    ) -> Result<Option<UserSession>> {
        self.engine
            .modify(realm_id, id, |session| {
                session
                    .client_sessions
                    .insert(client.client_id.clone(), client.clone());
            })
            .await
    }

    pub async fn detach_client(
        &self,
        realm_id: &str,
        id: &str,
        client_id: &str,
    ) -> Result<Option<UserSession>> {
        self.engine
            .modify(realm_id, id, |session| {
                session.client_sessions.remove(client_id);
            })
            .await
    }

    /// Move the session to `state`. An illegal transition is returned as
    /// the mutator error and nothing is written.
    pub async fn set_state(
        &self,
        realm_id: &str,
        id: &str,
        state: SessionState,
    ) -> std::result::Result<Option<UserSession>, UpdateError<StateTransitionError>> {
        self.engine
            .update(realm_id, id, |current: Option<UserSession>| {
                let Some(mut session) = current else {
                    return Ok(None);
                };
                if !session.state.can_move_to(state) {
                    return Err(StateTransitionError {
                        from: session.state,
                        to: state,
                    });
                }
                session.state = state;
                Ok(Some(session))
            })
            .await
    }

    /// Apply an arbitrary change to an existing session.
    pub async fn update_with<F>(&self, realm_id: &str, id: &str, change: F) -> Result<Option<UserSession>>
    where
        F: FnMut(&mut UserSession) + Send,
    {
        self.engine.modify(realm_id, id, change).await
    }

    pub async fn remove(&self, realm_id: &str, id: &str) -> Result<bool> {
        self.engine.remove(realm_id, id).await
    }

    pub async fn by_user(&self, realm_id: &str, user_id: &str) -> Result<Vec<UserSession>> {
        self.engine.find_by(realm_id, &IndexDimension::User, user_id).await
    }

    pub async fn by_client(&self, realm_id: &str, client_id: &str) -> Result<Vec<UserSession>> {
        self.engine.find_by(realm_id, &IndexDimension::Client, client_id).await
    }

    pub async fn by_broker_session(
        &self,
        realm_id: &str,
        broker_session_id: &str,
    ) -> Result<Vec<UserSession>> {
        self.engine
            .find_by(realm_id, &IndexDimension::BrokerSession, broker_session_id)
            .await
    }

    pub async fn by_broker_user(&self, realm_id: &str, broker_user_id: &str) -> Result<Vec<UserSession>> {
        self.engine
            .find_by(realm_id, &IndexDimension::BrokerUser, broker_user_id)
            .await
    }

    pub async fn count_by_client(&self, realm_id: &str, client_id: &str) -> Result<usize> {
        self.engine.count_by(realm_id, &IndexDimension::Client, client_id).await
    }

    /// Log out every session of a user.
    pub async fn remove_user_sessions(&self, realm_id: &str, user_id: &str) -> Result<ScanReport> {
        self.engine
            .remove_by(realm_id, &IndexMembership::new(IndexDimension::User, user_id))
            .await
    }

    pub async fn remove_realm(&self, realm_id: &str) -> Result<ScanReport> {
        self.engine.remove_realm(realm_id).await
    }

    pub async fn sweep_expired(&self, realm_id: &str) -> Result<ScanReport> {
        self.engine.sweep_expired(realm_id).await
    }

    /// Sessions across realms, oldest first.
    pub async fn page(&self, offset: usize, limit: usize) -> Result<Vec<UserSession>> {
        self.engine.page(offset, limit).await
    }
}
