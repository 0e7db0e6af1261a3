use crate::core::{Result, StoreError, UpdateError};
use crate::persist::{
    Aggregate, AggregateStore, IndexDimension, IndexMembership, LifespanRules, Lifetime,
    RealmLifespans, ScanReport,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::Infallible;
use uuid::Uuid;

/// One browser tab's in-progress login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationSessionTab {
    pub tab_id: String,
    pub client_id: String,
    pub action: Option<String>,
    pub authenticated_user_id: Option<String>,
    #[serde(default)]
    pub execution_status: BTreeMap<String, String>,
    #[serde(default)]
    pub auth_notes: BTreeMap<String, String>,
    #[serde(default)]
    pub client_notes: BTreeMap<String, String>,
}

impl AuthenticationSessionTab {
    fn new(tab_id: String, client_id: &str) -> Self {
        Self {
            tab_id,
            client_id: client_id.to_string(),
            action: None,
            authenticated_user_id: None,
            execution_status: BTreeMap::new(),
            auth_notes: BTreeMap::new(),
            client_notes: BTreeMap::new(),
        }
    }
}

/// Browser-level container of login tabs. Lives only while at least one tab
/// does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootAuthenticationSession {
    pub id: String,
    pub realm_id: String,
    pub timestamp_ms: i64,
    #[serde(default)]
    pub tabs: BTreeMap<String, AuthenticationSessionTab>,
}

impl RootAuthenticationSession {
    pub fn new(id: impl Into<String>, realm_id: impl Into<String>, now_ms: i64) -> Self {
        Self {
            id: id.into(),
            realm_id: realm_id.into(),
            timestamp_ms: now_ms,
            tabs: BTreeMap::new(),
        }
    }
}

impl Aggregate for RootAuthenticationSession {
    const SCOPE: &'static str = "auth-sessions";

    fn id(&self) -> &str {
        &self.id
    }

    fn realm_id(&self) -> &str {
        &self.realm_id
    }

    fn index_memberships(&self) -> Vec<IndexMembership> {
        self.tabs
            .values()
            .map(|tab| IndexMembership::new(IndexDimension::Client, tab.client_id.clone()))
            .collect()
    }

    fn lifetime(&self) -> Lifetime {
        Lifetime::new(self.timestamp_ms, self.timestamp_ms)
    }

    fn lifespan_rules(&self, lifespans: &RealmLifespans) -> LifespanRules {
        lifespans.authentication_sessions
    }
}

fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[derive(Clone)]
pub struct AuthenticationSessionStore {
    engine: AggregateStore<RootAuthenticationSession>,
}

impl AuthenticationSessionStore {
    pub fn new(engine: AggregateStore<RootAuthenticationSession>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &AggregateStore<RootAuthenticationSession> {
        &self.engine
    }

    /// Start a new root session with a generated id.
    pub async fn create_root(&self, realm_id: &str) -> Result<Option<RootAuthenticationSession>> {
        let root = RootAuthenticationSession::new(new_id(), realm_id, self.engine.now_millis());
        self.engine.create(root).await
    }

    pub async fn get_root(&self, realm_id: &str, root_id: &str) -> Result<Option<RootAuthenticationSession>> {
        self.engine.get(realm_id, root_id).await
    }

    /// Open a tab for `client_id`, refreshing the root's timestamp.
    /// Returns the new tab id, or `None` if the root does not exist.
    pub async fn create_tab(&self, realm_id: &str, root_id: &str, client_id: &str) -> Result<Option<String>> {
        let tab_id = new_id();
        let now_ms = self.engine.now_millis();
        let root = self
            .engine
            .modify(realm_id, root_id, |root| {
                root.timestamp_ms = root.timestamp_ms.max(now_ms);
                root.tabs.insert(
                    tab_id.clone(),
                    AuthenticationSessionTab::new(tab_id.clone(), client_id),
                );
            })
            .await?;
        Ok(root.map(|_| tab_id))
    }

    pub async fn get_tab(
        &self,
        realm_id: &str,
        root_id: &str,
        tab_id: &str,
    ) -> Result<Option<AuthenticationSessionTab>> {
        Ok(self
            .engine
            .get(realm_id, root_id)
            .await?
            .and_then(|mut root| root.tabs.remove(tab_id)))
    }

    /// Apply `change` to one tab. Returns the updated tab, `None` if the
    /// root or the tab is gone.
    pub async fn update_tab<F>(
        &self,
        realm_id: &str,
        root_id: &str,
        tab_id: &str,
        mut change: F,
    ) -> Result<Option<AuthenticationSessionTab>>
    where
        F: FnMut(&mut AuthenticationSessionTab) + Send,
    {
        let root = self
            .engine
            .update(realm_id, root_id, |current: Option<RootAuthenticationSession>| {
                let Some(mut root) = current else {
                    return Ok::<_, Infallible>(None);
                };
                if let Some(tab) = root.tabs.get_mut(tab_id) {
                    change(tab);
                }
                Ok(Some(root))
            })
            .await
            .map_err(StoreError::from)?;
        Ok(root.and_then(|mut root| root.tabs.remove(tab_id)))
    }

    /// Close a tab. The root goes with its last tab.
    /// Returns `true` if the tab existed.
    pub async fn remove_tab(&self, realm_id: &str, root_id: &str, tab_id: &str) -> Result<bool> {
        let result = self
            .engine
            .update(realm_id, root_id, |current: Option<RootAuthenticationSession>| {
                let Some(mut root) = current else {
                    return Err(TabMissing);
                };
                if root.tabs.remove(tab_id).is_none() {
                    return Err(TabMissing);
                }
                Ok((!root.tabs.is_empty()).then_some(root))
            })
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(UpdateError::Mutator(TabMissing)) => Ok(false),
            Err(UpdateError::Store(err)) => Err(err),
        }
    }

    pub async fn remove_root(&self, realm_id: &str, root_id: &str) -> Result<bool> {
        self.engine.remove(realm_id, root_id).await
    }

    pub async fn by_client(&self, realm_id: &str, client_id: &str) -> Result<Vec<RootAuthenticationSession>> {
        self.engine.find_by(realm_id, &IndexDimension::Client, client_id).await
    }

    pub async fn remove_realm(&self, realm_id: &str) -> Result<ScanReport> {
        self.engine.remove_realm(realm_id).await
    }

    pub async fn sweep_expired(&self, realm_id: &str) -> Result<ScanReport> {
        self.engine.sweep_expired(realm_id).await
    }
}

struct TabMissing;
