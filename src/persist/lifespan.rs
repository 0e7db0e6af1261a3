use super::ttl::LifespanRules;
use crate::core::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Lifespan rules of every aggregate kind for one realm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealmLifespans {
    pub sessions: LifespanRules,
    pub offline_sessions: LifespanRules,
    pub authentication_sessions: LifespanRules,
    pub login_failures: LifespanRules,
    pub workflow_schedules: LifespanRules,
}

impl Default for RealmLifespans {
    fn default() -> Self {
        Self {
            // 10h SSO max, 30m SSO idle
            sessions: LifespanRules::new(36_000, 1_800),
            // 30 days idle, lifespan not enforced
            offline_sessions: LifespanRules::new(0, 2_592_000),
            authentication_sessions: LifespanRules::new(1_800, 0),
            // brute-force detection window
            login_failures: LifespanRules::new(43_200, 0),
            workflow_schedules: LifespanRules::unbounded(),
        }
    }
}

/// Source of per-realm lifespan rules.
pub trait LifespanProvider: Send + Sync {
    fn lifespans(&self, realm_id: &str) -> Result<RealmLifespans>;
}

/// Default rules plus per-realm overrides, changeable at runtime.
#[derive(Debug, Default)]
pub struct StaticLifespanProvider {
    default: RealmLifespans,
    realms: RwLock<HashMap<String, RealmLifespans>>,
}

impl StaticLifespanProvider {
    pub fn new(default: RealmLifespans) -> Self {
        Self {
            default,
            realms: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_realm(self, realm_id: impl Into<String>, lifespans: RealmLifespans) -> Result<Self> {
        self.set_realm(realm_id, lifespans)?;
        Ok(self)
    }

    pub fn set_realm(&self, realm_id: impl Into<String>, lifespans: RealmLifespans) -> Result<()> {
        self.realms.write()?.insert(realm_id.into(), lifespans);
        Ok(())
    }

    pub fn remove_realm(&self, realm_id: &str) -> Result<()> {
        self.realms.write()?.remove(realm_id);
        Ok(())
    }
}

impl LifespanProvider for StaticLifespanProvider {
    fn lifespans(&self, realm_id: &str) -> Result<RealmLifespans> {
        Ok(self
            .realms
            .read()?
            .get(realm_id)
            .cloned()
            .unwrap_or_else(|| self.default.clone()))
    }
}
