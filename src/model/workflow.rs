use crate::core::Result;
use crate::persist::{
    Aggregate, AggregateStore, IndexDimension, IndexMembership, LifespanRules, Lifetime,
    RealmLifespans, ScanReport,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A pending step of a workflow bound to one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowSchedule {
    pub id: String,
    pub realm_id: String,
    pub workflow_id: String,
    pub resource_id: String,
    pub resource_type: String,
    pub step_id: Option<String>,
    pub created_ms: i64,
    pub scheduled_at_ms: i64,
    #[serde(default)]
    pub notes: BTreeMap<String, String>,
}

impl WorkflowSchedule {
    pub fn new(
        id: impl Into<String>,
        realm_id: impl Into<String>,
        workflow_id: impl Into<String>,
        resource_id: impl Into<String>,
        now_ms: i64,
    ) -> Self {
        Self {
            id: id.into(),
            realm_id: realm_id.into(),
            workflow_id: workflow_id.into(),
            resource_id: resource_id.into(),
            resource_type: "user".to_string(),
            step_id: None,
            created_ms: now_ms,
            scheduled_at_ms: now_ms,
            notes: BTreeMap::new(),
        }
    }

    pub fn step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn at(mut self, scheduled_at_ms: i64) -> Self {
        self.scheduled_at_ms = scheduled_at_ms;
        self
    }

    pub fn is_due(&self, now_ms: i64) -> bool {
        self.scheduled_at_ms <= now_ms
    }
}

impl Aggregate for WorkflowSchedule {
    const SCOPE: &'static str = "workflow-schedules";
    const REQUIRES_EXPIRY: bool = false;

    fn id(&self) -> &str {
        &self.id
    }

    fn realm_id(&self) -> &str {
        &self.realm_id
    }

    fn index_memberships(&self) -> Vec<IndexMembership> {
        vec![
            IndexMembership::new(IndexDimension::Workflow, self.workflow_id.clone()),
            IndexMembership::new(IndexDimension::Resource, self.resource_id.clone()),
        ]
    }

    fn order_score(&self) -> Option<f64> {
        Some(self.created_ms as f64)
    }

    fn lifetime(&self) -> Lifetime {
        Lifetime::new(self.created_ms, self.created_ms)
    }

    fn lifespan_rules(&self, lifespans: &RealmLifespans) -> LifespanRules {
        lifespans.workflow_schedules
    }
}

#[derive(Clone)]
pub struct WorkflowScheduleStore {
    engine: AggregateStore<WorkflowSchedule>,
}

impl WorkflowScheduleStore {
    pub fn new(engine: AggregateStore<WorkflowSchedule>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &AggregateStore<WorkflowSchedule> {
        &self.engine
    }

    /// Insert or replace a schedule.
    pub async fn schedule(&self, schedule: WorkflowSchedule) -> Result<Option<WorkflowSchedule>> {
        self.engine.put(schedule).await
    }

    pub async fn get(&self, realm_id: &str, id: &str) -> Result<Option<WorkflowSchedule>> {
        self.engine.get(realm_id, id).await
    }

    /// Move an existing schedule to another step and time.
    pub async fn reschedule(
        &self,
        realm_id: &str,
        id: &str,
        step_id: Option<&str>,
        scheduled_at_ms: i64,
    ) -> Result<Option<WorkflowSchedule>> {
        self.engine
            .modify(realm_id, id, |schedule| {
                schedule.step_id = step_id.map(str::to_string);
                schedule.scheduled_at_ms = scheduled_at_ms;
            })
            .await
    }

    pub async fn cancel(&self, realm_id: &str, id: &str) -> Result<bool> {
        self.engine.remove(realm_id, id).await
    }

    /// Drop every schedule bound to a resource, e.g. a deleted user.
    pub async fn cancel_for_resource(&self, realm_id: &str, resource_id: &str) -> Result<ScanReport> {
        self.engine
            .remove_by(
                realm_id,
                &IndexMembership::new(IndexDimension::Resource, resource_id),
            )
            .await
    }

    pub async fn by_resource(&self, realm_id: &str, resource_id: &str) -> Result<Vec<WorkflowSchedule>> {
        self.engine
            .find_by(realm_id, &IndexDimension::Resource, resource_id)
            .await
    }

    pub async fn by_workflow(&self, realm_id: &str, workflow_id: &str) -> Result<Vec<WorkflowSchedule>> {
        self.engine
            .find_by(realm_id, &IndexDimension::Workflow, workflow_id)
            .await
    }

    /// Schedules of a realm whose time has come, earliest first.
    pub async fn due(&self, realm_id: &str, now_ms: i64) -> Result<Vec<WorkflowSchedule>> {
        let mut due: Vec<WorkflowSchedule> = self
            .engine
            .list_realm(realm_id)
            .await?
            .into_iter()
            .filter(|schedule| schedule.is_due(now_ms))
            .collect();
        due.sort_by(|a, b| {
            a.scheduled_at_ms
                .cmp(&b.scheduled_at_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(due)
    }

    pub async fn remove_realm(&self, realm_id: &str) -> Result<ScanReport> {
        self.engine.remove_realm(realm_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedules_are_unbounded_by_default() {
        let schedule = WorkflowSchedule::new("w1", "r1", "disable-inactive", "u1", 0);
        let rules = schedule.lifespan_rules(&RealmLifespans::default());
        assert!(!rules.is_bounded(false));
        assert!(!WorkflowSchedule::REQUIRES_EXPIRY);
    }

    #[test]
    fn test_is_due() {
        let schedule = WorkflowSchedule::new("w1", "r1", "wf", "u1", 0).at(500);
        assert!(!schedule.is_due(499));
        assert!(schedule.is_due(500));
    }
}
