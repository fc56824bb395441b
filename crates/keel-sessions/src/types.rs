use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use keel_core::{AgentId, Channel, CustomerId, FieldValue, SessionId, TenantId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Active,
    Idle,
    Processing,
    Interrupted,
    Closed,
}

/// Marker set at migration deployment, cleared on the first turn that
/// teleports the session onto the new version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMigration {
    pub target_version: u32,
    pub anchor_content_hash: String,
    pub migration_plan_id: Uuid,
    pub marked_at: DateTime<Utc>,
}

/// Append-only record of entering a scenario step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepVisit {
    pub step_id: Uuid,
    pub step_name: Option<String>,
    pub entered_at: DateTime<Utc>,
    pub turn_number: u32,
    pub transition_reason: Option<String>,
    /// Navigation confidence in [0, 1].
    pub confidence: f64,
    pub is_checkpoint: bool,
    pub checkpoint_description: Option<String>,
    /// Anchor key for migration matching.
    pub step_content_hash: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Active,
    Paused,
    Completed,
    Cancelled,
}

/// One live execution of a scenario inside a session. Several may coexist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioInstance {
    pub scenario_id: Uuid,
    pub scenario_version: u32,
    pub current_step_id: Uuid,
    /// step_id -> visit count.
    pub visited_steps: HashMap<Uuid, u32>,
    pub started_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
    pub variables: HashMap<String, FieldValue>,
    pub status: InstanceStatus,
}

impl ScenarioInstance {
    pub fn start(scenario_id: Uuid, scenario_version: u32, entry_step_id: Uuid) -> Self {
        let now = Utc::now();
        let mut visited = HashMap::new();
        visited.insert(entry_step_id, 1);
        Self {
            scenario_id,
            scenario_version,
            current_step_id: entry_step_id,
            visited_steps: visited,
            started_at: now,
            last_active_at: now,
            paused_at: None,
            variables: HashMap::new(),
            status: InstanceStatus::Active,
        }
    }

    pub fn record_visit(&mut self, step_id: Uuid) {
        *self.visited_steps.entry(step_id).or_insert(0) += 1;
        self.last_active_at = Utc::now();
    }

    pub fn visit_count(&self, step_id: Uuid) -> u32 {
        self.visited_steps.get(&step_id).copied().unwrap_or(0)
    }
}

/// Live conversation state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub tenant_id: TenantId,
    pub agent_id: AgentId,
    pub channel: Channel,
    pub user_channel_id: String,
    pub customer_profile_id: Option<CustomerId>,
    /// Published agent config version this session resolved at.
    pub config_version: u32,
    pub active_scenarios: Vec<ScenarioInstance>,
    pub step_history: Vec<StepVisit>,
    pub relocalization_count: u32,
    /// rule_id -> fire count this session.
    pub rule_fires: HashMap<Uuid, u32>,
    /// rule_id -> turn number of the last fire.
    pub rule_last_fire_turn: HashMap<Uuid, u32>,
    pub variables: HashMap<String, FieldValue>,
    pub variable_updated_at: HashMap<String, DateTime<Utc>>,
    pub turn_count: u32,
    pub status: SessionStatus,
    pub pending_migration: Option<PendingMigration>,
    pub scenario_checksum: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        tenant_id: TenantId,
        agent_id: AgentId,
        channel: Channel,
        user_channel_id: &str,
        config_version: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: SessionId::new(),
            tenant_id,
            agent_id,
            channel,
            user_channel_id: user_channel_id.to_string(),
            customer_profile_id: None,
            config_version,
            active_scenarios: Vec::new(),
            step_history: Vec::new(),
            relocalization_count: 0,
            rule_fires: HashMap::new(),
            rule_last_fire_turn: HashMap::new(),
            variables: HashMap::new(),
            variable_updated_at: HashMap::new(),
            turn_count: 0,
            status: SessionStatus::Active,
            pending_migration: None,
            scenario_checksum: None,
            created_at: now,
            last_activity_at: now,
        }
    }

    /// Bump fire bookkeeping for a rule applied on `turn_number`.
    pub fn record_rule_fire(&mut self, rule_id: Uuid, turn_number: u32) {
        *self.rule_fires.entry(rule_id).or_insert(0) += 1;
        self.rule_last_fire_turn.insert(rule_id, turn_number);
    }

    pub fn instance(&self, scenario_id: Uuid) -> Option<&ScenarioInstance> {
        self.active_scenarios
            .iter()
            .find(|i| i.scenario_id == scenario_id)
    }

    pub fn instance_mut(&mut self, scenario_id: Uuid) -> Option<&mut ScenarioInstance> {
        self.active_scenarios
            .iter_mut()
            .find(|i| i.scenario_id == scenario_id)
    }

    /// Instances currently counted against `max_concurrent_scenarios`.
    pub fn running_instances(&self) -> impl Iterator<Item = &ScenarioInstance> {
        self.active_scenarios
            .iter()
            .filter(|i| matches!(i.status, InstanceStatus::Active | InstanceStatus::Paused))
    }

    /// The most recent visit recorded for a step of this scenario instance.
    pub fn last_visit_hash(&self, step_id: Uuid) -> Option<&str> {
        self.step_history
            .iter()
            .rev()
            .find(|v| v.step_id == step_id)
            .and_then(|v| v.step_content_hash.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(TenantId::new(), AgentId::new(), Channel::Webchat, "u1", 1)
    }

    #[test]
    fn rule_fire_bookkeeping_accumulates() {
        let mut s = session();
        let rule = Uuid::now_v7();
        s.record_rule_fire(rule, 3);
        s.record_rule_fire(rule, 7);
        assert_eq!(s.rule_fires[&rule], 2);
        assert_eq!(s.rule_last_fire_turn[&rule], 7);
    }

    #[test]
    fn instance_visit_counts() {
        let step = Uuid::now_v7();
        let mut instance = ScenarioInstance::start(Uuid::now_v7(), 1, step);
        assert_eq!(instance.visit_count(step), 1);
        instance.record_visit(step);
        assert_eq!(instance.visit_count(step), 2);
        assert_eq!(instance.visit_count(Uuid::now_v7()), 0);
    }
}
