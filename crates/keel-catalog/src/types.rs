//! Agent-scoped catalogue entities.
//!
//! Every mutable entity is tenant-scoped, carries created/updated timestamps
//! and a nullable `deleted_at` (soft delete). Constructors validate on entry;
//! stores call `validate()` again before persisting so hand-built structs in
//! tests can't sneak past the invariants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use keel_core::{AgentId, Channel, FieldValue, TenantId, ValueType};

use crate::error::CatalogError;

pub fn utc_now() -> DateTime<Utc> {
    Utc::now()
}

/// Scoping level for rules and templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Scope {
    Global,
    Scenario,
    Step,
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Scope::Global => "GLOBAL",
            Scope::Scenario => "SCENARIO",
            Scope::Step => "STEP",
        };
        write!(f, "{}", s)
    }
}

/// When a bound tool runs relative to the step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolTiming {
    BeforeStep,
    AfterStep,
}

/// A tool attached to a rule or step, resolved at plan time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolBinding {
    pub tool_id: String,
    pub timing: ToolTiming,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

/// Agent configuration root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub tenant_id: TenantId,
    pub name: String,
    pub default_model: String,
    pub system_prompt: String,
    pub enabled: bool,
    /// Published configuration version the core reads at.
    pub config_version: u32,
    pub settings: AgentSettings,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentSettings {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

impl Agent {
    pub fn new(tenant_id: TenantId, name: &str, default_model: &str, system_prompt: &str) -> Self {
        let now = utc_now();
        Self {
            id: AgentId::new(),
            tenant_id,
            name: name.to_string(),
            default_model: default_model.to_string(),
            system_prompt: system_prompt.to_string(),
            enabled: true,
            config_version: 1,
            settings: AgentSettings::default(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

/// Behavioural policy: when X, then Y.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub agent_id: AgentId,
    pub name: String,
    pub description: Option<String>,
    /// When this is true (natural language).
    pub condition_text: String,
    /// Do this (natural language).
    pub action_text: String,
    pub scope: Scope,
    /// scenario_id or step_id when scoped.
    pub scope_id: Option<Uuid>,
    /// Higher wins in conflicts, -100..=100.
    pub priority: i32,
    pub enabled: bool,
    /// 0 = unlimited.
    pub max_fires_per_session: u32,
    /// Minimum turns between re-fires.
    pub cooldown_turns: u32,
    pub is_hard_constraint: bool,
    /// Formal expression for deterministic enforcement (e.g. `amount <= 50`).
    pub enforcement_expression: Option<String>,
    pub tool_bindings: Vec<ToolBinding>,
    pub attached_template_ids: Vec<Uuid>,
    pub condition_embedding: Option<Vec<f32>>,
    pub embedding_model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Rule {
    pub fn new(
        tenant_id: TenantId,
        agent_id: AgentId,
        name: &str,
        condition_text: &str,
        action_text: &str,
    ) -> Self {
        let now = utc_now();
        Self {
            id: Uuid::now_v7(),
            tenant_id,
            agent_id,
            name: name.to_string(),
            description: None,
            condition_text: condition_text.to_string(),
            action_text: action_text.to_string(),
            scope: Scope::Global,
            scope_id: None,
            priority: 0,
            enabled: true,
            max_fires_per_session: 0,
            cooldown_turns: 0,
            is_hard_constraint: false,
            enforcement_expression: None,
            tool_bindings: Vec::new(),
            attached_template_ids: Vec::new(),
            condition_embedding: None,
            embedding_model: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.name.is_empty() || self.condition_text.is_empty() || self.action_text.is_empty() {
            return Err(CatalogError::Validation(
                "rule name, condition_text and action_text must be non-empty".into(),
            ));
        }
        if !(-100..=100).contains(&self.priority) {
            return Err(CatalogError::Validation(format!(
                "rule priority {} outside [-100, 100]",
                self.priority
            )));
        }
        if matches!(self.scope, Scope::Scenario | Scope::Step) && self.scope_id.is_none() {
            return Err(CatalogError::Validation(format!(
                "scope_id is required when scope is {}",
                self.scope
            )));
        }
        Ok(())
    }
}

/// Transition out of a scenario step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTransition {
    pub to_step_id: Uuid,
    pub condition_text: String,
    pub condition_embedding: Option<Vec<f32>>,
    pub priority: i32,
    /// Customer-data fields the condition references; non-empty routes the
    /// decision through the LLM instead of embedding similarity.
    #[serde(default)]
    pub condition_fields: Vec<String>,
}

impl StepTransition {
    pub fn new(to_step_id: Uuid, condition_text: &str) -> Self {
        Self {
            to_step_id,
            condition_text: condition_text.to_string(),
            condition_embedding: None,
            priority: 0,
            condition_fields: Vec::new(),
        }
    }
}

/// One step of a scenario flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioStep {
    pub id: Uuid,
    pub scenario_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    /// Rendered into the generation prompt when this step contributes.
    pub instructions: Option<String>,
    pub transitions: Vec<StepTransition>,
    pub template_ids: Vec<Uuid>,
    pub rule_ids: Vec<Uuid>,
    pub tool_bindings: Vec<ToolBinding>,
    pub is_entry: bool,
    pub is_terminal: bool,
    pub can_skip: bool,
    pub reachable_from_anywhere: bool,
    pub collects_profile_fields: Vec<String>,
    pub performs_action: bool,
    pub is_required_action: bool,
    pub is_checkpoint: bool,
    pub checkpoint_description: Option<String>,
}

impl ScenarioStep {
    pub fn new(scenario_id: Uuid, name: &str) -> Self {
        Self {
            id: Uuid::now_v7(),
            scenario_id,
            name: name.to_string(),
            description: None,
            instructions: None,
            transitions: Vec::new(),
            template_ids: Vec::new(),
            rule_ids: Vec::new(),
            tool_bindings: Vec::new(),
            is_entry: false,
            is_terminal: false,
            can_skip: false,
            reachable_from_anywhere: false,
            collects_profile_fields: Vec::new(),
            performs_action: false,
            is_required_action: false,
            is_checkpoint: false,
            checkpoint_description: None,
        }
    }
}

/// Versioned multi-step conversational flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub agent_id: AgentId,
    pub name: String,
    pub description: Option<String>,
    pub version: u32,
    /// Higher evaluated first; breaks contribution conflicts.
    #[serde(default)]
    pub priority: i32,
    pub entry_step_id: Uuid,
    pub steps: Vec<ScenarioStep>,
    pub entry_condition_text: Option<String>,
    pub entry_embedding: Option<Vec<f32>>,
    /// Content address over the canonicalised steps + transitions; filled by
    /// the migration engine's checksum on save.
    pub content_hash: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Scenario {
    pub fn new(
        tenant_id: TenantId,
        agent_id: AgentId,
        name: &str,
        steps: Vec<ScenarioStep>,
    ) -> Result<Self, CatalogError> {
        let entry_step_id = steps
            .first()
            .map(|s| s.id)
            .ok_or_else(|| CatalogError::Validation("scenario needs at least one step".into()))?;
        let now = utc_now();
        Ok(Self {
            id: Uuid::now_v7(),
            tenant_id,
            agent_id,
            name: name.to_string(),
            description: None,
            version: 1,
            priority: 0,
            entry_step_id,
            steps,
            entry_condition_text: None,
            entry_embedding: None,
            content_hash: None,
            enabled: true,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        })
    }

    pub fn step(&self, step_id: Uuid) -> Option<&ScenarioStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn entry_step(&self) -> Option<&ScenarioStep> {
        self.step(self.entry_step_id)
    }

    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.version < 1 {
            return Err(CatalogError::Validation("scenario version must be >= 1".into()));
        }
        if self.entry_step().is_none() {
            return Err(CatalogError::Validation(
                "entry_step_id must reference a step of this scenario".into(),
            ));
        }
        for step in &self.steps {
            for t in &step.transitions {
                if self.step(t.to_step_id).is_none() {
                    return Err(CatalogError::Validation(format!(
                        "step '{}' transition targets unknown step {}",
                        step.name, t.to_step_id
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Response template with `{{placeholder}}` substitution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub agent_id: AgentId,
    pub name: String,
    pub text: String,
    pub mode: TemplateMode,
    pub scope: Scope,
    pub scope_id: Option<Uuid>,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TemplateMode {
    /// Rendered when generation fails or a hard constraint blocks.
    Fallback,
    /// Offered to the generator as suggested phrasing.
    Suggest,
    /// Replaces generation entirely.
    Strict,
}

impl Template {
    pub fn new(
        tenant_id: TenantId,
        agent_id: AgentId,
        name: &str,
        text: &str,
        mode: TemplateMode,
    ) -> Self {
        let now = utc_now();
        Self {
            id: Uuid::now_v7(),
            tenant_id,
            agent_id,
            name: name.to_string(),
            text: text.to_string(),
            mode,
            scope: Scope::Global,
            scope_id: None,
            priority: 0,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

/// Dynamic value resolved through a tool at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub agent_id: AgentId,
    /// snake_case identifier.
    pub name: String,
    pub resolver_tool_id: Option<String>,
    pub update_policy: UpdatePolicy,
    pub cache_ttl_seconds: Option<u64>,
    pub default_value: Option<FieldValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdatePolicy {
    OnDemand,
    OnChange,
    Always,
}

impl Variable {
    pub fn new(tenant_id: TenantId, agent_id: AgentId, name: &str) -> Result<Self, CatalogError> {
        if !is_snake_case(name) {
            return Err(CatalogError::Validation(format!(
                "variable name '{}' must be snake_case",
                name
            )));
        }
        let now = utc_now();
        Ok(Self {
            id: Uuid::now_v7(),
            tenant_id,
            agent_id,
            name: name.to_string(),
            resolver_tool_id: None,
            update_policy: UpdatePolicy::OnDemand,
            cache_ttl_seconds: None,
            default_value: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        })
    }
}

/// Labeled example set for per-turn intent classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub agent_id: AgentId,
    pub label: String,
    pub description: Option<String>,
    pub example_phrases: Vec<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Domain vocabulary entry rendered into sensor prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlossaryItem {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub agent_id: AgentId,
    pub term: String,
    pub definition: String,
    pub usage_hint: Option<String>,
    pub aliases: Vec<String>,
    pub category: Option<String>,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Tenant-level activation of a platform tool for an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolActivation {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub agent_id: AgentId,
    pub tool_id: String,
    pub enabled: bool,
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Directed relationship between two rules (e.g. refines, conflicts-with).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleRelationship {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub rule_id: Uuid,
    pub related_rule_id: Uuid,
    pub relation: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Schema definition for one customer data field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerDataField {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub agent_id: AgentId,
    pub name: String,
    pub display_name: String,
    /// Logical grouping exposed to the schema mask (e.g. "IDENTITY").
    pub scope: String,
    pub value_type: ValueType,
    pub validation_regex: Option<String>,
    pub validation_tool_id: Option<String>,
    pub allowed_values: Option<Vec<String>>,
    pub validation_mode: ValidationMode,
    pub required_verification: bool,
    pub freshness_seconds: Option<u64>,
    pub is_pii: bool,
    pub encryption_required: bool,
    pub retention_days: Option<u32>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationMode {
    None,
    Regex,
    Tool,
    Enum,
}

impl CustomerDataField {
    pub fn new(
        tenant_id: TenantId,
        agent_id: AgentId,
        name: &str,
        display_name: &str,
        value_type: ValueType,
    ) -> Result<Self, CatalogError> {
        if !is_snake_case(name) {
            return Err(CatalogError::Validation(format!(
                "field name '{}' must be snake_case",
                name
            )));
        }
        let now = utc_now();
        Ok(Self {
            id: Uuid::now_v7(),
            tenant_id,
            agent_id,
            name: name.to_string(),
            display_name: display_name.to_string(),
            scope: "IDENTITY".to_string(),
            value_type,
            validation_regex: None,
            validation_tool_id: None,
            allowed_values: None,
            validation_mode: ValidationMode::None,
            required_verification: false,
            freshness_seconds: None,
            is_pii: false,
            encryption_required: false,
            retention_days: None,
            enabled: true,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        })
    }
}

/// Binds a field to a scenario/step with collection semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioFieldRequirement {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub scenario_id: Uuid,
    pub step_id: Option<Uuid>,
    pub field_name: String,
    pub required_level: RequiredLevel,
    pub fallback_action: FallbackAction,
    pub collection_order: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequiredLevel {
    Hard,
    Soft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FallbackAction {
    Ask,
    Skip,
    Escalate,
}

impl ScenarioFieldRequirement {
    pub fn new(
        tenant_id: TenantId,
        scenario_id: Uuid,
        field_name: &str,
        required_level: RequiredLevel,
    ) -> Self {
        let now = utc_now();
        Self {
            id: Uuid::now_v7(),
            tenant_id,
            scenario_id,
            step_id: None,
            field_name: field_name.to_string(),
            required_level,
            fallback_action: FallbackAction::Ask,
            collection_order: 0,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Migration plan entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationPlanStatus {
    Pending,
    Approved,
    Deployed,
    Rejected,
}

/// Per-anchor migration kind (see the migration engine for semantics).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationScenario {
    CleanGraft,
    GapFill,
    ReRoute,
}

/// Operator override for how a given anchor migrates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorMigrationPolicy {
    /// Follow the computed migration scenario.
    #[default]
    Auto,
    /// Leave the marker in place; sessions keep running on the old version.
    Hold,
    /// Hand affected sessions to a human.
    Escalate,
}

/// A step inserted upstream of an anchor in the new version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsertedNode {
    pub node_id: Uuid,
    pub node_name: String,
    pub collects_fields: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkBranch {
    pub to_step_id: Uuid,
    pub condition_text: String,
}

/// A branching step introduced upstream of an anchor in the new version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFork {
    pub fork_node_id: Uuid,
    pub fork_node_name: String,
    pub branches: Vec<ForkBranch>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamChanges {
    pub inserted_nodes: Vec<InsertedNode>,
    pub new_forks: Vec<NewFork>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownstreamChanges {
    pub deleted_nodes: Vec<Uuid>,
    pub added_nodes: Vec<Uuid>,
}

/// Mapping from an anchor in v1 to its counterpart in v2.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorTransformation {
    pub anchor_name: String,
    pub anchor_hash: String,
    pub source_step_id_v1: Uuid,
    pub target_step_id_v2: Uuid,
    pub migration_scenario: MigrationScenario,
    pub upstream_changes: UpstreamChanges,
    pub downstream_changes: DownstreamChanges,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletedNode {
    pub node_id: Uuid,
    pub node_name: String,
}

/// Output of diffing v_old against v_new.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransformationMap {
    pub anchors: Vec<AnchorTransformation>,
    pub deleted_nodes: Vec<DeletedNode>,
    pub new_node_ids: Vec<Uuid>,
}

impl TransformationMap {
    pub fn anchor_by_hash(&self, hash: &str) -> Option<&AnchorTransformation> {
        self.anchors.iter().find(|a| a.anchor_hash == hash)
    }
}

/// Restricts a deployment to a subset of sessions. Empty filter matches all.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopeFilter {
    pub channels: Vec<Channel>,
}

impl ScopeFilter {
    pub fn matches_channel(&self, channel: Channel) -> bool {
        self.channels.is_empty() || self.channels.contains(&channel)
    }
}

/// Versioned scenario migration plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub agent_id: AgentId,
    pub scenario_id: Uuid,
    pub from_version: u32,
    pub to_version: u32,
    pub scenario_checksum_v1: String,
    pub scenario_checksum_v2: String,
    pub status: MigrationPlanStatus,
    pub transformation_map: TransformationMap,
    /// anchor hash -> operator policy override.
    #[serde(default)]
    pub anchor_policies: std::collections::BTreeMap<String, AnchorMigrationPolicy>,
    pub scope_filter: Option<ScopeFilter>,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub deployed_at: Option<DateTime<Utc>>,
}

/// `snake_case`: lowercase ascii, digits, underscores; starts with a letter.
pub fn is_snake_case(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    name.chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_scope_requires_scope_id() {
        let tenant = TenantId::new();
        let agent = AgentId::new();
        let mut rule = Rule::new(tenant, agent, "r", "when", "then");
        rule.scope = Scope::Scenario;
        assert!(rule.validate().is_err());
        rule.scope_id = Some(Uuid::now_v7());
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn rule_priority_bounds() {
        let mut rule = Rule::new(TenantId::new(), AgentId::new(), "r", "c", "a");
        rule.priority = 101;
        assert!(rule.validate().is_err());
        rule.priority = -100;
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn variable_name_must_be_snake_case() {
        let tenant = TenantId::new();
        let agent = AgentId::new();
        assert!(Variable::new(tenant, agent, "phone_number").is_ok());
        assert!(Variable::new(tenant, agent, "PhoneNumber").is_err());
        assert!(Variable::new(tenant, agent, "1phone").is_err());
        assert!(Variable::new(tenant, agent, "").is_err());
    }

    #[test]
    fn scenario_validates_transition_targets() {
        let tenant = TenantId::new();
        let agent = AgentId::new();
        let scenario_id = Uuid::now_v7();
        let mut a = ScenarioStep::new(scenario_id, "A");
        a.transitions.push(StepTransition::new(Uuid::now_v7(), "next"));
        let scenario = Scenario::new(tenant, agent, "s", vec![a]).unwrap();
        assert!(scenario.validate().is_err());
    }

    #[test]
    fn scope_filter_empty_matches_everything() {
        let filter = ScopeFilter::default();
        assert!(filter.matches_channel(Channel::Webchat));
        let narrow = ScopeFilter {
            channels: vec![Channel::Whatsapp],
        };
        assert!(!narrow.matches_channel(Channel::Webchat));
        assert!(narrow.matches_channel(Channel::Whatsapp));
    }
}
