use async_trait::async_trait;
use uuid::Uuid;

use keel_core::{AgentId, TenantId};

use crate::error::Result;
use crate::types::*;

/// Pagination window for list operations.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

/// Catalogue store the core reads agent configuration through.
///
/// Contract obligations shared by every implementation:
/// - every read filters by `tenant_id` and `deleted_at IS NULL` unless
///   `include_deleted` is requested;
/// - any id that resolves to a row owned by another tenant is treated as
///   not-found (cross-tenant ids never leak);
/// - `save_*` validates the entity and bumps `updated_at`;
/// - `delete_*` is a soft delete (sets `deleted_at`).
#[async_trait]
pub trait AgentConfigStore: Send + Sync {
    // -- agents ------------------------------------------------------------
    async fn get_agent(&self, tenant_id: TenantId, agent_id: AgentId) -> Result<Option<Agent>>;
    async fn save_agent(&self, agent: Agent) -> Result<AgentId>;
    async fn delete_agent(&self, tenant_id: TenantId, agent_id: AgentId) -> Result<bool>;

    // -- rules -------------------------------------------------------------
    async fn get_rule(&self, tenant_id: TenantId, rule_id: Uuid) -> Result<Option<Rule>>;
    async fn get_rules(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
        scope: Option<Scope>,
        scope_id: Option<Uuid>,
        enabled_only: bool,
    ) -> Result<Vec<Rule>>;
    async fn list_rules(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
        page: Page,
        include_deleted: bool,
    ) -> Result<Vec<Rule>>;
    async fn save_rule(&self, rule: Rule) -> Result<Uuid>;
    async fn delete_rule(&self, tenant_id: TenantId, rule_id: Uuid) -> Result<bool>;

    // -- scenarios ---------------------------------------------------------
    async fn get_scenario(&self, tenant_id: TenantId, scenario_id: Uuid)
        -> Result<Option<Scenario>>;
    async fn get_scenarios(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
        enabled_only: bool,
    ) -> Result<Vec<Scenario>>;
    /// Save a scenario; when overwriting a lower version, the previous version
    /// is archived first (immutable, keyed `(tenant, scenario, version)`).
    async fn save_scenario(&self, scenario: Scenario) -> Result<Uuid>;
    async fn get_archived_scenario(
        &self,
        tenant_id: TenantId,
        scenario_id: Uuid,
        version: u32,
    ) -> Result<Option<Scenario>>;
    async fn delete_scenario(&self, tenant_id: TenantId, scenario_id: Uuid) -> Result<bool>;

    // -- templates ---------------------------------------------------------
    async fn get_template(&self, tenant_id: TenantId, template_id: Uuid)
        -> Result<Option<Template>>;
    async fn get_templates(&self, tenant_id: TenantId, agent_id: AgentId)
        -> Result<Vec<Template>>;
    async fn save_template(&self, template: Template) -> Result<Uuid>;
    async fn delete_template(&self, tenant_id: TenantId, template_id: Uuid) -> Result<bool>;

    // -- variables ---------------------------------------------------------
    async fn get_variables(&self, tenant_id: TenantId, agent_id: AgentId)
        -> Result<Vec<Variable>>;
    async fn save_variable(&self, variable: Variable) -> Result<Uuid>;
    async fn delete_variable(&self, tenant_id: TenantId, variable_id: Uuid) -> Result<bool>;

    // -- intents -----------------------------------------------------------
    async fn get_intents(&self, tenant_id: TenantId, agent_id: AgentId) -> Result<Vec<Intent>>;
    async fn save_intent(&self, intent: Intent) -> Result<Uuid>;
    async fn delete_intent(&self, tenant_id: TenantId, intent_id: Uuid) -> Result<bool>;

    // -- glossary ----------------------------------------------------------
    async fn get_glossary(&self, tenant_id: TenantId, agent_id: AgentId)
        -> Result<Vec<GlossaryItem>>;
    async fn save_glossary_item(&self, item: GlossaryItem) -> Result<Uuid>;
    async fn delete_glossary_item(&self, tenant_id: TenantId, item_id: Uuid) -> Result<bool>;

    // -- tool activations --------------------------------------------------
    async fn get_tool_activations(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
    ) -> Result<Vec<ToolActivation>>;
    async fn save_tool_activation(&self, activation: ToolActivation) -> Result<Uuid>;
    async fn delete_tool_activation(&self, tenant_id: TenantId, activation_id: Uuid)
        -> Result<bool>;

    // -- rule relationships ------------------------------------------------
    async fn get_rule_relationships(
        &self,
        tenant_id: TenantId,
        rule_id: Uuid,
    ) -> Result<Vec<RuleRelationship>>;
    async fn save_rule_relationship(&self, rel: RuleRelationship) -> Result<Uuid>;

    // -- customer field schema ----------------------------------------------
    async fn get_field_definitions(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
        enabled_only: bool,
    ) -> Result<Vec<CustomerDataField>>;
    async fn get_field_definition(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
        field_name: &str,
    ) -> Result<Option<CustomerDataField>>;
    async fn save_field_definition(&self, definition: CustomerDataField) -> Result<Uuid>;
    async fn delete_field_definition(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
        field_name: &str,
    ) -> Result<bool>;

    // -- scenario field requirements -----------------------------------------
    async fn get_scenario_requirements(
        &self,
        tenant_id: TenantId,
        scenario_id: Uuid,
        step_id: Option<Uuid>,
    ) -> Result<Vec<ScenarioFieldRequirement>>;
    async fn save_scenario_requirement(&self, requirement: ScenarioFieldRequirement)
        -> Result<Uuid>;

    // -- migration plans ------------------------------------------------------
    async fn get_migration_plan(
        &self,
        tenant_id: TenantId,
        plan_id: Uuid,
    ) -> Result<Option<MigrationPlan>>;
    async fn list_migration_plans(
        &self,
        tenant_id: TenantId,
        scenario_id: Option<Uuid>,
        page: Page,
    ) -> Result<Vec<MigrationPlan>>;
    async fn save_migration_plan(&self, plan: MigrationPlan) -> Result<Uuid>;
}
