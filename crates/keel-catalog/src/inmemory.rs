//! In-memory catalogue store for tests and embedded single-node use.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use keel_core::{AgentId, TenantId};

use crate::error::{CatalogError, Result};
use crate::store::{AgentConfigStore, Page};
use crate::types::*;

#[derive(Default)]
pub struct InMemoryAgentConfigStore {
    agents: DashMap<AgentId, Agent>,
    rules: DashMap<Uuid, Rule>,
    scenarios: DashMap<Uuid, Scenario>,
    scenario_archive: DashMap<(Uuid, u32), Scenario>,
    templates: DashMap<Uuid, Template>,
    variables: DashMap<Uuid, Variable>,
    intents: DashMap<Uuid, Intent>,
    glossary: DashMap<Uuid, GlossaryItem>,
    tool_activations: DashMap<Uuid, ToolActivation>,
    rule_relationships: DashMap<Uuid, RuleRelationship>,
    field_definitions: DashMap<Uuid, CustomerDataField>,
    scenario_requirements: DashMap<Uuid, ScenarioFieldRequirement>,
    migration_plans: DashMap<Uuid, MigrationPlan>,
}

impl InMemoryAgentConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Visible to this tenant: owned by it and not soft-deleted.
fn visible(tenant_id: TenantId, row_tenant: TenantId, deleted: bool) -> bool {
    row_tenant == tenant_id && !deleted
}

#[async_trait]
impl AgentConfigStore for InMemoryAgentConfigStore {
    async fn get_agent(&self, tenant_id: TenantId, agent_id: AgentId) -> Result<Option<Agent>> {
        Ok(self.agents.get(&agent_id).and_then(|a| {
            visible(tenant_id, a.tenant_id, a.deleted_at.is_some()).then(|| a.value().clone())
        }))
    }

    async fn save_agent(&self, mut agent: Agent) -> Result<AgentId> {
        agent.updated_at = utc_now();
        let id = agent.id;
        self.agents.insert(id, agent);
        Ok(id)
    }

    async fn delete_agent(&self, tenant_id: TenantId, agent_id: AgentId) -> Result<bool> {
        match self.agents.get_mut(&agent_id) {
            Some(mut a) if a.tenant_id == tenant_id && a.deleted_at.is_none() => {
                a.deleted_at = Some(utc_now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_rule(&self, tenant_id: TenantId, rule_id: Uuid) -> Result<Option<Rule>> {
        Ok(self.rules.get(&rule_id).and_then(|r| {
            visible(tenant_id, r.tenant_id, r.deleted_at.is_some()).then(|| r.value().clone())
        }))
    }

    async fn get_rules(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
        scope: Option<Scope>,
        scope_id: Option<Uuid>,
        enabled_only: bool,
    ) -> Result<Vec<Rule>> {
        let mut out: Vec<Rule> = self
            .rules
            .iter()
            .filter(|r| visible(tenant_id, r.tenant_id, r.deleted_at.is_some()))
            .filter(|r| r.agent_id == agent_id)
            .filter(|r| scope.map_or(true, |s| r.scope == s))
            .filter(|r| scope_id.map_or(true, |sid| r.scope_id == Some(sid)))
            .filter(|r| !enabled_only || r.enabled)
            .map(|r| r.value().clone())
            .collect();
        out.sort_by_key(|r| std::cmp::Reverse(r.priority));
        Ok(out)
    }

    async fn list_rules(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
        page: Page,
        include_deleted: bool,
    ) -> Result<Vec<Rule>> {
        let mut out: Vec<Rule> = self
            .rules
            .iter()
            .filter(|r| r.tenant_id == tenant_id && r.agent_id == agent_id)
            .filter(|r| include_deleted || r.deleted_at.is_none())
            .map(|r| r.value().clone())
            .collect();
        out.sort_by_key(|r| r.created_at);
        Ok(out.into_iter().skip(page.offset).take(page.limit).collect())
    }

    async fn save_rule(&self, mut rule: Rule) -> Result<Uuid> {
        rule.validate()?;
        rule.updated_at = utc_now();
        let id = rule.id;
        self.rules.insert(id, rule);
        Ok(id)
    }

    async fn delete_rule(&self, tenant_id: TenantId, rule_id: Uuid) -> Result<bool> {
        match self.rules.get_mut(&rule_id) {
            Some(mut r) if r.tenant_id == tenant_id && r.deleted_at.is_none() => {
                r.deleted_at = Some(utc_now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_scenario(
        &self,
        tenant_id: TenantId,
        scenario_id: Uuid,
    ) -> Result<Option<Scenario>> {
        Ok(self.scenarios.get(&scenario_id).and_then(|s| {
            visible(tenant_id, s.tenant_id, s.deleted_at.is_some()).then(|| s.value().clone())
        }))
    }

    async fn get_scenarios(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
        enabled_only: bool,
    ) -> Result<Vec<Scenario>> {
        Ok(self
            .scenarios
            .iter()
            .filter(|s| visible(tenant_id, s.tenant_id, s.deleted_at.is_some()))
            .filter(|s| s.agent_id == agent_id)
            .filter(|s| !enabled_only || s.enabled)
            .map(|s| s.value().clone())
            .collect())
    }

    async fn save_scenario(&self, mut scenario: Scenario) -> Result<Uuid> {
        scenario.validate()?;
        scenario.updated_at = utc_now();
        let id = scenario.id;
        // Archive the currently live version before overwriting with a newer one.
        if let Some(prev) = self.scenarios.get(&id).map(|s| s.value().clone()) {
            if prev.version < scenario.version {
                debug!(
                    scenario_id = %id,
                    archived_version = prev.version,
                    "archiving scenario version before overwrite"
                );
                self.scenario_archive.insert((id, prev.version), prev);
            }
        }
        self.scenarios.insert(id, scenario);
        Ok(id)
    }

    async fn get_archived_scenario(
        &self,
        tenant_id: TenantId,
        scenario_id: Uuid,
        version: u32,
    ) -> Result<Option<Scenario>> {
        // The live row serves its own version; the archive serves the rest.
        if let Some(live) = self.scenarios.get(&scenario_id) {
            if live.tenant_id == tenant_id && live.version == version {
                return Ok(Some(live.value().clone()));
            }
        }
        Ok(self
            .scenario_archive
            .get(&(scenario_id, version))
            .and_then(|s| (s.tenant_id == tenant_id).then(|| s.value().clone())))
    }

    async fn delete_scenario(&self, tenant_id: TenantId, scenario_id: Uuid) -> Result<bool> {
        match self.scenarios.get_mut(&scenario_id) {
            Some(mut s) if s.tenant_id == tenant_id && s.deleted_at.is_none() => {
                s.deleted_at = Some(utc_now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_template(
        &self,
        tenant_id: TenantId,
        template_id: Uuid,
    ) -> Result<Option<Template>> {
        Ok(self.templates.get(&template_id).and_then(|t| {
            visible(tenant_id, t.tenant_id, t.deleted_at.is_some()).then(|| t.value().clone())
        }))
    }

    async fn get_templates(&self, tenant_id: TenantId, agent_id: AgentId) -> Result<Vec<Template>> {
        Ok(self
            .templates
            .iter()
            .filter(|t| visible(tenant_id, t.tenant_id, t.deleted_at.is_some()))
            .filter(|t| t.agent_id == agent_id)
            .map(|t| t.value().clone())
            .collect())
    }

    async fn save_template(&self, mut template: Template) -> Result<Uuid> {
        template.updated_at = utc_now();
        let id = template.id;
        self.templates.insert(id, template);
        Ok(id)
    }

    async fn delete_template(&self, tenant_id: TenantId, template_id: Uuid) -> Result<bool> {
        match self.templates.get_mut(&template_id) {
            Some(mut t) if t.tenant_id == tenant_id && t.deleted_at.is_none() => {
                t.deleted_at = Some(utc_now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_variables(&self, tenant_id: TenantId, agent_id: AgentId) -> Result<Vec<Variable>> {
        Ok(self
            .variables
            .iter()
            .filter(|v| visible(tenant_id, v.tenant_id, v.deleted_at.is_some()))
            .filter(|v| v.agent_id == agent_id)
            .map(|v| v.value().clone())
            .collect())
    }

    async fn save_variable(&self, mut variable: Variable) -> Result<Uuid> {
        if !is_snake_case(&variable.name) {
            return Err(CatalogError::Validation(format!(
                "variable name '{}' must be snake_case",
                variable.name
            )));
        }
        variable.updated_at = utc_now();
        let id = variable.id;
        self.variables.insert(id, variable);
        Ok(id)
    }

    async fn delete_variable(&self, tenant_id: TenantId, variable_id: Uuid) -> Result<bool> {
        match self.variables.get_mut(&variable_id) {
            Some(mut v) if v.tenant_id == tenant_id && v.deleted_at.is_none() => {
                v.deleted_at = Some(utc_now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_intents(&self, tenant_id: TenantId, agent_id: AgentId) -> Result<Vec<Intent>> {
        Ok(self
            .intents
            .iter()
            .filter(|i| visible(tenant_id, i.tenant_id, i.deleted_at.is_some()))
            .filter(|i| i.agent_id == agent_id && i.enabled)
            .map(|i| i.value().clone())
            .collect())
    }

    async fn save_intent(&self, mut intent: Intent) -> Result<Uuid> {
        intent.updated_at = utc_now();
        let id = intent.id;
        self.intents.insert(id, intent);
        Ok(id)
    }

    async fn delete_intent(&self, tenant_id: TenantId, intent_id: Uuid) -> Result<bool> {
        match self.intents.get_mut(&intent_id) {
            Some(mut i) if i.tenant_id == tenant_id && i.deleted_at.is_none() => {
                i.deleted_at = Some(utc_now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_glossary(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
    ) -> Result<Vec<GlossaryItem>> {
        let mut out: Vec<GlossaryItem> = self
            .glossary
            .iter()
            .filter(|g| visible(tenant_id, g.tenant_id, g.deleted_at.is_some()))
            .filter(|g| g.agent_id == agent_id)
            .map(|g| g.value().clone())
            .collect();
        out.sort_by_key(|g| std::cmp::Reverse(g.priority));
        Ok(out)
    }

    async fn save_glossary_item(&self, mut item: GlossaryItem) -> Result<Uuid> {
        item.updated_at = utc_now();
        let id = item.id;
        self.glossary.insert(id, item);
        Ok(id)
    }

    async fn delete_glossary_item(&self, tenant_id: TenantId, item_id: Uuid) -> Result<bool> {
        match self.glossary.get_mut(&item_id) {
            Some(mut g) if g.tenant_id == tenant_id && g.deleted_at.is_none() => {
                g.deleted_at = Some(utc_now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_tool_activations(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
    ) -> Result<Vec<ToolActivation>> {
        Ok(self
            .tool_activations
            .iter()
            .filter(|t| visible(tenant_id, t.tenant_id, t.deleted_at.is_some()))
            .filter(|t| t.agent_id == agent_id)
            .map(|t| t.value().clone())
            .collect())
    }

    async fn save_tool_activation(&self, mut activation: ToolActivation) -> Result<Uuid> {
        activation.updated_at = utc_now();
        let id = activation.id;
        self.tool_activations.insert(id, activation);
        Ok(id)
    }

    async fn delete_tool_activation(
        &self,
        tenant_id: TenantId,
        activation_id: Uuid,
    ) -> Result<bool> {
        match self.tool_activations.get_mut(&activation_id) {
            Some(mut t) if t.tenant_id == tenant_id && t.deleted_at.is_none() => {
                t.deleted_at = Some(utc_now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_rule_relationships(
        &self,
        tenant_id: TenantId,
        rule_id: Uuid,
    ) -> Result<Vec<RuleRelationship>> {
        Ok(self
            .rule_relationships
            .iter()
            .filter(|r| visible(tenant_id, r.tenant_id, r.deleted_at.is_some()))
            .filter(|r| r.rule_id == rule_id || r.related_rule_id == rule_id)
            .map(|r| r.value().clone())
            .collect())
    }

    async fn save_rule_relationship(&self, mut rel: RuleRelationship) -> Result<Uuid> {
        rel.updated_at = utc_now();
        let id = rel.id;
        self.rule_relationships.insert(id, rel);
        Ok(id)
    }

    async fn get_field_definitions(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
        enabled_only: bool,
    ) -> Result<Vec<CustomerDataField>> {
        Ok(self
            .field_definitions
            .iter()
            .filter(|f| visible(tenant_id, f.tenant_id, f.deleted_at.is_some()))
            .filter(|f| f.agent_id == agent_id)
            .filter(|f| !enabled_only || f.enabled)
            .map(|f| f.value().clone())
            .collect())
    }

    async fn get_field_definition(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
        field_name: &str,
    ) -> Result<Option<CustomerDataField>> {
        Ok(self
            .field_definitions
            .iter()
            .find(|f| {
                visible(tenant_id, f.tenant_id, f.deleted_at.is_some())
                    && f.agent_id == agent_id
                    && f.name == field_name
            })
            .map(|f| f.value().clone()))
    }

    async fn save_field_definition(&self, mut definition: CustomerDataField) -> Result<Uuid> {
        definition.updated_at = utc_now();
        let id = definition.id;
        self.field_definitions.insert(id, definition);
        Ok(id)
    }

    async fn delete_field_definition(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
        field_name: &str,
    ) -> Result<bool> {
        let target = self.field_definitions.iter().find_map(|f| {
            (f.tenant_id == tenant_id
                && f.agent_id == agent_id
                && f.name == field_name
                && f.deleted_at.is_none())
            .then(|| f.id)
        });
        match target {
            Some(id) => {
                if let Some(mut f) = self.field_definitions.get_mut(&id) {
                    f.deleted_at = Some(utc_now());
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_scenario_requirements(
        &self,
        tenant_id: TenantId,
        scenario_id: Uuid,
        step_id: Option<Uuid>,
    ) -> Result<Vec<ScenarioFieldRequirement>> {
        let mut out: Vec<ScenarioFieldRequirement> = self
            .scenario_requirements
            .iter()
            .filter(|r| visible(tenant_id, r.tenant_id, r.deleted_at.is_some()))
            .filter(|r| r.scenario_id == scenario_id)
            .filter(|r| step_id.map_or(true, |sid| r.step_id == Some(sid)))
            .map(|r| r.value().clone())
            .collect();
        out.sort_by_key(|r| r.collection_order);
        Ok(out)
    }

    async fn save_scenario_requirement(
        &self,
        mut requirement: ScenarioFieldRequirement,
    ) -> Result<Uuid> {
        requirement.updated_at = utc_now();
        let id = requirement.id;
        self.scenario_requirements.insert(id, requirement);
        Ok(id)
    }

    async fn get_migration_plan(
        &self,
        tenant_id: TenantId,
        plan_id: Uuid,
    ) -> Result<Option<MigrationPlan>> {
        Ok(self
            .migration_plans
            .get(&plan_id)
            .and_then(|p| (p.tenant_id == tenant_id).then(|| p.value().clone())))
    }

    async fn list_migration_plans(
        &self,
        tenant_id: TenantId,
        scenario_id: Option<Uuid>,
        page: Page,
    ) -> Result<Vec<MigrationPlan>> {
        let mut out: Vec<MigrationPlan> = self
            .migration_plans
            .iter()
            .filter(|p| p.tenant_id == tenant_id)
            .filter(|p| scenario_id.map_or(true, |sid| p.scenario_id == sid))
            .map(|p| p.value().clone())
            .collect();
        out.sort_by_key(|p| p.created_at);
        Ok(out.into_iter().skip(page.offset).take(page.limit).collect())
    }

    async fn save_migration_plan(&self, plan: MigrationPlan) -> Result<Uuid> {
        let id = plan.id;
        self.migration_plans.insert(id, plan);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> InMemoryAgentConfigStore {
        InMemoryAgentConfigStore::new()
    }

    #[tokio::test]
    async fn cross_tenant_reads_come_back_empty() {
        let s = store();
        let tenant_a = TenantId::new();
        let tenant_b = TenantId::new();
        let agent = AgentId::new();
        let rule = Rule::new(tenant_a, agent, "r", "when", "then");
        let rule_id = s.save_rule(rule).await.unwrap();

        assert!(s.get_rule(tenant_a, rule_id).await.unwrap().is_some());
        assert!(s.get_rule(tenant_b, rule_id).await.unwrap().is_none());
        assert!(s.delete_rule(tenant_b, rule_id).await.unwrap() == false);
    }

    #[tokio::test]
    async fn soft_delete_hides_from_default_listing() {
        let s = store();
        let tenant = TenantId::new();
        let agent = AgentId::new();
        let rule = Rule::new(tenant, agent, "r", "c", "a");
        let rule_id = s.save_rule(rule).await.unwrap();

        assert!(s.delete_rule(tenant, rule_id).await.unwrap());

        let listed = s
            .list_rules(tenant, agent, Page::default(), false)
            .await
            .unwrap();
        assert!(listed.is_empty());

        let with_deleted = s
            .list_rules(tenant, agent, Page::default(), true)
            .await
            .unwrap();
        assert_eq!(with_deleted.len(), 1);
    }

    #[tokio::test]
    async fn scenario_save_archives_previous_version() {
        let s = store();
        let tenant = TenantId::new();
        let agent = AgentId::new();
        let scenario_id;
        {
            let step = ScenarioStep::new(Uuid::now_v7(), "A");
            let mut v1 = Scenario::new(tenant, agent, "flow", vec![step]).unwrap();
            v1.steps[0].scenario_id = v1.id;
            scenario_id = v1.id;
            s.save_scenario(v1).await.unwrap();
        }

        let mut v2 = s.get_scenario(tenant, scenario_id).await.unwrap().unwrap();
        v2.version = 2;
        v2.steps[0].name = "A'".to_string();
        s.save_scenario(v2).await.unwrap();

        let archived = s
            .get_archived_scenario(tenant, scenario_id, 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(archived.version, 1);
        assert_eq!(archived.steps[0].name, "A");

        let live = s.get_scenario(tenant, scenario_id).await.unwrap().unwrap();
        assert_eq!(live.version, 2);
    }

    #[tokio::test]
    async fn scoped_rule_queries_filter_by_scope_id() {
        let s = store();
        let tenant = TenantId::new();
        let agent = AgentId::new();
        let scenario_id = Uuid::now_v7();

        let global = Rule::new(tenant, agent, "g", "c", "a");
        let mut scoped = Rule::new(tenant, agent, "s", "c", "a");
        scoped.scope = Scope::Scenario;
        scoped.scope_id = Some(scenario_id);
        s.save_rule(global).await.unwrap();
        s.save_rule(scoped).await.unwrap();

        let globals = s
            .get_rules(tenant, agent, Some(Scope::Global), None, true)
            .await
            .unwrap();
        assert_eq!(globals.len(), 1);
        assert_eq!(globals[0].name, "g");

        let scoped = s
            .get_rules(tenant, agent, Some(Scope::Scenario), Some(scenario_id), true)
            .await
            .unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].name, "s");
    }
}
