//! Write-through cache wrapper for the catalogue store.
//!
//! Caches the hot per-turn reads (agent, rules by scope, scenarios, templates,
//! glossary, field schema, scenario requirements) under
//! `{prefix}:cfg:{tenant}:...` keys. Every write delegates to the backend
//! first, then invalidates the tenant's whole prefix. Cache backend errors
//! fall through to the store when `fallback_on_error` is set; otherwise they
//! surface to the caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use keel_core::cache::KvCache;
use keel_core::config::CacheConfig;
use keel_core::{AgentId, TenantId};

use crate::error::{CatalogError, Result};
use crate::store::{AgentConfigStore, Page};
use crate::types::*;

pub struct CachedAgentConfigStore {
    backend: Arc<dyn AgentConfigStore>,
    cache: Arc<dyn KvCache>,
    config: CacheConfig,
}

impl CachedAgentConfigStore {
    pub fn new(
        backend: Arc<dyn AgentConfigStore>,
        cache: Arc<dyn KvCache>,
        config: CacheConfig,
    ) -> Self {
        Self {
            backend,
            cache,
            config,
        }
    }

    fn tenant_prefix(&self, tenant_id: TenantId) -> String {
        format!("{}:cfg:{}", self.config.key_prefix, tenant_id)
    }

    fn key(&self, tenant_id: TenantId, suffix: &str) -> String {
        format!("{}:{}", self.tenant_prefix(tenant_id), suffix)
    }

    fn read_cached<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        if !self.config.enabled {
            return Ok(None);
        }
        match self.cache.get(key) {
            Ok(Some(raw)) => {
                counter!("profile_cache_hits", "store" => "config").increment(1);
                debug!(key, "config cache hit");
                Ok(serde_json::from_str(&raw).ok())
            }
            Ok(None) => {
                counter!("profile_cache_misses", "store" => "config").increment(1);
                Ok(None)
            }
            Err(e) => {
                counter!("profile_cache_errors", "store" => "config").increment(1);
                if self.config.fallback_on_error {
                    warn!(key, error = %e, "config cache read failed, falling back");
                    Ok(None)
                } else {
                    Err(CatalogError::Cache(e))
                }
            }
        }
    }

    fn write_cached<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let raw = serde_json::to_string(value)?;
        match self
            .cache
            .set_ex(key, &raw, Duration::from_secs(self.config.ttl_seconds))
        {
            Ok(()) => Ok(()),
            Err(e) => {
                counter!("profile_cache_errors", "store" => "config").increment(1);
                if self.config.fallback_on_error {
                    warn!(key, error = %e, "config cache write failed, ignoring");
                    Ok(())
                } else {
                    Err(CatalogError::Cache(e))
                }
            }
        }
    }

    /// Drop every cached key for this tenant.
    pub fn invalidate_tenant(&self, tenant_id: TenantId) -> Result<usize> {
        let prefix = self.tenant_prefix(tenant_id);
        match self.cache.delete_prefix(&prefix) {
            Ok(n) => {
                counter!("profile_cache_invalidations", "store" => "config").increment(n as u64);
                Ok(n)
            }
            Err(e) => {
                counter!("profile_cache_errors", "store" => "config").increment(1);
                if self.config.fallback_on_error {
                    warn!(%tenant_id, error = %e, "config cache invalidation failed");
                    Ok(0)
                } else {
                    Err(CatalogError::Cache(e))
                }
            }
        }
    }
}

#[async_trait]
impl AgentConfigStore for CachedAgentConfigStore {
    async fn get_agent(&self, tenant_id: TenantId, agent_id: AgentId) -> Result<Option<Agent>> {
        let key = self.key(tenant_id, &format!("agent:{agent_id}"));
        if let Some(agent) = self.read_cached(&key)? {
            return Ok(Some(agent));
        }
        let agent = self.backend.get_agent(tenant_id, agent_id).await?;
        if let Some(ref a) = agent {
            self.write_cached(&key, a)?;
        }
        Ok(agent)
    }

    async fn save_agent(&self, agent: Agent) -> Result<AgentId> {
        let tenant = agent.tenant_id;
        let id = self.backend.save_agent(agent).await?;
        self.invalidate_tenant(tenant)?;
        Ok(id)
    }

    async fn delete_agent(&self, tenant_id: TenantId, agent_id: AgentId) -> Result<bool> {
        let deleted = self.backend.delete_agent(tenant_id, agent_id).await?;
        if deleted {
            self.invalidate_tenant(tenant_id)?;
        }
        Ok(deleted)
    }

    async fn get_rule(&self, tenant_id: TenantId, rule_id: Uuid) -> Result<Option<Rule>> {
        self.backend.get_rule(tenant_id, rule_id).await
    }

    async fn get_rules(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
        scope: Option<Scope>,
        scope_id: Option<Uuid>,
        enabled_only: bool,
    ) -> Result<Vec<Rule>> {
        let suffix = format!(
            "rules:{agent_id}:{}:{}:{}",
            scope.map(|s| s.to_string()).unwrap_or_else(|| "*".into()),
            scope_id.map(|s| s.to_string()).unwrap_or_else(|| "*".into()),
            enabled_only
        );
        let key = self.key(tenant_id, &suffix);
        if let Some(rules) = self.read_cached(&key)? {
            return Ok(rules);
        }
        let rules = self
            .backend
            .get_rules(tenant_id, agent_id, scope, scope_id, enabled_only)
            .await?;
        self.write_cached(&key, &rules)?;
        Ok(rules)
    }

    async fn list_rules(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
        page: Page,
        include_deleted: bool,
    ) -> Result<Vec<Rule>> {
        self.backend
            .list_rules(tenant_id, agent_id, page, include_deleted)
            .await
    }

    async fn save_rule(&self, rule: Rule) -> Result<Uuid> {
        let tenant = rule.tenant_id;
        let id = self.backend.save_rule(rule).await?;
        self.invalidate_tenant(tenant)?;
        Ok(id)
    }

    async fn delete_rule(&self, tenant_id: TenantId, rule_id: Uuid) -> Result<bool> {
        let deleted = self.backend.delete_rule(tenant_id, rule_id).await?;
        if deleted {
            self.invalidate_tenant(tenant_id)?;
        }
        Ok(deleted)
    }

    async fn get_scenario(
        &self,
        tenant_id: TenantId,
        scenario_id: Uuid,
    ) -> Result<Option<Scenario>> {
        let key = self.key(tenant_id, &format!("scenario:{scenario_id}"));
        if let Some(s) = self.read_cached(&key)? {
            return Ok(Some(s));
        }
        let scenario = self.backend.get_scenario(tenant_id, scenario_id).await?;
        if let Some(ref s) = scenario {
            self.write_cached(&key, s)?;
        }
        Ok(scenario)
    }

    async fn get_scenarios(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
        enabled_only: bool,
    ) -> Result<Vec<Scenario>> {
        let key = self.key(tenant_id, &format!("scenarios:{agent_id}:{enabled_only}"));
        if let Some(s) = self.read_cached(&key)? {
            return Ok(s);
        }
        let scenarios = self
            .backend
            .get_scenarios(tenant_id, agent_id, enabled_only)
            .await?;
        self.write_cached(&key, &scenarios)?;
        Ok(scenarios)
    }

    async fn save_scenario(&self, scenario: Scenario) -> Result<Uuid> {
        let tenant = scenario.tenant_id;
        let id = self.backend.save_scenario(scenario).await?;
        self.invalidate_tenant(tenant)?;
        Ok(id)
    }

    async fn get_archived_scenario(
        &self,
        tenant_id: TenantId,
        scenario_id: Uuid,
        version: u32,
    ) -> Result<Option<Scenario>> {
        // Archive reads are rare (migration paths) and version-immutable;
        // serve them straight from the backend.
        self.backend
            .get_archived_scenario(tenant_id, scenario_id, version)
            .await
    }

    async fn delete_scenario(&self, tenant_id: TenantId, scenario_id: Uuid) -> Result<bool> {
        let deleted = self.backend.delete_scenario(tenant_id, scenario_id).await?;
        if deleted {
            self.invalidate_tenant(tenant_id)?;
        }
        Ok(deleted)
    }

    async fn get_template(
        &self,
        tenant_id: TenantId,
        template_id: Uuid,
    ) -> Result<Option<Template>> {
        self.backend.get_template(tenant_id, template_id).await
    }

    async fn get_templates(&self, tenant_id: TenantId, agent_id: AgentId) -> Result<Vec<Template>> {
        let key = self.key(tenant_id, &format!("templates:{agent_id}"));
        if let Some(t) = self.read_cached(&key)? {
            return Ok(t);
        }
        let templates = self.backend.get_templates(tenant_id, agent_id).await?;
        self.write_cached(&key, &templates)?;
        Ok(templates)
    }

    async fn save_template(&self, template: Template) -> Result<Uuid> {
        let tenant = template.tenant_id;
        let id = self.backend.save_template(template).await?;
        self.invalidate_tenant(tenant)?;
        Ok(id)
    }

    async fn delete_template(&self, tenant_id: TenantId, template_id: Uuid) -> Result<bool> {
        let deleted = self.backend.delete_template(tenant_id, template_id).await?;
        if deleted {
            self.invalidate_tenant(tenant_id)?;
        }
        Ok(deleted)
    }

    async fn get_variables(&self, tenant_id: TenantId, agent_id: AgentId) -> Result<Vec<Variable>> {
        self.backend.get_variables(tenant_id, agent_id).await
    }

    async fn save_variable(&self, variable: Variable) -> Result<Uuid> {
        let tenant = variable.tenant_id;
        let id = self.backend.save_variable(variable).await?;
        self.invalidate_tenant(tenant)?;
        Ok(id)
    }

    async fn delete_variable(&self, tenant_id: TenantId, variable_id: Uuid) -> Result<bool> {
        let deleted = self.backend.delete_variable(tenant_id, variable_id).await?;
        if deleted {
            self.invalidate_tenant(tenant_id)?;
        }
        Ok(deleted)
    }

    async fn get_intents(&self, tenant_id: TenantId, agent_id: AgentId) -> Result<Vec<Intent>> {
        self.backend.get_intents(tenant_id, agent_id).await
    }

    async fn save_intent(&self, intent: Intent) -> Result<Uuid> {
        let tenant = intent.tenant_id;
        let id = self.backend.save_intent(intent).await?;
        self.invalidate_tenant(tenant)?;
        Ok(id)
    }

    async fn delete_intent(&self, tenant_id: TenantId, intent_id: Uuid) -> Result<bool> {
        let deleted = self.backend.delete_intent(tenant_id, intent_id).await?;
        if deleted {
            self.invalidate_tenant(tenant_id)?;
        }
        Ok(deleted)
    }

    async fn get_glossary(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
    ) -> Result<Vec<GlossaryItem>> {
        let key = self.key(tenant_id, &format!("glossary:{agent_id}"));
        if let Some(g) = self.read_cached(&key)? {
            return Ok(g);
        }
        let glossary = self.backend.get_glossary(tenant_id, agent_id).await?;
        self.write_cached(&key, &glossary)?;
        Ok(glossary)
    }

    async fn save_glossary_item(&self, item: GlossaryItem) -> Result<Uuid> {
        let tenant = item.tenant_id;
        let id = self.backend.save_glossary_item(item).await?;
        self.invalidate_tenant(tenant)?;
        Ok(id)
    }

    async fn delete_glossary_item(&self, tenant_id: TenantId, item_id: Uuid) -> Result<bool> {
        let deleted = self.backend.delete_glossary_item(tenant_id, item_id).await?;
        if deleted {
            self.invalidate_tenant(tenant_id)?;
        }
        Ok(deleted)
    }

    async fn get_tool_activations(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
    ) -> Result<Vec<ToolActivation>> {
        self.backend.get_tool_activations(tenant_id, agent_id).await
    }

    async fn save_tool_activation(&self, activation: ToolActivation) -> Result<Uuid> {
        let tenant = activation.tenant_id;
        let id = self.backend.save_tool_activation(activation).await?;
        self.invalidate_tenant(tenant)?;
        Ok(id)
    }

    async fn delete_tool_activation(
        &self,
        tenant_id: TenantId,
        activation_id: Uuid,
    ) -> Result<bool> {
        let deleted = self
            .backend
            .delete_tool_activation(tenant_id, activation_id)
            .await?;
        if deleted {
            self.invalidate_tenant(tenant_id)?;
        }
        Ok(deleted)
    }

    async fn get_rule_relationships(
        &self,
        tenant_id: TenantId,
        rule_id: Uuid,
    ) -> Result<Vec<RuleRelationship>> {
        self.backend.get_rule_relationships(tenant_id, rule_id).await
    }

    async fn save_rule_relationship(&self, rel: RuleRelationship) -> Result<Uuid> {
        let tenant = rel.tenant_id;
        let id = self.backend.save_rule_relationship(rel).await?;
        self.invalidate_tenant(tenant)?;
        Ok(id)
    }

    async fn get_field_definitions(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
        enabled_only: bool,
    ) -> Result<Vec<CustomerDataField>> {
        let key = self.key(tenant_id, &format!("field_defs:{agent_id}:{enabled_only}"));
        if let Some(defs) = self.read_cached(&key)? {
            return Ok(defs);
        }
        let defs = self
            .backend
            .get_field_definitions(tenant_id, agent_id, enabled_only)
            .await?;
        self.write_cached(&key, &defs)?;
        Ok(defs)
    }

    async fn get_field_definition(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
        field_name: &str,
    ) -> Result<Option<CustomerDataField>> {
        self.backend
            .get_field_definition(tenant_id, agent_id, field_name)
            .await
    }

    async fn save_field_definition(&self, definition: CustomerDataField) -> Result<Uuid> {
        let tenant = definition.tenant_id;
        let id = self.backend.save_field_definition(definition).await?;
        self.invalidate_tenant(tenant)?;
        Ok(id)
    }

    async fn delete_field_definition(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
        field_name: &str,
    ) -> Result<bool> {
        let deleted = self
            .backend
            .delete_field_definition(tenant_id, agent_id, field_name)
            .await?;
        if deleted {
            self.invalidate_tenant(tenant_id)?;
        }
        Ok(deleted)
    }

    async fn get_scenario_requirements(
        &self,
        tenant_id: TenantId,
        scenario_id: Uuid,
        step_id: Option<Uuid>,
    ) -> Result<Vec<ScenarioFieldRequirement>> {
        let key = self.key(
            tenant_id,
            &format!(
                "scenario_reqs:{scenario_id}:{}",
                step_id.map(|s| s.to_string()).unwrap_or_else(|| "*".into())
            ),
        );
        if let Some(reqs) = self.read_cached(&key)? {
            return Ok(reqs);
        }
        let reqs = self
            .backend
            .get_scenario_requirements(tenant_id, scenario_id, step_id)
            .await?;
        self.write_cached(&key, &reqs)?;
        Ok(reqs)
    }

    async fn save_scenario_requirement(
        &self,
        requirement: ScenarioFieldRequirement,
    ) -> Result<Uuid> {
        let tenant = requirement.tenant_id;
        let id = self.backend.save_scenario_requirement(requirement).await?;
        self.invalidate_tenant(tenant)?;
        Ok(id)
    }

    async fn get_migration_plan(
        &self,
        tenant_id: TenantId,
        plan_id: Uuid,
    ) -> Result<Option<MigrationPlan>> {
        self.backend.get_migration_plan(tenant_id, plan_id).await
    }

    async fn list_migration_plans(
        &self,
        tenant_id: TenantId,
        scenario_id: Option<Uuid>,
        page: Page,
    ) -> Result<Vec<MigrationPlan>> {
        self.backend
            .list_migration_plans(tenant_id, scenario_id, page)
            .await
    }

    async fn save_migration_plan(&self, plan: MigrationPlan) -> Result<Uuid> {
        let tenant = plan.tenant_id;
        let id = self.backend.save_migration_plan(plan).await?;
        self.invalidate_tenant(tenant)?;
        Ok(id)
    }
}
