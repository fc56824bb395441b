//! Layered runtime configuration resolution.
//!
//! Resolution order (later overrides earlier): platform defaults ← tenant ←
//! agent ← channel ← scenario ← step. Tenant/channel/scenario/step override
//! layers come from catalogue `extra` surfaces when present; the agent layer
//! is derived from the agent's settings. Results are cached per full context
//! key and invalidated by tenant or tenant+agent prefix.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use keel_core::config::{ConfigOverride, ResolvedConfig};
use keel_core::{AgentId, TenantId};

use crate::error::Result;
use crate::store::AgentConfigStore;

#[derive(Debug, Clone, Copy)]
pub struct ConfigContext {
    pub tenant_id: TenantId,
    pub agent_id: AgentId,
    pub channel: Option<keel_core::Channel>,
    pub scenario_id: Option<Uuid>,
    pub step_id: Option<Uuid>,
}

pub struct ConfigResolver {
    store: Arc<dyn AgentConfigStore>,
    platform_defaults: ResolvedConfig,
    cache: DashMap<String, ResolvedConfig>,
}

impl ConfigResolver {
    pub fn new(store: Arc<dyn AgentConfigStore>, platform_defaults: ResolvedConfig) -> Self {
        Self {
            store,
            platform_defaults,
            cache: DashMap::new(),
        }
    }

    fn cache_key(ctx: &ConfigContext) -> String {
        let mut parts = vec![ctx.tenant_id.to_string(), ctx.agent_id.to_string()];
        if let Some(channel) = ctx.channel {
            parts.push(channel.to_string());
        }
        if let Some(sid) = ctx.scenario_id {
            parts.push(sid.to_string());
        }
        if let Some(step) = ctx.step_id {
            parts.push(step.to_string());
        }
        parts.join(":")
    }

    pub async fn resolve(&self, ctx: ConfigContext) -> Result<ResolvedConfig> {
        let key = Self::cache_key(&ctx);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached.clone());
        }

        debug!(tenant = %ctx.tenant_id, agent = %ctx.agent_id, "resolving runtime config");
        let mut resolved = self.platform_defaults.clone();

        if let Some(layer) = self.tenant_layer(&ctx).await? {
            resolved.apply(&layer);
        }
        if let Some(layer) = self.agent_layer(&ctx).await? {
            resolved.apply(&layer);
        }
        if let Some(layer) = self.channel_layer(&ctx).await? {
            resolved.apply(&layer);
        }
        if let Some(layer) = self.scenario_layer(&ctx).await? {
            resolved.apply(&layer);
        }
        if let Some(layer) = self.step_layer(&ctx).await? {
            resolved.apply(&layer);
        }

        self.cache.insert(key, resolved.clone());
        Ok(resolved)
    }

    /// Tenant-wide policy overrides. No tenant-level storage exists yet; the
    /// layer is a no-op until a tenant_configs surface lands.
    async fn tenant_layer(&self, _ctx: &ConfigContext) -> Result<Option<ConfigOverride>> {
        Ok(None)
    }

    async fn agent_layer(&self, ctx: &ConfigContext) -> Result<Option<ConfigOverride>> {
        let agent = match self.store.get_agent(ctx.tenant_id, ctx.agent_id).await? {
            Some(a) => a,
            None => return Ok(None),
        };
        let mut layer = ConfigOverride::default();
        let mut any = false;
        if let Some(t) = agent.settings.temperature {
            layer.temperature = Some(t);
            any = true;
        }
        if let Some(m) = agent.settings.max_tokens {
            layer.max_response_tokens = Some(m);
            any = true;
        }
        Ok(any.then_some(layer))
    }

    /// Channel-specific overrides (shorter responses for SMS-class channels,
    /// etc.). No channel-level storage exists yet.
    async fn channel_layer(&self, _ctx: &ConfigContext) -> Result<Option<ConfigOverride>> {
        Ok(None)
    }

    /// Scenario-level overrides (stricter validation in checkout, longer
    /// timeouts in support flows). No scenario-level storage exists yet.
    async fn scenario_layer(&self, _ctx: &ConfigContext) -> Result<Option<ConfigOverride>> {
        Ok(None)
    }

    async fn step_layer(&self, _ctx: &ConfigContext) -> Result<Option<ConfigOverride>> {
        Ok(None)
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Invalidate cached configs for a tenant, optionally narrowed to an agent.
    pub fn invalidate(&self, tenant_id: TenantId, agent_id: Option<AgentId>) {
        let prefix = match agent_id {
            Some(a) => format!("{}:{}", tenant_id, a),
            None => tenant_id.to_string(),
        };
        self.cache.retain(|k, _| !k.starts_with(&prefix));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inmemory::InMemoryAgentConfigStore;
    use crate::types::Agent;

    #[tokio::test]
    async fn agent_settings_override_platform_defaults() {
        let store = Arc::new(InMemoryAgentConfigStore::new());
        let tenant = TenantId::new();
        let mut agent = Agent::new(tenant, "a", "primary", "sys");
        agent.settings.temperature = Some(0.1);
        agent.settings.max_tokens = Some(256);
        let agent_id = agent.id;
        store.save_agent(agent).await.unwrap();

        let resolver = ConfigResolver::new(store, ResolvedConfig::default());
        let resolved = resolver
            .resolve(ConfigContext {
                tenant_id: tenant,
                agent_id,
                channel: None,
                scenario_id: None,
                step_id: None,
            })
            .await
            .unwrap();

        assert_eq!(resolved.temperature, 0.1);
        assert_eq!(resolved.max_response_tokens, 256);
        assert_eq!(resolved.max_response_length, 4096);
    }

    #[tokio::test]
    async fn resolution_is_cached_and_invalidation_clears_it() {
        let store = Arc::new(InMemoryAgentConfigStore::new());
        let tenant = TenantId::new();
        let mut agent = Agent::new(tenant, "a", "primary", "sys");
        agent.settings.temperature = Some(0.4);
        let agent_id = agent.id;
        store.save_agent(agent).await.unwrap();

        let resolver = ConfigResolver::new(store.clone(), ResolvedConfig::default());
        let ctx = ConfigContext {
            tenant_id: tenant,
            agent_id,
            channel: None,
            scenario_id: None,
            step_id: None,
        };
        let first = resolver.resolve(ctx).await.unwrap();
        assert_eq!(first.temperature, 0.4);

        // Change the backing setting; cached resolution still serves 0.4.
        let mut updated = store.get_agent(tenant, agent_id).await.unwrap().unwrap();
        updated.settings.temperature = Some(0.9);
        store.save_agent(updated).await.unwrap();
        assert_eq!(resolver.resolve(ctx).await.unwrap().temperature, 0.4);

        resolver.invalidate(tenant, Some(agent_id));
        assert_eq!(resolver.resolve(ctx).await.unwrap().temperature, 0.9);
    }
}
