//! Atomic agent-config publication.
//!
//! Publishing runs five stages in order: validate, compile (embeddings),
//! write_bundles, swap_pointer, invalidate_cache. The new version only becomes
//! visible at swap_pointer; earlier stage failures leave the live version
//! untouched. One publish per agent at a time.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use keel_core::{AgentId, TenantId};

use crate::cache::CachedAgentConfigStore;
use crate::embed::EmbeddingManager;
use crate::error::{CatalogError, Result};
use crate::resolve::ConfigResolver;
use crate::store::AgentConfigStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishStage {
    Validate,
    Compile,
    WriteBundles,
    SwapPointer,
    InvalidateCache,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishJob {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub agent_id: AgentId,
    pub description: Option<String>,
    pub completed_stages: Vec<PublishStage>,
    pub new_version: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

pub struct Publisher {
    store: Arc<dyn AgentConfigStore>,
    embedding_manager: Arc<EmbeddingManager>,
    /// Cache wrapper to invalidate at the final stage, if one is installed.
    cache: Option<Arc<CachedAgentConfigStore>>,
    /// Layered-config resolver whose per-context cache must drop the old
    /// version after the pointer swap.
    config_resolver: Option<Arc<ConfigResolver>>,
    in_flight: DashSet<AgentId>,
}

impl Publisher {
    pub fn new(
        store: Arc<dyn AgentConfigStore>,
        embedding_manager: Arc<EmbeddingManager>,
        cache: Option<Arc<CachedAgentConfigStore>>,
        config_resolver: Option<Arc<ConfigResolver>>,
    ) -> Self {
        Self {
            store,
            embedding_manager,
            cache,
            config_resolver,
            in_flight: DashSet::new(),
        }
    }

    /// Run the publish job to completion. Concurrent publishes for the same
    /// agent are rejected with `PublishInProgress`.
    #[instrument(skip(self), fields(tenant = %tenant_id, agent = %agent_id))]
    pub async fn publish(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
        description: Option<String>,
    ) -> Result<PublishJob> {
        if !self.in_flight.insert(agent_id) {
            return Err(CatalogError::PublishInProgress {
                agent_id: agent_id.to_string(),
            });
        }
        let result = self.run_stages(tenant_id, agent_id, description).await;
        self.in_flight.remove(&agent_id);
        result
    }

    async fn run_stages(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
        description: Option<String>,
    ) -> Result<PublishJob> {
        let mut job = PublishJob {
            id: Uuid::now_v7(),
            tenant_id,
            agent_id,
            description,
            completed_stages: Vec::new(),
            new_version: None,
            started_at: Utc::now(),
            finished_at: None,
        };

        // Stage 1: validate: the catalogue must be internally consistent.
        let mut agent = self
            .store
            .get_agent(tenant_id, agent_id)
            .await?
            .ok_or(CatalogError::NotFound {
                entity: "agent",
                id: agent_id.to_string(),
            })?;
        let rules = self
            .store
            .get_rules(tenant_id, agent_id, None, None, false)
            .await?;
        let scenarios = self.store.get_scenarios(tenant_id, agent_id, false).await?;
        for rule in &rules {
            rule.validate().map_err(|e| CatalogError::PublishFailed {
                stage: "validate",
                reason: e.to_string(),
            })?;
        }
        for scenario in &scenarios {
            scenario.validate().map_err(|e| CatalogError::PublishFailed {
                stage: "validate",
                reason: e.to_string(),
            })?;
        }
        job.completed_stages.push(PublishStage::Validate);

        // Stage 2: compile: generate and sync embeddings.
        self.embedding_manager
            .sync_all(&rules, &scenarios)
            .await
            .map_err(|e| CatalogError::PublishFailed {
                stage: "compile",
                reason: e.to_string(),
            })?;
        job.completed_stages.push(PublishStage::Compile);

        // Stage 3: write_bundles: the bundled single-node backends persist on
        // save, so the bundle write is the re-save of validated rows.
        for rule in rules {
            self.store.save_rule(rule).await?;
        }
        for scenario in scenarios {
            self.store.save_scenario(scenario).await?;
        }
        job.completed_stages.push(PublishStage::WriteBundles);

        // Stage 4: swap_pointer: bump the published version.
        agent.config_version += 1;
        let new_version = agent.config_version;
        self.store.save_agent(agent).await?;
        job.new_version = Some(new_version);
        job.completed_stages.push(PublishStage::SwapPointer);

        // Stage 5: invalidate_cache.
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.invalidate_tenant(tenant_id) {
                // The new version is live; a stale cache entry only survives
                // one TTL window.
                warn!(error = %e, "cache invalidation after publish failed");
            }
        }
        if let Some(resolver) = &self.config_resolver {
            resolver.invalidate(tenant_id, Some(agent_id));
        }
        job.completed_stages.push(PublishStage::InvalidateCache);

        job.finished_at = Some(Utc::now());
        info!(
            job_id = %job.id,
            version = new_version,
            "agent config published"
        );
        Ok(job)
    }
}
