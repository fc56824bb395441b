//! Vector-index synchronisation for catalogue entities.
//!
//! The EmbeddingManager is the single writer to the external vector index:
//! it generates missing embeddings, upserts documents keyed by a type-prefixed
//! entity id, removes them on delete, and batch-syncs whole catalogues.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use keel_core::{AgentId, TenantId};
use keel_llm::EmbeddingProvider;

use crate::error::{CatalogError, Result};
use crate::types::{Rule, Scenario, Scope};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Rule,
    Scenario,
}

impl EntityType {
    fn prefix(&self) -> &'static str {
        match self {
            EntityType::Rule => "rule",
            EntityType::Scenario => "scenario",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorMetadata {
    pub tenant_id: TenantId,
    pub agent_id: AgentId,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub scope: Option<Scope>,
    pub scope_id: Option<Uuid>,
    pub enabled: bool,
    pub embedding_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorDocument {
    /// `{type}:{entity_id}`: upserts are idempotent on this id.
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: VectorMetadata,
    pub text: String,
}

impl VectorDocument {
    pub fn make_id(entity_type: EntityType, entity_id: Uuid) -> String {
        format!("{}:{}", entity_type.prefix(), entity_id)
    }
}

/// External vector index interface. Upserts are idempotent by document id.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, docs: Vec<VectorDocument>) -> Result<()>;
    async fn delete(&self, ids: &[String]) -> Result<()>;
    async fn delete_by_agent(&self, tenant_id: TenantId, agent_id: AgentId) -> Result<usize>;
    async fn delete_by_tenant(&self, tenant_id: TenantId) -> Result<usize>;
    /// Nearest documents by cosine similarity, restricted by metadata filters.
    async fn search(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
        entity_type: EntityType,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<(VectorDocument, f64)>>;
}

pub struct EmbeddingManager {
    vector_store: Arc<dyn VectorStore>,
    embedding_provider: Arc<dyn EmbeddingProvider>,
}

impl EmbeddingManager {
    pub fn new(
        vector_store: Arc<dyn VectorStore>,
        embedding_provider: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            vector_store,
            embedding_provider,
        }
    }

    /// Sync a rule's condition embedding to the index, generating it when the
    /// row carries none.
    pub async fn sync_rule(&self, rule: &Rule) -> Result<Option<Vec<f32>>> {
        let (vector, generated) = match &rule.condition_embedding {
            Some(v) => (v.clone(), None),
            None => {
                let v = self
                    .embedding_provider
                    .embed_single(&rule.condition_text)
                    .await
                    .map_err(|e| CatalogError::Embedding(e.to_string()))?;
                debug!(rule_id = %rule.id, dimensions = v.len(), "generated rule embedding");
                (v.clone(), Some(v))
            }
        };

        let doc = VectorDocument {
            id: VectorDocument::make_id(EntityType::Rule, rule.id),
            vector,
            metadata: VectorMetadata {
                tenant_id: rule.tenant_id,
                agent_id: rule.agent_id,
                entity_type: EntityType::Rule,
                entity_id: rule.id,
                scope: Some(rule.scope),
                scope_id: rule.scope_id,
                enabled: rule.enabled,
                embedding_model: rule.embedding_model.clone(),
            },
            text: rule.condition_text.clone(),
        };
        self.vector_store.upsert(vec![doc]).await?;
        Ok(generated)
    }

    /// Sync a scenario's entry embedding. Scenarios without an entry condition
    /// are skipped (there is nothing to retrieve them by).
    pub async fn sync_scenario(&self, scenario: &Scenario) -> Result<Option<Vec<f32>>> {
        let entry_text = match &scenario.entry_condition_text {
            Some(t) if !t.is_empty() => t.clone(),
            _ => {
                warn!(scenario_id = %scenario.id, "scenario has no entry condition, skipping sync");
                return Ok(None);
            }
        };
        let (vector, generated) = match &scenario.entry_embedding {
            Some(v) => (v.clone(), None),
            None => {
                let v = self
                    .embedding_provider
                    .embed_single(&entry_text)
                    .await
                    .map_err(|e| CatalogError::Embedding(e.to_string()))?;
                (v.clone(), Some(v))
            }
        };

        let doc = VectorDocument {
            id: VectorDocument::make_id(EntityType::Scenario, scenario.id),
            vector,
            metadata: VectorMetadata {
                tenant_id: scenario.tenant_id,
                agent_id: scenario.agent_id,
                entity_type: EntityType::Scenario,
                entity_id: scenario.id,
                scope: None,
                scope_id: None,
                enabled: scenario.enabled,
                embedding_model: None,
            },
            text: entry_text,
        };
        self.vector_store.upsert(vec![doc]).await?;
        Ok(generated)
    }

    pub async fn delete_rule(&self, rule_id: Uuid) -> Result<()> {
        self.vector_store
            .delete(&[VectorDocument::make_id(EntityType::Rule, rule_id)])
            .await
    }

    pub async fn delete_scenario(&self, scenario_id: Uuid) -> Result<()> {
        self.vector_store
            .delete(&[VectorDocument::make_id(EntityType::Scenario, scenario_id)])
            .await
    }

    /// Batch-sync an existing catalogue (used when migrating agents onto the
    /// index). Failures are logged per entity and do not abort the batch.
    pub async fn sync_all(&self, rules: &[Rule], scenarios: &[Scenario]) -> Result<usize> {
        let mut synced = 0;
        for rule in rules {
            match self.sync_rule(rule).await {
                Ok(_) => synced += 1,
                Err(e) => warn!(rule_id = %rule.id, error = %e, "rule sync failed"),
            }
        }
        for scenario in scenarios {
            match self.sync_scenario(scenario).await {
                Ok(_) => synced += 1,
                Err(e) => warn!(scenario_id = %scenario.id, error = %e, "scenario sync failed"),
            }
        }
        Ok(synced)
    }

    pub async fn delete_by_agent(&self, tenant_id: TenantId, agent_id: AgentId) -> Result<usize> {
        self.vector_store.delete_by_agent(tenant_id, agent_id).await
    }

    pub async fn delete_by_tenant(&self, tenant_id: TenantId) -> Result<usize> {
        self.vector_store.delete_by_tenant(tenant_id).await
    }
}

/// Brute-force in-memory index for tests and embedded use.
pub struct InMemoryVectorStore {
    docs: dashmap::DashMap<String, VectorDocument>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self {
            docs: dashmap::DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let na: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let nb: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, docs: Vec<VectorDocument>) -> Result<()> {
        for doc in docs {
            self.docs.insert(doc.id.clone(), doc);
        }
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        for id in ids {
            self.docs.remove(id);
        }
        Ok(())
    }

    async fn delete_by_agent(&self, tenant_id: TenantId, agent_id: AgentId) -> Result<usize> {
        let ids: Vec<String> = self
            .docs
            .iter()
            .filter(|d| d.metadata.tenant_id == tenant_id && d.metadata.agent_id == agent_id)
            .map(|d| d.key().clone())
            .collect();
        let n = ids.len();
        for id in ids {
            self.docs.remove(&id);
        }
        Ok(n)
    }

    async fn delete_by_tenant(&self, tenant_id: TenantId) -> Result<usize> {
        let ids: Vec<String> = self
            .docs
            .iter()
            .filter(|d| d.metadata.tenant_id == tenant_id)
            .map(|d| d.key().clone())
            .collect();
        let n = ids.len();
        for id in ids {
            self.docs.remove(&id);
        }
        Ok(n)
    }

    async fn search(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
        entity_type: EntityType,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<(VectorDocument, f64)>> {
        let mut scored: Vec<(VectorDocument, f64)> = self
            .docs
            .iter()
            .filter(|d| {
                d.metadata.tenant_id == tenant_id
                    && d.metadata.agent_id == agent_id
                    && d.metadata.entity_type == entity_type
                    && d.metadata.enabled
            })
            .map(|d| {
                let score = cosine(query, &d.vector);
                (d.value().clone(), score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }
}
