use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use keel_core::{SessionId, TenantId};

use crate::error::Result;
use crate::types::{Entity, Episode, Relationship};

/// Episode + knowledge-graph persistence.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Episodes are append-only; saving an existing id is an error upstream.
    async fn save_episode(&self, episode: Episode) -> Result<Uuid>;
    async fn list_episodes(
        &self,
        tenant_id: TenantId,
        session_id: SessionId,
        limit: usize,
    ) -> Result<Vec<Episode>>;

    async fn save_entity(&self, entity: Entity) -> Result<Uuid>;
    async fn find_entity(&self, tenant_id: TenantId, name: &str) -> Result<Option<Entity>>;

    /// Write a relationship. Any open relationship between the same pair with
    /// the same relation label is closed (`valid_to = now`) first.
    async fn supersede_relationship(&self, relationship: Relationship) -> Result<Uuid>;
    async fn relationships_for(
        &self,
        tenant_id: TenantId,
        entity_id: Uuid,
        open_only: bool,
    ) -> Result<Vec<Relationship>>;
}

#[derive(Default)]
pub struct InMemoryMemoryStore {
    episodes: DashMap<Uuid, Episode>,
    entities: DashMap<Uuid, Entity>,
    relationships: DashMap<Uuid, Relationship>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn episode_count(&self) -> usize {
        self.episodes.len()
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn save_episode(&self, episode: Episode) -> Result<Uuid> {
        let id = episode.id;
        self.episodes.insert(id, episode);
        metrics::counter!("memory_episodes").increment(1);
        Ok(id)
    }

    async fn list_episodes(
        &self,
        tenant_id: TenantId,
        session_id: SessionId,
        limit: usize,
    ) -> Result<Vec<Episode>> {
        let mut out: Vec<Episode> = self
            .episodes
            .iter()
            .filter(|e| e.tenant_id == tenant_id && e.session_id == session_id)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(limit);
        Ok(out)
    }

    async fn save_entity(&self, entity: Entity) -> Result<Uuid> {
        let id = entity.id;
        self.entities.insert(id, entity);
        metrics::counter!("memory_entities").increment(1);
        Ok(id)
    }

    async fn find_entity(&self, tenant_id: TenantId, name: &str) -> Result<Option<Entity>> {
        Ok(self
            .entities
            .iter()
            .find(|e| e.tenant_id == tenant_id && e.name == name && e.valid_to.is_none())
            .map(|e| e.value().clone()))
    }

    async fn supersede_relationship(&self, relationship: Relationship) -> Result<Uuid> {
        let now = Utc::now();
        for mut existing in self.relationships.iter_mut() {
            if existing.tenant_id == relationship.tenant_id
                && existing.from_entity_id == relationship.from_entity_id
                && existing.to_entity_id == relationship.to_entity_id
                && existing.relation == relationship.relation
                && existing.is_open()
            {
                existing.valid_to = Some(now);
            }
        }
        let id = relationship.id;
        self.relationships.insert(id, relationship);
        Ok(id)
    }

    async fn relationships_for(
        &self,
        tenant_id: TenantId,
        entity_id: Uuid,
        open_only: bool,
    ) -> Result<Vec<Relationship>> {
        Ok(self
            .relationships
            .iter()
            .filter(|r| r.tenant_id == tenant_id)
            .filter(|r| r.from_entity_id == entity_id || r.to_entity_id == entity_id)
            .filter(|r| !open_only || r.is_open())
            .map(|r| r.value().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn superseding_a_relationship_closes_the_old_edge() {
        let store = InMemoryMemoryStore::new();
        let tenant = TenantId::new();
        let a = Entity::new(tenant, "customer", "person");
        let b = Entity::new(tenant, "acme", "company");
        let (a_id, b_id) = (a.id, b.id);
        store.save_entity(a).await.unwrap();
        store.save_entity(b).await.unwrap();

        let first = Relationship::new(tenant, a_id, b_id, "works_at");
        store.supersede_relationship(first).await.unwrap();
        let second = Relationship::new(tenant, a_id, b_id, "works_at");
        let second_id = second.id;
        store.supersede_relationship(second).await.unwrap();

        let all = store.relationships_for(tenant, a_id, false).await.unwrap();
        assert_eq!(all.len(), 2);
        let open = store.relationships_for(tenant, a_id, true).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, second_id);
    }

    #[tokio::test]
    async fn episodes_list_newest_first() {
        let store = InMemoryMemoryStore::new();
        let tenant = TenantId::new();
        let session = SessionId::new();
        for i in 0..3 {
            let mut e = Episode::new(tenant, session, None, &format!("msg {i}"), None);
            e.created_at = Utc::now() + chrono::Duration::milliseconds(i);
            store.save_episode(e).await.unwrap();
        }
        let listed = store.list_episodes(tenant, session, 2).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].user_message, "msg 2");
    }
}
