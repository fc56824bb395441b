//! SQLite-backed memory store.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use keel_core::{SessionId, TenantId};

use crate::error::Result;
use crate::store::MemoryStore;
use crate::types::{Entity, Episode, Relationship};

pub struct SqliteMemoryStore {
    db: Mutex<Connection>,
}

impl SqliteMemoryStore {
    pub fn new(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS episodes (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_episodes_session
                ON episodes (tenant_id, session_id, created_at);
            CREATE TABLE IF NOT EXISTS entities (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                name TEXT NOT NULL,
                body TEXT NOT NULL,
                valid_to TEXT
            );
            CREATE TABLE IF NOT EXISTS relationships (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                from_entity_id TEXT NOT NULL,
                to_entity_id TEXT NOT NULL,
                relation TEXT NOT NULL,
                body TEXT NOT NULL,
                valid_to TEXT
            );",
        )?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }
}

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    async fn save_episode(&self, episode: Episode) -> Result<Uuid> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO episodes (id, tenant_id, session_id, body, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                episode.id.to_string(),
                episode.tenant_id.to_string(),
                episode.session_id.to_string(),
                serde_json::to_string(&episode)?,
                episode.created_at.to_rfc3339(),
            ],
        )?;
        metrics::counter!("memory_episodes").increment(1);
        Ok(episode.id)
    }

    async fn list_episodes(
        &self,
        tenant_id: TenantId,
        session_id: SessionId,
        limit: usize,
    ) -> Result<Vec<Episode>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT body FROM episodes WHERE tenant_id = ?1 AND session_id = ?2
             ORDER BY created_at DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![tenant_id.to_string(), session_id.to_string(), limit as i64],
            |row| row.get::<_, String>(0),
        )?;
        Ok(rows
            .filter_map(|r| r.ok())
            .filter_map(|b| serde_json::from_str(&b).ok())
            .collect())
    }

    async fn save_entity(&self, entity: Entity) -> Result<Uuid> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO entities (id, tenant_id, name, body, valid_to)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entity.id.to_string(),
                entity.tenant_id.to_string(),
                entity.name,
                serde_json::to_string(&entity)?,
                entity.valid_to.map(|t| t.to_rfc3339()),
            ],
        )?;
        metrics::counter!("memory_entities").increment(1);
        Ok(entity.id)
    }

    async fn find_entity(&self, tenant_id: TenantId, name: &str) -> Result<Option<Entity>> {
        let db = self.db.lock().unwrap();
        let body: Option<String> = db
            .query_row(
                "SELECT body FROM entities
                 WHERE tenant_id = ?1 AND name = ?2 AND valid_to IS NULL",
                params![tenant_id.to_string(), name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(body.and_then(|b| serde_json::from_str(&b).ok()))
    }

    async fn supersede_relationship(&self, relationship: Relationship) -> Result<Uuid> {
        let now = Utc::now();
        let db = self.db.lock().unwrap();

        // Close any open edge of the same (from, to, relation) triple.
        let mut stmt = db.prepare(
            "SELECT id, body FROM relationships
             WHERE tenant_id = ?1 AND from_entity_id = ?2 AND to_entity_id = ?3
             AND relation = ?4 AND valid_to IS NULL",
        )?;
        let open: Vec<(String, String)> = stmt
            .query_map(
                params![
                    relationship.tenant_id.to_string(),
                    relationship.from_entity_id.to_string(),
                    relationship.to_entity_id.to_string(),
                    relationship.relation,
                ],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);

        for (id, body) in open {
            if let Ok(mut rel) = serde_json::from_str::<Relationship>(&body) {
                rel.valid_to = Some(now);
                db.execute(
                    "UPDATE relationships SET body = ?1, valid_to = ?2 WHERE id = ?3",
                    params![serde_json::to_string(&rel)?, now.to_rfc3339(), id],
                )?;
            }
        }

        db.execute(
            "INSERT INTO relationships
             (id, tenant_id, from_entity_id, to_entity_id, relation, body, valid_to)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                relationship.id.to_string(),
                relationship.tenant_id.to_string(),
                relationship.from_entity_id.to_string(),
                relationship.to_entity_id.to_string(),
                relationship.relation,
                serde_json::to_string(&relationship)?,
                relationship.valid_to.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(relationship.id)
    }

    async fn relationships_for(
        &self,
        tenant_id: TenantId,
        entity_id: Uuid,
        open_only: bool,
    ) -> Result<Vec<Relationship>> {
        let db = self.db.lock().unwrap();
        let mut sql = "SELECT body FROM relationships
             WHERE tenant_id = ?1 AND (from_entity_id = ?2 OR to_entity_id = ?2)"
            .to_string();
        if open_only {
            sql.push_str(" AND valid_to IS NULL");
        }
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params![tenant_id.to_string(), entity_id.to_string()], |row| {
            row.get::<_, String>(0)
        })?;
        Ok(rows
            .filter_map(|r| r.ok())
            .filter_map(|b| serde_json::from_str(&b).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn relationship_supersession_round_trips() {
        let store = SqliteMemoryStore::open_in_memory().unwrap();
        let tenant = TenantId::new();
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();

        store
            .supersede_relationship(Relationship::new(tenant, a, b, "prefers"))
            .await
            .unwrap();
        let second = Relationship::new(tenant, a, b, "prefers");
        store.supersede_relationship(second).await.unwrap();

        let open = store.relationships_for(tenant, a, true).await.unwrap();
        assert_eq!(open.len(), 1);
        let all = store.relationships_for(tenant, a, false).await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
