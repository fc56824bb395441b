//! SQLite-backed session store.
//!
//! Scalar columns for the lookup keys, JSON columns for nested state
//! (instances, history, fire maps, variables). The lease table is in-process:
//! a single-node backend needs no cross-process lock, and a clustered
//! deployment swaps in a store whose lease is a row-lock or token.

use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashSet;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, instrument};

use keel_core::{AgentId, Channel, CustomerId, SessionId, TenantId};

use crate::error::{Result, SessionError};
use crate::store::{SessionStore, StepHashQuery};
use crate::types::{Session, SessionStatus};

pub struct SqliteSessionStore {
    db: Mutex<Connection>,
    leases: DashSet<SessionId>,
}

impl SqliteSessionStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            leases: DashSet::new(),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }
}

fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
            session_id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            agent_id TEXT NOT NULL,
            channel TEXT NOT NULL,
            user_channel_id TEXT NOT NULL,
            customer_profile_id TEXT,
            config_version INTEGER NOT NULL,
            status TEXT NOT NULL,
            turn_count INTEGER NOT NULL,
            body TEXT NOT NULL,
            created_at TEXT NOT NULL,
            last_activity_at TEXT NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_channel_identity
            ON sessions (tenant_id, channel, user_channel_id);
        CREATE INDEX IF NOT EXISTS idx_sessions_agent
            ON sessions (tenant_id, agent_id, last_activity_at);",
    )?;
    Ok(())
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<Session> {
    let body: String = row.get("body")?;
    // The JSON body is authoritative; scalar columns exist for indexing.
    serde_json::from_str(&body).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get(&self, session_id: SessionId) -> Result<Option<Session>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT body FROM sessions WHERE session_id = ?1",
            params![session_id.to_string()],
            row_to_session,
        )
        .optional()
        .map_err(Into::into)
    }

    #[instrument(skip(self, session), fields(session = %session.session_id))]
    async fn save(&self, mut session: Session) -> Result<()> {
        session.last_activity_at = chrono::Utc::now();
        let status = match session.status {
            SessionStatus::Active => "ACTIVE",
            SessionStatus::Idle => "IDLE",
            SessionStatus::Processing => "PROCESSING",
            SessionStatus::Interrupted => "INTERRUPTED",
            SessionStatus::Closed => "CLOSED",
        };
        let body = serde_json::to_string(&session)?;
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO sessions
             (session_id, tenant_id, agent_id, channel, user_channel_id, customer_profile_id,
              config_version, status, turn_count, body, created_at, last_activity_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                session.session_id.to_string(),
                session.tenant_id.to_string(),
                session.agent_id.to_string(),
                session.channel.to_string(),
                session.user_channel_id,
                session.customer_profile_id.map(|c| c.to_string()),
                session.config_version as i64,
                status,
                session.turn_count as i64,
                body,
                session.created_at.to_rfc3339(),
                session.last_activity_at.to_rfc3339(),
            ],
        )?;
        debug!("session saved");
        Ok(())
    }

    async fn delete(&self, session_id: SessionId) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "DELETE FROM sessions WHERE session_id = ?1",
            params![session_id.to_string()],
        )?;
        Ok(n > 0)
    }

    async fn find_by_channel(
        &self,
        tenant_id: TenantId,
        channel: Channel,
        user_channel_id: &str,
    ) -> Result<Option<Session>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT body FROM sessions
             WHERE tenant_id = ?1 AND channel = ?2 AND user_channel_id = ?3",
            params![tenant_id.to_string(), channel.to_string(), user_channel_id],
            row_to_session,
        )
        .optional()
        .map_err(Into::into)
    }

    async fn list_by_agent(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Session>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT body FROM sessions WHERE tenant_id = ?1 AND agent_id = ?2
             ORDER BY last_activity_at DESC LIMIT ?3 OFFSET ?4",
        )?;
        let rows = stmt.query_map(
            params![
                tenant_id.to_string(),
                agent_id.to_string(),
                limit as i64,
                offset as i64
            ],
            row_to_session,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    async fn list_by_customer(
        &self,
        tenant_id: TenantId,
        customer_id: CustomerId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Session>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT body FROM sessions WHERE tenant_id = ?1 AND customer_profile_id = ?2
             ORDER BY last_activity_at DESC LIMIT ?3 OFFSET ?4",
        )?;
        let rows = stmt.query_map(
            params![
                tenant_id.to_string(),
                customer_id.to_string(),
                limit as i64,
                offset as i64
            ],
            row_to_session,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    async fn find_by_step_hash(&self, query: &StepHashQuery) -> Result<Vec<Session>> {
        // Narrow by tenant in SQL, match instance/version/hash in Rust: the
        // nested state lives in the JSON body.
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare("SELECT body FROM sessions WHERE tenant_id = ?1")?;
        let rows = stmt.query_map(params![query.tenant_id.to_string()], row_to_session)?;
        Ok(rows
            .filter_map(|r| r.ok())
            .filter(|s| query.channels.is_empty() || query.channels.contains(&s.channel))
            .filter(|s| {
                s.active_scenarios.iter().any(|i| {
                    i.scenario_id == query.scenario_id
                        && i.scenario_version == query.scenario_version
                        && s.last_visit_hash(i.current_step_id)
                            == Some(query.step_content_hash.as_str())
                })
            })
            .collect())
    }

    async fn acquire_lease(&self, _tenant_id: TenantId, session_id: SessionId) -> Result<()> {
        if self.leases.insert(session_id) {
            Ok(())
        } else {
            Err(SessionError::Busy {
                id: session_id.to_string(),
            })
        }
    }

    async fn release_lease(&self, _tenant_id: TenantId, session_id: SessionId) -> Result<()> {
        self.leases.remove(&session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn session_round_trips_through_sqlite() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        let mut s = Session::new(TenantId::new(), AgentId::new(), Channel::Api, "user-9", 3);
        s.turn_count = 4;
        s.record_rule_fire(uuid::Uuid::now_v7(), 2);
        let id = s.session_id;
        store.save(s.clone()).await.unwrap();

        let loaded = store.get(id).await.unwrap().unwrap();
        assert_eq!(loaded.turn_count, 4);
        assert_eq!(loaded.rule_fires.len(), 1);
        assert_eq!(loaded.config_version, 3);

        assert!(store.delete(id).await.unwrap());
        assert!(store.get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn channel_identity_is_unique_per_tenant() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        let tenant = TenantId::new();
        let agent = AgentId::new();
        let first = Session::new(tenant, agent, Channel::Webchat, "dup", 1);
        store.save(first.clone()).await.unwrap();

        let found = store
            .find_by_channel(tenant, Channel::Webchat, "dup")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.session_id, first.session_id);
    }
}
