use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tracing::debug;

use keel_core::{AgentId, Channel, CustomerId, SessionId, TenantId};

use crate::error::{Result, SessionError};
use crate::store::{SessionStore, StepHashQuery};
use crate::types::Session;

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<SessionId, Session>,
    leases: DashSet<SessionId>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lease_held(&self, session_id: SessionId) -> bool {
        self.leases.contains(&session_id)
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, session_id: SessionId) -> Result<Option<Session>> {
        Ok(self.sessions.get(&session_id).map(|s| s.value().clone()))
    }

    async fn save(&self, mut session: Session) -> Result<()> {
        session.last_activity_at = chrono::Utc::now();
        self.sessions.insert(session.session_id, session);
        Ok(())
    }

    async fn delete(&self, session_id: SessionId) -> Result<bool> {
        Ok(self.sessions.remove(&session_id).is_some())
    }

    async fn find_by_channel(
        &self,
        tenant_id: TenantId,
        channel: Channel,
        user_channel_id: &str,
    ) -> Result<Option<Session>> {
        Ok(self
            .sessions
            .iter()
            .find(|s| {
                s.tenant_id == tenant_id
                    && s.channel == channel
                    && s.user_channel_id == user_channel_id
            })
            .map(|s| s.value().clone()))
    }

    async fn list_by_agent(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Session>> {
        let mut out: Vec<Session> = self
            .sessions
            .iter()
            .filter(|s| s.tenant_id == tenant_id && s.agent_id == agent_id)
            .map(|s| s.value().clone())
            .collect();
        out.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        Ok(out.into_iter().skip(offset).take(limit).collect())
    }

    async fn list_by_customer(
        &self,
        tenant_id: TenantId,
        customer_id: CustomerId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Session>> {
        let mut out: Vec<Session> = self
            .sessions
            .iter()
            .filter(|s| s.tenant_id == tenant_id && s.customer_profile_id == Some(customer_id))
            .map(|s| s.value().clone())
            .collect();
        out.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        Ok(out.into_iter().skip(offset).take(limit).collect())
    }

    async fn find_by_step_hash(&self, query: &StepHashQuery) -> Result<Vec<Session>> {
        Ok(self
            .sessions
            .iter()
            .filter(|s| s.tenant_id == query.tenant_id)
            .filter(|s| query.channels.is_empty() || query.channels.contains(&s.channel))
            .filter(|s| {
                s.active_scenarios.iter().any(|i| {
                    i.scenario_id == query.scenario_id
                        && i.scenario_version == query.scenario_version
                        && s.last_visit_hash(i.current_step_id)
                            == Some(query.step_content_hash.as_str())
                })
            })
            .map(|s| s.value().clone())
            .collect())
    }

    async fn acquire_lease(&self, _tenant_id: TenantId, session_id: SessionId) -> Result<()> {
        if self.leases.insert(session_id) {
            debug!(session = %session_id, "lease acquired");
            Ok(())
        } else {
            Err(SessionError::Busy {
                id: session_id.to_string(),
            })
        }
    }

    async fn release_lease(&self, _tenant_id: TenantId, session_id: SessionId) -> Result<()> {
        self.leases.remove(&session_id);
        debug!(session = %session_id, "lease released");
        Ok(())
    }
}
