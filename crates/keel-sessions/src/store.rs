use async_trait::async_trait;
use uuid::Uuid;

use keel_core::{AgentId, Channel, CustomerId, SessionId, TenantId};

use crate::error::Result;
use crate::types::Session;

/// Query for sessions positioned on a semantically-known step, used by
/// migration deployment to find everyone standing on an anchor.
#[derive(Debug, Clone)]
pub struct StepHashQuery {
    pub tenant_id: TenantId,
    pub scenario_id: Uuid,
    pub scenario_version: u32,
    pub step_content_hash: String,
    /// Restrict matches to these channels; empty means all.
    pub channels: Vec<Channel>,
}

/// Session persistence and the per-session mutual exclusion primitive.
///
/// Turn processing acquires the lease at pipeline entry and releases it after
/// persist (or on cancellation). While held, nothing else may mutate the
/// session; a second acquire attempt fails with `SessionError::Busy`.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_id: SessionId) -> Result<Option<Session>>;
    async fn save(&self, session: Session) -> Result<()>;
    async fn delete(&self, session_id: SessionId) -> Result<bool>;

    /// Lookup by the channel identity triple that created the session.
    async fn find_by_channel(
        &self,
        tenant_id: TenantId,
        channel: Channel,
        user_channel_id: &str,
    ) -> Result<Option<Session>>;

    async fn list_by_agent(
        &self,
        tenant_id: TenantId,
        agent_id: AgentId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Session>>;

    async fn list_by_customer(
        &self,
        tenant_id: TenantId,
        customer_id: CustomerId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Session>>;

    /// Sessions whose current step in the given scenario/version carries the
    /// given content hash.
    async fn find_by_step_hash(&self, query: &StepHashQuery) -> Result<Vec<Session>>;

    /// Try to take the per-session lease. Returns `Busy` if already held.
    async fn acquire_lease(&self, tenant_id: TenantId, session_id: SessionId) -> Result<()>;
    async fn release_lease(&self, tenant_id: TenantId, session_id: SessionId) -> Result<()>;
}
