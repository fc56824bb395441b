use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use keel_core::{Channel, CustomerId, TenantId};

use crate::error::Result;
use crate::types::{ChannelIdentity, CustomerProfile, ItemStatus, ProfileAsset, VariableEntry};

/// One hop of a derivation chain, oldest first.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LineageHop {
    pub id: Uuid,
    pub kind: &'static str,
    pub name: String,
    pub metadata: Value,
}

/// Customer data persistence with status-aware reads and lineage.
#[async_trait]
pub trait CustomerDataStore: Send + Sync {
    async fn get_by_id(
        &self,
        tenant_id: TenantId,
        profile_id: CustomerId,
        include_history: bool,
    ) -> Result<Option<CustomerProfile>>;

    async fn get_by_channel_identity(
        &self,
        tenant_id: TenantId,
        channel: Channel,
        channel_user_id: &str,
        include_history: bool,
    ) -> Result<Option<CustomerProfile>>;

    async fn get_or_create(
        &self,
        tenant_id: TenantId,
        channel: Channel,
        channel_user_id: &str,
    ) -> Result<CustomerProfile>;

    async fn save(&self, profile: CustomerProfile) -> Result<CustomerId>;
    async fn delete(&self, tenant_id: TenantId, profile_id: CustomerId) -> Result<bool>;

    /// Write a field. The new entry becomes ACTIVE; a prior ACTIVE entry for
    /// the same name is marked SUPERSEDED with back-pointer and timestamp and
    /// pushed onto the field history.
    async fn update_field(
        &self,
        tenant_id: TenantId,
        profile_id: CustomerId,
        field: VariableEntry,
    ) -> Result<Uuid>;

    /// Status-aware read. `None` status returns whatever is newest.
    async fn get_field(
        &self,
        tenant_id: TenantId,
        profile_id: CustomerId,
        field_name: &str,
        status: Option<ItemStatus>,
    ) -> Result<Option<VariableEntry>>;

    /// Every recorded version of a field, newest first.
    async fn get_field_history(
        &self,
        tenant_id: TenantId,
        profile_id: CustomerId,
        field_name: &str,
    ) -> Result<Vec<VariableEntry>>;

    /// ACTIVE entries past `expires_at` transition to EXPIRED. Returns count.
    async fn expire_stale_fields(
        &self,
        tenant_id: TenantId,
        profile_id: Option<CustomerId>,
    ) -> Result<usize>;

    /// ACTIVE entries whose derivation source is superseded/expired/gone
    /// transition to ORPHANED. Returns count.
    async fn mark_orphaned_items(
        &self,
        tenant_id: TenantId,
        profile_id: Option<CustomerId>,
    ) -> Result<usize>;

    async fn add_asset(
        &self,
        tenant_id: TenantId,
        profile_id: CustomerId,
        asset: ProfileAsset,
        supersede_existing: bool,
    ) -> Result<Uuid>;

    /// Walk the derivation chain from an item towards its origins, bounded to
    /// depth 10. Cycles terminate the walk.
    async fn get_derivation_chain(
        &self,
        tenant_id: TenantId,
        item_id: Uuid,
    ) -> Result<Vec<LineageHop>>;

    /// Attach a channel identity; fails when the identity belongs to another
    /// profile of the tenant.
    async fn link_channel(
        &self,
        tenant_id: TenantId,
        profile_id: CustomerId,
        identity: ChannelIdentity,
    ) -> Result<bool>;

    /// Merge source into target: identities union, fields keep the newer
    /// entry, histories concatenate, source deleted. Idempotent.
    async fn merge_profiles(
        &self,
        tenant_id: TenantId,
        source_profile_id: CustomerId,
        target_profile_id: CustomerId,
    ) -> Result<bool>;
}
