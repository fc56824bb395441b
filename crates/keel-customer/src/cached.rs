//! Write-through cache wrapper for the customer data store.
//!
//! Key layout: `{prefix}:profile:{tenant}:{profile_id}` and
//! `{prefix}:profile:{tenant}:channel:{channel}:{user_id}`. Reads that carry
//! `include_history=true` always bypass the cache: history is unbounded and
//! only read on audit paths. Every write invalidates the tenant's profile
//! prefix after the backend write succeeds.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tracing::{debug, warn};
use uuid::Uuid;

use keel_core::cache::KvCache;
use keel_core::config::CacheConfig;
use keel_core::{Channel, CustomerId, TenantId};

use crate::error::{CustomerDataError, Result};
use crate::store::{CustomerDataStore, LineageHop};
use crate::types::{ChannelIdentity, CustomerProfile, ItemStatus, ProfileAsset, VariableEntry};

pub struct CachedCustomerDataStore {
    backend: Arc<dyn CustomerDataStore>,
    cache: Arc<dyn KvCache>,
    config: CacheConfig,
}

impl CachedCustomerDataStore {
    pub fn new(
        backend: Arc<dyn CustomerDataStore>,
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
        format!("{}:profile:{}", self.config.key_prefix, tenant_id)
    }

    fn profile_key(&self, tenant_id: TenantId, profile_id: CustomerId) -> String {
        format!("{}:{}", self.tenant_prefix(tenant_id), profile_id)
    }

    fn channel_key(&self, tenant_id: TenantId, channel: Channel, user_id: &str) -> String {
        format!("{}:channel:{}:{}", self.tenant_prefix(tenant_id), channel, user_id)
    }

    fn read_cached(&self, key: &str) -> Result<Option<CustomerProfile>> {
        if !self.config.enabled {
            return Ok(None);
        }
        match self.cache.get(key) {
            Ok(Some(raw)) => {
                counter!("profile_cache_hits", "store" => "customer").increment(1);
                debug!(key, "profile cache hit");
                Ok(serde_json::from_str(&raw).ok())
            }
            Ok(None) => {
                counter!("profile_cache_misses", "store" => "customer").increment(1);
                Ok(None)
            }
            Err(e) => {
                counter!("profile_cache_errors", "store" => "customer").increment(1);
                if self.config.fallback_on_error {
                    warn!(key, error = %e, "profile cache read failed, falling back");
                    Ok(None)
                } else {
                    Err(CustomerDataError::Cache(e))
                }
            }
        }
    }

    fn write_cached(&self, key: &str, profile: &CustomerProfile) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let raw = serde_json::to_string(profile)?;
        if let Err(e) = self
            .cache
            .set_ex(key, &raw, Duration::from_secs(self.config.ttl_seconds))
        {
            counter!("profile_cache_errors", "store" => "customer").increment(1);
            if !self.config.fallback_on_error {
                return Err(CustomerDataError::Cache(e));
            }
            warn!(key, error = %e, "profile cache write failed, ignoring");
        }
        Ok(())
    }

    fn invalidate_tenant(&self, tenant_id: TenantId) -> Result<()> {
        match self.cache.delete_prefix(&self.tenant_prefix(tenant_id)) {
            Ok(n) => {
                counter!("profile_cache_invalidations", "store" => "customer")
                    .increment(n as u64);
                Ok(())
            }
            Err(e) => {
                counter!("profile_cache_errors", "store" => "customer").increment(1);
                if self.config.fallback_on_error {
                    warn!(%tenant_id, error = %e, "profile cache invalidation failed");
                    Ok(())
                } else {
                    Err(CustomerDataError::Cache(e))
                }
            }
        }
    }
}

#[async_trait]
impl CustomerDataStore for CachedCustomerDataStore {
    async fn get_by_id(
        &self,
        tenant_id: TenantId,
        profile_id: CustomerId,
        include_history: bool,
    ) -> Result<Option<CustomerProfile>> {
        if include_history {
            return self.backend.get_by_id(tenant_id, profile_id, true).await;
        }
        let key = self.profile_key(tenant_id, profile_id);
        if let Some(profile) = self.read_cached(&key)? {
            return Ok(Some(profile));
        }
        let profile = self.backend.get_by_id(tenant_id, profile_id, false).await?;
        if let Some(ref p) = profile {
            self.write_cached(&key, p)?;
        }
        Ok(profile)
    }

    async fn get_by_channel_identity(
        &self,
        tenant_id: TenantId,
        channel: Channel,
        channel_user_id: &str,
        include_history: bool,
    ) -> Result<Option<CustomerProfile>> {
        if include_history {
            return self
                .backend
                .get_by_channel_identity(tenant_id, channel, channel_user_id, true)
                .await;
        }
        let key = self.channel_key(tenant_id, channel, channel_user_id);
        if let Some(profile) = self.read_cached(&key)? {
            return Ok(Some(profile));
        }
        let profile = self
            .backend
            .get_by_channel_identity(tenant_id, channel, channel_user_id, false)
            .await?;
        if let Some(ref p) = profile {
            self.write_cached(&key, p)?;
        }
        Ok(profile)
    }

    async fn get_or_create(
        &self,
        tenant_id: TenantId,
        channel: Channel,
        channel_user_id: &str,
    ) -> Result<CustomerProfile> {
        let profile = self
            .backend
            .get_or_create(tenant_id, channel, channel_user_id)
            .await?;
        // A create is a write; keep the cache coherent either way.
        self.invalidate_tenant(tenant_id)?;
        Ok(profile)
    }

    async fn save(&self, profile: CustomerProfile) -> Result<CustomerId> {
        let tenant = profile.tenant_id;
        let id = self.backend.save(profile).await?;
        self.invalidate_tenant(tenant)?;
        Ok(id)
    }

    async fn delete(&self, tenant_id: TenantId, profile_id: CustomerId) -> Result<bool> {
        let deleted = self.backend.delete(tenant_id, profile_id).await?;
        if deleted {
            self.invalidate_tenant(tenant_id)?;
        }
        Ok(deleted)
    }

    async fn update_field(
        &self,
        tenant_id: TenantId,
        profile_id: CustomerId,
        field: VariableEntry,
    ) -> Result<Uuid> {
        let id = self.backend.update_field(tenant_id, profile_id, field).await?;
        // Invalidation runs only after the backend write succeeded.
        self.invalidate_tenant(tenant_id)?;
        Ok(id)
    }

    async fn get_field(
        &self,
        tenant_id: TenantId,
        profile_id: CustomerId,
        field_name: &str,
        status: Option<ItemStatus>,
    ) -> Result<Option<VariableEntry>> {
        // Status-aware single-field reads consult history; bypass cache.
        self.backend
            .get_field(tenant_id, profile_id, field_name, status)
            .await
    }

    async fn get_field_history(
        &self,
        tenant_id: TenantId,
        profile_id: CustomerId,
        field_name: &str,
    ) -> Result<Vec<VariableEntry>> {
        self.backend
            .get_field_history(tenant_id, profile_id, field_name)
            .await
    }

    async fn expire_stale_fields(
        &self,
        tenant_id: TenantId,
        profile_id: Option<CustomerId>,
    ) -> Result<usize> {
        let n = self.backend.expire_stale_fields(tenant_id, profile_id).await?;
        if n > 0 {
            self.invalidate_tenant(tenant_id)?;
        }
        Ok(n)
    }

    async fn mark_orphaned_items(
        &self,
        tenant_id: TenantId,
        profile_id: Option<CustomerId>,
    ) -> Result<usize> {
        let n = self.backend.mark_orphaned_items(tenant_id, profile_id).await?;
        if n > 0 {
            self.invalidate_tenant(tenant_id)?;
        }
        Ok(n)
    }

    async fn add_asset(
        &self,
        tenant_id: TenantId,
        profile_id: CustomerId,
        asset: ProfileAsset,
        supersede_existing: bool,
    ) -> Result<Uuid> {
        let id = self
            .backend
            .add_asset(tenant_id, profile_id, asset, supersede_existing)
            .await?;
        self.invalidate_tenant(tenant_id)?;
        Ok(id)
    }

    async fn get_derivation_chain(
        &self,
        tenant_id: TenantId,
        item_id: Uuid,
    ) -> Result<Vec<LineageHop>> {
        self.backend.get_derivation_chain(tenant_id, item_id).await
    }

    async fn link_channel(
        &self,
        tenant_id: TenantId,
        profile_id: CustomerId,
        identity: ChannelIdentity,
    ) -> Result<bool> {
        let linked = self
            .backend
            .link_channel(tenant_id, profile_id, identity)
            .await?;
        if linked {
            self.invalidate_tenant(tenant_id)?;
        }
        Ok(linked)
    }

    async fn merge_profiles(
        &self,
        tenant_id: TenantId,
        source_profile_id: CustomerId,
        target_profile_id: CustomerId,
    ) -> Result<bool> {
        let merged = self
            .backend
            .merge_profiles(tenant_id, source_profile_id, target_profile_id)
            .await?;
        if merged {
            self.invalidate_tenant(tenant_id)?;
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inmemory::InMemoryCustomerDataStore;
    use crate::types::EntrySource;
    use keel_core::cache::InMemoryKvCache;
    use keel_core::FieldValue;

    fn wrapped() -> (CachedCustomerDataStore, Arc<InMemoryKvCache>) {
        let cache = Arc::new(InMemoryKvCache::new());
        let store = CachedCustomerDataStore::new(
            Arc::new(InMemoryCustomerDataStore::new()),
            cache.clone(),
            CacheConfig::default(),
        );
        (store, cache)
    }

    #[tokio::test]
    async fn repeat_profile_read_hits_cache() {
        let (store, cache) = wrapped();
        let tenant = TenantId::new();
        let profile = store
            .get_or_create(tenant, Channel::Webchat, "u1")
            .await
            .unwrap();

        store.get_by_id(tenant, profile.id, false).await.unwrap();
        assert!(!cache.is_empty());
        let again = store
            .get_by_id(tenant, profile.id, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, profile.id);
    }

    #[tokio::test]
    async fn field_write_invalidates_cached_profile() {
        let (store, cache) = wrapped();
        let tenant = TenantId::new();
        let profile = store
            .get_or_create(tenant, Channel::Webchat, "u2")
            .await
            .unwrap();
        store.get_by_id(tenant, profile.id, false).await.unwrap();
        assert!(!cache.is_empty());

        store
            .update_field(
                tenant,
                profile.id,
                VariableEntry::new(
                    "phone_number",
                    FieldValue::Str("555".into()),
                    EntrySource::UserProvided,
                ),
            )
            .await
            .unwrap();
        assert!(cache.is_empty());

        // Next read observes the write.
        let fresh = store
            .get_by_id(tenant, profile.id, false)
            .await
            .unwrap()
            .unwrap();
        assert!(fresh.has_active_field("phone_number"));
    }

    #[tokio::test]
    async fn history_reads_bypass_cache() {
        let (store, cache) = wrapped();
        let tenant = TenantId::new();
        let profile = store
            .get_or_create(tenant, Channel::Webchat, "u3")
            .await
            .unwrap();
        // History-bearing read never populates the cache.
        cache.delete_prefix("").unwrap();
        store.get_by_id(tenant, profile.id, true).await.unwrap();
        assert!(cache.is_empty());
    }
}
