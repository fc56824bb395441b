use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use keel_core::{Channel, CustomerId, TenantId};

use crate::error::{CustomerDataError, Result};
use crate::store::{CustomerDataStore, LineageHop};
use crate::types::*;

/// In-memory customer data store.
///
/// A single mutex over the whole state keeps supersession atomic per write;
/// the engine serialises per-customer writes anyway (per-customer lease), so
/// contention is not a concern at this tier.
#[derive(Default)]
pub struct InMemoryCustomerDataStore {
    inner: Mutex<State>,
}

#[derive(Default)]
struct State {
    profiles: HashMap<CustomerId, CustomerProfile>,
    /// profile -> field name -> superseded/expired entries, oldest first.
    field_history: HashMap<CustomerId, HashMap<String, Vec<VariableEntry>>>,
}

impl InMemoryCustomerDataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl State {
    fn profile(&self, tenant_id: TenantId, profile_id: CustomerId) -> Option<&CustomerProfile> {
        self.profiles
            .get(&profile_id)
            .filter(|p| p.tenant_id == tenant_id && p.deleted_at.is_none())
    }

    fn profile_mut(
        &mut self,
        tenant_id: TenantId,
        profile_id: CustomerId,
    ) -> Option<&mut CustomerProfile> {
        self.profiles
            .get_mut(&profile_id)
            .filter(|p| p.tenant_id == tenant_id && p.deleted_at.is_none())
    }

    /// Set the status of a field or asset to ORPHANED wherever it lives
    /// (current fields, assets, or history). Returns whether anything changed.
    fn mark_item_orphaned(&mut self, tenant_id: TenantId, item_id: Uuid) -> bool {
        let mut changed = false;
        for profile in self.profiles.values_mut() {
            if profile.tenant_id != tenant_id {
                continue;
            }
            for field in profile.fields.values_mut() {
                if field.id == item_id && field.status != ItemStatus::Orphaned {
                    field.status = ItemStatus::Orphaned;
                    changed = true;
                }
            }
            for asset in &mut profile.assets {
                if asset.id == item_id && asset.status != ItemStatus::Orphaned {
                    asset.status = ItemStatus::Orphaned;
                    changed = true;
                }
            }
        }
        for history in self.field_history.values_mut() {
            for entries in history.values_mut() {
                for field in entries {
                    if field.id == item_id && field.status != ItemStatus::Orphaned {
                        field.status = ItemStatus::Orphaned;
                        changed = true;
                    }
                }
            }
        }
        changed
    }

    /// Find a field or asset anywhere in the tenant (current or history).
    fn find_item(&self, tenant_id: TenantId, item_id: Uuid) -> Option<FoundItem<'_>> {
        for profile in self.profiles.values() {
            if profile.tenant_id != tenant_id {
                continue;
            }
            for field in profile.fields.values() {
                if field.id == item_id {
                    return Some(FoundItem::Field(field));
                }
            }
            for asset in &profile.assets {
                if asset.id == item_id {
                    return Some(FoundItem::Asset(asset));
                }
            }
            if let Some(history) = self.field_history.get(&profile.id) {
                for entries in history.values() {
                    for field in entries {
                        if field.id == item_id {
                            return Some(FoundItem::Field(field));
                        }
                    }
                }
            }
        }
        None
    }
}

enum FoundItem<'a> {
    Field(&'a VariableEntry),
    Asset(&'a ProfileAsset),
}

impl FoundItem<'_> {
    fn status(&self) -> ItemStatus {
        match self {
            FoundItem::Field(f) => f.status,
            FoundItem::Asset(a) => a.status,
        }
    }

    fn source_item_id(&self) -> Option<Uuid> {
        match self {
            FoundItem::Field(f) => f.source_item_id,
            FoundItem::Asset(a) => a.source_item_id,
        }
    }

    fn hop(&self) -> LineageHop {
        match self {
            FoundItem::Field(f) => LineageHop {
                id: f.id,
                kind: "profile_field",
                name: f.name.clone(),
                metadata: json!(f.source_metadata),
            },
            FoundItem::Asset(a) => LineageHop {
                id: a.id,
                kind: "profile_asset",
                name: a.name.clone(),
                metadata: json!({}),
            },
        }
    }
}

#[async_trait]
impl CustomerDataStore for InMemoryCustomerDataStore {
    async fn get_by_id(
        &self,
        tenant_id: TenantId,
        profile_id: CustomerId,
        _include_history: bool,
    ) -> Result<Option<CustomerProfile>> {
        let state = self.inner.lock().unwrap();
        Ok(state.profile(tenant_id, profile_id).cloned())
    }

    async fn get_by_channel_identity(
        &self,
        tenant_id: TenantId,
        channel: Channel,
        channel_user_id: &str,
        _include_history: bool,
    ) -> Result<Option<CustomerProfile>> {
        let state = self.inner.lock().unwrap();
        Ok(state
            .profiles
            .values()
            .find(|p| {
                p.tenant_id == tenant_id
                    && p.deleted_at.is_none()
                    && p.channel_identities
                        .iter()
                        .any(|i| i.channel == channel && i.channel_user_id == channel_user_id)
            })
            .cloned())
    }

    async fn get_or_create(
        &self,
        tenant_id: TenantId,
        channel: Channel,
        channel_user_id: &str,
    ) -> Result<CustomerProfile> {
        if let Some(existing) = self
            .get_by_channel_identity(tenant_id, channel, channel_user_id, false)
            .await?
        {
            return Ok(existing);
        }
        let profile = CustomerProfile::new(
            tenant_id,
            ChannelIdentity {
                channel,
                channel_user_id: channel_user_id.to_string(),
                primary: true,
            },
        );
        let mut state = self.inner.lock().unwrap();
        state.profiles.insert(profile.id, profile.clone());
        Ok(profile)
    }

    async fn save(&self, mut profile: CustomerProfile) -> Result<CustomerId> {
        profile.updated_at = Utc::now();
        let id = profile.id;
        let mut state = self.inner.lock().unwrap();
        state.profiles.insert(id, profile);
        Ok(id)
    }

    async fn delete(&self, tenant_id: TenantId, profile_id: CustomerId) -> Result<bool> {
        let mut state = self.inner.lock().unwrap();
        if state.profile(tenant_id, profile_id).is_none() {
            return Ok(false);
        }
        state.profiles.remove(&profile_id);
        state.field_history.remove(&profile_id);
        Ok(true)
    }

    async fn update_field(
        &self,
        tenant_id: TenantId,
        profile_id: CustomerId,
        mut field: VariableEntry,
    ) -> Result<Uuid> {
        let mut state = self.inner.lock().unwrap();
        let profile =
            state
                .profile_mut(tenant_id, profile_id)
                .ok_or(CustomerDataError::NotFound {
                    id: profile_id.to_string(),
                })?;

        let now = Utc::now();
        field.status = ItemStatus::Active;
        field.updated_at = now;

        let superseded = if let Some(existing) = profile.fields.get_mut(&field.name) {
            if existing.status == ItemStatus::Active {
                existing.status = ItemStatus::Superseded;
                existing.superseded_by_id = Some(field.id);
                existing.superseded_at = Some(now);
            }
            Some(existing.clone())
        } else {
            None
        };

        let field_id = field.id;
        let field_name = field.name.clone();
        profile.fields.insert(field.name.clone(), field);
        profile.updated_at = now;

        if let Some(old) = superseded {
            info!(
                tenant_id = %tenant_id,
                profile_id = %profile_id,
                field_name = %field_name,
                old_field_id = %old.id,
                new_field_id = %field_id,
                "profile_field_superseded"
            );
            state
                .field_history
                .entry(profile_id)
                .or_default()
                .entry(field_name)
                .or_default()
                .push(old);
        }

        Ok(field_id)
    }

    async fn get_field(
        &self,
        tenant_id: TenantId,
        profile_id: CustomerId,
        field_name: &str,
        status: Option<ItemStatus>,
    ) -> Result<Option<VariableEntry>> {
        let state = self.inner.lock().unwrap();
        let profile = match state.profile(tenant_id, profile_id) {
            Some(p) => p,
            None => return Ok(None),
        };

        if let Some(field) = profile.fields.get(field_name) {
            if status.map_or(true, |s| field.status == s) {
                return Ok(Some(field.clone()));
            }
        }

        // Non-active statuses live in the history, newest first.
        if status != Some(ItemStatus::Active) {
            if let Some(history) = state
                .field_history
                .get(&profile_id)
                .and_then(|h| h.get(field_name))
            {
                let mut entries: Vec<&VariableEntry> = history.iter().collect();
                entries.sort_by(|a, b| b.collected_at.cmp(&a.collected_at));
                for entry in entries {
                    if status.map_or(true, |s| entry.status == s) {
                        return Ok(Some(entry.clone()));
                    }
                }
            }
        }

        Ok(None)
    }

    async fn get_field_history(
        &self,
        tenant_id: TenantId,
        profile_id: CustomerId,
        field_name: &str,
    ) -> Result<Vec<VariableEntry>> {
        let state = self.inner.lock().unwrap();
        let profile = match state.profile(tenant_id, profile_id) {
            Some(p) => p,
            None => return Ok(Vec::new()),
        };
        let mut out = Vec::new();
        if let Some(current) = profile.fields.get(field_name) {
            out.push(current.clone());
        }
        if let Some(history) = state
            .field_history
            .get(&profile_id)
            .and_then(|h| h.get(field_name))
        {
            out.extend(history.iter().cloned());
        }
        out.sort_by(|a, b| b.collected_at.cmp(&a.collected_at));
        Ok(out)
    }

    async fn expire_stale_fields(
        &self,
        tenant_id: TenantId,
        profile_id: Option<CustomerId>,
    ) -> Result<usize> {
        let mut state = self.inner.lock().unwrap();
        let now = Utc::now();
        let mut count = 0;
        for profile in state.profiles.values_mut() {
            if profile.tenant_id != tenant_id {
                continue;
            }
            if let Some(pid) = profile_id {
                if profile.id != pid {
                    continue;
                }
            }
            for field in profile.fields.values_mut() {
                if field.status == ItemStatus::Active
                    && field.expires_at.map_or(false, |exp| exp <= now)
                {
                    field.status = ItemStatus::Expired;
                    count += 1;
                    info!(
                        tenant_id = %tenant_id,
                        profile_id = %profile.id,
                        field_name = %field.name,
                        field_id = %field.id,
                        "profile_field_expired"
                    );
                }
            }
        }
        Ok(count)
    }

    async fn mark_orphaned_items(
        &self,
        tenant_id: TenantId,
        profile_id: Option<CustomerId>,
    ) -> Result<usize> {
        let mut state = self.inner.lock().unwrap();

        // Two passes: decide first against an immutable view, mutate after.
        let mut to_orphan: Vec<(CustomerId, Uuid)> = Vec::new();
        for profile in state.profiles.values() {
            if profile.tenant_id != tenant_id {
                continue;
            }
            if let Some(pid) = profile_id {
                if profile.id != pid {
                    continue;
                }
            }
            for field in profile.fields.values() {
                if field.status != ItemStatus::Active {
                    continue;
                }
                if let Some(source_id) = field.source_item_id {
                    let alive = state
                        .find_item(tenant_id, source_id)
                        .map_or(false, |item| item.status() == ItemStatus::Active);
                    if !alive {
                        to_orphan.push((profile.id, field.id));
                    }
                }
            }
            for asset in &profile.assets {
                if asset.status != ItemStatus::Active {
                    continue;
                }
                if let Some(source_id) = asset.source_item_id {
                    let alive = state
                        .find_item(tenant_id, source_id)
                        .map_or(false, |item| item.status() == ItemStatus::Active);
                    if !alive {
                        to_orphan.push((profile.id, asset.id));
                    }
                }
            }
        }

        for (pid, item_id) in &to_orphan {
            if let Some(profile) = state.profiles.get_mut(pid) {
                for field in profile.fields.values_mut() {
                    if field.id == *item_id {
                        field.status = ItemStatus::Orphaned;
                        info!(
                            tenant_id = %tenant_id,
                            profile_id = %pid,
                            field_id = %item_id,
                            "profile_field_orphaned"
                        );
                    }
                }
                for asset in &mut profile.assets {
                    if asset.id == *item_id {
                        asset.status = ItemStatus::Orphaned;
                        info!(
                            tenant_id = %tenant_id,
                            profile_id = %pid,
                            asset_id = %item_id,
                            "profile_field_orphaned"
                        );
                    }
                }
            }
        }

        Ok(to_orphan.len())
    }

    async fn add_asset(
        &self,
        tenant_id: TenantId,
        profile_id: CustomerId,
        mut asset: ProfileAsset,
        supersede_existing: bool,
    ) -> Result<Uuid> {
        let mut state = self.inner.lock().unwrap();
        let profile =
            state
                .profile_mut(tenant_id, profile_id)
                .ok_or(CustomerDataError::NotFound {
                    id: profile_id.to_string(),
                })?;

        if supersede_existing {
            let now = Utc::now();
            for existing in &mut profile.assets {
                if existing.name == asset.name && existing.status == ItemStatus::Active {
                    existing.status = ItemStatus::Superseded;
                    existing.superseded_by_id = Some(asset.id);
                    existing.superseded_at = Some(now);
                }
            }
        }
        asset.status = ItemStatus::Active;
        let id = asset.id;
        profile.assets.push(asset);
        profile.updated_at = Utc::now();
        Ok(id)
    }

    async fn get_derivation_chain(
        &self,
        tenant_id: TenantId,
        item_id: Uuid,
    ) -> Result<Vec<LineageHop>> {
        let mut state = self.inner.lock().unwrap();
        let mut chain: Vec<LineageHop> = Vec::new();
        let mut visited: std::collections::HashSet<Uuid> = std::collections::HashSet::new();
        let mut current = Some(item_id);
        let mut cycle_at: Option<Uuid> = None;

        while let Some(id) = current {
            if chain.len() >= keel_core::config::DERIVATION_MAX_DEPTH {
                break;
            }
            if !visited.insert(id) {
                cycle_at = Some(id);
                break;
            }
            let (hop, next) = match state.find_item(tenant_id, id) {
                Some(item) => (item.hop(), item.source_item_id()),
                None => break,
            };
            chain.insert(0, hop);
            current = next;
        }

        // Lineage is broken: the revisited node's provenance can no longer be
        // trusted, so it leaves ACTIVE.
        if let Some(id) = cycle_at {
            info!(tenant_id = %tenant_id, item_id = %id, "lineage_cycle_detected");
            if state.mark_item_orphaned(tenant_id, id) {
                info!(tenant_id = %tenant_id, field_id = %id, "profile_field_orphaned");
            }
        }

        if !chain.is_empty() {
            info!(
                tenant_id = %tenant_id,
                item_id = %item_id,
                chain_depth = chain.len(),
                "derivation_chain_traversed"
            );
        }
        Ok(chain)
    }

    async fn link_channel(
        &self,
        tenant_id: TenantId,
        profile_id: CustomerId,
        identity: ChannelIdentity,
    ) -> Result<bool> {
        let mut state = self.inner.lock().unwrap();

        let taken = state.profiles.values().any(|p| {
            p.tenant_id == tenant_id
                && p.id != profile_id
                && p.channel_identities.iter().any(|i| {
                    i.channel == identity.channel && i.channel_user_id == identity.channel_user_id
                })
        });
        if taken {
            return Ok(false);
        }

        match state.profile_mut(tenant_id, profile_id) {
            Some(profile) => {
                if !profile.channel_identities.contains(&identity) {
                    profile.channel_identities.push(identity);
                    profile.updated_at = Utc::now();
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn merge_profiles(
        &self,
        tenant_id: TenantId,
        source_profile_id: CustomerId,
        target_profile_id: CustomerId,
    ) -> Result<bool> {
        let mut state = self.inner.lock().unwrap();

        let source = match state.profile(tenant_id, source_profile_id) {
            Some(p) => p.clone(),
            None => return Ok(false),
        };
        if state.profile(tenant_id, target_profile_id).is_none() {
            return Ok(false);
        }

        let source_history = state.field_history.remove(&source_profile_id);

        let target = state.profiles.get_mut(&target_profile_id).unwrap();
        for identity in source.channel_identities {
            let dup = target
                .channel_identities
                .iter()
                .any(|i| i.channel == identity.channel && i.channel_user_id == identity.channel_user_id);
            if !dup {
                target.channel_identities.push(identity);
            }
        }
        for (name, field) in source.fields {
            let keep_incoming = target
                .fields
                .get(&name)
                .map_or(true, |existing| field.updated_at > existing.updated_at);
            if keep_incoming {
                target.fields.insert(name, field);
            }
        }
        for asset in source.assets {
            if !target.assets.iter().any(|a| a.id == asset.id) {
                target.assets.push(asset);
            }
        }
        for consent in source.consents {
            if !target.consents.contains(&consent) {
                target.consents.push(consent);
            }
        }
        target.updated_at = Utc::now();

        if let Some(history) = source_history {
            let target_history = state.field_history.entry(target_profile_id).or_default();
            for (name, entries) in history {
                target_history.entry(name).or_default().extend(entries);
            }
        }

        state.profiles.remove(&source_profile_id);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::FieldValue;

    async fn store_with_profile() -> (InMemoryCustomerDataStore, TenantId, CustomerId) {
        let store = InMemoryCustomerDataStore::new();
        let tenant = TenantId::new();
        let profile = store
            .get_or_create(tenant, Channel::Webchat, "user-1")
            .await
            .unwrap();
        (store, tenant, profile.id)
    }

    fn entry(name: &str, value: &str) -> VariableEntry {
        VariableEntry::new(name, FieldValue::Str(value.into()), EntrySource::UserProvided)
    }

    #[tokio::test]
    async fn supersession_keeps_exactly_one_active() {
        let (store, tenant, profile_id) = store_with_profile().await;

        let first = entry("phone_number", "111");
        let first_id = first.id;
        store.update_field(tenant, profile_id, first).await.unwrap();
        let second = entry("phone_number", "222");
        let second_id = second.id;
        store.update_field(tenant, profile_id, second).await.unwrap();

        let active = store
            .get_field(tenant, profile_id, "phone_number", Some(ItemStatus::Active))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.id, second_id);
        assert_eq!(active.value.to_string(), "222");

        let superseded = store
            .get_field(
                tenant,
                profile_id,
                "phone_number",
                Some(ItemStatus::Superseded),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(superseded.id, first_id);
        assert_eq!(superseded.superseded_by_id, Some(second_id));
        assert!(superseded.superseded_at.is_some());

        let history = store
            .get_field_history(tenant, profile_id, "phone_number")
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        let active_count = history
            .iter()
            .filter(|f| f.status == ItemStatus::Active)
            .count();
        assert_eq!(active_count, 1);
    }

    #[tokio::test]
    async fn expiration_sweep_transitions_active_to_expired() {
        let (store, tenant, profile_id) = store_with_profile().await;
        let mut field = entry("otp_code", "1234");
        field.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        store.update_field(tenant, profile_id, field).await.unwrap();

        let expired = store.expire_stale_fields(tenant, None).await.unwrap();
        assert_eq!(expired, 1);

        assert!(store
            .get_field(tenant, profile_id, "otp_code", Some(ItemStatus::Active))
            .await
            .unwrap()
            .is_none());
        assert!(store
            .get_field(tenant, profile_id, "otp_code", Some(ItemStatus::Expired))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn orphan_marking_follows_dead_sources() {
        let (store, tenant, profile_id) = store_with_profile().await;

        let source = entry("raw_address", "1 Main St");
        let source_id = source.id;
        store.update_field(tenant, profile_id, source).await.unwrap();

        let mut derived = entry("normalized_address", "1 MAIN ST");
        derived.source_item_id = Some(source_id);
        derived.source_item_type = Some(SourceItemType::ProfileField);
        derived.source = EntrySource::ToolDerived;
        store.update_field(tenant, profile_id, derived).await.unwrap();

        // Supersede the source; the derived field's lineage is now dead.
        store
            .update_field(tenant, profile_id, entry("raw_address", "2 Oak Ave"))
            .await
            .unwrap();

        let orphaned = store.mark_orphaned_items(tenant, None).await.unwrap();
        assert_eq!(orphaned, 1);
        let derived = store
            .get_field(tenant, profile_id, "normalized_address", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(derived.status, ItemStatus::Orphaned);
    }

    #[tokio::test]
    async fn derivation_chain_walks_to_origin_and_handles_cycles() {
        let (store, tenant, profile_id) = store_with_profile().await;

        let a = entry("a", "1");
        let a_id = a.id;
        store.update_field(tenant, profile_id, a).await.unwrap();

        let mut b = entry("b", "2");
        b.source_item_id = Some(a_id);
        b.source_item_type = Some(SourceItemType::ProfileField);
        let b_id = b.id;
        store.update_field(tenant, profile_id, b).await.unwrap();

        let chain = store.get_derivation_chain(tenant, b_id).await.unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].name, "a");
        assert_eq!(chain[1].name, "b");

        // Introduce a cycle a -> b -> a; traversal must terminate and the
        // revisited node loses its ACTIVE status.
        {
            let mut state = store.inner.lock().unwrap();
            let profile = state.profiles.get_mut(&profile_id).unwrap();
            let field_a = profile.fields.get_mut("a").unwrap();
            field_a.source_item_id = Some(b_id);
            field_a.source_item_type = Some(SourceItemType::ProfileField);
        }
        let chain = store.get_derivation_chain(tenant, b_id).await.unwrap();
        assert_eq!(chain.len(), 2);

        let b = store
            .get_field(tenant, profile_id, "b", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(b.status, ItemStatus::Orphaned);
        // The untainted link keeps its status.
        let a = store
            .get_field(tenant, profile_id, "a", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a.status, ItemStatus::Active);
    }

    #[tokio::test]
    async fn channel_identity_unique_across_profiles() {
        let store = InMemoryCustomerDataStore::new();
        let tenant = TenantId::new();
        let first = store
            .get_or_create(tenant, Channel::Webchat, "shared")
            .await
            .unwrap();
        let second = store
            .get_or_create(tenant, Channel::Whatsapp, "other")
            .await
            .unwrap();
        assert_ne!(first.id, second.id);

        let linked = store
            .link_channel(
                tenant,
                second.id,
                ChannelIdentity {
                    channel: Channel::Webchat,
                    channel_user_id: "shared".into(),
                    primary: false,
                },
            )
            .await
            .unwrap();
        assert!(!linked);
    }

    #[tokio::test]
    async fn merge_unions_identities_and_keeps_newer_fields() {
        let store = InMemoryCustomerDataStore::new();
        let tenant = TenantId::new();
        let target = store
            .get_or_create(tenant, Channel::Webchat, "web-user")
            .await
            .unwrap();
        let source = store
            .get_or_create(tenant, Channel::Whatsapp, "wa-user")
            .await
            .unwrap();

        store
            .update_field(tenant, target.id, entry("name", "Old Name"))
            .await
            .unwrap();
        // Source write happens later, so it wins the merge.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store
            .update_field(tenant, source.id, entry("name", "New Name"))
            .await
            .unwrap();

        assert!(store
            .merge_profiles(tenant, source.id, target.id)
            .await
            .unwrap());

        let merged = store
            .get_by_id(tenant, target.id, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(merged.channel_identities.len(), 2);
        assert_eq!(merged.fields["name"].value.to_string(), "New Name");
        assert!(store
            .get_by_id(tenant, source.id, false)
            .await
            .unwrap()
            .is_none());

        // Merging an already-gone source is a no-op, not an error.
        assert!(!store
            .merge_profiles(tenant, source.id, target.id)
            .await
            .unwrap());
    }
}
