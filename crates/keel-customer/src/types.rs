use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use keel_core::{Channel, CustomerId, FieldValue, TenantId, ValueType};

/// Lifecycle status of a customer data item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    Active,
    Superseded,
    Expired,
    Orphaned,
}

/// Where a fact about the customer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntrySource {
    UserProvided,
    ToolDerived,
    Inferred,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceItemType {
    ProfileField,
    ProfileAsset,
}

/// One status-tracked fact about a customer.
///
/// At most one entry per `(customer, name)` is ACTIVE at a time; a new write
/// supersedes the previous ACTIVE entry with a back-pointer and timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableEntry {
    pub id: Uuid,
    pub name: String,
    pub value: FieldValue,
    pub value_type: ValueType,
    pub source: EntrySource,
    pub status: ItemStatus,
    pub collected_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub superseded_by_id: Option<Uuid>,
    pub superseded_at: Option<DateTime<Utc>>,
    /// Derivation lineage: the item this one was computed from.
    pub source_item_id: Option<Uuid>,
    pub source_item_type: Option<SourceItemType>,
    #[serde(default)]
    pub source_metadata: serde_json::Map<String, serde_json::Value>,
    pub verified: bool,
}

impl VariableEntry {
    pub fn new(name: &str, value: FieldValue, source: EntrySource) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            name: name.to_string(),
            value_type: value.value_type(),
            value,
            source,
            status: ItemStatus::Active,
            collected_at: now,
            updated_at: now,
            expires_at: None,
            superseded_by_id: None,
            superseded_at: None,
            source_item_id: None,
            source_item_type: None,
            source_metadata: serde_json::Map::new(),
            verified: false,
        }
    }
}

/// Same lifecycle as `VariableEntry` but for opaque blobs held in external
/// object storage; only the reference lives here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileAsset {
    pub id: Uuid,
    pub name: String,
    pub storage_ref: String,
    pub content_type: Option<String>,
    pub status: ItemStatus,
    pub collected_at: DateTime<Utc>,
    pub superseded_by_id: Option<Uuid>,
    pub superseded_at: Option<DateTime<Utc>>,
    pub source_item_id: Option<Uuid>,
    pub source_item_type: Option<SourceItemType>,
}

impl ProfileAsset {
    pub fn new(name: &str, storage_ref: &str) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.to_string(),
            storage_ref: storage_ref.to_string(),
            content_type: None,
            status: ItemStatus::Active,
            collected_at: Utc::now(),
            superseded_by_id: None,
            superseded_at: None,
            source_item_id: None,
            source_item_type: None,
        }
    }
}

/// Links a channel-local user id to a customer. Unique across the tenant's
/// profiles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelIdentity {
    pub channel: Channel,
    pub channel_user_id: String,
    pub primary: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Consent {
    pub kind: String,
    pub granted_at: DateTime<Utc>,
}

/// Per-customer data store: ACTIVE fields, assets, identities, consents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerProfile {
    pub id: CustomerId,
    pub tenant_id: TenantId,
    pub customer_id: CustomerId,
    pub channel_identities: Vec<ChannelIdentity>,
    /// name -> ACTIVE entry. Non-active entries live in the history.
    pub fields: HashMap<String, VariableEntry>,
    pub assets: Vec<ProfileAsset>,
    pub consents: Vec<Consent>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl CustomerProfile {
    pub fn new(tenant_id: TenantId, identity: ChannelIdentity) -> Self {
        let now = Utc::now();
        let id = CustomerId::new();
        Self {
            id,
            tenant_id,
            customer_id: id,
            channel_identities: vec![identity],
            fields: HashMap::new(),
            assets: Vec::new(),
            consents: Vec::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// ACTIVE value for a field, if any.
    pub fn active_field(&self, name: &str) -> Option<&VariableEntry> {
        self.fields
            .get(name)
            .filter(|f| f.status == ItemStatus::Active)
    }

    pub fn has_active_field(&self, name: &str) -> bool {
        self.active_field(name).is_some()
    }
}
