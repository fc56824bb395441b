use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use keel_core::{SessionId, TenantId, TurnId};

/// Immutable record of one user↔agent exchange (or system event), embedded
/// for associative recall. Episodes are append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub turn_id: Option<TurnId>,
    pub user_message: String,
    pub agent_response: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

impl Episode {
    pub fn new(
        tenant_id: TenantId,
        session_id: SessionId,
        turn_id: Option<TurnId>,
        user_message: &str,
        agent_response: Option<&str>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            tenant_id,
            session_id,
            turn_id,
            user_message: user_message.to_string(),
            agent_response: agent_response.map(|s| s.to_string()),
            embedding: None,
            created_at: Utc::now(),
        }
    }
}

/// Knowledge-graph node with temporal validity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub name: String,
    pub entity_type: String,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
}

impl Entity {
    pub fn new(tenant_id: TenantId, name: &str, entity_type: &str) -> Self {
        Self {
            id: Uuid::now_v7(),
            tenant_id,
            name: name.to_string(),
            entity_type: entity_type.to_string(),
            valid_from: Utc::now(),
            valid_to: None,
        }
    }
}

/// Directed edge between two entities. Superseding a relationship closes the
/// old edge (`valid_to = now`) and opens a new one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub from_entity_id: Uuid,
    pub to_entity_id: Uuid,
    pub relation: String,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
}

impl Relationship {
    pub fn new(
        tenant_id: TenantId,
        from_entity_id: Uuid,
        to_entity_id: Uuid,
        relation: &str,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            tenant_id,
            from_entity_id,
            to_entity_id,
            relation: relation.to_string(),
            valid_from: Utc::now(),
            valid_to: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.valid_to.is_none()
    }
}
