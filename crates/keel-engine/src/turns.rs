//! Append-only turn records and their store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use keel_core::{SessionId, TenantId, TurnId};

use crate::result::TurnResolution;

/// One processed turn, persisted for the session timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn_id: TurnId,
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub turn_number: u32,
    pub user_message: String,
    pub response: String,
    pub outcome: TurnResolution,
    pub matched_rule_ids: Vec<uuid::Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnSort {
    Asc,
    Desc,
}

#[async_trait]
pub trait TurnStore: Send + Sync {
    async fn save(&self, record: TurnRecord) -> Result<(), String>;
    async fn list(
        &self,
        tenant_id: TenantId,
        session_id: SessionId,
        limit: usize,
        offset: usize,
        sort: TurnSort,
    ) -> Result<Vec<TurnRecord>, String>;
}

#[derive(Default)]
pub struct InMemoryTurnStore {
    records: DashMap<TurnId, TurnRecord>,
}

impl InMemoryTurnStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TurnStore for InMemoryTurnStore {
    async fn save(&self, record: TurnRecord) -> Result<(), String> {
        self.records.insert(record.turn_id, record);
        Ok(())
    }

    async fn list(
        &self,
        tenant_id: TenantId,
        session_id: SessionId,
        limit: usize,
        offset: usize,
        sort: TurnSort,
    ) -> Result<Vec<TurnRecord>, String> {
        let mut out: Vec<TurnRecord> = self
            .records
            .iter()
            .filter(|r| r.tenant_id == tenant_id && r.session_id == session_id)
            .map(|r| r.value().clone())
            .collect();
        out.sort_by_key(|r| r.turn_number);
        if sort == TurnSort::Desc {
            out.reverse();
        }
        // API contract caps page size at 100.
        Ok(out.into_iter().skip(offset).take(limit.min(100)).collect())
    }
}
