//! Immutable audit events emitted around turn processing.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use keel_core::{SessionId, TenantId, TurnId};

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub turn_id: Option<TurnId>,
    pub event: &'static str,
    pub at: DateTime<Utc>,
    pub payload: Value,
}

impl AuditEvent {
    pub fn new(
        tenant_id: TenantId,
        session_id: SessionId,
        turn_id: Option<TurnId>,
        event: &'static str,
        payload: Value,
    ) -> Self {
        Self {
            tenant_id,
            session_id,
            turn_id,
            event,
            at: Utc::now(),
            payload,
        }
    }
}

/// Receives audit events. The bundled sink emits structured log lines; wire
/// formats (OTLP etc.) are an embedder concern.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

#[derive(Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        info!(
            tenant_id = %event.tenant_id,
            session_id = %event.session_id,
            turn_id = ?event.turn_id,
            event = event.event,
            payload = %event.payload,
            "audit"
        );
    }
}
