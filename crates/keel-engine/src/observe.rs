//! Logging setup and PII-aware redaction.

use std::collections::HashSet;

use tracing_subscriber::EnvFilter;

/// Initialise structured logging. `RUST_LOG` overrides the default level.
/// Safe to call more than once (later calls are no-ops).
pub fn setup_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Metric names emitted across the engine, kept in one place so dashboards
/// and code stay in sync.
pub mod metric {
    pub const REQUEST_COUNT: &str = "request_count";
    pub const REQUEST_LATENCY: &str = "request_latency";
    pub const LLM_TOKENS: &str = "llm_tokens";
    pub const RULES_MATCHED: &str = "rules_matched";
    pub const ACTIVE_SESSIONS: &str = "active_sessions";
    pub const ERRORS: &str = "errors";
    pub const PIPELINE_STEP_LATENCY: &str = "pipeline_step_latency";
}

/// Replace values of PII-marked fields in a JSON payload before it reaches a
/// log line. Field names come from the customer schema (`is_pii`).
pub fn redact_pii(value: &mut serde_json::Value, pii_fields: &HashSet<String>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                if pii_fields.contains(key) {
                    *entry = serde_json::Value::String("[redacted]".to_string());
                } else {
                    redact_pii(entry, pii_fields);
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                redact_pii(item, pii_fields);
            }
        }
        _ => {}
    }
}
