use thiserror::Error;

/// Engine-level error taxonomy.
///
/// Every component error that escapes the pipeline is mapped into one of
/// these kinds before it reaches a caller; `code()` is the stable wire string
/// and `http_status()` the transport mapping for embedders that serve HTTP.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Tenant not found: {id}")]
    TenantNotFound { id: String },

    #[error("Agent not found: {id}")]
    AgentNotFound { id: String },

    #[error("Session not found: {id}")]
    SessionNotFound { id: String },

    #[error("Session busy: {id}")]
    SessionBusy { id: String },

    #[error("{entity} not found: {id}")]
    EntityNotFound { entity: &'static str, id: String },

    #[error("Hard constraint violated by rule {rule_id}")]
    RuleViolation { rule_id: String },

    #[error("Tool failed ({tool_id}): {reason}")]
    ToolFailed { tool_id: String, reason: String },

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("LLM provider error: {0}")]
    Llm(String),

    #[error("Publish already in progress for agent {agent_id}")]
    PublishInProgress { agent_id: String },

    #[error("Publish failed at stage {stage}: {reason}")]
    PublishFailed { stage: String, reason: String },

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Turn deadline exceeded after {ms}ms")]
    TurnDeadlineExceeded { ms: u64 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable error code used in wire envelopes and audit records.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidRequest(_) => "INVALID_REQUEST",
            EngineError::TenantNotFound { .. } => "TENANT_NOT_FOUND",
            EngineError::AgentNotFound { .. } => "AGENT_NOT_FOUND",
            EngineError::SessionNotFound { .. } => "SESSION_NOT_FOUND",
            EngineError::SessionBusy { .. } => "SESSION_BUSY",
            EngineError::EntityNotFound { entity, .. } => entity_code(entity),
            EngineError::RuleViolation { .. } => "RULE_VIOLATION",
            EngineError::ToolFailed { .. } => "TOOL_FAILED",
            EngineError::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            EngineError::Llm(_) => "LLM_ERROR",
            EngineError::PublishInProgress { .. } => "PUBLISH_IN_PROGRESS",
            EngineError::PublishFailed { .. } => "PUBLISH_FAILED",
            EngineError::InvalidTransition(_) => "INVALID_TRANSITION",
            EngineError::TurnDeadlineExceeded { .. } => "TURN_DEADLINE_EXCEEDED",
            EngineError::Serialization(_) => "INTERNAL_ERROR",
            EngineError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status from the fixed mapping table.
    pub fn http_status(&self) -> u16 {
        match self {
            EngineError::InvalidRequest(_) | EngineError::InvalidTransition(_) => 400,
            EngineError::TenantNotFound { .. }
            | EngineError::AgentNotFound { .. }
            | EngineError::SessionNotFound { .. }
            | EngineError::EntityNotFound { .. } => 404,
            EngineError::SessionBusy { .. } | EngineError::PublishInProgress { .. } => 409,
            EngineError::RateLimitExceeded => 429,
            EngineError::Llm(_) | EngineError::ToolFailed { .. } => 502,
            EngineError::TurnDeadlineExceeded { .. } => 504,
            EngineError::RuleViolation { .. }
            | EngineError::PublishFailed { .. }
            | EngineError::Serialization(_)
            | EngineError::Internal(_) => 500,
        }
    }
}

/// One NOT_FOUND code per catalogue entity, keyed by the entity label used
/// when the error was raised.
fn entity_code(entity: &str) -> &'static str {
    match entity {
        "rule" => "RULE_NOT_FOUND",
        "scenario" => "SCENARIO_NOT_FOUND",
        "template" => "TEMPLATE_NOT_FOUND",
        "variable" => "VARIABLE_NOT_FOUND",
        "intent" => "INTENT_NOT_FOUND",
        "glossary_item" => "GLOSSARY_ITEM_NOT_FOUND",
        "tool_activation" => "TOOL_ACTIVATION_NOT_FOUND",
        "customer_data_field" => "CUSTOMER_DATA_FIELD_NOT_FOUND",
        "migration_plan" => "MIGRATION_PLAN_NOT_FOUND",
        "profile" => "PROFILE_NOT_FOUND",
        _ => "ENTITY_NOT_FOUND",
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_table() {
        assert_eq!(EngineError::InvalidRequest("x".into()).http_status(), 400);
        assert_eq!(
            EngineError::SessionBusy { id: "s".into() }.http_status(),
            409
        );
        assert_eq!(EngineError::RateLimitExceeded.http_status(), 429);
        assert_eq!(EngineError::Llm("boom".into()).http_status(), 502);
        assert_eq!(
            EngineError::TurnDeadlineExceeded { ms: 30000 }.http_status(),
            504
        );
        assert_eq!(EngineError::Internal("x".into()).http_status(), 500);
    }

    #[test]
    fn entity_not_found_codes() {
        let e = EngineError::EntityNotFound {
            entity: "rule",
            id: "r1".into(),
        };
        assert_eq!(e.code(), "RULE_NOT_FOUND");
        assert_eq!(e.http_status(), 404);
    }
}
