use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("cross-tenant access rejected for {entity} {id}")]
    TenantMismatch { entity: &'static str, id: String },

    #[error("publish already in progress for agent {agent_id}")]
    PublishInProgress { agent_id: String },

    #[error("publish failed at stage {stage}: {reason}")]
    PublishFailed { stage: &'static str, reason: String },

    #[error("database error: {0}")]
    Database(String),

    #[error("cache error: {0}")]
    Cache(#[from] keel_core::cache::CacheError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("embedding error: {0}")]
    Embedding(String),
}

impl From<rusqlite::Error> for CatalogError {
    fn from(e: rusqlite::Error) -> Self {
        CatalogError::Database(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CatalogError>;
