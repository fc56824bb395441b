use thiserror::Error;

#[derive(Debug, Error)]
pub enum CustomerDataError {
    #[error("profile not found: {id}")]
    NotFound { id: String },

    #[error("channel identity already linked to another profile")]
    IdentityTaken,

    #[error("cache error: {0}")]
    Cache(#[from] keel_core::cache::CacheError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CustomerDataError>;
