use thiserror::Error;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("scenario not found: {id}")]
    ScenarioNotFound { id: String },

    #[error("migration plan not found: {id}")]
    PlanNotFound { id: String },

    #[error("invalid plan transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("scenario checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("floats are not permitted in hashed payloads")]
    FloatInHashPayload,

    #[error("catalog error: {0}")]
    Catalog(#[from] keel_catalog::CatalogError),

    #[error("session error: {0}")]
    Session(#[from] keel_sessions::SessionError),

    #[error("customer data error: {0}")]
    CustomerData(#[from] keel_customer::CustomerDataError),
}

pub type Result<T> = std::result::Result<T, MigrationError>;
