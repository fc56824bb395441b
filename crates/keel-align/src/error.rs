use thiserror::Error;

#[derive(Debug, Error)]
pub enum AlignError {
    #[error("llm error: {0}")]
    Llm(#[from] keel_llm::ProviderError),

    #[error("catalog error: {0}")]
    Catalog(#[from] keel_catalog::CatalogError),

    #[error("expression error: {0}")]
    Expression(String),

    #[error("tool failed ({tool_id}): {reason}")]
    ToolFailed { tool_id: String, reason: String },

    #[error("orchestration error: {0}")]
    Orchestration(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AlignError>;
