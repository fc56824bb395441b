pub mod embedding;
pub mod executor;
pub mod json;
pub mod mock;
pub mod provider;
pub mod rerank;
pub mod template;

pub use embedding::{EmbeddingProvider, MockEmbeddingProvider};
pub use executor::LlmExecutor;
pub use provider::{ChatMessage, ChatRequest, ChatResponse, LlmProvider, ProviderError, Role};
pub use rerank::{RerankProvider, RerankedItem};
pub use template::TextTemplate;
