use async_trait::async_trait;

use crate::provider::ProviderError;

/// One reranked candidate: original position plus the provider's score.
#[derive(Debug, Clone)]
pub struct RerankedItem {
    /// Index into the candidate list passed to `rerank`.
    pub index: usize,
    pub score: f64,
}

/// External reranking provider interface.
///
/// Given the raw user message and candidate condition texts, returns the
/// candidates reordered by the provider's own relevance scoring. Callers keep
/// their payloads and only consume the new order.
#[async_trait]
pub trait RerankProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
    ) -> Result<Vec<RerankedItem>, ProviderError>;
}
