//! Scripted LLM provider for tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::provider::{ChatRequest, ChatResponse, LlmProvider, ProviderError};

/// Returns queued responses in order, falling back to a default once the
/// script is exhausted. Records every request for assertions.
pub struct MockLlmProvider {
    script: Mutex<VecDeque<String>>,
    default_response: String,
    requests: Mutex<Vec<ChatRequest>>,
}

impl MockLlmProvider {
    pub fn new(default_response: impl Into<String>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_response: default_response.into(),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue the next scripted response.
    pub fn push_response(&self, content: impl Into<String>) {
        self.script.lock().unwrap().push_back(content.into());
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<ChatRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl LlmProvider for MockLlmProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.requests.lock().unwrap().push(req.clone());
        let content = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_response.clone());
        Ok(ChatResponse {
            content,
            model: req.model.clone(),
            tokens_in: (req.system.len() / 4) as u32,
            tokens_out: 16,
            stop_reason: "end_turn".to_string(),
        })
    }
}
