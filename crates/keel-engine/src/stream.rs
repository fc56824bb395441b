//! Streaming turn events.
//!
//! Callers that serve SSE map these events one-to-one onto the wire. The
//! engine's generation path is not token-streaming end to end, so the stream
//! emits the finished response in chunks followed by `Done`: the same
//! fallback a non-streaming provider uses.

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use keel_core::{SessionId, TurnId};

use crate::engine::{AlignmentEngine, TurnRequest};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnStreamEvent {
    Token {
        content: String,
    },
    Done {
        turn_id: TurnId,
        session_id: SessionId,
        matched_rules: usize,
        tools_called: usize,
        tokens_used: u32,
        latency_ms: f64,
    },
    Error {
        code: &'static str,
        message: String,
    },
}

/// Chunk size for the token events (characters).
const CHUNK_CHARS: usize = 24;

impl AlignmentEngine {
    /// Process a turn and emit stream events. Errors flow as one `Error`
    /// event and close the stream.
    pub async fn process_turn_stream(
        &self,
        request: TurnRequest,
        tx: mpsc::Sender<TurnStreamEvent>,
        cancel: Option<CancellationToken>,
    ) {
        match self.process_turn(request, cancel).await {
            Ok(result) => {
                let chars: Vec<char> = result.response.chars().collect();
                for chunk in chars.chunks(CHUNK_CHARS) {
                    let content: String = chunk.iter().collect();
                    if tx.send(TurnStreamEvent::Token { content }).await.is_err() {
                        return;
                    }
                }
                let tools_called = result
                    .tool_results
                    .as_object()
                    .map(|m| m.len())
                    .unwrap_or(0);
                let _ = tx
                    .send(TurnStreamEvent::Done {
                        turn_id: result.turn_id,
                        session_id: result.session_id,
                        matched_rules: result.matched_rules.len(),
                        tools_called,
                        tokens_used: result.generation.tokens_in + result.generation.tokens_out,
                        latency_ms: result.total_time_ms,
                    })
                    .await;
            }
            Err(e) => {
                let _ = tx
                    .send(TurnStreamEvent::Error {
                        code: e.code(),
                        message: e.to_string(),
                    })
                    .await;
            }
        }
    }
}
