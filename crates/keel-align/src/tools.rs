//! Tool binding resolution and execution around generation.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use keel_catalog::types::{ToolBinding, ToolTiming};

use crate::types::ToolResult;

/// Executes one platform tool. Implementations live outside the core.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(
        &self,
        tool_id: &str,
        params: &serde_json::Map<String, Value>,
    ) -> Result<Value, String>;
}

/// Resolves the plan's tool bindings through the injected executor, keyed by
/// tool id. Failures are recorded, never thrown: the planner decides whether
/// a missing result matters (a failed tool bound to a hard constraint
/// triggers the enforcer's fallback path).
pub struct ToolBindingCollector<'a> {
    executor: &'a dyn ToolExecutor,
}

impl<'a> ToolBindingCollector<'a> {
    pub fn new(executor: &'a dyn ToolExecutor) -> Self {
        Self { executor }
    }

    pub async fn run(
        &self,
        bindings: &[ToolBinding],
        timing: ToolTiming,
    ) -> HashMap<String, ToolResult> {
        let mut results = HashMap::new();
        for binding in bindings.iter().filter(|b| b.timing == timing) {
            if results.contains_key(&binding.tool_id) {
                continue;
            }
            let start = Instant::now();
            let outcome = self.executor.execute(&binding.tool_id, &binding.params).await;
            let duration_ms = start.elapsed().as_millis() as u64;
            let result = match outcome {
                Ok(output) => {
                    info!(tool = %binding.tool_id, duration_ms, "tool executed");
                    ToolResult {
                        tool_id: binding.tool_id.clone(),
                        output: Some(output),
                        error: None,
                        duration_ms,
                    }
                }
                Err(reason) => {
                    warn!(tool = %binding.tool_id, %reason, "tool failed");
                    ToolResult {
                        tool_id: binding.tool_id.clone(),
                        output: None,
                        error: Some(reason),
                        duration_ms,
                    }
                }
            };
            results.insert(binding.tool_id.clone(), result);
        }
        results
    }
}

/// No-op executor for deployments without a tool runtime.
pub struct NullToolExecutor;

#[async_trait]
impl ToolExecutor for NullToolExecutor {
    async fn execute(
        &self,
        tool_id: &str,
        _params: &serde_json::Map<String, Value>,
    ) -> Result<Value, String> {
        Err(format!("no tool runtime configured (tool {tool_id})"))
    }
}
