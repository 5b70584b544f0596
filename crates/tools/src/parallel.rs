//! The `parallel` tool: fan a batch of sub-calls out over a bounded number
//! of workers and return every result in input order.
//!
//! A failing sub-call yields an entry with a non-empty `error`; its siblings
//! keep running.

use async_trait::async_trait;
use futures::future::join_all;
use rustedloop_core::tool::decode_params;
use rustedloop_core::{Tool, ToolCall, ToolError, ToolRegistry, ToolResult};
use rustedloop_security::AuthorizationGate;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::dispatcher::Dispatcher;

pub const PARALLEL_TOOL_NAME: &str = "parallel";

#[derive(Debug, Deserialize)]
struct ParallelParams {
    calls: Vec<SubCall>,
}

#[derive(Debug, Deserialize)]
struct SubCall {
    name: String,
    #[serde(default = "empty_object")]
    parameters: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// One entry of the aggregated result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubResult {
    pub name: String,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default)]
    pub error: String,
}

pub struct ParallelTool {
    dispatcher: Dispatcher,
    max_workers: usize,
}

impl ParallelTool {
    /// `registry` holds the tools sub-calls may use.
    pub fn new(registry: ToolRegistry, gate: Option<AuthorizationGate>, max_workers: usize) -> Self {
        let dispatcher = Dispatcher::new(registry);
        Self {
            dispatcher: match gate {
                Some(gate) => dispatcher.with_gate(gate),
                None => dispatcher,
            },
            max_workers: max_workers.max(1),
        }
    }

    async fn run_one(
        &self,
        cancel: &CancellationToken,
        semaphore: &Semaphore,
        index: usize,
        sub: SubCall,
    ) -> SubResult {
        let name = sub.name;
        if name == PARALLEL_TOOL_NAME {
            return SubResult {
                name,
                value: serde_json::Value::Null,
                error: "nested parallel calls are not allowed".into(),
            };
        }

        let Ok(_permit) = semaphore.acquire().await else {
            return SubResult {
                name,
                value: serde_json::Value::Null,
                error: "worker pool closed".into(),
            };
        };

        debug!(index, tool = %name, "Parallel sub-call started");
        let call = ToolCall::new(format!("parallel-{index}"), name.clone(), sub.parameters);
        let result = self.dispatcher.execute(cancel, call).await;

        let error = if result.requires_user_input {
            format!("requires approval: {}", result.reason)
        } else {
            result.error
        };
        SubResult {
            name,
            value: result.value,
            error,
        }
    }
}

#[async_trait]
impl Tool for ParallelTool {
    fn name(&self) -> &str {
        PARALLEL_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Run several independent tool calls concurrently. Results come back in the order given."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "calls": {
                    "type": "array",
                    "description": "Tool calls to run",
                    "items": {
                        "type": "object",
                        "properties": {
                            "name": { "type": "string" },
                            "parameters": { "type": "object" }
                        },
                        "required": ["name"]
                    }
                }
            },
            "required": ["calls"]
        })
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        parameters: serde_json::Value,
    ) -> Result<ToolResult, ToolError> {
        let params: ParallelParams = decode_params(self.name(), parameters)?;
        let semaphore = Semaphore::new(self.max_workers);

        let results: Vec<SubResult> = join_all(
            params
                .calls
                .into_iter()
                .enumerate()
                .map(|(index, sub)| self.run_one(cancel, &semaphore, index, sub)),
        )
        .await;

        let failed = results.iter().filter(|r| !r.error.is_empty()).count();
        debug!(total = results.len(), failed, "Parallel batch finished");

        Ok(ToolResult::ok(serde_json::json!({ "results": results })))
    }
}
