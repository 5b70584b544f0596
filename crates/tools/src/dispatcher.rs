//! Tool dispatch: lookup, validation, authorization and execution.
//!
//! Every call goes through the same two phases. `prepare` resolves the
//! tool, validates parameters against its schema and consults the
//! authorization gate; `run` executes it under the caller's cancellation
//! token (and, if configured, lets it be detached into a background job).
//! When an executor actor is attached, both phases are driven by that actor
//! instead of the caller.

use std::sync::Arc;
use std::time::Instant;

use rustedloop_actors::ActorRef;
use rustedloop_core::{AuthDecision, Tool, ToolCall, ToolError, ToolRegistry, ToolResult};
use rustedloop_security::AuthorizationGate;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::executor::ExecMessage;
use crate::jobs::{Background, ToolFuture, run_detachable};
use crate::validate::validate_params;

/// A resolved, validated and authorized call, ready to run.
pub struct Prepared {
    tool: Arc<dyn Tool>,
    call: ToolCall,
}

/// Executes tool calls on behalf of the loop.
#[derive(Clone, Default)]
pub struct Dispatcher {
    registry: ToolRegistry,
    gate: Option<AuthorizationGate>,
    executor: Option<ActorRef<ExecMessage>>,
    background: Option<Background>,
}

impl Dispatcher {
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            registry,
            ..Self::default()
        }
    }

    pub fn with_gate(mut self, gate: AuthorizationGate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_background(mut self, background: Background) -> Self {
        self.background = Some(background);
        self
    }

    /// Route every execution through the executor actor.
    pub fn with_executor_actor(mut self, executor: ActorRef<ExecMessage>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn gate(&self) -> Option<&AuthorizationGate> {
        self.gate.as_ref()
    }

    /// A copy that runs calls itself, used inside the executor actor.
    pub(crate) fn local(&self) -> Self {
        Self {
            executor: None,
            ..self.clone()
        }
    }

    /// Check a call's parameters against the tool's schema.
    pub fn validate(&self, call: &ToolCall) -> Result<(), ToolError> {
        let tool = self
            .registry
            .get(&call.name)
            .ok_or_else(|| ToolError::NotFound(call.name.clone()))?;
        validate_params(&call.name, &tool.parameters_schema(), &call.parameters)
    }

    /// Execute a call, consulting the authorization gate first.
    pub async fn execute(&self, cancel: &CancellationToken, call: ToolCall) -> ToolResult {
        self.dispatch(cancel, call, true).await
    }

    /// Execute a call a human has already approved. Skips the gate for this
    /// call only.
    pub async fn execute_with_approval(&self, cancel: &CancellationToken, call: ToolCall) -> ToolResult {
        self.dispatch(cancel, call, false).await
    }

    async fn dispatch(&self, cancel: &CancellationToken, call: ToolCall, check_gate: bool) -> ToolResult {
        let Some(executor) = &self.executor else {
            return match self.prepare(cancel, call, check_gate).await {
                Ok(prepared) => self.run(cancel, prepared).await,
                Err(result) => result,
            };
        };

        let name = call.name.clone();
        let request = executor
            .request(cancel, |reply| ExecMessage::Run {
                call,
                check_gate,
                cancel: cancel.clone(),
                reply,
            })
            .await;

        match request {
            Ok(result) => result,
            Err(e) if cancel.is_cancelled() => ToolError::Cancelled(format!("{name}: {e}")).into(),
            Err(e) => ToolError::ExecutionFailed {
                tool_name: name,
                reason: e.to_string(),
            }
            .into(),
        }
    }

    /// Resolve, validate and authorize a call.
    ///
    /// Returns the result to report instead when the call must not run.
    pub async fn prepare(
        &self,
        cancel: &CancellationToken,
        call: ToolCall,
        check_gate: bool,
    ) -> Result<Prepared, ToolResult> {
        let Some(tool) = self.registry.get(&call.name) else {
            return Err(ToolError::NotFound(call.name).into());
        };

        validate_params(&call.name, &tool.parameters_schema(), &call.parameters)
            .map_err(ToolResult::from)?;

        if check_gate
            && let (Some(gate), Some(request)) =
                (&self.gate, tool.requires_authorization(&call.parameters))
        {
            let decision = gate.check(cancel, request).await.map_err(|e| {
                ToolResult::from(ToolError::PermissionDenied {
                    tool_name: call.name.clone(),
                    reason: format!("authorization unavailable: {e}"),
                })
            })?;

            match decision {
                AuthDecision::Allowed => {}
                AuthDecision::Denied(reason) => {
                    warn!(tool = %call.name, %reason, "Tool call denied");
                    return Err(ToolError::PermissionDenied {
                        tool_name: call.name,
                        reason,
                    }
                    .into());
                }
                AuthDecision::NeedsApproval {
                    reason,
                    suggested_prefix,
                } => {
                    debug!(tool = %call.name, %reason, "Tool call needs approval");
                    return Err(ToolResult::needs_approval(reason, suggested_prefix));
                }
            }
        }

        Ok(Prepared { tool, call })
    }

    /// Execute a prepared call.
    pub async fn run(&self, cancel: &CancellationToken, prepared: Prepared) -> ToolResult {
        let Prepared { tool, call } = prepared;
        let started = Instant::now();
        let name = call.name.clone();

        let fut: ToolFuture = {
            let cancel = cancel.clone();
            Box::pin(async move {
                let name = call.name;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => ToolResult::from(ToolError::Cancelled(name)),
                    result = tool.execute(&cancel, call.parameters) => {
                        result.unwrap_or_else(ToolResult::from)
                    }
                }
            })
        };

        let result = match &self.background {
            Some(background) => run_detachable(cancel, &name, fut, background).await,
            None => fut.await,
        };

        debug!(
            tool = %name,
            success = !result.is_error(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Tool finished"
        );
        result
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("tools", &self.registry)
            .field("gated", &self.gate.is_some())
            .field("executor", &self.executor.is_some())
            .field("background", &self.background.is_some())
            .finish()
    }
}
