//! The orchestration loop.
//!
//! One run drives a session until the model gives a final answer, repeats
//! itself, runs out of auto-continue attempts or hits the iteration cap.
//! Each iteration builds a request from the session, measures context
//! usage (starting a background compaction when the window is nearly full),
//! calls the model through the judged retry path, appends the reply and
//! executes any tool calls in order.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::Utc;
use rustedloop_config::AppConfig;
use rustedloop_core::provider::CacheOptions;
use rustedloop_core::{
    EventBus, LlmClient, LlmRequest, LlmResponse, LoopEvent, Message, MessageToolCall,
    PrefixStore, ProviderError, Result, Session, StreamChunk, ToolCall, ToolDefinition, ToolError,
    ToolResult,
};
use rustedloop_tools::Dispatcher;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auto_continue::{CONTINUE_PROMPT, ContinueContext, ContinueStrategy};
use crate::callbacks::LoopCallbacks;
use crate::context::ContextManager;
use crate::context::compactor::{CompactionOutcome, Compactor};
use crate::loop_detect::{LoopDetection, LoopDetector};
use crate::retry::{ErrorDecision, ErrorJudge, HeuristicJudge, retry_with_judge};

/// Text recorded when a human turns down a gated tool call.
pub const DENIED_BY_USER: &str = "Operation denied by user";

/// Status sent before a retry when the failed attempt already streamed output.
pub const PARTIAL_RESPONSE_DISCARDED: &str = "Partial response discarded, retrying";

/// Builds the system prompt for each request.
pub trait SystemPromptProvider: Send + Sync {
    fn system_prompt(&self, tools: &[ToolDefinition]) -> String;
}

/// A fixed system prompt.
#[derive(Debug, Clone)]
pub struct StaticPrompt(pub String);

impl SystemPromptProvider for StaticPrompt {
    fn system_prompt(&self, _tools: &[ToolDefinition]) -> String {
        self.0.clone()
    }
}

/// Everything a run talks to.
#[derive(Clone)]
pub struct Dependencies {
    pub client: Arc<dyn LlmClient>,
    pub session: Arc<Session>,
    pub tools: Dispatcher,
    pub system_prompt: Arc<dyn SystemPromptProvider>,
    pub context: Arc<ContextManager>,
    /// Where approved command prefixes are remembered across runs
    pub prefix_store: Option<Arc<dyn PrefixStore>>,
    pub judge: Arc<dyn ErrorJudge>,
    pub events: Option<EventBus>,
}

impl Dependencies {
    /// Dependencies with the heuristic judge, no prefix store and no events.
    pub fn new(
        client: Arc<dyn LlmClient>,
        session: Arc<Session>,
        tools: Dispatcher,
        system_prompt: Arc<dyn SystemPromptProvider>,
        context: Arc<ContextManager>,
    ) -> Self {
        Self {
            client,
            session,
            tools,
            system_prompt,
            context,
            prefix_store: None,
            judge: Arc::new(HeuristicJudge),
            events: None,
        }
    }

    pub fn with_prefix_store(mut self, store: Arc<dyn PrefixStore>) -> Self {
        self.prefix_store = Some(store);
        self
    }

    pub fn with_judge(mut self, judge: Arc<dyn ErrorJudge>) -> Self {
        self.judge = judge;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }
}

/// Limits and request parameters for a run.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub max_iterations: usize,
    pub loop_threshold: usize,
    pub max_auto_continue_attempts: usize,
    pub retry_max_attempts: u32,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Synchronous compactions allowed per run after the provider rejects
    /// a request as too large
    pub max_compaction_attempts: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 256,
            loop_threshold: 3,
            max_auto_continue_attempts: 3,
            retry_max_attempts: 5,
            temperature: None,
            max_tokens: None,
            max_compaction_attempts: 3,
        }
    }
}

impl LoopConfig {
    pub fn from_config(config: &AppConfig) -> Self {
        let model = &config.model.orchestration;
        Self {
            max_iterations: config.agent.max_iterations,
            loop_threshold: config.agent.loop_threshold,
            max_auto_continue_attempts: config.agent.max_auto_continue_attempts(model),
            retry_max_attempts: config.retry.max_attempts,
            temperature: Some(config.model.temperature),
            max_tokens: (config.model.max_output_tokens > 0).then_some(config.model.max_output_tokens),
            ..Self::default()
        }
    }

    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max;
        self
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    Completed,
    LoopDetected { pattern: String, count: usize },
    IterationLimit,
    AutoContinueExhausted,
}

impl Terminal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::LoopDetected { .. } => "loop_detected",
            Self::IterationLimit => "iteration_limit",
            Self::AutoContinueExhausted => "auto_continue_exhausted",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub terminal: Terminal,
    /// Content of the last assistant reply
    pub final_content: String,
    pub iterations: usize,
    /// Compactions started during the run
    pub compactions: usize,
}

/// Result of one iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Continue,
    CompactionNeeded,
    Break(String),
    BreakLoopDetected(LoopDetection),
    AutoContinueExhausted(String),
}

/// Per-run bookkeeping.
#[derive(Debug)]
struct LoopState {
    iteration: usize,
    detector: LoopDetector,
    auto_continues: usize,
    forced_compactions: usize,
    compactions: usize,
    last_content: String,
}

impl LoopState {
    fn new(config: &LoopConfig) -> Self {
        Self {
            iteration: 0,
            detector: LoopDetector::new(config.loop_threshold),
            auto_continues: 0,
            forced_compactions: 0,
            compactions: 0,
            last_content: String::new(),
        }
    }
}

pub struct Orchestrator {
    deps: Dependencies,
    config: LoopConfig,
    strategy: Arc<dyn ContinueStrategy>,
    compactor: Compactor,
}

impl Orchestrator {
    pub fn new(deps: Dependencies, config: LoopConfig, strategy: impl ContinueStrategy + 'static) -> Self {
        let compactor = match &deps.events {
            Some(bus) => Compactor::with_events(
                Arc::clone(&deps.session),
                Arc::clone(&deps.context),
                bus.clone(),
            ),
            None => Compactor::new(Arc::clone(&deps.session), Arc::clone(&deps.context)),
        };
        Self {
            deps,
            config,
            strategy: Arc::new(strategy),
            compactor,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.deps.session
    }

    pub fn compactor(&self) -> &Compactor {
        &self.compactor
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Append `prompt` as a user message and run until a terminal state.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
        callbacks: &LoopCallbacks,
    ) -> Result<LoopOutcome> {
        self.deps.session.add_message(Message::user(prompt));
        self.resume(cancel, callbacks).await
    }

    /// Run on the session as it stands.
    pub async fn resume(&self, cancel: &CancellationToken, callbacks: &LoopCallbacks) -> Result<LoopOutcome> {
        let session_id = self.deps.session.id().to_string();
        info!(
            session_id = %session_id,
            messages = self.deps.session.len(),
            strategy = self.strategy.name(),
            "Starting agent loop"
        );

        let mut state = LoopState::new(&self.config);
        let terminal = loop {
            if state.iteration >= self.config.max_iterations {
                warn!(
                    session_id = %session_id,
                    iterations = state.iteration,
                    "Iteration limit reached, stopping"
                );
                callbacks.status("Stopped: iteration limit reached");
                break Terminal::IterationLimit;
            }
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled.into());
            }
            state.iteration += 1;

            match self.step(cancel, callbacks, &mut state).await? {
                Transition::Continue | Transition::CompactionNeeded => {}
                Transition::Break(content) => {
                    state.last_content = content;
                    break Terminal::Completed;
                }
                Transition::BreakLoopDetected(detection) => {
                    warn!(
                        session_id = %session_id,
                        pattern = %detection.pattern,
                        count = detection.count,
                        "Model is repeating itself, stopping"
                    );
                    callbacks.status("Stopped: the model keeps repeating the same output");
                    self.publish(LoopEvent::LoopDetected {
                        pattern: detection.pattern.clone(),
                        count: detection.count,
                    });
                    break Terminal::LoopDetected {
                        pattern: detection.pattern,
                        count: detection.count,
                    };
                }
                Transition::AutoContinueExhausted(content) => {
                    warn!(
                        session_id = %session_id,
                        attempts = state.auto_continues,
                        "Auto-continue attempts exhausted, stopping"
                    );
                    state.last_content = content;
                    break Terminal::AutoContinueExhausted;
                }
            }
        };

        info!(
            session_id = %session_id,
            terminal = terminal.as_str(),
            iterations = state.iteration,
            compactions = state.compactions,
            "Agent loop finished"
        );
        self.publish(LoopEvent::Finished {
            session_id,
            terminal: terminal.as_str().to_string(),
            iterations: state.iteration,
            timestamp: Utc::now(),
        });

        Ok(LoopOutcome {
            terminal,
            final_content: state.last_content,
            iterations: state.iteration,
            compactions: state.compactions,
        })
    }

    async fn step(
        &self,
        cancel: &CancellationToken,
        callbacks: &LoopCallbacks,
        state: &mut LoopState,
    ) -> Result<Transition> {
        let session = &self.deps.session;
        let session_id = session.id().to_string();
        debug!(session_id = %session_id, iteration = state.iteration, "Agent loop iteration");
        self.publish(LoopEvent::IterationStarted {
            session_id: session_id.clone(),
            iteration: state.iteration,
            timestamp: Utc::now(),
        });

        // ── Build request ──
        let tools = self.deps.tools.registry().definitions();
        let system_prompt = self.deps.system_prompt.system_prompt(&tools);
        let messages = session.messages();
        let total = self.report_usage(callbacks, &system_prompt, &messages);

        if self.deps.context.should_compact(messages.len(), total)
            && self
                .compactor
                .trigger_background(cancel, system_prompt.clone(), callbacks.status_fn())
        {
            state.compactions += 1;
            info!(session_id = %session_id, tokens = total, "Started background compaction");
            callbacks.status("Compacting earlier conversation");
        }

        let request = LlmRequest {
            messages,
            tools,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            system_prompt: Some(system_prompt.clone()),
            cache: CacheOptions {
                cache_system_prompt: true,
                cache_tools: true,
            },
        };

        // ── Call model ──
        self.deps.client.set_previous_response_id(session.previous_response_id());
        let response = match self.call_model(cancel, callbacks, request).await {
            Ok(response) => response,
            Err(e) if e.is_tool_validation() => {
                warn!(error = %e, "Provider rejected a tool call, asking the model to fix it");
                session.add_message(Message::synthetic_user(format!(
                    "Your last tool call was rejected: {e}. \
                     Check the tool's parameter schema and call it again with valid arguments."
                )));
                return Ok(Transition::Continue);
            }
            Err(e) if e.is_context_length() => {
                return self.recover_context(cancel, callbacks, state, &system_prompt, e).await;
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(id) = self.deps.client.last_response_id() {
            session.set_previous_response_id(Some(id));
        }

        // ── Record reply ──
        let content = response.content.clone();
        let truncated = response.is_truncated();
        let tool_calls = response.tool_calls.clone();
        session.add_message(response.into_message());
        state.last_content = content.clone();

        if let Some(detection) = state.detector.observe(&output_signature(&content, &tool_calls)) {
            return Ok(Transition::BreakLoopDetected(detection));
        }

        // ── Auto-continue ──
        if tool_calls.is_empty() || truncated {
            let ctx = ContinueContext {
                content: &content,
                truncated,
                has_tool_calls: !tool_calls.is_empty(),
            };
            if self.strategy.should_continue(cancel, &ctx).await {
                if state.auto_continues >= self.config.max_auto_continue_attempts {
                    return Ok(Transition::AutoContinueExhausted(content));
                }
                state.auto_continues += 1;
                debug!(attempt = state.auto_continues, truncated, "Auto-continuing");
                callbacks.status("Response looks unfinished, continuing");
                for call in &tool_calls {
                    session.add_message(Message::tool_result(
                        &call.id,
                        &call.name,
                        "Error: not executed because the response was cut off",
                    ));
                }
                session.add_message(Message::synthetic_user(CONTINUE_PROMPT));
                return Ok(Transition::Continue);
            }
            if tool_calls.is_empty() {
                return Ok(Transition::Break(content));
            }
        }

        // ── Execute tools ──
        let mut corrections = Vec::new();
        for call in &tool_calls {
            self.execute_tool_call(cancel, callbacks, call, &mut corrections).await;
        }
        for correction in corrections {
            session.add_message(Message::synthetic_user(correction));
        }
        state.auto_continues = 0;

        self.report_usage(callbacks, &system_prompt, &session.messages());
        Ok(Transition::Continue)
    }

    async fn call_model(
        &self,
        cancel: &CancellationToken,
        callbacks: &LoopCallbacks,
        request: LlmRequest,
    ) -> std::result::Result<LlmResponse, ProviderError> {
        let client = self.deps.client.as_ref();
        let stream = callbacks.wants_stream();
        let streamed = AtomicBool::new(false);
        let on_retry = |attempt: u32, decision: &ErrorDecision| {
            if streamed.swap(false, Ordering::Relaxed) {
                callbacks.status(PARTIAL_RESPONSE_DISCARDED);
            }
            callbacks.status(&decision.status_text());
            self.publish(LoopEvent::RetryScheduled {
                attempt,
                sleep_secs: decision.sleep_seconds,
                reason: decision.reason.clone(),
            });
        };

        retry_with_judge(
            cancel,
            self.deps.judge.as_ref(),
            self.config.retry_max_attempts,
            &on_retry,
            || {
                let request = request.clone();
                let streamed = &streamed;
                async move {
                    if !stream {
                        return client.complete_with_request(cancel, request).await;
                    }
                    let on_chunk = |chunk: StreamChunk| {
                        streamed.store(true, Ordering::Relaxed);
                        match chunk {
                            StreamChunk::Content(text) => callbacks.content(&text),
                            StreamChunk::Reasoning(text) => callbacks.reasoning(&text),
                        }
                    };
                    client.stream(cancel, request, &on_chunk).await
                }
            },
        )
        .await
    }

    /// The provider said the request does not fit: compact on this task.
    async fn recover_context(
        &self,
        cancel: &CancellationToken,
        callbacks: &LoopCallbacks,
        state: &mut LoopState,
        system_prompt: &str,
        error: ProviderError,
    ) -> Result<Transition> {
        state.forced_compactions += 1;
        if state.forced_compactions > self.config.max_compaction_attempts {
            warn!(
                attempts = self.config.max_compaction_attempts,
                "Context still too large after compaction"
            );
            return Err(error.into());
        }

        callbacks.status("Context window exceeded, compacting");
        let mut outcome = self.compactor.compact_now(cancel, system_prompt).await;
        if outcome == CompactionOutcome::AlreadyRunning {
            outcome = self
                .compactor
                .join_background()
                .await
                .unwrap_or(CompactionOutcome::Stale);
        } else {
            state.compactions += 1;
        }

        match outcome {
            CompactionOutcome::NothingToCompact => {
                warn!(error = %error, "Context too large and nothing left to compact");
                Err(error.into())
            }
            outcome => {
                debug!(?outcome, "Forced compaction finished");
                Ok(Transition::CompactionNeeded)
            }
        }
    }

    async fn execute_tool_call(
        &self,
        cancel: &CancellationToken,
        callbacks: &LoopCallbacks,
        raw: &MessageToolCall,
        corrections: &mut Vec<String>,
    ) {
        let started = Instant::now();
        let result = match parse_arguments(&raw.arguments) {
            Ok(parameters) => {
                let call = ToolCall::new(&raw.id, &raw.name, parameters);
                callbacks.tool_call(&call);
                let result = self.dispatch(cancel, callbacks, call.clone(), corrections).await;
                callbacks.tool_result(&call, &result);
                result
            }
            Err(e) => {
                warn!(tool = %raw.name, error = %e, "Tool arguments are not valid JSON");
                ToolResult::err(format!(
                    "Could not parse the arguments of '{}' as JSON ({e}). \
                     Send the arguments as a single JSON object.",
                    raw.name
                ))
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        debug!(tool = %raw.name, success = !result.is_error(), duration_ms, "Tool call done");
        self.publish(LoopEvent::ToolExecuted {
            tool_name: raw.name.clone(),
            success: !result.is_error(),
            duration_ms,
            timestamp: Utc::now(),
        });
        self.deps
            .session
            .add_message(Message::tool_result(&raw.id, &raw.name, result.output_text()));
    }

    async fn dispatch(
        &self,
        cancel: &CancellationToken,
        callbacks: &LoopCallbacks,
        call: ToolCall,
        corrections: &mut Vec<String>,
    ) -> ToolResult {
        let tools = &self.deps.tools;
        if let Err(ToolError::MissingParameter { tool_name, parameter }) = tools.validate(&call) {
            corrections.push(format!(
                "The call to '{tool_name}' was missing the required parameter '{parameter}'. \
                 Call it again with every required parameter."
            ));
            return ToolError::MissingParameter { tool_name, parameter }.into();
        }

        let result = tools.execute(cancel, call.clone()).await;
        if !result.requires_user_input {
            return result;
        }
        self.approve_and_run(cancel, callbacks, call, result).await
    }

    /// Ask a human about a gated call; remember the prefix if approved.
    async fn approve_and_run(
        &self,
        cancel: &CancellationToken,
        callbacks: &LoopCallbacks,
        call: ToolCall,
        pending: ToolResult,
    ) -> ToolResult {
        let session = &self.deps.session;
        let prefix = pending.suggested_prefix.clone();

        if prefix.as_deref().is_some_and(|p| session.is_command_authorized(p)) {
            debug!(tool = %call.name, "Prefix already approved in this session");
            return self.deps.tools.execute_with_approval(cancel, call).await;
        }

        let approved = callbacks
            .authorize(cancel, &call.name, &call.parameters, &pending.reason)
            .await;
        match approved {
            Ok(true) => {}
            Ok(false) => {
                info!(tool = %call.name, "Tool call denied by user");
                return ToolResult::err(DENIED_BY_USER);
            }
            Err(e) => {
                warn!(tool = %call.name, error = %e, "Authorization callback failed");
                return ToolResult::err(format!("{DENIED_BY_USER}: {e}"));
            }
        }

        if let Some(prefix) = prefix {
            self.remember_prefix(cancel, &prefix).await;
        }
        self.deps.tools.execute_with_approval(cancel, call).await
    }

    async fn remember_prefix(&self, cancel: &CancellationToken, prefix: &str) {
        self.deps.session.authorize_command(prefix);

        if let Some(gate) = self.deps.tools.gate()
            && let Err(e) = gate.grant_prefix(cancel, prefix).await
        {
            warn!(prefix, error = %e, "Could not grant prefix on the gate");
        }

        if let Some(store) = &self.deps.prefix_store
            && !store.contains(prefix)
        {
            let store = Arc::clone(store);
            let owned = prefix.to_string();
            match tokio::task::spawn_blocking(move || store.persist(&owned)).await {
                Ok(Ok(())) => info!(prefix, "Remembered approved prefix"),
                Ok(Err(e)) => warn!(prefix, error = %e, "Could not persist approved prefix"),
                Err(e) => warn!(prefix, error = %e, "Prefix persistence task failed"),
            }
        }
    }

    /// Estimate the request, tell observers and return the total.
    fn report_usage(&self, callbacks: &LoopCallbacks, system_prompt: &str, messages: &[Message]) -> usize {
        let estimate = self.deps.context.estimate(system_prompt, messages);
        let usage = self.deps.context.usage(&estimate);
        callbacks.context_usage(usage.free_percent, usage.window);
        self.publish(LoopEvent::ContextUsage {
            session_id: self.deps.session.id().to_string(),
            total_tokens: usage.total,
            window: usage.window,
            free_percent: usage.free_percent,
            approximate: usage.approximate,
        });
        estimate.total
    }

    fn publish(&self, event: LoopEvent) {
        if let Some(bus) = &self.deps.events {
            bus.publish(event);
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("session_id", self.deps.session.id())
            .field("model", &self.deps.client.model_name())
            .field("tools", &self.deps.tools)
            .field("strategy", &self.strategy.name())
            .field("config", &self.config)
            .finish()
    }
}

/// Empty arguments mean no parameters.
fn parse_arguments(arguments: &str) -> std::result::Result<Value, serde_json::Error> {
    if arguments.trim().is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    serde_json::from_str(arguments)
}

/// What the loop detector compares between turns.
fn output_signature(content: &str, tool_calls: &[MessageToolCall]) -> String {
    let mut signature = content.to_string();
    for call in tool_calls {
        signature.push_str(&format!(" {}({})", call.name, call.arguments));
    }
    signature
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auto_continue::AutoContinue;
    use crate::test_helpers::{EchoTool, ScriptedClient, ShellLikeTool, tool_call_response, truncated};
    use rustedloop_actors::ActorSystem;
    use rustedloop_config::CompactionConfig;
    use rustedloop_core::{Error, StaticProviderManager, ToolRegistry};
    use rustedloop_security::{AuthorizationActor, AuthorizationGate, Grants, InteractiveAuthorizer};
    use serde_json::json;
    use async_trait::async_trait;
    use rustedloop_core::Tool;
    use std::collections::BTreeSet;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::thread::ThreadId;
    use std::time::Duration;

    /// Remembers prefixes and the threads that wrote them.
    #[derive(Default)]
    struct MemoryStore {
        prefixes: Mutex<BTreeSet<String>>,
        writers: Mutex<Vec<ThreadId>>,
    }

    impl PrefixStore for MemoryStore {
        fn contains(&self, prefix: &str) -> bool {
            self.prefixes.lock().unwrap().contains(prefix)
        }
        fn persist(&self, prefix: &str) -> Result<()> {
            self.writers.lock().unwrap().push(std::thread::current().id());
            self.prefixes.lock().unwrap().insert(prefix.to_string());
            Ok(())
        }
    }

    /// Blocks until the run is cancelled.
    struct WaitTool;

    #[async_trait]
    impl Tool for WaitTool {
        fn name(&self) -> &str {
            "wait"
        }
        fn description(&self) -> &str {
            "Waits for cancellation"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object", "properties": {} })
        }
        async fn execute(&self, cancel: &CancellationToken, _parameters: Value) -> std::result::Result<ToolResult, ToolError> {
            cancel.cancelled().await;
            Err(ToolError::Cancelled("wait".into()))
        }
    }

    /// Streams a fragment and drops the connection on the first call, then
    /// streams a full answer.
    struct FlakyStreamClient {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl LlmClient for FlakyStreamClient {
        fn model_name(&self) -> &str {
            "m"
        }

        async fn complete_with_request(
            &self,
            _cancel: &CancellationToken,
            _request: LlmRequest,
        ) -> std::result::Result<LlmResponse, ProviderError> {
            Ok(LlmResponse::text("fresh answer"))
        }

        async fn stream(
            &self,
            _cancel: &CancellationToken,
            _request: LlmRequest,
            on_chunk: &(dyn Fn(StreamChunk) + Send + Sync),
        ) -> std::result::Result<LlmResponse, ProviderError> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                on_chunk(StreamChunk::Content("stale frag".into()));
                return Err(ProviderError::StreamInterrupted("connection reset".into()));
            }
            on_chunk(StreamChunk::Content("fresh answer".into()));
            Ok(LlmResponse::text("fresh answer"))
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(ShellLikeTool::default()));
        registry
    }

    fn deps(client: Arc<ScriptedClient>, tools: Dispatcher) -> Dependencies {
        let providers = Arc::new(StaticProviderManager::new(client.model_name()));
        let context = Arc::new(ContextManager::new(CompactionConfig::default(), providers));
        Dependencies::new(
            client,
            Arc::new(Session::new()),
            tools,
            Arc::new(StaticPrompt("You are a test agent.".into())),
            context,
        )
    }

    fn orchestrator(client: Arc<ScriptedClient>, strategy: AutoContinue) -> Orchestrator {
        Orchestrator::new(deps(client, Dispatcher::new(registry())), LoopConfig::default(), strategy)
    }

    #[tokio::test]
    async fn plain_answer_completes() {
        let client = Arc::new(ScriptedClient::texts("m", &["Hello! How can I help?"]));
        let orch = orchestrator(Arc::clone(&client), AutoContinue::Default);

        let outcome = orch
            .run(&CancellationToken::new(), "Hello!", &LoopCallbacks::new())
            .await
            .unwrap();

        assert_eq!(outcome.terminal, Terminal::Completed);
        assert_eq!(outcome.final_content, "Hello! How can I help?");
        assert_eq!(outcome.iterations, 1);
        assert_eq!(orch.session().len(), 2);
        let request = &client.requests()[0];
        assert_eq!(request.system_prompt.as_deref(), Some("You are a test agent."));
        assert_eq!(request.tools.len(), 2);
    }

    #[tokio::test]
    async fn tool_calls_run_in_order_and_feed_back() {
        let client = Arc::new(ScriptedClient::new(
            "m",
            vec![
                Ok(LlmResponse {
                    tool_calls: vec![
                        MessageToolCall { id: "c1".into(), name: "echo".into(), arguments: r#"{"text":"one"}"#.into() },
                        MessageToolCall { id: "c2".into(), name: "echo".into(), arguments: r#"{"text":"two"}"#.into() },
                    ],
                    ..LlmResponse::default()
                }),
                Ok(LlmResponse::text("Both echoed.")),
            ],
        ));
        let orch = orchestrator(Arc::clone(&client), AutoContinue::Default);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callbacks = LoopCallbacks::new()
            .with_tool_result(move |call, result| sink.lock().unwrap().push((call.id.clone(), result.output_text())));

        let outcome = orch.run(&CancellationToken::new(), "echo twice", &callbacks).await.unwrap();

        assert_eq!(outcome.final_content, "Both echoed.");
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("c1".to_string(), "one".to_string()), ("c2".to_string(), "two".to_string())]
        );
        let messages = orch.session().messages();
        let tool_messages: Vec<_> = messages.iter().filter(|m| m.tool_call_id.is_some()).collect();
        assert_eq!(tool_messages.len(), 2);
        assert_eq!(tool_messages[0].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(client.requests()[1].messages.len(), 4);
    }

    #[tokio::test]
    async fn bad_arguments_are_reported_to_the_model() {
        let client = Arc::new(ScriptedClient::new(
            "m",
            vec![
                Ok(LlmResponse {
                    tool_calls: vec![MessageToolCall {
                        id: "c1".into(),
                        name: "echo".into(),
                        arguments: "{not json".into(),
                    }],
                    ..LlmResponse::default()
                }),
                Ok(tool_call_response("c2", "echo", json!({}))),
                Ok(LlmResponse::text("fixed")),
            ],
        ));
        let orch = orchestrator(client, AutoContinue::Default);
        orch.run(&CancellationToken::new(), "go", &LoopCallbacks::new()).await.unwrap();

        let messages = orch.session().messages();
        let parse_error = messages.iter().find(|m| m.tool_call_id.as_deref() == Some("c1")).unwrap();
        assert!(parse_error.content.contains("as JSON"));
        let missing = messages.iter().find(|m| m.tool_call_id.as_deref() == Some("c2")).unwrap();
        assert!(missing.content.starts_with("Error:"));
        assert!(
            messages
                .iter()
                .any(|m| m.is_synthetic() && m.content.contains("required parameter 'text'"))
        );
    }

    #[tokio::test]
    async fn repeated_output_stops_at_threshold() {
        let client = Arc::new(ScriptedClient::new(
            "m",
            (0..5).map(|_| Ok(tool_call_response("c", "echo", json!({"text": "again"})))).collect(),
        ));
        let orch = orchestrator(Arc::clone(&client), AutoContinue::Default);

        let outcome = orch.run(&CancellationToken::new(), "loop", &LoopCallbacks::new()).await.unwrap();

        assert!(matches!(outcome.terminal, Terminal::LoopDetected { count: 3, .. }));
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test]
    async fn auto_continue_is_bounded() {
        let client = Arc::new(ScriptedClient::new(
            "m",
            (0..4).map(|i| Ok(truncated(&format!("part {i}")))).collect(),
        ));
        let orch = orchestrator(Arc::clone(&client), AutoContinue::Conservative);

        let outcome = orch.run(&CancellationToken::new(), "write", &LoopCallbacks::new()).await.unwrap();

        assert_eq!(outcome.terminal, Terminal::AutoContinueExhausted);
        assert_eq!(outcome.final_content, "part 3");
        assert_eq!(client.calls(), 4);
        let synthetic = orch.session().messages().iter().filter(|m| m.is_synthetic()).count();
        assert_eq!(synthetic, 3);
    }

    #[tokio::test]
    async fn iteration_cap_terminates() {
        let client = Arc::new(ScriptedClient::new(
            "m",
            (0..3)
                .map(|i| Ok(tool_call_response(&format!("c{i}"), "echo", json!({"text": format!("{i}")}))))
                .collect(),
        ));
        let orch = Orchestrator::new(
            deps(Arc::clone(&client), Dispatcher::new(registry())),
            LoopConfig::default().with_max_iterations(2),
            AutoContinue::Default,
        );
        let outcome = orch.run(&CancellationToken::new(), "go", &LoopCallbacks::new()).await.unwrap();
        assert_eq!(outcome.terminal, Terminal::IterationLimit);
        assert_eq!(outcome.iterations, 2);
    }

    #[tokio::test]
    async fn tool_validation_error_injects_correction() {
        let client = Arc::new(ScriptedClient::new(
            "m",
            vec![
                Err(ProviderError::ToolCallValidation {
                    tool_name: "echo".into(),
                    message: "missing required parameter".into(),
                }),
                Ok(LlmResponse::text("ok")),
            ],
        ));
        let orch = orchestrator(Arc::clone(&client), AutoContinue::Default);
        let outcome = orch.run(&CancellationToken::new(), "go", &LoopCallbacks::new()).await.unwrap();

        assert_eq!(outcome.final_content, "ok");
        let second = &client.requests()[1];
        assert!(second.messages.last().unwrap().is_synthetic());
    }

    #[tokio::test]
    async fn context_overflow_compacts_then_gives_up() {
        let overflow = || Err(ProviderError::ContextLengthExceeded("too long".into()));
        let client = Arc::new(ScriptedClient::new("m", (0..4).map(|_| overflow()).collect()));
        let d = deps(Arc::clone(&client), Dispatcher::new(registry()));
        for i in 0..6 {
            d.session.add_message(Message::user(format!("request {i} {}", "x".repeat(400))));
            d.session.add_message(Message::assistant(format!("answer {i} {}", "y".repeat(400))));
        }
        let orch = Orchestrator::new(d, LoopConfig::default(), AutoContinue::Default);

        let err = orch.resume(&CancellationToken::new(), &LoopCallbacks::new()).await.unwrap_err();

        assert!(matches!(err, Error::Provider(ref e) if e.is_context_length()));
        assert_eq!(client.calls(), 4);
        assert!(orch.session().messages()[0].is_compaction_summary());
    }

    #[tokio::test]
    async fn response_ids_are_carried_between_calls() {
        let client = Arc::new(
            ScriptedClient::new(
                "m",
                vec![Ok(tool_call_response("c1", "echo", json!({"text": "a"}))), Ok(LlmResponse::text("done"))],
            )
            .with_response_ids(),
        );
        let orch = orchestrator(Arc::clone(&client), AutoContinue::Default);
        orch.run(&CancellationToken::new(), "go", &LoopCallbacks::new()).await.unwrap();

        assert_eq!(client.previous_ids(), vec![None, Some("resp-1".to_string())]);
        assert_eq!(orch.session().previous_response_id().as_deref(), Some("resp-2"));
    }

    async fn gated_run(approve: bool) -> (Orchestrator, Arc<MemoryStore>, ActorSystem) {
        let system = ActorSystem::new(CancellationToken::new());
        let authorizer = InteractiveAuthorizer::new(Grants::new(Vec::<String>::new(), Vec::<String>::new()));
        let gate = AuthorizationGate::new(
            system
                .spawn("authorization", AuthorizationActor::new(Box::new(authorizer)), 8)
                .unwrap(),
        );
        let client = Arc::new(ScriptedClient::new(
            "m",
            vec![
                Ok(tool_call_response("c1", "shell", json!({"command": "cargo test --all"}))),
                Ok(tool_call_response("c2", "shell", json!({"command": "cargo test -p core"}))),
                Ok(LlmResponse::text("tests ran")),
            ],
        ));
        let store = Arc::new(MemoryStore::default());
        let d = deps(client, Dispatcher::new(registry()).with_gate(gate))
            .with_prefix_store(Arc::clone(&store) as Arc<dyn PrefixStore>);
        let orch = Orchestrator::new(d, LoopConfig::default(), AutoContinue::Default);

        let asked = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&asked);
        let callbacks = LoopCallbacks::new().with_authorization(move |_: &str, _: &Value, _: &str| {
            *counter.lock().unwrap() += 1;
            Ok(approve)
        });
        orch.run(&CancellationToken::new(), "run the tests", &callbacks).await.unwrap();

        let expected_asks = if approve { 1 } else { 2 };
        assert_eq!(*asked.lock().unwrap(), expected_asks);
        (orch, store, system)
    }

    #[tokio::test]
    async fn approval_is_remembered() {
        let (orch, store, system) = gated_run(true).await;
        assert!(orch.session().is_command_authorized("cargo test"));
        assert!(store.contains("cargo test"));
        let writers = store.writers.lock().unwrap().clone();
        assert_eq!(writers.len(), 1);
        assert_ne!(writers[0], std::thread::current().id());
        let outputs: Vec<_> = orch
            .session()
            .messages()
            .into_iter()
            .filter(|m| m.tool_call_id.is_some())
            .map(|m| m.content)
            .collect();
        assert_eq!(outputs, vec!["ran: cargo test --all", "ran: cargo test -p core"]);
        system.stop_all(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn denial_is_reported() {
        let (orch, store, system) = gated_run(false).await;
        assert!(!store.contains("cargo test"));
        let denied = orch
            .session()
            .messages()
            .into_iter()
            .filter(|m| m.content == format!("Error: {DENIED_BY_USER}"))
            .count();
        assert_eq!(denied, 2);
        system.stop_all(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn events_cover_the_run() {
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let client = Arc::new(ScriptedClient::new(
            "m",
            vec![Ok(tool_call_response("c1", "echo", json!({"text": "a"}))), Ok(LlmResponse::text("done"))],
        ));
        let d = deps(client, Dispatcher::new(registry())).with_events(bus);
        let orch = Orchestrator::new(d, LoopConfig::default(), AutoContinue::Default);
        orch.run(&CancellationToken::new(), "go", &LoopCallbacks::new()).await.unwrap();

        let mut tools = 0;
        let mut finished = None;
        while let Ok(event) = rx.try_recv() {
            match event.as_ref() {
                LoopEvent::ToolExecuted { success, .. } => {
                    assert!(*success);
                    tools += 1;
                }
                LoopEvent::Finished { terminal, iterations, .. } => finished = Some((terminal.clone(), *iterations)),
                _ => {}
            }
        }
        assert_eq!(tools, 1);
        assert_eq!(finished, Some(("completed".to_string(), 2)));
    }

    #[tokio::test]
    async fn streamed_content_and_reasoning_reach_callbacks() {
        let client = Arc::new(ScriptedClient::new(
            "m",
            vec![Ok(LlmResponse {
                content: "The answer is 4.".into(),
                reasoning: Some("2 + 2".into()),
                ..LlmResponse::default()
            })],
        ));
        let orch = orchestrator(Arc::clone(&client), AutoContinue::Default);
        let content = Arc::new(Mutex::new(String::new()));
        let reasoning = Arc::new(Mutex::new(String::new()));
        let (content_sink, reasoning_sink) = (Arc::clone(&content), Arc::clone(&reasoning));
        let callbacks = LoopCallbacks::new()
            .with_content(move |chunk| content_sink.lock().unwrap().push_str(chunk))
            .with_reasoning(move |chunk| reasoning_sink.lock().unwrap().push_str(chunk));

        let outcome = orch.run(&CancellationToken::new(), "what is 2 + 2?", &callbacks).await.unwrap();

        assert_eq!(outcome.final_content, "The answer is 4.");
        assert_eq!(*content.lock().unwrap(), "The answer is 4.");
        assert_eq!(*reasoning.lock().unwrap(), "2 + 2");
        assert_eq!(orch.session().messages()[1].reasoning.as_deref(), Some("2 + 2"));
    }

    #[tokio::test(start_paused = true)]
    async fn retried_stream_marks_partial_output_discarded() {
        let client = Arc::new(FlakyStreamClient { attempts: AtomicUsize::new(0) });
        let providers = Arc::new(StaticProviderManager::new("m"));
        let orch = Orchestrator::new(
            Dependencies::new(
                client.clone(),
                Arc::new(Session::new()),
                Dispatcher::new(registry()),
                Arc::new(StaticPrompt("You are a test agent.".into())),
                Arc::new(ContextManager::new(CompactionConfig::default(), providers)),
            ),
            LoopConfig::default(),
            AutoContinue::Default,
        );
        let log = Arc::new(Mutex::new(Vec::new()));
        let (chunks, statuses) = (Arc::clone(&log), Arc::clone(&log));
        let callbacks = LoopCallbacks::new()
            .with_content(move |chunk| chunks.lock().unwrap().push(format!("content: {chunk}")))
            .with_status(move |text| statuses.lock().unwrap().push(format!("status: {text}")));

        let outcome = orch.run(&CancellationToken::new(), "hi", &callbacks).await.unwrap();

        assert_eq!(outcome.final_content, "fresh answer");
        assert_eq!(client.attempts.load(Ordering::SeqCst), 2);
        let log = log.lock().unwrap().clone();
        let position = |entry: &str| log.iter().position(|l| l == entry).unwrap();
        let stale = position("content: stale frag");
        let discarded = position(format!("status: {PARTIAL_RESPONSE_DISCARDED}").as_str());
        let fresh = position("content: fresh answer");
        assert!(stale < discarded && discarded < fresh);
        assert_eq!(log.iter().filter(|l| l.contains("discarded")).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_retry_sleep_ends_the_run() {
        let client = Arc::new(ScriptedClient::new(
            "m",
            vec![
                Err(ProviderError::RateLimited { retry_after_secs: 30 }),
                Ok(LlmResponse::text("too late")),
            ],
        ));
        let orch = orchestrator(Arc::clone(&client), AutoContinue::Default);
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&statuses);
        let callbacks = LoopCallbacks::new().with_status(move |text| sink.lock().unwrap().push(text.to_string()));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let err = orch.run(&cancel, "go", &callbacks).await.unwrap_err();

        assert!(matches!(err, Error::Provider(ProviderError::Cancelled)));
        assert_eq!(client.calls(), 1);
        assert_eq!(*statuses.lock().unwrap(), vec!["Retrying in 5s: rate limited".to_string()]);
    }

    #[tokio::test]
    async fn cancel_during_tool_ends_the_run() {
        let client = Arc::new(ScriptedClient::new(
            "m",
            vec![Ok(tool_call_response("c1", "wait", json!({}))), Ok(LlmResponse::text("never"))],
        ));
        let mut registry = registry();
        registry.register(Arc::new(WaitTool));
        let orch = Orchestrator::new(
            deps(Arc::clone(&client), Dispatcher::new(registry)),
            LoopConfig::default(),
            AutoContinue::Default,
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let callbacks = LoopCallbacks::new().with_tool_call(move |_| trigger.cancel());

        let err = orch.run(&cancel, "wait for it", &callbacks).await.unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(client.calls(), 1);
        let last = orch.session().messages().pop().unwrap();
        assert_eq!(last.tool_call_id.as_deref(), Some("c1"));
        assert!(last.content.starts_with("Error:"));
    }
}
