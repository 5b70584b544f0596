//! Runtime assembly.
//!
//! [`AgentRuntime::start`] spawns the actors every run shares (authorization,
//! todo list, job table, optionally the error judge and the tool executor),
//! builds the dispatcher on top of them and hands out orchestrators for
//! individual sessions. If any actor fails to start, the ones already
//! running are stopped and the failure is attributed to that component.

use std::sync::Arc;

use rustedloop_actors::{ActorSystem, SystemBuilder};
use rustedloop_config::{AppConfig, JudgeMode};
use rustedloop_core::{
    Error, EventBus, LlmClient, PrefixStore, ProviderManager, Result, Session, ToolRegistry,
};
use rustedloop_security::{AuthorizationActor, AuthorizationGate, authorizer_from_config};
use rustedloop_tools::{
    Background, BackgroundTrigger, Dispatcher, JobClient, JobTable, TodoActor, TodoClient,
    ToolExecutorActor, background_signal, with_builtins,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auto_continue::strategy_from_config;
use crate::context::ContextManager;
use crate::orchestrator::{Dependencies, LoopConfig, Orchestrator, SystemPromptProvider};
use crate::retry::{ErrorJudge, ErrorJudgeActor, HeuristicJudge, LlmJudge};
use crate::specialized::{InvestigationAgent, VerificationAgent};

const EVENT_CAPACITY: usize = 256;

/// Shared services for every session of one process.
pub struct AgentRuntime {
    config: AppConfig,
    system: ActorSystem,
    client: Arc<dyn LlmClient>,
    providers: Arc<dyn ProviderManager>,
    context: Arc<ContextManager>,
    tools: Dispatcher,
    judge: Arc<dyn ErrorJudge>,
    todos: TodoClient,
    jobs: JobClient,
    background: BackgroundTrigger,
    events: EventBus,
    prefix_store: Option<Arc<dyn PrefixStore>>,
}

impl AgentRuntime {
    /// Spawn the shared actors and wire the dispatcher.
    ///
    /// `registry` holds the embedding application's tools; the built-ins
    /// (`todo_write`, `todo_read`, `jobs`, `parallel`) are added on top.
    pub async fn start(
        config: AppConfig,
        providers: Arc<dyn ProviderManager>,
        registry: ToolRegistry,
        root: CancellationToken,
    ) -> Result<Self> {
        let model = providers.orchestration_model();
        let client = providers.client(&model).ok_or_else(|| {
            Error::component(
                "provider",
                Error::Config {
                    message: format!("no client configured for model '{model}'"),
                },
            )
        })?;

        let mut builder = SystemBuilder::new(
            root,
            config.actors.mailbox_capacity,
            config.actors.shutdown_timeout(),
        );

        let gate = AuthorizationGate::new(
            builder
                .spawn(
                    "authorization",
                    AuthorizationActor::new(authorizer_from_config(&config.authorization)),
                )
                .await?,
        );
        let todos = TodoClient::new(builder.spawn("todo", TodoActor::new()).await?);
        let jobs = JobClient::new(builder.spawn("jobs", JobTable::new()).await?);

        let judge: Arc<dyn ErrorJudge> = match config.retry.judge {
            JudgeMode::Heuristic => Arc::new(HeuristicJudge),
            JudgeMode::Llm => {
                let judge_client = providers.client(&providers.summarization_model());
                if judge_client.is_none() {
                    warn!("No client for the error judge, it will use the heuristic");
                }
                let actor = builder
                    .spawn("error-judge", ErrorJudgeActor::new(judge_client))
                    .await?;
                Arc::new(LlmJudge::new(actor))
            }
        };

        let registry = with_builtins(
            registry,
            todos.clone(),
            jobs.clone(),
            Some(gate.clone()),
            config.tools.parallel_max_workers,
        );
        let (background, listener) = background_signal();
        let mut tools = Dispatcher::new(registry)
            .with_gate(gate)
            .with_background(Background {
                jobs: jobs.clone(),
                listener,
            });
        if config.tools.use_executor_actor {
            let executor = builder
                .spawn("tool-executor", ToolExecutorActor::new(&tools))
                .await?;
            tools = tools.with_executor_actor(executor);
        }

        let system = builder.finish();
        info!(
            model = %model,
            actors = ?system.names(),
            tools = tools.registry().len(),
            "Agent runtime started"
        );

        let context = Arc::new(ContextManager::new(
            config.compaction.clone(),
            Arc::clone(&providers),
        ));

        Ok(Self {
            config,
            system,
            client,
            providers,
            context,
            tools,
            judge,
            todos,
            jobs,
            background,
            events: EventBus::new(EVENT_CAPACITY),
            prefix_store: None,
        })
    }

    /// Remember approved prefixes across processes.
    pub fn with_prefix_store(mut self, store: Arc<dyn PrefixStore>) -> Self {
        self.prefix_store = Some(store);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn tools(&self) -> &Dispatcher {
        &self.tools
    }

    pub fn context(&self) -> &Arc<ContextManager> {
        &self.context
    }

    pub fn todos(&self) -> &TodoClient {
        &self.todos
    }

    pub fn jobs(&self) -> &JobClient {
        &self.jobs
    }

    /// Moves the currently running tool into a background job.
    pub fn background_trigger(&self) -> BackgroundTrigger {
        self.background.clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn dependencies(
        &self,
        session: Arc<Session>,
        system_prompt: Arc<dyn SystemPromptProvider>,
    ) -> Dependencies {
        let mut deps = Dependencies::new(
            Arc::clone(&self.client),
            session,
            self.tools.clone(),
            system_prompt,
            Arc::clone(&self.context),
        )
        .with_judge(Arc::clone(&self.judge))
        .with_events(self.events.clone());
        if let Some(store) = &self.prefix_store {
            deps = deps.with_prefix_store(Arc::clone(store));
        }
        deps
    }

    /// An orchestrator for `session` using the configured limits and
    /// auto-continue policy.
    pub fn orchestrator(
        &self,
        session: Arc<Session>,
        system_prompt: Arc<dyn SystemPromptProvider>,
    ) -> Orchestrator {
        let judge_client = self
            .providers
            .client(&self.providers.summarization_model())
            .or_else(|| Some(Arc::clone(&self.client)));
        let strategy = strategy_from_config(
            self.config.agent.auto_continue,
            judge_client,
            Arc::clone(&session),
        );
        Orchestrator::new(
            self.dependencies(session, system_prompt),
            LoopConfig::from_config(&self.config),
            strategy,
        )
    }

    pub fn investigation_agent(&self, system_prompt: Arc<dyn SystemPromptProvider>) -> InvestigationAgent {
        let deps = self.dependencies(Arc::new(Session::new()), system_prompt);
        InvestigationAgent::new(
            &deps,
            &LoopConfig::from_config(&self.config),
            self.config.tools.parallel_max_workers,
        )
    }

    pub fn verification_agent(&self, system_prompt: Arc<dyn SystemPromptProvider>) -> VerificationAgent {
        let deps = self.dependencies(Arc::new(Session::new()), system_prompt);
        VerificationAgent::new(
            &deps,
            &LoopConfig::from_config(&self.config),
            self.config.tools.parallel_max_workers,
        )
    }

    /// Stop every actor, bounded by the configured shutdown timeout.
    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down agent runtime");
        self.system
            .stop_all(self.config.actors.shutdown_timeout())
            .await
            .map_err(Error::from)
    }
}

impl std::fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("model", &self.client.model_name())
            .field("system", &self.system)
            .field("tools", &self.tools)
            .field("prefix_store", &self.prefix_store.is_some())
            .finish()
    }
}
