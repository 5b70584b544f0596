//! Background compaction driven through a full orchestrator run.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rustedloop_agent::{
    AutoContinue, CompactionOutcome, ContextManager, Dependencies, LoopCallbacks, LoopConfig,
    Orchestrator, StaticPrompt, Terminal,
};
use rustedloop_config::CompactionConfig;
use rustedloop_core::{
    LlmClient, LlmRequest, LlmResponse, Message, ProviderError, ProviderManager, Session,
    StaticProviderManager, ToolRegistry,
};
use rustedloop_tools::Dispatcher;
use tokio_util::sync::CancellationToken;

const MODEL: &str = "my-local-model";
const WINDOW: usize = 8192;

/// Replies in order after a fixed delay, recording how many messages each
/// request carried.
struct SlowClient {
    replies: Mutex<VecDeque<String>>,
    delay: Duration,
    request_sizes: Mutex<Vec<usize>>,
}

impl SlowClient {
    fn new(replies: &[&str], delay: Duration) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            delay,
            request_sizes: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl LlmClient for SlowClient {
    fn model_name(&self) -> &str {
        MODEL
    }

    async fn complete_with_request(
        &self,
        _cancel: &CancellationToken,
        request: LlmRequest,
    ) -> Result<LlmResponse, ProviderError> {
        self.request_sizes.lock().unwrap().push(request.messages.len());
        tokio::time::sleep(self.delay).await;
        let reply = self.replies.lock().unwrap().pop_front();
        reply
            .map(LlmResponse::text)
            .ok_or_else(|| ProviderError::Other("no more replies".into()))
    }
}

fn providers(client: Arc<SlowClient>) -> Arc<dyn ProviderManager> {
    // No client for the summarizer, so summaries use the deterministic fallback.
    Arc::new(
        StaticProviderManager::new(MODEL)
            .with_summarization_model("offline-summarizer")
            .with_context_window(MODEL, WINDOW)
            .with_client(client),
    )
}

fn orchestrator(session: Arc<Session>, client: Arc<SlowClient>) -> Orchestrator {
    let context = Arc::new(ContextManager::new(
        CompactionConfig::default(),
        providers(Arc::clone(&client)),
    ));
    let deps = Dependencies::new(
        client,
        session,
        Dispatcher::new(ToolRegistry::new()),
        Arc::new(StaticPrompt("You are a helpful assistant.".into())),
        context,
    );
    Orchestrator::new(deps, LoopConfig::default(), AutoContinue::Disabled)
}

/// A long history: one short request followed by `n` assistant messages of
/// roughly 1000 approximate tokens each.
fn long_history(n: usize) -> Vec<Message> {
    let mut messages = vec![Message::user("Refactor the storage layer.")];
    for i in 0..n {
        let body = format!("step {i}: ") + &"inspected module and noted findings ".repeat(115);
        messages.push(Message::assistant(body));
    }
    messages
}

#[tokio::test(start_paused = true)]
async fn near_full_window_compacts_in_background() {
    let session = Arc::new(Session::from_messages(long_history(8)));
    let client = Arc::new(SlowClient::new(&["Storage layer refactored."], Duration::from_secs(1)));
    let orch = orchestrator(Arc::clone(&session), Arc::clone(&client));

    let context = ContextManager::new(CompactionConfig::default(), providers(Arc::clone(&client)));
    let before = context.estimate("You are a helpful assistant.", &session.messages());
    assert!(before.approximate);
    assert!(before.total as f64 > 0.9 * WINDOW as f64, "history too small: {}", before.total);

    let outcome = orch
        .run(&CancellationToken::new(), "Finish up and report.", &LoopCallbacks::new())
        .await
        .unwrap();

    assert_eq!(outcome.terminal, Terminal::Completed);
    assert_eq!(outcome.final_content, "Storage layer refactored.");
    assert_eq!(outcome.compactions, 1);

    // The summary was applied while the model call was in flight.
    assert!(matches!(
        orch.compactor().join_background().await,
        Some(CompactionOutcome::Applied { .. })
    ));
    let messages = session.messages();
    assert!(messages[0].is_compaction_summary());
    assert_eq!(messages.last().unwrap().content, "Storage layer refactored.");

    let after = context.estimate("You are a helpful assistant.", &messages);
    assert!(after.total < before.total, "{} !< {}", after.total, before.total);
}

#[tokio::test(start_paused = true)]
async fn small_history_is_left_alone() {
    let session = Arc::new(Session::from_messages(long_history(2)));
    let client = Arc::new(SlowClient::new(&["Done."], Duration::from_millis(10)));
    let orch = orchestrator(Arc::clone(&session), client);
    let len_before = session.len();

    let outcome = orch
        .run(&CancellationToken::new(), "Anything else?", &LoopCallbacks::new())
        .await
        .unwrap();

    assert_eq!(outcome.compactions, 0);
    assert!(orch.compactor().join_background().await.is_none());
    assert_eq!(session.len(), len_before + 2);
    assert!(!session.messages()[0].is_compaction_summary());
}
