//! Prefix compaction.
//!
//! At most one compaction runs per [`Compactor`]. A run snapshots the
//! session, picks the prefix holding the oldest ~40% of tokens (always
//! leaving the last messages alone), summarizes it and swaps the summary in
//! only if the session revision has not moved since the snapshot. A result
//! computed against a stale revision is dropped; the next turn re-evaluates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rustedloop_core::{CompactionSummary, EventBus, LoopEvent, Session};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::summary::{self, UserPromptLimits};
use super::{ContextManager, clamp_prefix, select_prefix_with_ratio};
use crate::callbacks::StatusFn;

/// What a compaction run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactionOutcome {
    /// The summary replaced `prefix_len` messages.
    Applied {
        prefix_len: usize,
        tokens_before: usize,
        tokens_after: usize,
    },
    /// The session moved on while the summary was produced.
    Stale,
    /// Not enough history outside the protected tail.
    NothingToCompact,
    /// Another compaction held the guard.
    AlreadyRunning,
}

impl CompactionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

struct Inner {
    session: Arc<Session>,
    context: Arc<ContextManager>,
    in_progress: AtomicBool,
    events: Option<EventBus>,
    background: Mutex<Option<JoinHandle<CompactionOutcome>>>,
}

/// Releases the in-progress flag when a run ends, however it ends.
struct RunGuard(Arc<Inner>);

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.in_progress.store(false, Ordering::Release);
    }
}

/// Compacts one session's history.
#[derive(Clone)]
pub struct Compactor {
    inner: Arc<Inner>,
}

impl Compactor {
    pub fn new(session: Arc<Session>, context: Arc<ContextManager>) -> Self {
        Self {
            inner: Arc::new(Inner {
                session,
                context,
                in_progress: AtomicBool::new(false),
                events: None,
                background: Mutex::new(None),
            }),
        }
    }

    /// Publish [`LoopEvent::Compaction`] after each run.
    pub fn with_events(session: Arc<Session>, context: Arc<ContextManager>, events: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                session,
                context,
                in_progress: AtomicBool::new(false),
                events: Some(events),
                background: Mutex::new(None),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.in_progress.load(Ordering::Acquire)
    }

    fn acquire(&self) -> Option<RunGuard> {
        self.inner
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard(Arc::clone(&self.inner)))
    }

    /// Start a compaction on its own task.
    ///
    /// Returns `false` without doing anything when one is already running.
    pub fn trigger_background(
        &self,
        cancel: &CancellationToken,
        system_prompt: String,
        status: Option<StatusFn>,
    ) -> bool {
        let Some(guard) = self.acquire() else {
            debug!("Compaction already in progress, not starting another");
            return false;
        };

        let inner = Arc::clone(&self.inner);
        let cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let outcome = run(&inner, &cancel, &system_prompt).await;
            if let Some(status) = status {
                status(&status_text(&outcome));
            }
            outcome
        });

        let mut slot = self
            .inner
            .background
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(handle);
        true
    }

    /// Compact on the caller's task. Used when the provider has already
    /// rejected the request as too large.
    pub async fn compact_now(&self, cancel: &CancellationToken, system_prompt: &str) -> CompactionOutcome {
        let Some(_guard) = self.acquire() else {
            return CompactionOutcome::AlreadyRunning;
        };
        run(&self.inner, cancel, system_prompt).await
    }

    /// Wait for the most recent background compaction, if any.
    pub async fn join_background(&self) -> Option<CompactionOutcome> {
        let handle = self
            .inner
            .background
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()?;
        match handle.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(error = %e, "Background compaction task failed");
                None
            }
        }
    }
}

impl std::fmt::Debug for Compactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compactor")
            .field("session_id", &self.inner.session.id())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Status line for a finished run.
pub fn status_text(outcome: &CompactionOutcome) -> String {
    match outcome {
        CompactionOutcome::Applied {
            prefix_len,
            tokens_before,
            tokens_after,
        } => format!(
            "Compacted {prefix_len} earlier messages ({tokens_before} -> {tokens_after} tokens)"
        ),
        CompactionOutcome::Stale => "Compaction discarded: conversation moved on".into(),
        CompactionOutcome::NothingToCompact => "Nothing to compact".into(),
        CompactionOutcome::AlreadyRunning => "Compaction already in progress".into(),
    }
}

async fn run(inner: &Inner, cancel: &CancellationToken, system_prompt: &str) -> CompactionOutcome {
    let config = inner.context.config();
    let snapshot = inner.session.snapshot();
    let estimate = inner.context.estimate(system_prompt, &snapshot.messages);

    let prefix = select_prefix_with_ratio(&estimate.per_message, estimate.total, config.prefix_ratio);
    let prefix_len = clamp_prefix(prefix, snapshot.messages.len(), config.keep_trailing);
    if prefix_len == 0 {
        debug!(messages = snapshot.messages.len(), "Nothing to compact");
        return CompactionOutcome::NothingToCompact;
    }

    let prefix_messages = &snapshot.messages[..prefix_len];
    let providers = inner.context.providers();
    let client = providers.client(&providers.summarization_model());

    let body = summary::summary_body(
        cancel,
        client.as_ref(),
        prefix_messages,
        config.summary_timeout(),
        config.condense_chars,
    )
    .await;

    let user_section = summary::user_prompt_section(
        prefix_messages,
        &snapshot.messages,
        &inner.context.counter(),
        UserPromptLimits {
            effective_window: inner.context.effective_window(),
            verbatim_share: config.user_prompt_share,
            max_chars: config.condense_chars,
        },
    );

    let applied = inner.session.compact_with_summary(&CompactionSummary {
        prefix_len,
        expected_revision: snapshot.revision,
        text: summary::compose(&body, &user_section),
        user_requests: summary::user_requests(prefix_messages),
    });

    let tokens_after = if applied {
        inner
            .context
            .estimate(system_prompt, &inner.session.messages())
            .total
    } else {
        estimate.total
    };

    if let Some(events) = &inner.events {
        events.publish(LoopEvent::Compaction {
            session_id: inner.session.id().to_string(),
            before: estimate.total,
            after: tokens_after,
            applied,
            timestamp: Utc::now(),
        });
    }

    if applied {
        info!(
            session_id = %inner.session.id(),
            prefix_len,
            revision = snapshot.revision,
            tokens_before = estimate.total,
            tokens_after,
            "Compaction applied"
        );
        CompactionOutcome::Applied {
            prefix_len,
            tokens_before: estimate.total,
            tokens_after,
        }
    } else {
        debug!(
            session_id = %inner.session.id(),
            revision = snapshot.revision,
            "Compaction result was stale, discarded"
        );
        CompactionOutcome::Stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::ScriptedClient;
    use rustedloop_config::CompactionConfig;
    use rustedloop_core::{LlmClient, LlmResponse, Message, StaticProviderManager};
    use std::time::Duration;

    fn session_with(n: usize) -> Arc<Session> {
        let session = Session::new();
        for i in 0..n {
            if i % 2 == 0 {
                session.add_message(Message::user(format!("request {i} {}", "x".repeat(2000))));
            } else {
                session.add_message(Message::assistant(format!("answer {i} {}", "y".repeat(2000))));
            }
        }
        Arc::new(session)
    }

    fn context(summarizer: Option<Arc<dyn LlmClient>>) -> Arc<ContextManager> {
        let mut providers = StaticProviderManager::new("my-local-model")
            .with_summarization_model("summarizer")
            .with_default_context_window(8192);
        if let Some(client) = summarizer {
            providers = providers.with_client(client);
        }
        Arc::new(ContextManager::new(CompactionConfig::default(), Arc::new(providers)))
    }

    #[tokio::test]
    async fn compaction_replaces_prefix_with_summary() {
        let session = session_with(6);
        let compactor = Compactor::new(Arc::clone(&session), context(None));

        let outcome = compactor.compact_now(&CancellationToken::new(), "").await;
        let CompactionOutcome::Applied { prefix_len, tokens_before, tokens_after } = outcome else {
            panic!("expected applied, got {outcome:?}");
        };
        assert!(prefix_len >= 1);
        assert!(tokens_after < tokens_before);

        let messages = session.messages();
        assert!(messages[0].is_compaction_summary());
        assert!(messages[0].content.starts_with(summary::SUMMARY_HEADER));
        assert_eq!(messages.len(), 6 - prefix_len + 1);
    }

    #[tokio::test]
    async fn second_compaction_keeps_the_request() {
        let session = Session::new();
        session.add_message(Message::user("fix the flaky test"));
        for i in 0..5 {
            session.add_message(Message::assistant(format!("step {i} {}", "y".repeat(2000))));
        }
        let session = Arc::new(session);
        let compactor = Compactor::new(Arc::clone(&session), context(None));
        let cancel = CancellationToken::new();

        assert!(compactor.compact_now(&cancel, "").await.is_applied());
        assert_eq!(session.messages()[0].user_requests(), vec!["fix the flaky test"]);

        for i in 5..10 {
            session.add_message(Message::assistant(format!("step {i} {}", "y".repeat(2000))));
        }
        assert!(session.messages().iter().all(|m| !m.is_user_authored()));
        assert!(compactor.compact_now(&cancel, "").await.is_applied());

        let summary = &session.messages()[0];
        assert!(summary.is_compaction_summary());
        assert_eq!(summary.user_requests(), vec!["fix the flaky test"]);
        assert!(summary.content.contains("Most recent user request (verbatim):\nfix the flaky test"));
        assert!(summary.content.ends_with("Continue working on this request from where the conversation left off."));
    }

    #[tokio::test]
    async fn three_messages_compact_at_most_one() {
        let session = session_with(3);
        let compactor = Compactor::new(Arc::clone(&session), context(None));
        let outcome = compactor.compact_now(&CancellationToken::new(), "").await;
        match outcome {
            CompactionOutcome::Applied { prefix_len, .. } => {
                assert_eq!(prefix_len, 1);
                assert_eq!(session.len(), 3);
            }
            CompactionOutcome::NothingToCompact => assert_eq!(session.len(), 3),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn two_messages_are_left_alone() {
        let session = session_with(2);
        let compactor = Compactor::new(Arc::clone(&session), context(None));
        let outcome = compactor.compact_now(&CancellationToken::new(), "").await;
        assert_eq!(outcome, CompactionOutcome::NothingToCompact);
        assert_eq!(session.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_triggers_produce_one_summary() {
        let summarizer = Arc::new(
            ScriptedClient::new("summarizer", vec![Ok(LlmResponse::text("short summary"))])
                .with_delay(Duration::from_secs(1)),
        );
        let session = session_with(8);
        let compactor = Compactor::new(Arc::clone(&session), context(Some(summarizer.clone() as Arc<dyn LlmClient>)));
        let cancel = CancellationToken::new();

        assert!(compactor.trigger_background(&cancel, String::new(), None));
        assert!(!compactor.trigger_background(&cancel, String::new(), None));
        assert_eq!(
            compactor.compact_now(&cancel, "").await,
            CompactionOutcome::AlreadyRunning
        );

        let outcome = compactor.join_background().await.unwrap();
        assert!(outcome.is_applied());
        assert_eq!(summarizer.calls(), 1);
        assert!(!compactor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn session_moving_during_summary_discards_result() {
        let summarizer = Arc::new(
            ScriptedClient::new("summarizer", vec![Ok(LlmResponse::text("short summary"))])
                .with_delay(Duration::from_secs(5)),
        );
        let session = session_with(8);
        let compactor = Compactor::new(Arc::clone(&session), context(Some(summarizer as Arc<dyn LlmClient>)));

        assert!(compactor.trigger_background(&CancellationToken::new(), String::new(), None));
        tokio::time::sleep(Duration::from_secs(1)).await;
        session.add_message(Message::user("appended mid-compaction"));

        assert_eq!(compactor.join_background().await, Some(CompactionOutcome::Stale));
        assert_eq!(session.len(), 9);
        assert!(!session.messages()[0].is_compaction_summary());
    }

    #[tokio::test]
    async fn events_are_published() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let session = session_with(6);
        let compactor = Compactor::with_events(Arc::clone(&session), context(None), bus);

        compactor.compact_now(&CancellationToken::new(), "").await;
        let event = rx.recv().await.unwrap();
        match event.as_ref() {
            LoopEvent::Compaction { applied, before, after, .. } => {
                assert!(*applied);
                assert!(after < before);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
