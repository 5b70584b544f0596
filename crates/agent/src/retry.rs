//! Judged retry of model calls.
//!
//! A failed call is shown to an [`ErrorJudge`], which decides whether to
//! retry and how long to wait first. The final attempt is never judged, and
//! failures the loop handles itself (context pressure, tool-call validation,
//! cancellation) are returned straight away.
//!
//! Two judges exist: [`HeuristicJudge`] matches on the error text, and
//! [`LlmJudge`] asks a model through the [`ErrorJudgeActor`], falling back to
//! the heuristic when the model is missing, failing or unparseable.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustedloop_actors::{ActorContext, ActorRef, Behavior};
use rustedloop_core::{LlmClient, LlmRequest, LlmResponse, ProviderError};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound on any sleep a judge may ask for.
pub const MAX_SLEEP_SECS: u64 = 60;

/// Whether and when to retry a failed call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDecision {
    pub should_retry: bool,
    #[serde(default)]
    pub sleep_seconds: u64,
    #[serde(default)]
    pub reason: String,
}

impl ErrorDecision {
    pub fn retry(sleep_seconds: u64, reason: impl Into<String>) -> Self {
        Self {
            should_retry: true,
            sleep_seconds,
            reason: reason.into(),
        }
    }

    pub fn halt(reason: impl Into<String>) -> Self {
        Self {
            should_retry: false,
            sleep_seconds: 0,
            reason: reason.into(),
        }
    }

    /// Status line shown before the retry sleep.
    pub fn status_text(&self) -> String {
        format!("Retrying in {}s: {}", self.sleep_seconds, self.reason)
    }
}

#[async_trait]
pub trait ErrorJudge: Send + Sync {
    /// Decide about the failure of 1-based `attempt`.
    async fn judge(&self, cancel: &CancellationToken, error: &ProviderError, attempt: u32) -> ErrorDecision;
}

// --- Heuristic ---

/// Rule-based judge over the error text.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicJudge;

impl HeuristicJudge {
    pub fn decide(error_text: &str, attempt: u32) -> ErrorDecision {
        let text = error_text.to_lowercase();
        let attempt = attempt.max(1);

        if text.contains("rate limit") || text.contains("429") {
            let backoff = 5u64.saturating_mul(1u64 << (attempt - 1).min(16));
            return ErrorDecision::retry(backoff.min(MAX_SLEEP_SECS), "rate limited");
        }
        if text.contains("500") || text.contains("503") || text.contains("timeout") {
            return ErrorDecision::retry(3 * u64::from(attempt), "provider unavailable");
        }
        if text.contains("connection") || text.contains("network") {
            return ErrorDecision::retry(2 * u64::from(attempt), "connection problem");
        }
        if attempt < 3 {
            return ErrorDecision::retry(2 * u64::from(attempt), "unclassified error");
        }
        ErrorDecision::halt("unclassified error persisted")
    }
}

#[async_trait]
impl ErrorJudge for HeuristicJudge {
    async fn judge(&self, _cancel: &CancellationToken, error: &ProviderError, attempt: u32) -> ErrorDecision {
        Self::decide(&error.to_string(), attempt)
    }
}

// --- Model-backed judge ---

pub enum JudgeMessage {
    Judge {
        error_text: String,
        attempt: u32,
        cancel: CancellationToken,
        reply: oneshot::Sender<ErrorDecision>,
    },
    Stats {
        reply: oneshot::Sender<JudgeStats>,
    },
}

/// Counters kept by the judge actor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JudgeStats {
    pub judged: u64,
    pub model_decisions: u64,
    pub fallbacks: u64,
}

/// Owns the judging client and its counters.
pub struct ErrorJudgeActor {
    client: Option<Arc<dyn LlmClient>>,
    stats: JudgeStats,
}

impl ErrorJudgeActor {
    pub fn new(client: Option<Arc<dyn LlmClient>>) -> Self {
        Self {
            client,
            stats: JudgeStats::default(),
        }
    }

    async fn ask_model(
        client: &Arc<dyn LlmClient>,
        cancel: &CancellationToken,
        error_text: &str,
        attempt: u32,
    ) -> Option<ErrorDecision> {
        let prompt = judge_prompt(error_text, attempt);
        match client.complete(cancel, &prompt).await {
            Ok(text) => parse_decision(&text),
            Err(e) => {
                debug!(error = %e, "Judge model call failed");
                None
            }
        }
    }
}

fn judge_prompt(error_text: &str, attempt: u32) -> String {
    format!(
        "A call to a language model API failed on attempt {attempt}.\n\
         Error: {error_text}\n\n\
         Decide whether retrying can help. Answer with JSON only:\n\
         {{\"should_retry\": true|false, \"sleep_seconds\": <integer>, \"reason\": \"<short reason>\"}}"
    )
}

/// Parse the first JSON object in `text` as a decision.
pub fn parse_decision(text: &str) -> Option<ErrorDecision> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    let mut decision: ErrorDecision = serde_json::from_str(&text[start..=end]).ok()?;
    decision.sleep_seconds = decision.sleep_seconds.min(MAX_SLEEP_SECS);
    Some(decision)
}

#[async_trait]
impl Behavior for ErrorJudgeActor {
    type Message = JudgeMessage;

    async fn handle(&mut self, msg: JudgeMessage, _ctx: &ActorContext) {
        match msg {
            JudgeMessage::Judge {
                error_text,
                attempt,
                cancel,
                reply,
            } => {
                self.stats.judged += 1;
                let from_model = match &self.client {
                    Some(client) => Self::ask_model(client, &cancel, &error_text, attempt).await,
                    None => None,
                };
                let decision = match from_model {
                    Some(decision) => {
                        self.stats.model_decisions += 1;
                        decision
                    }
                    None => {
                        self.stats.fallbacks += 1;
                        HeuristicJudge::decide(&error_text, attempt)
                    }
                };
                let _ = reply.send(decision);
            }
            JudgeMessage::Stats { reply } => {
                let _ = reply.send(self.stats);
            }
        }
    }
}

/// Client of the [`ErrorJudgeActor`].
#[derive(Debug, Clone)]
pub struct LlmJudge {
    actor: ActorRef<JudgeMessage>,
}

impl LlmJudge {
    pub fn new(actor: ActorRef<JudgeMessage>) -> Self {
        Self { actor }
    }

    pub async fn stats(&self, cancel: &CancellationToken) -> Option<JudgeStats> {
        self.actor
            .request(cancel, |reply| JudgeMessage::Stats { reply })
            .await
            .ok()
    }
}

#[async_trait]
impl ErrorJudge for LlmJudge {
    async fn judge(&self, cancel: &CancellationToken, error: &ProviderError, attempt: u32) -> ErrorDecision {
        let error_text = error.to_string();
        let request = self
            .actor
            .request(cancel, |reply| JudgeMessage::Judge {
                error_text: error_text.clone(),
                attempt,
                cancel: cancel.clone(),
                reply,
            })
            .await;
        match request {
            Ok(decision) => decision,
            Err(e) => {
                warn!(error = %e, "Judge actor unavailable, using heuristic");
                HeuristicJudge::decide(&error_text, attempt)
            }
        }
    }
}

// --- Retry loop ---

/// Run `op` until it succeeds, the judge halts, attempts run out or
/// `cancel` fires.
///
/// `on_retry` is told about every scheduled retry before its sleep starts.
pub async fn retry_with_judge<T, F, Fut>(
    cancel: &CancellationToken,
    judge: &dyn ErrorJudge,
    max_attempts: u32,
    on_retry: &(dyn Fn(u32, &ErrorDecision) + Send + Sync),
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }

        let error = match op().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if error.bypasses_judge() {
            debug!(attempt, error = %error, "Not retrying");
            return Err(error);
        }
        if attempt >= max_attempts {
            warn!(attempt, error = %error, "Retry attempts exhausted");
            return Err(error);
        }

        let decision = judge.judge(cancel, &error, attempt).await;
        if !decision.should_retry {
            warn!(attempt, reason = %decision.reason, error = %error, "Judge halted retries");
            return Err(ProviderError::Halted {
                reason: decision.reason,
                source: Box::new(error),
            });
        }

        info!(
            attempt,
            sleep_secs = decision.sleep_seconds,
            reason = %decision.reason,
            "Retrying model call"
        );
        on_retry(attempt, &decision);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            _ = tokio::time::sleep(Duration::from_secs(decision.sleep_seconds)) => {}
        }
    }
}

/// [`retry_with_judge`] over `client.complete_with_request`.
pub async fn complete_with_retry(
    cancel: &CancellationToken,
    client: &dyn LlmClient,
    request: LlmRequest,
    judge: &dyn ErrorJudge,
    max_attempts: u32,
    on_retry: &(dyn Fn(u32, &ErrorDecision) + Send + Sync),
) -> Result<LlmResponse, ProviderError> {
    retry_with_judge(cancel, judge, max_attempts, on_retry, || {
        let request = request.clone();
        async move { client.complete_with_request(cancel, request).await }
    })
    .await
}
