//! Build-and-test verification.
//!
//! The agent runs the project's checks and reports a structured verdict in
//! a `<result>` tag. When the tag or its JSON is unusable the verdict is
//! inferred from keywords in the reply.

use rustedloop_core::Result;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{extract_tagged, narrow_dependencies, narrow_dispatcher};
use crate::auto_continue::AutoContinue;
use crate::callbacks::LoopCallbacks;
use crate::orchestrator::{Dependencies, LoopConfig, Orchestrator};

pub const VERIFICATION_TOOLS: &[&str] = &["build", "test", "shell", "read", "parallel"];
pub const VERIFICATION_MAX_TURNS: usize = 64;

const VERIFICATION_PROMPT: &str = "You verify that a change works. \
Build the project and run its tests with the tools you have, reading files when output needs context. \
Do not fix anything. Finish with a verdict inside <result></result> tags as JSON: \
{\"success\": true|false, \"summary\": \"...\", \"failures\": [\"...\"]}";

const FAILURE_WORDS: &[&str] = &["fail", "failed", "fails", "failure", "failures", "error", "errors", "panicked"];
const SUCCESS_WORDS: &[&str] = &["pass", "passed", "passes", "success", "successful", "succeeded", "ok"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub success: bool,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub failures: Vec<String>,
}

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
}

fn mentions(text: &str, vocabulary: &[&str]) -> bool {
    words(text).any(|w| vocabulary.contains(&w.as_str()))
}

/// Read the verdict out of a final reply.
pub fn parse_verification(reply: &str) -> VerificationResult {
    let tagged = extract_tagged(reply, "result");
    if let Ok(result) = serde_json::from_str::<VerificationResult>(&tagged) {
        return result;
    }

    warn!("Verification verdict is not valid JSON, inferring from text");
    let summary = tagged.trim().to_string();
    if mentions(&summary, FAILURE_WORDS) {
        let failures = summary
            .lines()
            .map(str::trim)
            .filter(|line| mentions(line, FAILURE_WORDS))
            .map(str::to_string)
            .collect();
        return VerificationResult {
            success: false,
            summary,
            failures,
        };
    }
    VerificationResult {
        success: mentions(&summary, SUCCESS_WORDS),
        summary,
        failures: Vec::new(),
    }
}

pub struct VerificationAgent {
    parent: Dependencies,
    config: LoopConfig,
    max_workers: usize,
}

impl VerificationAgent {
    pub fn new(parent: &Dependencies, config: &LoopConfig, max_workers: usize) -> Self {
        Self {
            parent: parent.clone(),
            config: config.clone().with_max_iterations(VERIFICATION_MAX_TURNS),
            max_workers,
        }
    }

    pub async fn verify(
        &self,
        cancel: &CancellationToken,
        task: &str,
        callbacks: &LoopCallbacks,
    ) -> Result<VerificationResult> {
        let tools = narrow_dispatcher(&self.parent.tools, VERIFICATION_TOOLS, self.max_workers);
        let deps = narrow_dependencies(&self.parent, tools, VERIFICATION_PROMPT);
        let orchestrator = Orchestrator::new(deps, self.config.clone(), AutoContinue::Default);

        let outcome = orchestrator.run(cancel, task, callbacks).await?;
        let result = parse_verification(&outcome.final_content);
        info!(
            success = result.success,
            failures = result.failures.len(),
            terminal = outcome.terminal.as_str(),
            "Verification finished"
        );
        Ok(result)
    }
}
