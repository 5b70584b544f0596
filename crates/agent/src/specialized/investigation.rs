//! Read-only investigation of a question about the workspace.

use rustedloop_core::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{extract_tagged, narrow_dependencies, narrow_dispatcher};
use crate::auto_continue::AutoContinue;
use crate::callbacks::LoopCallbacks;
use crate::orchestrator::{Dependencies, LoopConfig, Orchestrator, Terminal};

pub const INVESTIGATION_TOOLS: &[&str] = &["search", "read", "parallel"];
pub const INVESTIGATION_MAX_TURNS: usize = 32;

const INVESTIGATION_PROMPT: &str = "You investigate questions about a codebase. \
Use the search and read tools to gather evidence; batch independent lookups with parallel. \
Do not change anything. When you know the answer, reply with it inside <answer></answer> tags, \
citing the files you relied on.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvestigationReport {
    pub answer: String,
    pub terminal: Terminal,
    pub iterations: usize,
}

pub struct InvestigationAgent {
    parent: Dependencies,
    config: LoopConfig,
    max_workers: usize,
}

impl InvestigationAgent {
    pub fn new(parent: &Dependencies, config: &LoopConfig, max_workers: usize) -> Self {
        Self {
            parent: parent.clone(),
            config: config.clone().with_max_iterations(INVESTIGATION_MAX_TURNS),
            max_workers,
        }
    }

    pub async fn investigate(
        &self,
        cancel: &CancellationToken,
        question: &str,
        callbacks: &LoopCallbacks,
    ) -> Result<InvestigationReport> {
        let tools = narrow_dispatcher(&self.parent.tools, INVESTIGATION_TOOLS, self.max_workers);
        let deps = narrow_dependencies(&self.parent, tools, INVESTIGATION_PROMPT);
        let orchestrator = Orchestrator::new(deps, self.config.clone(), AutoContinue::Conservative);

        let outcome = orchestrator.run(cancel, question, callbacks).await?;
        info!(
            terminal = outcome.terminal.as_str(),
            iterations = outcome.iterations,
            "Investigation finished"
        );
        Ok(InvestigationReport {
            answer: extract_tagged(&outcome.final_content, "answer"),
            terminal: outcome.terminal,
            iterations: outcome.iterations,
        })
    }
}
