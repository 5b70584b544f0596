//! Narrow agents.
//!
//! Each one runs the same orchestration loop in a fresh session with a
//! smaller tool set, a lower turn cap and a task-specific system prompt,
//! then pulls its result out of a delimited tag in the final reply.

pub mod investigation;
pub mod verification;

use std::sync::Arc;

use rustedloop_core::Session;
use rustedloop_tools::{Dispatcher, PARALLEL_TOOL_NAME, ParallelTool};

use crate::orchestrator::{Dependencies, StaticPrompt};

pub use investigation::{InvestigationAgent, InvestigationReport};
pub use verification::{VerificationAgent, VerificationResult, parse_verification};

/// Text between the first `<tag>` and the last `</tag>`.
///
/// Without an opening tag the text comes back unchanged; without a closing
/// tag everything after the opening tag is returned, trimmed.
pub fn extract_tagged(text: &str, tag: &str) -> String {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");

    let Some(start) = text.find(&open) else {
        return text.to_string();
    };
    let rest = &text[start + open.len()..];
    match rest.rfind(&close) {
        Some(end) => rest[..end].trim().to_string(),
        None => rest.trim().to_string(),
    }
}

/// A dispatcher over `names` that shares `tools`' gate.
///
/// `parallel` is rebuilt over the narrowed set so it cannot reach tools the
/// agent was not given.
pub(crate) fn narrow_dispatcher(tools: &Dispatcher, names: &[&str], max_workers: usize) -> Dispatcher {
    let direct: Vec<&str> = names
        .iter()
        .copied()
        .filter(|n| *n != PARALLEL_TOOL_NAME)
        .collect();
    let mut registry = tools.registry().subset(&direct);

    if names.contains(&PARALLEL_TOOL_NAME) && tools.registry().contains(PARALLEL_TOOL_NAME) {
        let inner = registry.clone();
        registry.register(Arc::new(ParallelTool::new(inner, tools.gate().cloned(), max_workers)));
    }

    let dispatcher = Dispatcher::new(registry);
    match tools.gate() {
        Some(gate) => dispatcher.with_gate(gate.clone()),
        None => dispatcher,
    }
}

/// Dependencies for one narrow run: a fresh session, the narrowed tools and
/// the agent's own prompt, everything else shared with `parent`.
pub(crate) fn narrow_dependencies(parent: &Dependencies, tools: Dispatcher, prompt: &str) -> Dependencies {
    Dependencies {
        session: Arc::new(Session::new()),
        tools,
        system_prompt: Arc::new(StaticPrompt(prompt.to_string())),
        ..parent.clone()
    }
}
