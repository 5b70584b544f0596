//! Tool execution for the agent loop.
//!
//! The [`Dispatcher`] is the single entry point: it looks tools up,
//! validates parameters, asks the authorization gate and runs the call
//! under the loop's cancellation token. Stateful built-ins (the todo list
//! and the background job table) live behind actors.

pub mod dispatcher;
pub mod executor;
pub mod jobs;
pub mod parallel;
pub mod todo;
pub mod validate;

#[cfg(test)]
mod test_helpers;

use std::sync::Arc;

use rustedloop_core::ToolRegistry;
use rustedloop_security::AuthorizationGate;

pub use dispatcher::{Dispatcher, Prepared};
pub use executor::{ExecMessage, ToolExecutorActor};
pub use jobs::{
    Background, BackgroundListener, BackgroundTrigger, Job, JobClient, JobId, JobMessage,
    JobStatus, JobStatusTool, JobTable, background_signal,
};
pub use parallel::{PARALLEL_TOOL_NAME, ParallelTool, SubResult};
pub use todo::{TodoActor, TodoClient, TodoItem, TodoMessage, TodoReadTool, TodoStatus, TodoWriteTool};
pub use validate::validate_params;

/// Register the stateful built-ins and the `parallel` tool on top of
/// `registry`.
///
/// `parallel` sees a snapshot of everything registered before it, so it can
/// never reach itself.
pub fn with_builtins(
    mut registry: ToolRegistry,
    todos: TodoClient,
    jobs: JobClient,
    gate: Option<AuthorizationGate>,
    parallel_max_workers: usize,
) -> ToolRegistry {
    registry.register(Arc::new(TodoWriteTool::new(todos.clone())));
    registry.register(Arc::new(TodoReadTool::new(todos)));
    registry.register(Arc::new(JobStatusTool::new(jobs)));

    let snapshot = registry.clone();
    registry.register(Arc::new(ParallelTool::new(snapshot, gate, parallel_max_workers)));
    registry
}
