//! The model's working todo list, owned by an actor and exposed through
//! `todo_write` / `todo_read`.

use async_trait::async_trait;
use rustedloop_actors::{ActorContext, ActorRef, Behavior};
use rustedloop_core::tool::decode_params;
use rustedloop_core::{ActorError, Tool, ToolError, ToolResult};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub status: TodoStatus,
}

pub enum TodoMessage {
    List {
        reply: oneshot::Sender<Vec<TodoItem>>,
    },
    Replace {
        items: Vec<TodoItem>,
        reply: oneshot::Sender<()>,
    },
    Update {
        id: String,
        status: TodoStatus,
        reply: oneshot::Sender<bool>,
    },
}

#[derive(Debug, Default)]
pub struct TodoActor {
    items: Vec<TodoItem>,
}

impl TodoActor {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Behavior for TodoActor {
    type Message = TodoMessage;

    async fn handle(&mut self, msg: TodoMessage, _ctx: &ActorContext) {
        match msg {
            TodoMessage::List { reply } => {
                let _ = reply.send(self.items.clone());
            }
            TodoMessage::Replace { items, reply } => {
                debug!(count = items.len(), "Todo list replaced");
                self.items = items;
                let _ = reply.send(());
            }
            TodoMessage::Update { id, status, reply } => {
                let found = match self.items.iter_mut().find(|item| item.id == id) {
                    Some(item) => {
                        item.status = status;
                        true
                    }
                    None => false,
                };
                let _ = reply.send(found);
            }
        }
    }
}

/// Client handle for the [`TodoActor`].
#[derive(Debug, Clone)]
pub struct TodoClient {
    actor: ActorRef<TodoMessage>,
}

impl TodoClient {
    pub fn new(actor: ActorRef<TodoMessage>) -> Self {
        Self { actor }
    }

    pub async fn list(&self, cancel: &CancellationToken) -> Result<Vec<TodoItem>, ActorError> {
        self.actor
            .request(cancel, |reply| TodoMessage::List { reply })
            .await
    }

    pub async fn replace(
        &self,
        cancel: &CancellationToken,
        items: Vec<TodoItem>,
    ) -> Result<(), ActorError> {
        self.actor
            .request(cancel, |reply| TodoMessage::Replace { items, reply })
            .await
    }

    /// Returns `false` if no item has that id.
    pub async fn update(
        &self,
        cancel: &CancellationToken,
        id: impl Into<String>,
        status: TodoStatus,
    ) -> Result<bool, ActorError> {
        let id = id.into();
        self.actor
            .request(cancel, |reply| TodoMessage::Update { id, status, reply })
            .await
    }
}

fn actor_failure(tool_name: &str) -> impl Fn(ActorError) -> ToolError + '_ {
    move |e| ToolError::ExecutionFailed {
        tool_name: tool_name.to_string(),
        reason: e.to_string(),
    }
}

fn render(items: &[TodoItem]) -> serde_json::Value {
    serde_json::json!({ "todos": items })
}

// --- todo_write ---

pub struct TodoWriteTool {
    todos: TodoClient,
}

impl TodoWriteTool {
    pub fn new(todos: TodoClient) -> Self {
        Self { todos }
    }
}

#[derive(Deserialize)]
struct TodoWriteParams {
    todos: Vec<TodoItem>,
}

#[async_trait]
impl Tool for TodoWriteTool {
    fn name(&self) -> &str {
        "todo_write"
    }

    fn description(&self) -> &str {
        "Replace the todo list. Send the full list every time; each item has an id, content and status (pending, in_progress, completed)."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "todos": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": { "type": "string" },
                            "content": { "type": "string" },
                            "status": {
                                "type": "string",
                                "enum": ["pending", "in_progress", "completed"]
                            }
                        },
                        "required": ["id", "content"]
                    }
                }
            },
            "required": ["todos"]
        })
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        parameters: serde_json::Value,
    ) -> Result<ToolResult, ToolError> {
        let params: TodoWriteParams = decode_params(self.name(), parameters)?;
        self.todos
            .replace(cancel, params.todos.clone())
            .await
            .map_err(actor_failure(self.name()))?;
        Ok(ToolResult::ok(render(&params.todos)))
    }
}

// --- todo_read ---

pub struct TodoReadTool {
    todos: TodoClient,
}

impl TodoReadTool {
    pub fn new(todos: TodoClient) -> Self {
        Self { todos }
    }
}

#[async_trait]
impl Tool for TodoReadTool {
    fn name(&self) -> &str {
        "todo_read"
    }

    fn description(&self) -> &str {
        "Show the current todo list."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        _parameters: serde_json::Value,
    ) -> Result<ToolResult, ToolError> {
        let items = self
            .todos
            .list(cancel)
            .await
            .map_err(actor_failure(self.name()))?;
        Ok(ToolResult::ok(render(&items)))
    }
}
