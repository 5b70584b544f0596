//! The tool executor actor.
//!
//! Logging and authorization checks for every call happen here, one call at
//! a time. The tool body itself runs on its own task so a long-running tool
//! never holds up the mailbox.

use async_trait::async_trait;
use rustedloop_actors::{ActorContext, Behavior};
use rustedloop_core::{ToolCall, ToolResult};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::dispatcher::Dispatcher;

pub enum ExecMessage {
    Run {
        call: ToolCall,
        check_gate: bool,
        cancel: CancellationToken,
        reply: oneshot::Sender<ToolResult>,
    },
}

pub struct ToolExecutorActor {
    dispatcher: Dispatcher,
}

impl ToolExecutorActor {
    pub fn new(dispatcher: &Dispatcher) -> Self {
        Self {
            dispatcher: dispatcher.local(),
        }
    }
}

#[async_trait]
impl Behavior for ToolExecutorActor {
    type Message = ExecMessage;

    async fn handle(&mut self, msg: ExecMessage, _ctx: &ActorContext) {
        let ExecMessage::Run {
            call,
            check_gate,
            cancel,
            reply,
        } = msg;

        info!(tool = %call.name, call_id = %call.id, check_gate, "Executing tool");

        match self.dispatcher.prepare(&cancel, call, check_gate).await {
            Err(result) => {
                let _ = reply.send(result);
            }
            Ok(prepared) => {
                let dispatcher = self.dispatcher.clone();
                tokio::spawn(async move {
                    let result = dispatcher.run(&cancel, prepared).await;
                    let _ = reply.send(result);
                });
            }
        }
    }
}
