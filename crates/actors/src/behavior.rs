//! What an actor does with its messages.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Per-actor context handed to every `handle` call.
#[derive(Debug, Clone)]
pub struct ActorContext {
    name: String,
    lifetime: CancellationToken,
}

impl ActorContext {
    pub(crate) fn new(name: String, lifetime: CancellationToken) -> Self {
        Self { name, lifetime }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cancelled when the actor is asked to stop.
    pub fn lifetime(&self) -> &CancellationToken {
        &self.lifetime
    }
}

/// The state and message handler of one actor.
///
/// `handle` runs on the actor's own task, one message at a time, in
/// mailbox order.
#[async_trait]
pub trait Behavior: Send + 'static {
    type Message: Send + 'static;

    async fn handle(&mut self, msg: Self::Message, ctx: &ActorContext);

    /// Called once after the mailbox has been drained.
    async fn on_stop(&mut self, _ctx: &ActorContext) {}
}
