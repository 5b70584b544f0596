//! Handles for sending messages to a running actor.

use std::sync::Arc;

use rustedloop_core::ActorError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// A cloneable handle to an actor's mailbox.
pub struct ActorRef<M> {
    name: Arc<str>,
    tx: mpsc::Sender<M>,
}

impl<M> Clone for ActorRef<M> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<M> std::fmt::Debug for ActorRef<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorRef")
            .field("name", &self.name)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl<M: Send + 'static> ActorRef<M> {
    pub(crate) fn new(name: &str, tx: mpsc::Sender<M>) -> Self {
        Self {
            name: Arc::from(name),
            tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the actor has stopped accepting messages.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Enqueue a message.
    ///
    /// Waits for mailbox capacity when the mailbox is full. Returns
    /// [`ActorError::Cancelled`] if `cancel` fires first.
    pub async fn send(&self, cancel: &CancellationToken, msg: M) -> Result<(), ActorError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ActorError::Cancelled),
            sent = self.tx.send(msg) => {
                sent.map_err(|_| ActorError::MailboxClosed(self.name.to_string()))
            }
        }
    }

    /// Send a message built around a one-shot reply channel and wait for
    /// the reply.
    pub async fn request<R, F>(&self, cancel: &CancellationToken, make: F) -> Result<R, ActorError>
    where
        R: Send,
        F: FnOnce(oneshot::Sender<R>) -> M,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(cancel, make(reply_tx)).await?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ActorError::Cancelled),
            reply = reply_rx => reply.map_err(|_| ActorError::ReplyDropped(self.name.to_string())),
        }
    }
}
