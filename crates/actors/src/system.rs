//! Spawning and stopping actors.
//!
//! Every actor gets a child of the system's cancellation token as its
//! lifetime. Stopping cancels the lifetimes, lets each worker drain what is
//! already queued, and joins the tasks within a bounded window.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rustedloop_core::{ActorError, Error};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::actor_ref::ActorRef;
use crate::behavior::{ActorContext, Behavior};

struct ActorEntry {
    name: String,
    lifetime: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the lifecycle of a set of named actors.
pub struct ActorSystem {
    lifetime: CancellationToken,
    actors: Mutex<Vec<ActorEntry>>,
}

impl ActorSystem {
    /// Create a system whose actors stop when `root` is cancelled.
    pub fn new(root: CancellationToken) -> Self {
        Self {
            lifetime: root.child_token(),
            actors: Mutex::new(Vec::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, Vec<ActorEntry>> {
        self.actors.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn a named actor with a mailbox of `capacity` messages.
    pub fn spawn<B: Behavior>(
        &self,
        name: &str,
        behavior: B,
        capacity: usize,
    ) -> Result<ActorRef<B::Message>, ActorError> {
        let fail = |reason: &str| ActorError::SpawnFailed {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        if capacity == 0 {
            return Err(fail("mailbox capacity must be greater than zero"));
        }
        if self.lifetime.is_cancelled() {
            return Err(fail("actor system is shut down"));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| fail("no tokio runtime available"))?;

        let mut actors = self.entries();
        if actors.iter().any(|entry| entry.name == name) {
            return Err(fail("an actor with this name already exists"));
        }

        let (tx, rx) = mpsc::channel(capacity);
        let lifetime = self.lifetime.child_token();
        let ctx = ActorContext::new(name.to_string(), lifetime.clone());
        let handle = runtime.spawn(run_actor(behavior, rx, ctx));

        actors.push(ActorEntry {
            name: name.to_string(),
            lifetime,
            handle,
        });
        debug!(actor = name, capacity, "Actor spawned");

        Ok(ActorRef::new(name, tx))
    }

    /// Names of the actors currently registered.
    pub fn names(&self) -> Vec<String> {
        self.entries().iter().map(|e| e.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Stop every actor and wait for them to drain, bounded by `timeout`.
    ///
    /// Returns the first error encountered: a panicked worker, or a
    /// shutdown timeout if some workers were still running at the deadline.
    pub async fn stop_all(&self, timeout: Duration) -> Result<(), ActorError> {
        self.lifetime.cancel();
        let entries = std::mem::take(&mut *self.entries());
        if entries.is_empty() {
            return Ok(());
        }

        info!(actors = entries.len(), "Stopping actor system");
        for entry in &entries {
            entry.lifetime.cancel();
        }

        let deadline = Instant::now() + timeout;
        let mut first_error = None;
        let mut pending = 0;

        for mut entry in entries {
            match tokio::time::timeout_at(deadline, &mut entry.handle).await {
                Ok(Ok(())) => debug!(actor = %entry.name, "Actor stopped"),
                Ok(Err(join_err)) => {
                    let message = if join_err.is_panic() {
                        panic_message(join_err.into_panic())
                    } else {
                        "task was cancelled".to_string()
                    };
                    warn!(actor = %entry.name, %message, "Actor task failed during shutdown");
                    first_error.get_or_insert(ActorError::Panicked {
                        name: entry.name,
                        message,
                    });
                }
                Err(_) => {
                    warn!(actor = %entry.name, "Actor did not stop before the deadline");
                    entry.handle.abort();
                    pending += 1;
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None if pending > 0 => Err(ActorError::ShutdownTimeout { pending }),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ActorSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorSystem")
            .field("actors", &self.names())
            .field("stopped", &self.lifetime.is_cancelled())
            .finish()
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn run_actor<B: Behavior>(
    mut behavior: B,
    mut rx: mpsc::Receiver<B::Message>,
    ctx: ActorContext,
) {
    loop {
        tokio::select! {
            biased;
            _ = ctx.lifetime().cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => behavior.handle(msg, &ctx).await,
                // All handles dropped
                None => break,
            },
        }
    }

    // Refuse new work, then finish what is already queued.
    rx.close();
    while let Some(msg) = rx.recv().await {
        behavior.handle(msg, &ctx).await;
    }

    behavior.on_stop(&ctx).await;
    debug!(actor = ctx.name(), "Actor loop exited");
}

/// Spawns the actors a component needs, unwinding on the first failure.
pub struct SystemBuilder {
    system: ActorSystem,
    capacity: usize,
    shutdown_timeout: Duration,
}

impl SystemBuilder {
    pub fn new(root: CancellationToken, capacity: usize, shutdown_timeout: Duration) -> Self {
        Self {
            system: ActorSystem::new(root),
            capacity,
            shutdown_timeout,
        }
    }

    /// Spawn an actor with the default mailbox capacity.
    ///
    /// On failure every actor spawned so far is stopped and the error is
    /// attributed to `name`.
    pub async fn spawn<B: Behavior>(
        &mut self,
        name: &str,
        behavior: B,
    ) -> Result<ActorRef<B::Message>, Error> {
        let capacity = self.capacity;
        self.spawn_with_capacity(name, behavior, capacity).await
    }

    pub async fn spawn_with_capacity<B: Behavior>(
        &mut self,
        name: &str,
        behavior: B,
        capacity: usize,
    ) -> Result<ActorRef<B::Message>, Error> {
        match self.system.spawn(name, behavior, capacity) {
            Ok(actor) => Ok(actor),
            Err(err) => {
                warn!(actor = name, error = %err, "Actor failed to start, unwinding");
                if let Err(stop_err) = self.system.stop_all(self.shutdown_timeout).await {
                    warn!(error = %stop_err, "Unwinding after failed spawn did not finish cleanly");
                }
                Err(Error::component(name, err))
            }
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// The assembled system.
    pub fn finish(self) -> ActorSystem {
        self.system
    }
}
