//! # RustedLoop Actors
//!
//! A small actor substrate: named workers, each with a bounded mailbox and a
//! single dedicated task. State owned by a [`Behavior`] is only ever touched
//! by its own task, so it needs no locks.
//!
//! Clients wrap an [`ActorRef`] and expose plain async methods built on
//! [`ActorRef::request`], which sends a message carrying a one-shot reply
//! channel and waits for the answer while respecting the caller's
//! cancellation token.

pub mod actor_ref;
pub mod behavior;
pub mod system;

pub use actor_ref::ActorRef;
pub use behavior::{ActorContext, Behavior};
pub use system::{ActorSystem, SystemBuilder};
