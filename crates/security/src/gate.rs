//! The authorization gate: an actor that owns the authorizer, and the
//! client handle everyone else uses to talk to it.

use rustedloop_actors::{ActorContext, ActorRef, Behavior};
use rustedloop_core::{ActorError, AuthDecision, AuthRequest};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::authorizer::Authorizer;

/// Messages understood by [`AuthorizationActor`].
pub enum AuthMessage {
    Check {
        request: AuthRequest,
        reply: oneshot::Sender<AuthDecision>,
    },
    GrantPrefix {
        prefix: String,
        reply: oneshot::Sender<bool>,
    },
    GrantDomain {
        domain: String,
        reply: oneshot::Sender<bool>,
    },
    GrantedPrefixes {
        reply: oneshot::Sender<Vec<String>>,
    },
}

/// Serializes every read and write of authorization state.
pub struct AuthorizationActor {
    authorizer: Box<dyn Authorizer>,
}

impl AuthorizationActor {
    pub fn new(authorizer: Box<dyn Authorizer>) -> Self {
        Self { authorizer }
    }
}

#[async_trait::async_trait]
impl Behavior for AuthorizationActor {
    type Message = AuthMessage;

    async fn handle(&mut self, msg: AuthMessage, _ctx: &ActorContext) {
        match msg {
            AuthMessage::Check { request, reply } => {
                let decision = self.authorizer.check(&request);
                debug!(tool = %request.tool_name, ?decision, "Authorization checked");
                let _ = reply.send(decision);
            }
            AuthMessage::GrantPrefix { prefix, reply } => {
                let added = self.authorizer.grant_prefix(&prefix);
                if added {
                    info!(%prefix, "Command prefix granted");
                }
                let _ = reply.send(added);
            }
            AuthMessage::GrantDomain { domain, reply } => {
                let added = self.authorizer.grant_domain(&domain);
                if added {
                    info!(%domain, "Domain granted");
                }
                let _ = reply.send(added);
            }
            AuthMessage::GrantedPrefixes { reply } => {
                let _ = reply.send(self.authorizer.granted_prefixes());
            }
        }
    }
}

/// Client handle for the authorization actor.
#[derive(Debug, Clone)]
pub struct AuthorizationGate {
    actor: ActorRef<AuthMessage>,
}

impl AuthorizationGate {
    pub fn new(actor: ActorRef<AuthMessage>) -> Self {
        Self { actor }
    }

    pub async fn check(
        &self,
        cancel: &CancellationToken,
        request: AuthRequest,
    ) -> Result<AuthDecision, ActorError> {
        self.actor
            .request(cancel, |reply| AuthMessage::Check { request, reply })
            .await
    }

    pub async fn grant_prefix(
        &self,
        cancel: &CancellationToken,
        prefix: impl Into<String>,
    ) -> Result<bool, ActorError> {
        let prefix = prefix.into();
        self.actor
            .request(cancel, |reply| AuthMessage::GrantPrefix { prefix, reply })
            .await
    }

    pub async fn grant_domain(
        &self,
        cancel: &CancellationToken,
        domain: impl Into<String>,
    ) -> Result<bool, ActorError> {
        let domain = domain.into();
        self.actor
            .request(cancel, |reply| AuthMessage::GrantDomain { domain, reply })
            .await
    }

    pub async fn granted_prefixes(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, ActorError> {
        self.actor
            .request(cancel, |reply| AuthMessage::GrantedPrefixes { reply })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorizer::{Grants, InteractiveAuthorizer};
    use rustedloop_actors::ActorSystem;
    use std::time::Duration;

    fn spawn_gate(system: &ActorSystem) -> AuthorizationGate {
        let authorizer = InteractiveAuthorizer::new(Grants::new(vec!["ls".into()], Vec::new()));
        let actor = system
            .spawn("authorization", AuthorizationActor::new(Box::new(authorizer)), 8)
            .unwrap();
        AuthorizationGate::new(actor)
    }

    #[tokio::test]
    async fn gate_checks_and_grants_through_the_actor() {
        let system = ActorSystem::new(CancellationToken::new());
        let gate = spawn_gate(&system);
        let cancel = CancellationToken::new();
        let request = AuthRequest::command("shell", "git push origin main");

        assert!(gate.check(&cancel, AuthRequest::command("shell", "ls -la")).await.unwrap().is_allowed());
        assert!(!gate.check(&cancel, request.clone()).await.unwrap().is_allowed());

        assert!(gate.grant_prefix(&cancel, "git push").await.unwrap());
        assert!(gate.check(&cancel, request).await.unwrap().is_allowed());
        assert_eq!(
            gate.granted_prefixes(&cancel).await.unwrap(),
            vec!["git push", "ls"]
        );

        system.stop_all(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_grants_are_serialized() {
        let system = ActorSystem::new(CancellationToken::new());
        let gate = spawn_gate(&system);
        let cancel = CancellationToken::new();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let gate = gate.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                gate.grant_prefix(&cancel, "cargo test").await.unwrap()
            }));
        }

        let mut added = 0;
        for handle in handles {
            if handle.await.unwrap() {
                added += 1;
            }
        }
        assert_eq!(added, 1);

        system.stop_all(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_caller_gets_cancelled_error() {
        let system = ActorSystem::new(CancellationToken::new());
        let gate = spawn_gate(&system);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = gate
            .check(&cancel, AuthRequest::command("shell", "ls"))
            .await
            .unwrap_err();
        assert!(matches!(err, ActorError::Cancelled));

        system.stop_all(Duration::from_secs(1)).await.unwrap();
    }
}
