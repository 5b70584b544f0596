//! Pluggable authorization policies.
//!
//! An [`Authorizer`] is owned by the authorization actor, so its methods
//! take `&mut self` freely and never need interior locking.

use std::collections::BTreeSet;

use rustedloop_config::{AuthorizationConfig, AuthorizationMode};
use rustedloop_core::{AuthDecision, AuthKind, AuthRequest};

use crate::allowlist::{domain_matches, host_of, is_private_host, prefix_matches, suggest_prefix};

/// Decides whether a gated operation may run.
pub trait Authorizer: Send + 'static {
    fn check(&self, request: &AuthRequest) -> AuthDecision;

    /// Grant a command prefix. Returns `true` if it was new.
    fn grant_prefix(&mut self, prefix: &str) -> bool;

    /// Grant a domain. Returns `true` if it was new.
    fn grant_domain(&mut self, domain: &str) -> bool;

    fn granted_prefixes(&self) -> Vec<String>;
}

/// Granted prefixes and domains, shared by the list-based authorizers.
#[derive(Debug, Clone, Default)]
pub struct Grants {
    prefixes: BTreeSet<String>,
    domains: BTreeSet<String>,
}

impl Grants {
    pub fn new(
        prefixes: impl IntoIterator<Item = String>,
        domains: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            prefixes: prefixes
                .into_iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            domains: domains
                .into_iter()
                .map(|d| d.trim().to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
        }
    }

    fn covers(&self, kind: &AuthKind) -> bool {
        match kind {
            AuthKind::Command(command) => self.prefixes.iter().any(|p| prefix_matches(p, command)),
            AuthKind::Domain(target) => {
                let host = host_of(target);
                self.domains.iter().any(|d| domain_matches(d, &host))
            }
            AuthKind::Action(_) => false,
        }
    }

    fn grant_prefix(&mut self, prefix: &str) -> bool {
        let prefix = prefix.trim();
        !prefix.is_empty() && self.prefixes.insert(prefix.to_string())
    }

    fn grant_domain(&mut self, domain: &str) -> bool {
        let domain = domain.trim().to_ascii_lowercase();
        !domain.is_empty() && self.domains.insert(domain)
    }
}

fn suggestion_for(kind: &AuthKind) -> Option<String> {
    match kind {
        AuthKind::Command(command) => suggest_prefix(command),
        _ => None,
    }
}

/// Only pre-authorized prefixes and domains run; everything else is denied.
#[derive(Debug, Clone, Default)]
pub struct AllowlistAuthorizer {
    grants: Grants,
}

impl AllowlistAuthorizer {
    pub fn new(grants: Grants) -> Self {
        Self { grants }
    }
}

impl Authorizer for AllowlistAuthorizer {
    fn check(&self, request: &AuthRequest) -> AuthDecision {
        if self.grants.covers(&request.kind) {
            return AuthDecision::Allowed;
        }
        let reason = match &request.kind {
            AuthKind::Domain(target) if is_private_host(&host_of(target)) => {
                format!("Request to private/internal host blocked: {target}")
            }
            _ => format!("{} is not on the allowlist", request.reason),
        };
        AuthDecision::Denied(reason)
    }

    fn grant_prefix(&mut self, prefix: &str) -> bool {
        self.grants.grant_prefix(prefix)
    }

    fn grant_domain(&mut self, domain: &str) -> bool {
        self.grants.grant_domain(domain)
    }

    fn granted_prefixes(&self) -> Vec<String> {
        self.grants.prefixes.iter().cloned().collect()
    }
}

/// Pre-authorized operations run; everything else goes to a human.
#[derive(Debug, Clone, Default)]
pub struct InteractiveAuthorizer {
    grants: Grants,
}

impl InteractiveAuthorizer {
    pub fn new(grants: Grants) -> Self {
        Self { grants }
    }
}

impl Authorizer for InteractiveAuthorizer {
    fn check(&self, request: &AuthRequest) -> AuthDecision {
        if self.grants.covers(&request.kind) {
            return AuthDecision::Allowed;
        }
        let reason = match &request.kind {
            AuthKind::Domain(target) if is_private_host(&host_of(target)) => {
                format!("{} (private/internal host)", request.reason)
            }
            _ => request.reason.clone(),
        };
        AuthDecision::NeedsApproval {
            reason,
            suggested_prefix: suggestion_for(&request.kind),
        }
    }

    fn grant_prefix(&mut self, prefix: &str) -> bool {
        self.grants.grant_prefix(prefix)
    }

    fn grant_domain(&mut self, domain: &str) -> bool {
        self.grants.grant_domain(domain)
    }

    fn granted_prefixes(&self) -> Vec<String> {
        self.grants.prefixes.iter().cloned().collect()
    }
}

/// Allows everything. For trusted batch environments.
#[derive(Debug, Clone, Default)]
pub struct AllowAllAuthorizer {
    prefixes: BTreeSet<String>,
}

impl Authorizer for AllowAllAuthorizer {
    fn check(&self, _request: &AuthRequest) -> AuthDecision {
        AuthDecision::Allowed
    }

    fn grant_prefix(&mut self, prefix: &str) -> bool {
        self.prefixes.insert(prefix.trim().to_string())
    }

    fn grant_domain(&mut self, _domain: &str) -> bool {
        false
    }

    fn granted_prefixes(&self) -> Vec<String> {
        self.prefixes.iter().cloned().collect()
    }
}

/// Build the authorizer selected by configuration.
pub fn authorizer_from_config(config: &AuthorizationConfig) -> Box<dyn Authorizer> {
    let grants = Grants::new(
        config.allowed_prefixes.iter().cloned(),
        config.allowed_domains.iter().cloned(),
    );
    match config.mode {
        AuthorizationMode::Interactive => Box::new(InteractiveAuthorizer::new(grants)),
        AuthorizationMode::Allowlist => Box::new(AllowlistAuthorizer::new(grants)),
        AuthorizationMode::AllowAll => Box::new(AllowAllAuthorizer::default()),
    }
}
