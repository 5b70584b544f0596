//! Authorization gate for RustedLoop.
//!
//! Provides:
//! - **Allowlists**: word-boundary command prefixes, domain/subdomain matching
//! - **Authorizers**: allowlist-only, interactive and allow-all policies
//! - **Gate**: an actor that owns authorization state, plus its client handle

pub mod allowlist;
pub mod authorizer;
pub mod gate;

pub use allowlist::{domain_matches, host_of, is_private_host, prefix_matches, suggest_prefix};
pub use authorizer::{
    AllowAllAuthorizer, AllowlistAuthorizer, Authorizer, Grants, InteractiveAuthorizer,
    authorizer_from_config,
};
pub use gate::{AuthMessage, AuthorizationActor, AuthorizationGate};
