//! Authorization vocabulary shared by tools, the gate and the loop.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// What kind of side effect a tool call wants to perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "target", rename_all = "snake_case")]
pub enum AuthKind {
    /// A shell command line.
    Command(String),
    /// Network access to a URL or host.
    Domain(String),
    /// Any other named side effect.
    Action(String),
}

/// A tool's request to perform a gated operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub tool_name: String,
    pub kind: AuthKind,
    /// Human-readable description shown to the approver.
    pub reason: String,
}

impl AuthRequest {
    pub fn command(tool_name: impl Into<String>, command: impl Into<String>) -> Self {
        let command = command.into();
        Self {
            tool_name: tool_name.into(),
            reason: format!("Run command: {command}"),
            kind: AuthKind::Command(command),
        }
    }

    pub fn domain(tool_name: impl Into<String>, url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            tool_name: tool_name.into(),
            reason: format!("Access network: {url}"),
            kind: AuthKind::Domain(url),
        }
    }

    pub fn action(tool_name: impl Into<String>, action: impl Into<String>) -> Self {
        let action = action.into();
        Self {
            tool_name: tool_name.into(),
            reason: action.clone(),
            kind: AuthKind::Action(action),
        }
    }
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Allowed,
    Denied(String),
    /// The caller must ask a human.
    NeedsApproval {
        reason: String,
        /// Prefix to remember if the human approves.
        suggested_prefix: Option<String>,
    },
}

impl AuthDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Durable storage for approved command prefixes.
pub trait PrefixStore: Send + Sync {
    fn contains(&self, prefix: &str) -> bool;

    /// May block on file I/O.
    fn persist(&self, prefix: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_request_describes_itself() {
        let req = AuthRequest::command("shell", "git push");
        assert_eq!(req.kind, AuthKind::Command("git push".into()));
        assert!(req.reason.contains("git push"));
    }

    #[test]
    fn only_allowed_is_allowed() {
        assert!(AuthDecision::Allowed.is_allowed());
        assert!(!AuthDecision::Denied("no".into()).is_allowed());
        assert!(
            !AuthDecision::NeedsApproval {
                reason: "ask".into(),
                suggested_prefix: None
            }
            .is_allowed()
        );
    }
}
