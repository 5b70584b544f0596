//! Session — the revision-tagged, append-only conversation log.
//!
//! The session is the one structure touched by two logical actors: the
//! orchestration loop appends to it, and the background compactor replaces
//! a prefix of it. Instead of locking the whole pipeline, every structural
//! mutation bumps a monotonically increasing revision and compaction is a
//! compare-and-swap against the revision it was computed from.

use std::collections::BTreeSet;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::SessionError;
use crate::message::{META_COMPACTION, META_USER_REQUESTS, Message};

/// Unique identifier for a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A consistent copy of the session at one revision.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub revision: u64,
    pub messages: Vec<Message>,
}

/// Generated text that replaces a message prefix.
#[derive(Debug, Clone)]
pub struct CompactionSummary {
    /// Number of leading messages the summary replaces.
    pub prefix_len: usize,
    /// Revision the summary was computed against.
    pub expected_revision: u64,
    /// Summary text.
    pub text: String,
    /// User requests the replaced prefix held, recorded on the summary
    /// message so later compactions can still find them.
    pub user_requests: Vec<String>,
}

#[derive(Debug)]
struct SessionState {
    messages: Vec<Message>,
    revision: u64,
    authorized_prefixes: BTreeSet<String>,
    previous_response_id: Option<String>,
    updated_at: DateTime<Utc>,
}

/// An ordered, append-only sequence of messages for one conversation.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    created_at: DateTime<Utc>,
    state: RwLock<SessionState>,
}

impl Session {
    /// Create a new empty session.
    pub fn new() -> Self {
        Self::with_id(SessionId::new())
    }

    pub fn with_id(id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            id,
            created_at: now,
            state: RwLock::new(SessionState {
                messages: Vec::new(),
                revision: 0,
                authorized_prefixes: BTreeSet::new(),
                previous_response_id: None,
                updated_at: now,
            }),
        }
    }

    /// Create a session pre-populated with history.
    pub fn from_messages(messages: Vec<Message>) -> Self {
        let session = Self::new();
        for message in messages {
            session.add_message(message);
        }
        session
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.read().updated_at
    }

    /// Append a message. Returns the new revision.
    pub fn add_message(&self, message: Message) -> u64 {
        let mut state = self.write();
        state.messages.push(message);
        state.revision += 1;
        state.updated_at = Utc::now();
        state.revision
    }

    /// A copy of all messages.
    pub fn messages(&self) -> Vec<Message> {
        self.read().messages.clone()
    }

    pub fn len(&self) -> usize {
        self.read().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().messages.is_empty()
    }

    /// The current head revision.
    pub fn revision(&self) -> u64 {
        self.read().revision
    }

    /// Messages and revision taken under one lock.
    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.read();
        SessionSnapshot {
            revision: state.revision,
            messages: state.messages.clone(),
        }
    }

    /// Replace the leading `prefix_len` messages with one summary message,
    /// provided the session has not moved since the summary was computed.
    pub fn try_compact(&self, summary: &CompactionSummary) -> Result<u64, SessionError> {
        let mut state = self.write();

        if state.revision != summary.expected_revision {
            return Err(SessionError::StaleRevision {
                expected: summary.expected_revision,
                actual: state.revision,
            });
        }

        if summary.prefix_len == 0 || summary.prefix_len > state.messages.len() {
            return Err(SessionError::InvalidPrefix {
                prefix_len: summary.prefix_len,
                available: state.messages.len(),
            });
        }

        let mut replacement = Message::user(summary.text.clone());
        replacement
            .metadata
            .insert(META_COMPACTION.into(), serde_json::Value::Bool(true));
        if !summary.user_requests.is_empty() {
            replacement
                .metadata
                .insert(META_USER_REQUESTS.into(), serde_json::json!(summary.user_requests));
        }

        state
            .messages
            .splice(0..summary.prefix_len, std::iter::once(replacement));
        state.revision += 1;
        state.updated_at = Utc::now();
        // Provider-side continuation state refers to the old transcript.
        state.previous_response_id = None;
        Ok(state.revision)
    }

    /// Apply a compaction. Returns `false` on an optimistic-concurrency
    /// conflict; the session is left untouched in that case.
    pub fn compact_with_summary(&self, summary: &CompactionSummary) -> bool {
        match self.try_compact(summary) {
            Ok(revision) => {
                debug!(session_id = %self.id, revision, replaced = summary.prefix_len, "Session compacted");
                true
            }
            Err(e) => {
                debug!(session_id = %self.id, error = %e, "Compaction rejected");
                false
            }
        }
    }

    /// Record an authorized command prefix for this conversation.
    /// Returns `true` if the prefix was not already present.
    pub fn authorize_command(&self, prefix: impl Into<String>) -> bool {
        let prefix = prefix.into().trim().to_string();
        if prefix.is_empty() {
            return false;
        }
        self.write().authorized_prefixes.insert(prefix)
    }

    /// Whether `command` starts with an authorized prefix on a word boundary.
    pub fn is_command_authorized(&self, command: &str) -> bool {
        let command = command.trim();
        self.read().authorized_prefixes.iter().any(|prefix| {
            command == prefix
                || command
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.starts_with(char::is_whitespace))
        })
    }

    pub fn authorized_prefixes(&self) -> Vec<String> {
        self.read().authorized_prefixes.iter().cloned().collect()
    }

    /// Provider-side continuation token from the last response.
    pub fn previous_response_id(&self) -> Option<String> {
        self.read().previous_response_id.clone()
    }

    pub fn set_previous_response_id(&self, id: Option<String>) {
        self.write().previous_response_id = id;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
