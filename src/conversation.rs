//! In-memory log of the turns in the active session.
//!
//! The store is display state: it is written only by the orchestrator and
//! cleared when a new chat starts. Persistence belongs to the backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a backend conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One message in the conversation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: Uuid,
    pub role: Role,
    pub text: String,
    /// Once set, `text` never changes again.
    pub finalized: bool,
    /// The exchange this turn belongs to did not complete.
    pub failed: bool,
    /// Streaming was cut short by a user cancellation.
    pub interrupted: bool,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    fn new(role: Role, text: String, finalized: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            text,
            finalized,
            failed: false,
            interrupted: false,
            created_at: Utc::now(),
        }
    }
}

/// A role/text pair for rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub role: Role,
    pub text: String,
}

/// Append-only turn log with at most one unfinalized turn.
#[derive(Debug, Default)]
pub struct ConversationStore {
    turns: Vec<Turn>,
    session: Option<SessionId>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every turn and the session binding.
    pub fn new_session(&mut self) {
        self.turns.clear();
        self.session = None;
    }

    pub fn session(&self) -> Option<&SessionId> {
        self.session.as_ref()
    }

    pub fn bind_session(&mut self, id: SessionId) {
        self.session = Some(id);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// The unfinalized turn, if one is streaming.
    pub fn active(&self) -> Option<&Turn> {
        self.turns.last().filter(|t| !t.finalized)
    }

    /// Record an accepted user utterance or typed submission.
    ///
    /// Any turn still streaming is finalized first so the one-in-flight rule
    /// holds even if a caller skipped the normal completion path.
    pub fn push_user(&mut self, text: &str) -> Uuid {
        self.seal_active();
        let turn = Turn::new(Role::User, text.to_owned(), true);
        let id = turn.id;
        self.turns.push(turn);
        id
    }

    /// Open an empty assistant turn that will receive streamed text.
    pub fn begin_assistant(&mut self) -> Uuid {
        self.seal_active();
        let turn = Turn::new(Role::Assistant, String::new(), false);
        let id = turn.id;
        self.turns.push(turn);
        id
    }

    /// Append a streamed fragment to the active turn. Returns `false` when
    /// nothing is streaming.
    pub fn append_active(&mut self, fragment: &str) -> bool {
        match self.active_mut() {
            Some(turn) => {
                turn.text.push_str(fragment);
                true
            }
            None => false,
        }
    }

    /// Freeze the active turn as a completed reply and return its text.
    pub fn finalize_active(&mut self) -> Option<String> {
        let turn = self.active_mut()?;
        turn.finalized = true;
        Some(turn.text.clone())
    }

    /// Replace the active turn's partial text with `message` and freeze it
    /// as failed. When `user_failed` is set the preceding user turn is
    /// flagged too.
    pub fn fail_active(&mut self, message: &str, user_failed: bool) -> Option<String> {
        let turn = self.active_mut()?;
        turn.text = message.to_owned();
        turn.failed = true;
        turn.finalized = true;
        if user_failed
            && let Some(user) = self
                .turns
                .iter_mut()
                .rev()
                .find(|t| t.role == Role::User)
        {
            user.failed = true;
        }
        Some(message.to_owned())
    }

    /// Freeze the active turn with whatever text it holds, marked interrupted.
    pub fn interrupt_active(&mut self) -> bool {
        self.seal_active()
    }

    /// Role/text pairs of every non-empty turn.
    pub fn snapshot(&self) -> Vec<SnapshotEntry> {
        self.turns
            .iter()
            .filter(|t| !t.text.trim().is_empty())
            .map(|t| SnapshotEntry {
                role: t.role,
                text: t.text.clone(),
            })
            .collect()
    }

    fn active_mut(&mut self) -> Option<&mut Turn> {
        self.turns.last_mut().filter(|t| !t.finalized)
    }

    fn seal_active(&mut self) -> bool {
        match self.active_mut() {
            Some(turn) => {
                turn.finalized = true;
                turn.interrupted = true;
                true
            }
            None => false,
        }
    }
}
