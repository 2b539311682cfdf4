//! Runtime events emitted by the turn loop for UI and observability.
//!
//! Events are small and cloned per subscriber. Sending never blocks the
//! loop; a lagging subscriber loses old events rather than stalling turns.

use crate::conversation::SessionId;
use crate::orchestrator::OrchestratorState;

/// What the turn loop is doing "right now".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    /// The state machine moved between states.
    StateChanged {
        from: OrchestratorState,
        to: OrchestratorState,
    },
    /// Interim recognition text while the user is still speaking.
    PartialTranscript(String),
    /// A user utterance or typed submission was accepted.
    UserTurn(String),
    /// A fragment of the assistant reply arrived.
    AssistantDelta(String),
    /// The assistant reply is complete (or was substituted after a failure).
    AssistantFinal { text: String, failed: bool },
    /// The turn log was bound to a backend session.
    SessionBound(SessionId),
    /// Message for the user that is not part of the conversation.
    Notice(String),
    /// Hands-free mode was switched.
    ContinuousMode { enabled: bool },
}
