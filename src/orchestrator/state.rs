use serde::Serialize;
use std::fmt;

/// What the turn loop is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    /// Waiting for the user.
    Idle,
    /// Capture is open for one utterance.
    Listening,
    /// A reply is being read from the backend.
    Streaming,
    /// The reply is being spoken; capture is locked out.
    Speaking,
    /// Waiting out the audio tail before capture may reopen.
    CoolingDown,
}

impl OrchestratorState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Streaming => "streaming",
            Self::Speaking => "speaking",
            Self::CoolingDown => "cooling_down",
        }
    }
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
