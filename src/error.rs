//! Error types for the parley turn loop.
//!
//! Each capability has its own taxonomy so the orchestrator can apply a
//! per-kind recovery policy; [`ParleyError`] wraps them for callers that
//! only need to propagate.

/// Stable error codes for log lines and UI mapping.
pub mod error_codes {
    /// Capture produced no speech before it ended.
    pub const CAPTURE_NO_SPEECH: &str = "CAPTURE_NO_SPEECH";
    /// Microphone access was refused.
    pub const CAPTURE_PERMISSION: &str = "CAPTURE_PERMISSION";
    /// Capture was cancelled by the caller.
    pub const CAPTURE_ABORTED: &str = "CAPTURE_ABORTED";
    /// Recognition service could not be reached.
    pub const CAPTURE_TRANSPORT: &str = "CAPTURE_TRANSPORT";
    /// Any other capture failure.
    pub const CAPTURE_OTHER: &str = "CAPTURE_OTHER";
    /// Speech engine failed to start or finish an utterance.
    pub const SYNTHESIS_ENGINE: &str = "SYNTHESIS_ENGINE";
    /// Connection to the text-generation service failed or dropped.
    pub const STREAM_TRANSPORT: &str = "STREAM_TRANSPORT";
    /// Text-generation service answered with a non-success status.
    pub const STREAM_REJECTED: &str = "STREAM_REJECTED";
    /// No backend session could be created for the turn.
    pub const STREAM_SESSION: &str = "STREAM_SESSION";
}

/// Failure reported by a [`crate::capture::CaptureAdapter`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("[{}] no speech detected", error_codes::CAPTURE_NO_SPEECH)]
    NoSpeech,
    #[error("[{}] microphone permission denied", error_codes::CAPTURE_PERMISSION)]
    PermissionDenied,
    #[error("[{}] capture aborted", error_codes::CAPTURE_ABORTED)]
    Aborted,
    #[error("[{}] recognition transport failure", error_codes::CAPTURE_TRANSPORT)]
    Transport,
    #[error("[{}] {}", error_codes::CAPTURE_OTHER, .0)]
    Other(String),
}

impl CaptureError {
    /// Returns the stable error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoSpeech => error_codes::CAPTURE_NO_SPEECH,
            Self::PermissionDenied => error_codes::CAPTURE_PERMISSION,
            Self::Aborted => error_codes::CAPTURE_ABORTED,
            Self::Transport => error_codes::CAPTURE_TRANSPORT,
            Self::Other(_) => error_codes::CAPTURE_OTHER,
        }
    }

    /// Text shown to the user when this error is surfaced.
    pub fn user_message(&self) -> String {
        match self {
            Self::NoSpeech => "I didn't hear anything.".to_owned(),
            Self::PermissionDenied => "Microphone access was denied.".to_owned(),
            Self::Aborted => "Listening was cancelled.".to_owned(),
            Self::Transport => "Speech recognition is unreachable.".to_owned(),
            Self::Other(detail) => format!("Speech recognition failed: {detail}"),
        }
    }
}

/// Failure reported by a [`crate::synthesis::SynthesisAdapter`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SynthesisError {
    #[error("[{}] {}", error_codes::SYNTHESIS_ENGINE, .0)]
    EngineFailure(String),
}

impl SynthesisError {
    /// Returns the stable error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::EngineFailure(_) => error_codes::SYNTHESIS_ENGINE,
        }
    }
}

/// Failure while submitting a query or reading its streamed reply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("[{}] {}", error_codes::STREAM_TRANSPORT, .0)]
    TransportFailure(String),
    #[error("[{}] HTTP {status}: {detail}", error_codes::STREAM_REJECTED)]
    ServerRejected { status: u16, detail: String },
    #[error("[{}] {}", error_codes::STREAM_SESSION, .0)]
    SessionUnavailable(String),
}

impl StreamError {
    /// Returns the stable error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::TransportFailure(_) => error_codes::STREAM_TRANSPORT,
            Self::ServerRejected { .. } => error_codes::STREAM_REJECTED,
            Self::SessionUnavailable(_) => error_codes::STREAM_SESSION,
        }
    }

    /// Whether the credential was refused (the login flow lives elsewhere).
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::ServerRejected { status: 401 | 403, .. })
    }
}

/// Top-level error type for the parley client.
#[derive(Debug, thiserror::Error)]
pub enum ParleyError {
    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("synthesis error: {0}")]
    Synthesis(#[from] SynthesisError),

    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, ParleyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_stable_code() {
        let err = StreamError::ServerRejected {
            status: 502,
            detail: "bad gateway".into(),
        };
        assert_eq!(err.to_string(), "[STREAM_REJECTED] HTTP 502: bad gateway");
        assert_eq!(err.code(), error_codes::STREAM_REJECTED);
    }

    #[test]
    fn auth_failures_are_detected() {
        let unauthorized = StreamError::ServerRejected {
            status: 401,
            detail: String::new(),
        };
        assert!(unauthorized.is_auth_failure());
        assert!(!StreamError::TransportFailure("reset".into()).is_auth_failure());
    }

    #[test]
    fn top_level_wraps_capability_errors() {
        let err: ParleyError = CaptureError::PermissionDenied.into();
        assert!(err.to_string().starts_with("capture error: [CAPTURE_PERMISSION]"));
    }
}
