//! Speech output: the narrow event contract over a text-to-speech engine.
//!
//! An utterance emits [`PlaybackEvent::Started`] and then exactly one of
//! [`PlaybackEvent::Ended`] or [`PlaybackEvent::Error`]. A cancelled
//! utterance may emit nothing further; callers identify stale events by the
//! utterance number they passed to [`SynthesisAdapter::speak`].

mod command;
mod voices;

pub use command::CommandSynthesis;
pub use voices::{Voice, normalize_locale, parse_voice_listing, select_voice};

use crate::error::SynthesisError;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    Started,
    Ended,
    Error(SynthesisError),
}

/// A playback event tagged with the utterance that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackSignal {
    pub utterance: u64,
    pub event: PlaybackEvent,
}

impl PlaybackSignal {
    pub fn new(utterance: u64, event: PlaybackEvent) -> Self {
        Self { utterance, event }
    }
}

/// Where an adapter delivers its events.
pub type PlaybackSink = mpsc::UnboundedSender<PlaybackSignal>;

/// Text-to-speech capability.
///
/// At most one utterance plays at a time. [`speak`](Self::speak) refuses
/// to start while another utterance is still playing; callers cancel first.
pub trait SynthesisAdapter: Send {
    /// Register the event handler. Replaces any previous one.
    fn subscribe(&mut self, events: PlaybackSink);

    /// Start speaking `text` as utterance number `utterance`.
    ///
    /// # Errors
    ///
    /// Returns [`SynthesisError::EngineFailure`] if the engine cannot start
    /// or an utterance is already playing.
    fn speak(&mut self, utterance: u64, text: &str) -> Result<(), SynthesisError>;

    /// Silence any playing or queued utterance. Idempotent.
    fn cancel_all(&mut self);

    /// Keepalive check while an utterance plays.
    ///
    /// Resumes an engine the host suspended, or fails an utterance whose
    /// engine has hung by sending `Error` for it. Returns `true` if it did
    /// either. The default is for engines that cannot stall.
    fn resume_if_stalled(&mut self) -> bool {
        false
    }
}
