//! Speech capture: the narrow event contract over a speech-to-text engine.
//!
//! A capture cycle emits zero or more [`CaptureEvent::PartialResult`], then
//! exactly one of [`CaptureEvent::FinalResult`] or [`CaptureEvent::Error`],
//! then [`CaptureEvent::Ended`]. Every event is tagged with the cycle number
//! the caller passed to [`CaptureAdapter::start_capture`], which is how the
//! orchestrator recognises results from a cycle it already abandoned.

mod line;

pub use line::LineCapture;

use crate::error::CaptureError;
use tokio::sync::mpsc;

/// Why a capture cycle failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureErrorKind {
    NoSpeechDetected,
    PermissionDenied,
    /// Expected outcome of [`CaptureAdapter::stop_capture`].
    Aborted,
    NetworkFailure,
    Other(String),
}

impl From<CaptureErrorKind> for CaptureError {
    fn from(kind: CaptureErrorKind) -> Self {
        match kind {
            CaptureErrorKind::NoSpeechDetected => Self::NoSpeech,
            CaptureErrorKind::PermissionDenied => Self::PermissionDenied,
            CaptureErrorKind::Aborted => Self::Aborted,
            CaptureErrorKind::NetworkFailure => Self::Transport,
            CaptureErrorKind::Other(detail) => Self::Other(detail),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    PartialResult(String),
    FinalResult(String),
    Error(CaptureErrorKind),
    Ended,
}

/// A capture event tagged with the cycle that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSignal {
    pub cycle: u64,
    pub event: CaptureEvent,
}

impl CaptureSignal {
    pub fn new(cycle: u64, event: CaptureEvent) -> Self {
        Self { cycle, event }
    }
}

/// Where an adapter delivers its events.
pub type CaptureSink = mpsc::UnboundedSender<CaptureSignal>;

/// Speech-to-text capability.
///
/// Implementations tolerate redundant calls: starting while a cycle is
/// running or stopping while idle is logged and otherwise ignored.
pub trait CaptureAdapter: Send {
    /// Register the event handler. Replaces any previous one.
    fn subscribe(&mut self, events: CaptureSink);

    /// Open the microphone for one utterance, tagging events with `cycle`.
    fn start_capture(&mut self, cycle: u64);

    /// Interrupt the running cycle. The cycle then reports
    /// [`CaptureErrorKind::Aborted`] unless it already produced a result.
    ///
    /// A new cycle may be started as soon as this returns.
    fn stop_capture(&mut self);
}
