//! Scripted capability adapters and backend for exercising the turn loop
//! without a microphone, a speaker, or a network.
//!
//! Each fake returns a cloneable handle through which a test injects events
//! and inspects what the orchestrator asked for. Capture and playback share
//! a [`DeviceLog`] so a whole run can be checked for capture/playback
//! overlap afterwards.

use crate::backend::{ChatBackend, ChatRequest, ModelInfo, SessionSummary, TextStream};
use crate::capture::{CaptureAdapter, CaptureErrorKind, CaptureEvent, CaptureSignal, CaptureSink};
use crate::conversation::SessionId;
use crate::echo_guard::EchoGuard;
use crate::error::{StreamError, SynthesisError};
use crate::synthesis::{PlaybackEvent, PlaybackSignal, PlaybackSink, SynthesisAdapter};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── Device Log ─────────────────────────────────────────────────

/// What happened to the audio hardware, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    CaptureOpened { guard_engaged: bool },
    CaptureClosed,
    PlaybackStarted,
    PlaybackStopped,
}

/// Shared, ordered record of device use.
#[derive(Debug, Clone, Default)]
pub struct DeviceLog(Arc<Mutex<Vec<DeviceEvent>>>);

impl DeviceLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, event: DeviceEvent) {
        lock(&self.0).push(event);
    }

    pub fn events(&self) -> Vec<DeviceEvent> {
        lock(&self.0).clone()
    }

    /// True when the microphone was never open while the speaker played and
    /// never opened while the echo guard was engaged.
    pub fn overlap_free(&self) -> bool {
        let mut capture_open = false;
        let mut playing = false;
        for event in lock(&self.0).iter() {
            match *event {
                DeviceEvent::CaptureOpened { guard_engaged } => {
                    if guard_engaged || playing {
                        return false;
                    }
                    capture_open = true;
                }
                DeviceEvent::CaptureClosed => capture_open = false,
                DeviceEvent::PlaybackStarted => {
                    if capture_open {
                        return false;
                    }
                    playing = true;
                }
                DeviceEvent::PlaybackStopped => playing = false,
            }
        }
        true
    }
}

// ── Scripted Capture ───────────────────────────────────────────

#[derive(Default)]
struct CaptureState {
    sink: Option<CaptureSink>,
    open: Option<u64>,
    last_cycle: Option<u64>,
    starts: usize,
    stops: usize,
    scripts: VecDeque<Vec<CaptureEvent>>,
}

/// Test-side control of a [`ScriptedCapture`].
#[derive(Clone)]
pub struct CaptureHandle {
    state: Arc<Mutex<CaptureState>>,
    log: DeviceLog,
}

impl CaptureHandle {
    fn deliver(&self, state: &mut CaptureState, cycle: u64, event: CaptureEvent) {
        let closes = matches!(
            event,
            CaptureEvent::FinalResult(_) | CaptureEvent::Error(_) | CaptureEvent::Ended
        );
        if closes && state.open == Some(cycle) {
            state.open = None;
            self.log.record(DeviceEvent::CaptureClosed);
        }
        if let Some(sink) = &state.sink {
            let _ = sink.send(CaptureSignal::new(cycle, event));
        }
    }

    /// Emit `event` for the most recently started cycle.
    pub fn emit(&self, event: CaptureEvent) {
        let mut state = lock(&self.state);
        let Some(cycle) = state.last_cycle else {
            debug!("scripted capture never started, dropping event");
            return;
        };
        self.deliver(&mut state, cycle, event);
    }

    /// Emit `event` tagged with an arbitrary cycle, e.g. an abandoned one.
    pub fn emit_for(&self, cycle: u64, event: CaptureEvent) {
        let mut state = lock(&self.state);
        self.deliver(&mut state, cycle, event);
    }

    /// Emit a final result followed by `Ended`.
    pub fn say(&self, text: &str) {
        self.emit(CaptureEvent::FinalResult(text.to_owned()));
        self.emit(CaptureEvent::Ended);
    }

    /// Emit an error followed by `Ended`.
    pub fn fail(&self, kind: CaptureErrorKind) {
        self.emit(CaptureEvent::Error(kind));
        self.emit(CaptureEvent::Ended);
    }

    /// Queue events to emit as soon as the next cycle starts.
    pub fn script(&self, events: Vec<CaptureEvent>) {
        lock(&self.state).scripts.push_back(events);
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state).open.is_some()
    }

    pub fn last_cycle(&self) -> Option<u64> {
        lock(&self.state).last_cycle
    }

    pub fn starts(&self) -> usize {
        lock(&self.state).starts
    }

    pub fn stops(&self) -> usize {
        lock(&self.state).stops
    }
}

/// [`CaptureAdapter`] driven by a [`CaptureHandle`].
pub struct ScriptedCapture {
    handle: CaptureHandle,
    guard: EchoGuard,
}

impl ScriptedCapture {
    pub fn new(guard: EchoGuard, log: DeviceLog) -> (Self, CaptureHandle) {
        let handle = CaptureHandle {
            state: Arc::new(Mutex::new(CaptureState::default())),
            log,
        };
        (
            Self {
                handle: handle.clone(),
                guard,
            },
            handle,
        )
    }
}

impl CaptureAdapter for ScriptedCapture {
    fn subscribe(&mut self, events: CaptureSink) {
        lock(&self.handle.state).sink = Some(events);
    }

    fn start_capture(&mut self, cycle: u64) {
        let mut state = lock(&self.handle.state);
        if state.open.is_some() {
            debug!(cycle, "scripted capture already open");
            return;
        }
        state.starts += 1;
        state.open = Some(cycle);
        state.last_cycle = Some(cycle);
        self.handle.log.record(DeviceEvent::CaptureOpened {
            guard_engaged: self.guard.is_speaking(),
        });
        if let Some(script) = state.scripts.pop_front() {
            for event in script {
                self.handle.deliver(&mut state, cycle, event);
            }
        }
    }

    fn stop_capture(&mut self) {
        let mut state = lock(&self.handle.state);
        let Some(cycle) = state.open else {
            debug!("scripted capture not open");
            return;
        };
        state.stops += 1;
        self.handle.deliver(
            &mut state,
            cycle,
            CaptureEvent::Error(CaptureErrorKind::Aborted),
        );
        self.handle.deliver(&mut state, cycle, CaptureEvent::Ended);
    }
}

// ── Scripted Synthesis ─────────────────────────────────────────

#[derive(Default)]
struct SynthesisState {
    sink: Option<PlaybackSink>,
    playing: Option<u64>,
    spoken: Vec<String>,
    cancels: usize,
    auto_finish: bool,
    refuse_start: bool,
    stalled: bool,
    resumes: usize,
}

/// Test-side control of a [`ScriptedSynthesis`].
#[derive(Clone)]
pub struct SynthesisHandle {
    state: Arc<Mutex<SynthesisState>>,
    log: DeviceLog,
}

impl SynthesisHandle {
    fn end_current(&self, event: PlaybackEvent) {
        let mut state = lock(&self.state);
        let Some(utterance) = state.playing.take() else {
            debug!("nothing playing");
            return;
        };
        self.log.record(DeviceEvent::PlaybackStopped);
        if let Some(sink) = &state.sink {
            let _ = sink.send(PlaybackSignal::new(utterance, event));
        }
    }

    /// Finish the playing utterance normally.
    pub fn finish(&self) {
        self.end_current(PlaybackEvent::Ended);
    }

    /// Fail the playing utterance.
    pub fn fail(&self, detail: &str) {
        self.end_current(PlaybackEvent::Error(SynthesisError::EngineFailure(
            detail.to_owned(),
        )));
    }

    /// Emit `event` for an arbitrary utterance without touching device state.
    pub fn emit_for(&self, utterance: u64, event: PlaybackEvent) {
        if let Some(sink) = &lock(&self.state).sink {
            let _ = sink.send(PlaybackSignal::new(utterance, event));
        }
    }

    /// End every utterance as soon as it starts.
    pub fn set_auto_finish(&self, enabled: bool) {
        lock(&self.state).auto_finish = enabled;
    }

    /// Make `speak` fail synchronously.
    pub fn set_refuse_start(&self, enabled: bool) {
        lock(&self.state).refuse_start = enabled;
    }

    /// Pretend the host suspended the engine.
    pub fn stall(&self) {
        lock(&self.state).stalled = true;
    }

    pub fn spoken(&self) -> Vec<String> {
        lock(&self.state).spoken.clone()
    }

    pub fn is_playing(&self) -> bool {
        lock(&self.state).playing.is_some()
    }

    pub fn current_utterance(&self) -> Option<u64> {
        lock(&self.state).playing
    }

    pub fn cancels(&self) -> usize {
        lock(&self.state).cancels
    }

    pub fn resumes(&self) -> usize {
        lock(&self.state).resumes
    }
}

/// [`SynthesisAdapter`] driven by a [`SynthesisHandle`].
pub struct ScriptedSynthesis {
    handle: SynthesisHandle,
}

impl ScriptedSynthesis {
    pub fn new(log: DeviceLog) -> (Self, SynthesisHandle) {
        let handle = SynthesisHandle {
            state: Arc::new(Mutex::new(SynthesisState::default())),
            log,
        };
        (
            Self {
                handle: handle.clone(),
            },
            handle,
        )
    }
}

impl SynthesisAdapter for ScriptedSynthesis {
    fn subscribe(&mut self, events: PlaybackSink) {
        lock(&self.handle.state).sink = Some(events);
    }

    fn speak(&mut self, utterance: u64, text: &str) -> Result<(), SynthesisError> {
        let auto_finish = {
            let mut state = lock(&self.handle.state);
            if state.playing.is_some() {
                return Err(SynthesisError::EngineFailure(
                    "an utterance is already playing".into(),
                ));
            }
            if state.refuse_start {
                return Err(SynthesisError::EngineFailure("engine unavailable".into()));
            }
            self.handle.log.record(DeviceEvent::PlaybackStarted);
            state.playing = Some(utterance);
            state.spoken.push(text.to_owned());
            if let Some(sink) = &state.sink {
                let _ = sink.send(PlaybackSignal::new(utterance, PlaybackEvent::Started));
            }
            state.auto_finish
        };
        if auto_finish {
            self.handle.finish();
        }
        Ok(())
    }

    fn cancel_all(&mut self) {
        let mut state = lock(&self.handle.state);
        state.cancels += 1;
        if state.playing.take().is_some() {
            self.handle.log.record(DeviceEvent::PlaybackStopped);
        }
    }

    fn resume_if_stalled(&mut self) -> bool {
        let mut state = lock(&self.handle.state);
        if state.stalled {
            state.stalled = false;
            state.resumes += 1;
            true
        } else {
            false
        }
    }
}

// ── Scripted Backend ───────────────────────────────────────────

/// One scripted reply to `open_stream`.
#[derive(Debug, Clone, Default)]
pub struct ScriptedReply {
    chunks: Vec<Result<String, StreamError>>,
    rejection: Option<StreamError>,
    hold_open: bool,
}

impl ScriptedReply {
    /// A reply that streams `fragments` and then closes.
    pub fn text(fragments: &[&str]) -> Self {
        Self {
            chunks: fragments.iter().map(|f| Ok((*f).to_owned())).collect(),
            ..Self::default()
        }
    }

    /// A request refused before any byte of reply.
    pub fn rejected(error: StreamError) -> Self {
        Self {
            rejection: Some(error),
            ..Self::default()
        }
    }

    /// Break the stream with `error` after the fragments.
    pub fn then_fail(mut self, error: StreamError) -> Self {
        self.chunks.push(Err(error));
        self
    }

    /// Keep the stream open after the fragments, never finishing.
    pub fn held_open(mut self) -> Self {
        self.hold_open = true;
        self
    }
}

#[derive(Default)]
struct BackendState {
    replies: VecDeque<ScriptedReply>,
    session_failure: Option<StreamError>,
    session_titles: Vec<String>,
    requests: Vec<ChatRequest>,
    models: Vec<ModelInfo>,
    sessions: Vec<SessionSummary>,
}

/// In-memory [`ChatBackend`]. Clones share the same script.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    state: Arc<Mutex<BackendState>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_reply(&self, reply: ScriptedReply) {
        lock(&self.state).replies.push_back(reply);
    }

    /// Make every `create_session` call fail with `error`.
    pub fn fail_sessions(&self, error: StreamError) {
        lock(&self.state).session_failure = Some(error);
    }

    pub fn set_models(&self, names: &[&str]) {
        lock(&self.state).models = names
            .iter()
            .map(|n| ModelInfo {
                model: (*n).to_owned(),
            })
            .collect();
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        lock(&self.state).requests.clone()
    }

    pub fn session_titles(&self) -> Vec<String> {
        lock(&self.state).session_titles.clone()
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn create_session(&self, title: &str) -> Result<SessionId, StreamError> {
        let mut state = lock(&self.state);
        if let Some(error) = &state.session_failure {
            return Err(error.clone());
        }
        state.session_titles.push(title.to_owned());
        let id = SessionId(format!("session-{}", state.session_titles.len()));
        state.sessions.insert(
            0,
            SessionSummary {
                id: id.clone(),
                title: title.to_owned(),
                updated_at: None,
            },
        );
        Ok(id)
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, StreamError> {
        Ok(lock(&self.state).sessions.clone())
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, StreamError> {
        Ok(lock(&self.state).models.clone())
    }

    async fn open_stream(&self, request: ChatRequest) -> Result<TextStream, StreamError> {
        let reply = {
            let mut state = lock(&self.state);
            state.requests.push(request);
            state.replies.pop_front()
        };
        let Some(reply) = reply else {
            return Err(StreamError::TransportFailure("no scripted reply".into()));
        };
        if let Some(error) = reply.rejection {
            return Err(error);
        }
        let body = futures_util::stream::iter(reply.chunks);
        if reply.hold_open {
            Ok(Box::pin(body.chain(futures_util::stream::pending())))
        } else {
            Ok(Box::pin(body))
        }
    }
}
