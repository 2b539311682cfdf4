//! Turn orchestration: sequences capture, streaming, and playback into
//! conversational turns and drives the hands-free loop.
//!
//! The orchestrator is a single owned state machine. Capture events,
//! playback events, reply chunks, and the timers are all funnelled
//! into [`TurnOrchestrator::step`], which handles exactly one of them per
//! call, so no handler ever observes a half-applied transition.
//!
//! Events from superseded phases are recognised by counters:
//! - capture signals carry the cycle number passed to `start_capture`;
//! - playback signals carry the utterance number passed to `speak`;
//! - reply chunks carry the generation of the turn that opened them.

mod state;

pub use state::OrchestratorState;

use crate::capture::{
    CaptureAdapter, CaptureErrorKind, CaptureEvent, CaptureSignal, CaptureSink,
};
use crate::config::{ChatConfig, ConversationConfig};
use crate::conversation::{ConversationStore, SessionId};
use crate::echo_guard::EchoGuard;
use crate::error::{CaptureError, StreamError};
use crate::runtime::TurnEvent;
use crate::stream::{ChunkStream, StreamChunk, StreamConsumer};
use crate::synthesis::{PlaybackEvent, PlaybackSignal, PlaybackSink, SynthesisAdapter};
use futures_util::StreamExt;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runtime event buffer size.
const EVENT_CHANNEL_SIZE: usize = 256;

/// External requests to the turn loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnCommand {
    /// Open capture for one utterance (from `Idle` only).
    StartCapture,
    /// Interrupt the open capture cycle.
    StopCapture,
    /// A typed message.
    Submit(String),
    /// Switch hands-free mode.
    SetContinuous(bool),
    /// Cancel everything and start an empty conversation.
    NewChat,
    /// Cancel everything and leave hands-free mode.
    Stop,
    /// Continue an existing backend session with an empty local log.
    ResumeSession(SessionId),
}

/// The conversational turn state machine.
pub struct TurnOrchestrator {
    conversation: ConversationConfig,
    output_enabled: bool,
    max_spoken_chars: usize,

    capture: Box<dyn CaptureAdapter>,
    synthesis: Box<dyn SynthesisAdapter>,
    consumer: StreamConsumer,
    guard: EchoGuard,
    store: ConversationStore,

    state: OrchestratorState,
    continuous: bool,
    /// The adapter has an open cycle that has not reported `Ended`.
    capture_active: bool,
    /// A manual stop was requested for the open cycle.
    capture_stopping: bool,
    capture_cycle: u64,
    generation: u64,
    utterance: u64,

    stream: Option<(u64, ChunkStream)>,
    cooldown: Option<Pin<Box<Sleep>>>,
    /// Pending re-open of capture after a silent cycle in hands-free mode.
    rearm: Option<Pin<Box<Sleep>>>,
    keepalive: Interval,

    capture_rx: mpsc::UnboundedReceiver<CaptureSignal>,
    playback_rx: mpsc::UnboundedReceiver<PlaybackSignal>,
    // Held so the event channels stay open for the orchestrator's lifetime.
    _capture_tx: CaptureSink,
    _playback_tx: PlaybackSink,
    events: broadcast::Sender<TurnEvent>,
}

impl TurnOrchestrator {
    /// Wire the adapters into a new orchestrator in `Idle`.
    ///
    /// `guard` must be the same guard the capture adapter consults. Must be
    /// called inside a tokio runtime.
    pub fn new(
        config: &ChatConfig,
        mut capture: Box<dyn CaptureAdapter>,
        mut synthesis: Box<dyn SynthesisAdapter>,
        consumer: StreamConsumer,
        guard: EchoGuard,
    ) -> Self {
        let (capture_tx, capture_rx) = mpsc::unbounded_channel();
        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        capture.subscribe(capture_tx.clone());
        synthesis.subscribe(playback_tx.clone());

        let period = Duration::from_millis(config.voice.keepalive_interval_ms.max(1));
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        Self {
            conversation: config.conversation.clone(),
            output_enabled: config.voice.output_enabled,
            max_spoken_chars: config.voice.max_spoken_chars,
            capture,
            synthesis,
            consumer,
            guard,
            store: ConversationStore::new(),
            state: OrchestratorState::Idle,
            continuous: config.conversation.continuous,
            capture_active: false,
            capture_stopping: false,
            capture_cycle: 0,
            generation: 0,
            utterance: 0,
            stream: None,
            cooldown: None,
            rearm: None,
            keepalive,
            capture_rx,
            playback_rx,
            _capture_tx: capture_tx,
            _playback_tx: playback_tx,
            events,
        }
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    pub fn is_continuous(&self) -> bool {
        self.continuous
    }

    pub fn is_capture_active(&self) -> bool {
        self.capture_active
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn model(&self) -> &str {
        self.consumer.model()
    }

    /// Subscribe to runtime events.
    pub fn subscribe(&self) -> broadcast::Receiver<TurnEvent> {
        self.events.subscribe()
    }

    // ── Commands ───────────────────────────────────────────────

    /// Open capture for one utterance. Only valid from `Idle`.
    pub fn start_capture(&mut self) -> bool {
        if self.state != OrchestratorState::Idle {
            debug!(state = %self.state, "capture start ignored");
            return false;
        }
        self.enter_listening()
    }

    /// Interrupt the open capture cycle. The adapter's `Aborted` then
    /// returns the machine to `Idle` without a message.
    pub fn stop_capture(&mut self) -> bool {
        if self.state != OrchestratorState::Listening || !self.capture_active {
            debug!(state = %self.state, "capture stop ignored");
            return false;
        }
        self.capture_stopping = true;
        self.capture.stop_capture();
        true
    }

    /// Submit a typed message.
    ///
    /// Accepted from `Idle`, and from `Listening` or `CoolingDown` after
    /// abandoning the capture cycle or timer. Ignored while a reply is
    /// streaming or being spoken.
    pub fn submit_text(&mut self, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() {
            return false;
        }
        match self.state {
            OrchestratorState::Idle => {}
            OrchestratorState::Listening => self.abandon_capture(),
            OrchestratorState::CoolingDown => self.cooldown = None,
            OrchestratorState::Streaming | OrchestratorState::Speaking => {
                debug!(state = %self.state, "typed submission ignored, turn in flight");
                return false;
            }
        }
        self.begin_turn(text.to_owned());
        true
    }

    /// Switch hands-free mode.
    ///
    /// Turning it off cancels everything and lands in `Idle` from any state.
    /// Turning it on from `Idle` opens capture.
    pub fn set_continuous(&mut self, enabled: bool) {
        if self.continuous != enabled {
            self.continuous = enabled;
            info!(enabled, "continuous mode switched");
            self.emit(TurnEvent::ContinuousMode { enabled });
        }
        if enabled {
            if self.state == OrchestratorState::Idle && !self.capture_active {
                self.enter_listening();
            }
        } else {
            self.cancel_all();
        }
    }

    /// Explicit stop: cancel everything and leave hands-free mode.
    pub fn stop(&mut self) {
        info!(state = %self.state, "stop requested");
        self.set_continuous(false);
    }

    /// Cancel everything and start an empty, unbound conversation.
    pub fn new_chat(&mut self) {
        self.set_continuous(false);
        self.store.new_session();
        info!("new chat");
    }

    /// Cancel everything and bind an empty log to an existing session, so
    /// the next turn continues it instead of creating a new one.
    pub fn resume_session(&mut self, id: SessionId) {
        self.set_continuous(false);
        self.store.new_session();
        self.store.bind_session(id.clone());
        info!(session = %id, "session resumed");
        self.emit(TurnEvent::SessionBound(id));
    }

    pub fn apply(&mut self, command: TurnCommand) {
        debug!(?command, "turn command");
        match command {
            TurnCommand::StartCapture => {
                self.start_capture();
            }
            TurnCommand::StopCapture => {
                self.stop_capture();
            }
            TurnCommand::Submit(text) => {
                self.submit_text(&text);
            }
            TurnCommand::SetContinuous(enabled) => self.set_continuous(enabled),
            TurnCommand::NewChat => self.new_chat(),
            TurnCommand::Stop => self.stop(),
            TurnCommand::ResumeSession(id) => self.resume_session(id),
        }
    }

    // ── Event Loop ─────────────────────────────────────────────

    /// Wait for the next input and handle it.
    ///
    /// Inputs are taken in a fixed priority order: capture, playback, reply
    /// chunks, cooldown expiry, re-arm expiry, keepalive. Cancel-safe.
    pub async fn step(&mut self) {
        tokio::select! {
            biased;
            Some(signal) = self.capture_rx.recv() => self.handle_capture(signal),
            Some(signal) = self.playback_rx.recv() => self.handle_playback(signal),
            (generation, chunk) = next_chunk(&mut self.stream) => {
                self.handle_chunk(generation, chunk);
            }
            () = timer_elapsed(&mut self.cooldown) => self.on_cooldown(),
            () = timer_elapsed(&mut self.rearm) => self.on_rearm(),
            _ = self.keepalive.tick(), if self.state == OrchestratorState::Speaking => {
                self.on_keepalive();
            }
        }
    }

    /// Drive the machine, applying commands as they arrive, then release
    /// both devices.
    ///
    /// Returns when `cancel` fires, or once the command channel is closed
    /// and the machine has come to rest in `Idle`.
    pub async fn run(
        &mut self,
        mut commands: mpsc::UnboundedReceiver<TurnCommand>,
        cancel: CancellationToken,
    ) {
        info!(continuous = self.continuous, model = self.model(), "turn loop started");
        let mut commands_open = true;
        loop {
            if !commands_open && self.state == OrchestratorState::Idle {
                debug!("no more commands and nothing in flight");
                break;
            }
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.apply(command),
                    None => {
                        debug!("command channel closed");
                        commands_open = false;
                    }
                },
                () = self.step() => {}
            }
        }
        self.shutdown();
    }

    /// Release both devices and finalize any in-flight turn.
    pub fn shutdown(&mut self) {
        self.cancel_all();
        info!("turn loop stopped");
    }

    // ── Capture ────────────────────────────────────────────────

    fn enter_listening(&mut self) -> bool {
        if self.guard.is_speaking() {
            warn!("capture locked out while speaking");
            return false;
        }
        if self.capture_active {
            self.capture.stop_capture();
        }
        self.rearm = None;
        self.capture_cycle += 1;
        self.capture_active = true;
        self.capture_stopping = false;
        self.transition(OrchestratorState::Listening);
        self.capture.start_capture(self.capture_cycle);
        true
    }

    /// Stop the adapter and orphan its cycle so late events are stale.
    fn abandon_capture(&mut self) {
        if self.capture_active {
            self.capture.stop_capture();
            self.capture_active = false;
        }
        self.capture_stopping = false;
        self.capture_cycle += 1;
    }

    fn handle_capture(&mut self, signal: CaptureSignal) {
        let CaptureSignal { cycle, event } = signal;
        if cycle != self.capture_cycle {
            debug!(cycle, current = self.capture_cycle, ?event, "stale capture event");
            return;
        }
        match event {
            CaptureEvent::PartialResult(text) => {
                if self.state == OrchestratorState::Listening && !self.guard.is_speaking() {
                    self.emit(TurnEvent::PartialTranscript(text));
                }
            }
            CaptureEvent::FinalResult(text) => {
                if self.state != OrchestratorState::Listening || self.guard.is_speaking() {
                    debug!(cycle, state = %self.state, "capture result outside listening, discarded");
                    return;
                }
                if self.capture_stopping {
                    debug!(cycle, "result of a stopped capture, discarded");
                    self.capture_stopping = false;
                    self.transition(OrchestratorState::Idle);
                    return;
                }
                let text = text.trim();
                if text.is_empty() {
                    self.on_capture_error(CaptureErrorKind::NoSpeechDetected);
                } else {
                    self.begin_turn(text.to_owned());
                }
            }
            CaptureEvent::Error(kind) => {
                if self.state != OrchestratorState::Listening {
                    debug!(cycle, state = %self.state, ?kind, "capture error outside listening");
                    return;
                }
                self.on_capture_error(kind);
            }
            CaptureEvent::Ended => {
                self.capture_active = false;
                self.capture_stopping = false;
                if self.state == OrchestratorState::Listening {
                    debug!(cycle, "capture ended without a result");
                    self.transition(OrchestratorState::Idle);
                }
            }
        }
    }

    fn on_capture_error(&mut self, kind: CaptureErrorKind) {
        let error = CaptureError::from(kind);
        let mut rearm = false;
        match error {
            CaptureError::Aborted => debug!("capture aborted"),
            CaptureError::NoSpeech if self.continuous => {
                debug!("no speech this cycle");
                rearm = !self.capture_stopping;
            }
            _ => {
                warn!(code = error.code(), "capture failed: {error}");
                self.emit(TurnEvent::Notice(error.user_message()));
            }
        }
        self.capture_stopping = false;
        self.transition(OrchestratorState::Idle);
        if rearm {
            let delay = self.conversation.cooldown_after_no_speech();
            self.rearm = Some(Box::pin(tokio::time::sleep(delay)));
        }
    }

    /// Re-open capture after a silent cycle, unless something else has
    /// claimed the machine in the meantime.
    fn on_rearm(&mut self) {
        self.rearm = None;
        if self.continuous && self.state == OrchestratorState::Idle && !self.guard.is_speaking() {
            debug!("re-arming capture after silence");
            self.enter_listening();
        }
    }

    // ── Streaming ──────────────────────────────────────────────

    fn begin_turn(&mut self, text: String) {
        self.rearm = None;
        self.generation += 1;
        self.store.push_user(&text);
        self.emit(TurnEvent::UserTurn(text.clone()));
        self.store.begin_assistant();

        let body = self.consumer.submit(&text, self.store.session().cloned());
        self.stream = Some((self.generation, body));
        info!(generation = self.generation, chars = text.chars().count(), "turn submitted");
        self.transition(OrchestratorState::Streaming);
    }

    fn handle_chunk(&mut self, generation: u64, chunk: Option<StreamChunk>) {
        if generation != self.generation || self.state != OrchestratorState::Streaming {
            debug!(generation, current = self.generation, "stale reply chunk");
            self.stream = None;
            return;
        }
        match chunk {
            Some(StreamChunk::SessionBound(id)) => {
                self.store.bind_session(id.clone());
                self.emit(TurnEvent::SessionBound(id));
            }
            Some(StreamChunk::Text(text)) => {
                self.store.append_active(&text);
                self.emit(TurnEvent::AssistantDelta(text));
            }
            Some(StreamChunk::Failed(error)) => self.fail_reply(error),
            None => self.complete_reply(),
        }
    }

    fn complete_reply(&mut self) {
        self.stream = None;
        let text = self.store.finalize_active().unwrap_or_default();
        info!(
            generation = self.generation,
            chars = text.chars().count(),
            "reply complete"
        );
        self.emit(TurnEvent::AssistantFinal {
            text: text.clone(),
            failed: false,
        });
        self.after_reply(&text);
    }

    fn fail_reply(&mut self, error: StreamError) {
        self.stream = None;
        warn!(code = error.code(), generation = self.generation, "reply failed: {error}");
        let session_lost = matches!(error, StreamError::SessionUnavailable(_));
        let reply = self.conversation.error_reply.clone();
        self.store.fail_active(&reply, session_lost);
        if error.is_auth_failure() {
            self.emit(TurnEvent::Notice(
                "The backend rejected the credential. Sign in again and retry.".to_owned(),
            ));
        }
        self.emit(TurnEvent::AssistantFinal {
            text: reply.clone(),
            failed: true,
        });
        self.after_reply(&reply);
    }

    fn should_speak(&self, text: &str) -> bool {
        self.output_enabled
            && !text.trim().is_empty()
            && text.chars().count() < self.max_spoken_chars
    }

    fn after_reply(&mut self, text: &str) {
        if self.should_speak(text) {
            self.enter_speaking(text);
        } else if self.continuous {
            self.schedule_cooldown(self.conversation.cooldown_after_silence());
        } else {
            self.transition(OrchestratorState::Idle);
        }
    }

    // ── Playback ───────────────────────────────────────────────

    fn enter_speaking(&mut self, text: &str) {
        // Guard, then capture, then speaker.
        self.guard.engage();
        self.abandon_capture();
        self.synthesis.cancel_all();

        self.utterance += 1;
        self.keepalive.reset();
        self.transition(OrchestratorState::Speaking);
        if let Err(e) = self.synthesis.speak(self.utterance, text) {
            warn!(code = e.code(), utterance = self.utterance, "speech did not start: {e}");
            self.finish_speaking();
        }
    }

    fn handle_playback(&mut self, signal: PlaybackSignal) {
        if signal.utterance != self.utterance || self.state != OrchestratorState::Speaking {
            debug!(
                utterance = signal.utterance,
                current = self.utterance,
                "stale playback event"
            );
            return;
        }
        match signal.event {
            PlaybackEvent::Started => debug!(utterance = signal.utterance, "playback started"),
            PlaybackEvent::Ended => {
                debug!(utterance = signal.utterance, "playback ended");
                self.finish_speaking();
            }
            PlaybackEvent::Error(e) => {
                warn!(code = e.code(), utterance = signal.utterance, "playback failed: {e}");
                self.finish_speaking();
            }
        }
    }

    fn finish_speaking(&mut self) {
        self.guard.release();
        self.schedule_cooldown(self.conversation.cooldown_after_speech());
    }

    fn on_keepalive(&mut self) {
        if self.synthesis.resume_if_stalled() {
            info!(utterance = self.utterance, "speech engine was stalled");
        }
    }

    // ── Cooldown ───────────────────────────────────────────────

    fn schedule_cooldown(&mut self, delay: Duration) {
        self.cooldown = Some(Box::pin(tokio::time::sleep(delay)));
        self.transition(OrchestratorState::CoolingDown);
    }

    fn on_cooldown(&mut self) {
        self.cooldown = None;
        if self.state != OrchestratorState::CoolingDown {
            return;
        }
        if self.continuous && !self.guard.is_speaking() {
            self.enter_listening();
        } else {
            self.transition(OrchestratorState::Idle);
        }
    }

    // ── Cancellation ───────────────────────────────────────────

    /// Cancel every pending suspension and land in `Idle`. Idempotent.
    fn cancel_all(&mut self) {
        self.synthesis.cancel_all();
        self.abandon_capture();
        self.guard.release();
        self.utterance += 1;

        if self.stream.take().is_some() {
            debug!(generation = self.generation, "abandoning reply stream");
        }
        self.generation += 1;
        self.cooldown = None;
        self.rearm = None;

        if let Some(partial) = self.store.active().map(|t| t.text.clone()) {
            self.store.interrupt_active();
            self.emit(TurnEvent::AssistantFinal {
                text: partial,
                failed: false,
            });
        }
        self.transition(OrchestratorState::Idle);
    }

    fn transition(&mut self, to: OrchestratorState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        debug!(%from, %to, generation = self.generation, "state change");
        self.emit(TurnEvent::StateChanged { from, to });
    }

    fn emit(&self, event: TurnEvent) {
        let _ = self.events.send(event);
    }
}

async fn next_chunk(stream: &mut Option<(u64, ChunkStream)>) -> (u64, Option<StreamChunk>) {
    match stream {
        Some((generation, body)) => (*generation, body.next().await),
        None => std::future::pending().await,
    }
}

async fn timer_elapsed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::testing::{
        CaptureHandle, DeviceLog, ScriptedBackend, ScriptedCapture, ScriptedReply,
        ScriptedSynthesis, SynthesisHandle,
    };
    use std::sync::Arc;

    struct Rig {
        orchestrator: TurnOrchestrator,
        capture: CaptureHandle,
        synthesis: SynthesisHandle,
        backend: ScriptedBackend,
    }

    fn rig() -> Rig {
        let config = ChatConfig::default();
        let guard = EchoGuard::new();
        let log = DeviceLog::new();
        let (capture, capture_handle) = ScriptedCapture::new(guard.clone(), log.clone());
        let (synthesis, synthesis_handle) = ScriptedSynthesis::new(log);
        let backend = ScriptedBackend::new();
        let consumer = StreamConsumer::new(Arc::new(backend.clone()), "test-1b", 40);
        Rig {
            orchestrator: TurnOrchestrator::new(
                &config,
                Box::new(capture),
                Box::new(synthesis),
                consumer,
                guard,
            ),
            capture: capture_handle,
            synthesis: synthesis_handle,
            backend,
        }
    }

    #[test]
    fn state_names_are_snake_case() {
        assert_eq!(OrchestratorState::CoolingDown.to_string(), "cooling_down");
        assert_eq!(OrchestratorState::Idle.as_str(), "idle");
    }

    #[tokio::test]
    async fn manual_capture_only_from_idle() {
        let mut rig = rig();
        rig.backend.push_reply(ScriptedReply::text(&["hi"]).held_open());

        assert!(rig.orchestrator.submit_text("hello"));
        assert_eq!(rig.orchestrator.state(), OrchestratorState::Streaming);
        assert!(!rig.orchestrator.start_capture());
        assert_eq!(rig.capture.starts(), 0);

        rig.orchestrator.stop();
        assert!(rig.orchestrator.start_capture());
        assert_eq!(rig.orchestrator.state(), OrchestratorState::Listening);
        assert_eq!(rig.capture.starts(), 1);
    }

    #[tokio::test]
    async fn typed_submission_ignored_while_speaking() {
        let mut rig = rig();
        rig.backend.push_reply(ScriptedReply::text(&["Hi."]));
        rig.orchestrator.submit_text("hello");
        while rig.orchestrator.state() == OrchestratorState::Streaming {
            rig.orchestrator.step().await;
        }
        assert_eq!(rig.orchestrator.state(), OrchestratorState::Speaking);
        assert!(!rig.orchestrator.submit_text("again"));
        assert_eq!(rig.synthesis.spoken(), vec!["Hi.".to_owned()]);
        assert_eq!(rig.orchestrator.store().len(), 2);
    }

    #[tokio::test]
    async fn blank_submission_is_ignored() {
        let mut rig = rig();
        assert!(!rig.orchestrator.submit_text("   "));
        assert_eq!(rig.orchestrator.state(), OrchestratorState::Idle);
        assert!(rig.orchestrator.store().is_empty());
    }

    #[tokio::test]
    async fn state_changes_are_broadcast() {
        let mut rig = rig();
        let mut events = rig.orchestrator.subscribe();
        rig.orchestrator.start_capture();
        assert_eq!(
            events.try_recv().unwrap(),
            TurnEvent::StateChanged {
                from: OrchestratorState::Idle,
                to: OrchestratorState::Listening
            }
        );
    }
}
