//! Speech output through an external text-to-speech command.
//!
//! Each utterance runs the engine once (`say -v Samantha "text"`,
//! `espeak-ng -v en-us "text"`). The child is killed on cancellation, so a
//! cancelled utterance never keeps the speaker busy.
//!
//! An utterance gets a deadline from its length plus `stall_grace_ms`. The
//! keepalive check continues a child the host has stopped, and fails an
//! utterance whose engine is still running past its deadline.

use super::voices::{Voice, parse_voice_listing, select_voice};
use super::{PlaybackEvent, PlaybackSignal, PlaybackSink, SynthesisAdapter};
use crate::config::VoiceConfig;
use crate::error::SynthesisError;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Expected speaking time per character, about 12 characters a second.
const SPEECH_MS_PER_CHAR: u64 = 80;

struct Playing {
    utterance: u64,
    cancel: CancellationToken,
    finished: Arc<AtomicBool>,
    pid: Option<u32>,
    deadline: Instant,
}

impl Playing {
    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Kill the child now rather than when its waiter task next runs, so
    /// the speaker is free before `cancel_all` returns.
    fn kill_now(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid
            && !self.is_finished()
        {
            // SAFETY: kill(2) has no memory-safety preconditions. The pid is
            // our own child, which the waiter task has not reaped yet.
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
            if rc != 0 {
                debug!(utterance = self.utterance, pid, "speech process already gone");
            }
        }
    }

    /// Continue a child the host has stopped. Returns `true` if it was stopped.
    fn resume_if_stopped(&self) -> bool {
        #[cfg(unix)]
        if let Some(pid) = self.pid
            && !self.is_finished()
            && process_is_stopped(pid)
        {
            // SAFETY: as in `kill_now`.
            return unsafe { libc::kill(pid as libc::pid_t, libc::SIGCONT) } == 0;
        }
        false
    }
}

#[cfg(target_os = "linux")]
fn process_is_stopped(pid: u32) -> bool {
    // The state letter follows the parenthesised command name.
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            stat.rsplit_once(')')
                .map(|(_, rest)| rest.trim_start().starts_with('T'))
        })
        .unwrap_or(false)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn process_is_stopped(_pid: u32) -> bool {
    false
}

/// Process-backed [`SynthesisAdapter`].
pub struct CommandSynthesis {
    program: String,
    voice_flag: String,
    voice: Option<Voice>,
    stall_grace: Duration,
    events: Option<PlaybackSink>,
    current: Option<Playing>,
}

impl CommandSynthesis {
    /// Build an adapter for `config.engine_command`, choosing a voice from
    /// `voices` for `config.language`.
    pub fn new(config: &VoiceConfig, voices: &[Voice]) -> Self {
        let voice = select_voice(voices, &config.language, &config.preferred_voices).cloned();
        match &voice {
            Some(v) => info!(voice = %v.name, locale = %v.locale, "selected speech voice"),
            None => warn!(
                language = %config.language,
                "no voices listed, using engine default voice"
            ),
        }
        Self {
            program: config.engine_command.clone(),
            voice_flag: config.voice_flag.clone(),
            voice,
            stall_grace: Duration::from_millis(config.stall_grace_ms),
            events: None,
            current: None,
        }
    }

    /// Ask the engine for its voice inventory.
    ///
    /// # Errors
    ///
    /// Returns [`SynthesisError::EngineFailure`] if the engine cannot be run
    /// or exits unsuccessfully.
    pub async fn discover_voices(config: &VoiceConfig) -> Result<Vec<Voice>, SynthesisError> {
        let output = Command::new(&config.engine_command)
            .args(&config.list_voices_args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                SynthesisError::EngineFailure(format!(
                    "cannot run `{}`: {e}",
                    config.engine_command
                ))
            })?;
        if !output.status.success() {
            return Err(SynthesisError::EngineFailure(format!(
                "`{}` voice listing exited with {}",
                config.engine_command, output.status
            )));
        }
        let voices = parse_voice_listing(&String::from_utf8_lossy(&output.stdout));
        debug!(count = voices.len(), "discovered speech voices");
        Ok(voices)
    }

    pub fn voice(&self) -> Option<&Voice> {
        self.voice.as_ref()
    }

    fn is_playing(&self) -> bool {
        self.current.as_ref().is_some_and(|p| !p.is_finished())
    }

    fn deadline_for(&self, text: &str) -> Instant {
        let chars = text.chars().count() as u64;
        Instant::now() + Duration::from_millis(chars * SPEECH_MS_PER_CHAR) + self.stall_grace
    }

    fn build_command(&self, text: &str) -> Command {
        let mut command = Command::new(&self.program);
        if let Some(voice) = &self.voice
            && !self.voice_flag.is_empty()
        {
            command.arg(&self.voice_flag).arg(&voice.id);
        }
        command
            .arg(text)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        command
    }
}

impl SynthesisAdapter for CommandSynthesis {
    fn subscribe(&mut self, events: PlaybackSink) {
        self.events = Some(events);
    }

    fn speak(&mut self, utterance: u64, text: &str) -> Result<(), SynthesisError> {
        if self.is_playing() {
            return Err(SynthesisError::EngineFailure(
                "an utterance is already playing".into(),
            ));
        }
        let events = self
            .events
            .clone()
            .ok_or_else(|| SynthesisError::EngineFailure("no playback subscriber".into()))?;

        let mut child = self.build_command(text).spawn().map_err(|e| {
            SynthesisError::EngineFailure(format!("cannot start `{}`: {e}", self.program))
        })?;

        let cancel = CancellationToken::new();
        let finished = Arc::new(AtomicBool::new(false));
        self.current = Some(Playing {
            utterance,
            cancel: cancel.clone(),
            finished: Arc::clone(&finished),
            pid: child.id(),
            deadline: self.deadline_for(text),
        });

        let _ = events.send(PlaybackSignal::new(utterance, PlaybackEvent::Started));
        let program = self.program.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                status = child.wait() => Some(status),
            };
            match status {
                None => {
                    if let Err(e) = child.kill().await {
                        debug!(utterance, "speech process already gone: {e}");
                    }
                }
                Some(status) => {
                    let event = match status {
                        Ok(s) if s.success() => PlaybackEvent::Ended,
                        Ok(s) => PlaybackEvent::Error(SynthesisError::EngineFailure(format!(
                            "`{program}` exited with {s}"
                        ))),
                        Err(e) => PlaybackEvent::Error(SynthesisError::EngineFailure(format!(
                            "waiting for `{program}` failed: {e}"
                        ))),
                    };
                    let _ = events.send(PlaybackSignal::new(utterance, event));
                }
            }
            finished.store(true, Ordering::SeqCst);
        });
        Ok(())
    }

    fn cancel_all(&mut self) {
        if let Some(playing) = self.current.take() {
            debug!(utterance = playing.utterance, "cancelling speech");
            playing.kill_now();
            playing.cancel.cancel();
        }
    }

    fn resume_if_stalled(&mut self) -> bool {
        let Some(playing) = self.current.as_ref().filter(|p| !p.is_finished()) else {
            return false;
        };
        if playing.resume_if_stopped() {
            info!(utterance = playing.utterance, "continued stopped speech process");
            return true;
        }
        if Instant::now() < playing.deadline {
            return false;
        }
        let utterance = playing.utterance;
        warn!(utterance, "speech engine still running past its deadline, giving up");
        self.cancel_all();
        if let Some(events) = &self.events {
            let error = SynthesisError::EngineFailure(format!("`{}` stalled", self.program));
            let _ = events.send(PlaybackSignal::new(utterance, PlaybackEvent::Error(error)));
        }
        true
    }
}

impl Drop for CommandSynthesis {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
