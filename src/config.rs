//! Configuration types for the parley client.

use crate::error::{ParleyError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Text-generation service and session registry.
    pub backend: BackendConfig,
    /// Speech output settings.
    pub voice: VoiceConfig,
    /// Speech capture settings.
    pub capture: CaptureConfig,
    /// Turn loop behaviour.
    pub conversation: ConversationConfig,
}

/// Backend connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the chat service, without a trailing path.
    pub base_url: String,
    /// Path of the streaming chat endpoint.
    pub chat_path: String,
    /// Path of the session registry (create with POST, list with GET).
    pub sessions_path: String,
    /// Path of the model listing endpoint.
    pub models_path: String,
    /// Model to request. `None` lets the client pick from the listing.
    pub model: Option<String>,
    /// Bearer credential attached to outbound calls.
    pub token: Option<String>,
    /// Environment variable consulted when `token` is unset.
    pub token_env: String,
    /// Timeout for establishing a request, in seconds.
    pub connect_timeout_s: u64,
    /// Longest wait for the reply headers or the next body chunk, in
    /// milliseconds. The total length of a streamed reply is not bounded.
    pub read_idle_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_owned(),
            chat_path: "/chat".to_owned(),
            sessions_path: "/chats".to_owned(),
            models_path: "/models".to_owned(),
            model: None,
            token: None,
            token_env: "PARLEY_TOKEN".to_owned(),
            connect_timeout_s: 10,
            read_idle_timeout_ms: 60_000,
        }
    }
}

impl BackendConfig {
    /// Resolve the bearer credential: explicit token first, then the environment.
    pub fn credential(&self) -> Option<String> {
        self.token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| std::env::var(&self.token_env).ok())
            .filter(|t| !t.trim().is_empty())
    }

    pub fn read_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.read_idle_timeout_ms)
    }

    /// Join the base URL with an endpoint path.
    pub fn endpoint(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }
}

/// Speech output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Whether completed replies are spoken at all.
    pub output_enabled: bool,
    /// Locale of the conversation, e.g. `en-US`.
    pub language: String,
    /// Voice names tried first, in order.
    pub preferred_voices: Vec<String>,
    /// Replies at or above this many characters are shown but not spoken.
    pub max_spoken_chars: usize,
    /// Text-to-speech command, run once per utterance.
    pub engine_command: String,
    /// Flag that precedes the voice name on the engine command line.
    pub voice_flag: String,
    /// Arguments that make the engine print its voice inventory.
    pub list_voices_args: Vec<String>,
    /// Interval of the playback keepalive check, in milliseconds.
    pub keepalive_interval_ms: u64,
    /// Time an utterance may play beyond its expected length before the
    /// engine is treated as hung, in milliseconds.
    pub stall_grace_ms: u64,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            output_enabled: true,
            language: "en-US".to_owned(),
            preferred_voices: vec!["Google US English".to_owned(), "Microsoft David".to_owned()],
            max_spoken_chars: 500,
            engine_command: "say".to_owned(),
            voice_flag: "-v".to_owned(),
            list_voices_args: vec!["-v".to_owned(), "?".to_owned()],
            keepalive_interval_ms: 3000,
            stall_grace_ms: 10_000,
        }
    }
}

/// Speech capture configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// How long a capture cycle waits for an utterance before reporting
    /// no speech, in milliseconds.
    pub listen_timeout_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            listen_timeout_ms: 8000,
        }
    }
}

/// Turn loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Start in hands-free mode.
    pub continuous: bool,
    /// Delay before re-opening capture after speech finished, in milliseconds.
    ///
    /// Must exceed the output device's drain latency or the tail of the reply
    /// is captured as the next utterance.
    pub cooldown_after_speech_ms: u64,
    /// Delay before re-opening capture when the reply was not spoken.
    pub cooldown_after_silence_ms: u64,
    /// Delay before re-opening capture after a cycle heard nothing.
    pub cooldown_after_no_speech_ms: u64,
    /// Assistant reply substituted for a failed stream.
    pub error_reply: String,
    /// Maximum characters of the first utterance used as a session title.
    pub session_title_chars: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            continuous: false,
            cooldown_after_speech_ms: 1500,
            cooldown_after_silence_ms: 2000,
            cooldown_after_no_speech_ms: 500,
            error_reply: "Sorry, I encountered an error. Is the backend running?".to_owned(),
            session_title_chars: 40,
        }
    }
}

impl ConversationConfig {
    pub fn cooldown_after_speech(&self) -> Duration {
        Duration::from_millis(self.cooldown_after_speech_ms)
    }

    pub fn cooldown_after_silence(&self) -> Duration {
        Duration::from_millis(self.cooldown_after_silence_ms)
    }

    pub fn cooldown_after_no_speech(&self) -> Duration {
        Duration::from_millis(self.cooldown_after_no_speech_ms)
    }
}

impl ChatConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| ParleyError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| ParleyError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path.
    ///
    /// `PARLEY_CONFIG_DIR` overrides the platform config directory.
    pub fn default_config_path() -> PathBuf {
        if let Some(dir) = std::env::var_os("PARLEY_CONFIG_DIR") {
            return PathBuf::from(dir).join("config.toml");
        }
        dirs::config_dir()
            .map(|d| d.join("parley"))
            .unwrap_or_else(|| PathBuf::from("/tmp/parley-config"))
            .join("config.toml")
    }

    /// Reject settings the turn loop cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ParleyError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.backend.base_url.trim().is_empty() {
            return Err(ParleyError::Config("backend.base_url is empty".into()));
        }
        if self.conversation.cooldown_after_speech_ms == 0 {
            return Err(ParleyError::Config(
                "conversation.cooldown_after_speech_ms must be nonzero".into(),
            ));
        }
        if self.conversation.cooldown_after_silence_ms == 0 {
            return Err(ParleyError::Config(
                "conversation.cooldown_after_silence_ms must be nonzero".into(),
            ));
        }
        if self.conversation.cooldown_after_no_speech_ms == 0 {
            return Err(ParleyError::Config(
                "conversation.cooldown_after_no_speech_ms must be nonzero".into(),
            ));
        }
        if self.backend.read_idle_timeout_ms == 0 {
            return Err(ParleyError::Config(
                "backend.read_idle_timeout_ms must be nonzero".into(),
            ));
        }
        if self.voice.max_spoken_chars == 0 {
            return Err(ParleyError::Config(
                "voice.max_spoken_chars must be nonzero".into(),
            ));
        }
        if self.voice.keepalive_interval_ms == 0 {
            return Err(ParleyError::Config(
                "voice.keepalive_interval_ms must be nonzero".into(),
            ));
        }
        Ok(())
    }
}
