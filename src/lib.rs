//! Parley: voice-interactive chat client with hands-free turn orchestration.
//!
//! A turn runs capture → streamed reply → optional speech, after which the
//! client can reopen capture on its own ("continuous mode"):
//!
//! ```text
//! Idle → Listening → Streaming → Speaking → CoolingDown → Listening …
//! ```
//!
//! # Architecture
//!
//! - **Capture**: [`capture::CaptureAdapter`] turns speech into utterance events
//! - **Synthesis**: [`synthesis::SynthesisAdapter`] speaks completed replies
//! - **Stream**: [`stream::StreamConsumer`] submits text and reads the reply incrementally
//! - **Echo guard**: [`echo_guard::EchoGuard`] keeps the microphone shut while speaking
//! - **Orchestrator**: [`orchestrator::TurnOrchestrator`] sequences all of the above
//! - **Store**: [`conversation::ConversationStore`] keeps the turns for display

pub mod backend;
pub mod capture;
pub mod config;
pub mod conversation;
pub mod echo_guard;
pub mod error;
pub mod orchestrator;
pub mod runtime;
pub mod stream;
pub mod synthesis;

// Scripted adapters for the turn-loop tests; not part of the supported API.
#[doc(hidden)]
pub mod testing;

pub use backend::{ChatBackend, HttpBackend, pick_default_model};
pub use config::ChatConfig;
pub use conversation::{ConversationStore, SessionId};
pub use echo_guard::EchoGuard;
pub use error::{ParleyError, Result};
pub use orchestrator::{OrchestratorState, TurnCommand, TurnOrchestrator};
pub use runtime::TurnEvent;
pub use stream::StreamConsumer;
