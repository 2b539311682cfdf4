//! Contracts for the text-generation service and the session registry.
//!
//! The backend is opaque: it accepts a message and streams plain text back
//! until the connection closes. [`HttpBackend`] is the production client;
//! tests substitute scripted implementations of [`ChatBackend`].

mod http;

pub use http::{HttpBackend, map_http_error};

use crate::conversation::SessionId;
use crate::error::StreamError;
use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// Reply body as a lazy sequence of text fragments.
///
/// An `Err` item is terminal: nothing follows it.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, StreamError>> + Send>>;

/// Body of a chat submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

/// Entry of the session registry listing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// Entry of the model listing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModelInfo {
    #[serde(alias = "name")]
    pub model: String,
}

/// Text-generation service plus session registry.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Register a new conversation and return its identifier.
    async fn create_session(&self, title: &str) -> Result<SessionId, StreamError>;

    /// Conversations known to the registry, most recent first.
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, StreamError>;

    /// Models the service can generate with.
    async fn list_models(&self) -> Result<Vec<ModelInfo>, StreamError>;

    /// Submit a message and start reading the streamed reply.
    ///
    /// Errors returned here mean no reply byte was received; failures after
    /// the stream opened arrive as a terminal `Err` item.
    async fn open_stream(&self, request: ChatRequest) -> Result<TextStream, StreamError>;
}

/// Choose the model to request: the configured one, else the first
/// lightweight (`1b`) model, else the first listed.
pub fn pick_default_model(models: &[ModelInfo], configured: Option<&str>) -> Option<String> {
    if let Some(model) = configured.filter(|m| !m.trim().is_empty()) {
        return Some(model.to_owned());
    }
    models
        .iter()
        .find(|m| m.model.contains("1b"))
        .or_else(|| models.first())
        .map(|m| m.model.clone())
}
