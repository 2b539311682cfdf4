//! reqwest client for the chat service.

use super::{ChatBackend, ChatRequest, ModelInfo, SessionSummary, TextStream};
use crate::config::BackendConfig;
use crate::conversation::SessionId;
use crate::error::StreamError;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use std::time::Duration;
use tracing::Instrument;

// ── Error Mapping ──────────────────────────────────────────────

/// Map a non-success HTTP response to a typed error.
pub fn map_http_error(status: reqwest::StatusCode, body: &str) -> StreamError {
    StreamError::ServerRejected {
        status: status.as_u16(),
        detail: extract_error_message(body),
    }
}

/// Pull a readable message out of an error body (`{"detail": ...}` or
/// `{"error": {"message": ...}}`), falling back to the raw text.
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("detail")
                .and_then(|d| d.as_str())
                .or_else(|| v.pointer("/error/message").and_then(|m| m.as_str()))
                .map(String::from)
        })
        .unwrap_or_else(|| {
            if body.is_empty() {
                "no response body".to_string()
            } else {
                body.chars().take(500).collect()
            }
        })
}

// ── UTF-8 Reassembly ───────────────────────────────────────────

/// Decodes a byte stream whose chunk boundaries may split a character.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Append bytes and return all text that is complete so far.
    ///
    /// Invalid sequences become U+FFFD; a truncated sequence at the end is
    /// kept for the next chunk.
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut text = String::with_capacity(self.pending.len());
        let mut rest = self.pending.as_slice();
        while !rest.is_empty() {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(bad) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        let consumed = self.pending.len() - rest.len();
        self.pending.drain(..consumed);
        text
    }

    /// Flush whatever is left when the body ends.
    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

// ── Client ─────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreatedSession {
    #[serde(alias = "session_id", alias = "sessionId")]
    id: SessionId,
}

#[derive(Deserialize)]
struct ModelListing {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

fn idle_timeout(idle: Duration) -> StreamError {
    StreamError::TransportFailure(format!("no data from backend for {}ms", idle.as_millis()))
}

/// HTTP implementation of [`ChatBackend`].
pub struct HttpBackend {
    config: BackendConfig,
    client: reqwest::Client,
    credential: Option<String>,
}

impl HttpBackend {
    /// Create a client for `config`, resolving the bearer credential once.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::TransportFailure`] if the HTTP client cannot be built.
    pub fn new(config: BackendConfig) -> Result<Self, StreamError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_s))
            .build()
            .map_err(|e| StreamError::TransportFailure(format!("client setup failed: {e}")))?;
        let credential = config.credential();
        if credential.is_none() {
            tracing::debug!("no bearer credential configured");
        }
        Ok(Self {
            config,
            client,
            credential,
        })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credential {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, StreamError> {
        let url = self.config.endpoint(path);
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| StreamError::TransportFailure(format!("connection error: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_http_error(status, &body));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| StreamError::TransportFailure(format!("malformed response from {url}: {e}")))
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn create_session(&self, title: &str) -> Result<SessionId, StreamError> {
        let url = self.config.endpoint(&self.config.sessions_path);
        let response = self
            .authorize(self.client.post(&url))
            .json(&serde_json::json!({ "title": title }))
            .send()
            .await
            .map_err(|e| StreamError::SessionUnavailable(format!("connection error: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StreamError::SessionUnavailable(format!(
                "HTTP {status}: {}",
                extract_error_message(&body)
            )));
        }
        let created = response
            .json::<CreatedSession>()
            .await
            .map_err(|e| StreamError::SessionUnavailable(format!("malformed session reply: {e}")))?;
        tracing::info!(session = %created.id, "created backend session");
        Ok(created.id)
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, StreamError> {
        self.get_json(&self.config.sessions_path).await
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, StreamError> {
        let listing: ModelListing = self.get_json(&self.config.models_path).await?;
        Ok(listing.models)
    }

    async fn open_stream(&self, request: ChatRequest) -> Result<TextStream, StreamError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("chat_request", request_id = %request_id, model = %request.model);

        let idle = self.config.read_idle_timeout();
        let url = self.config.endpoint(&self.config.chat_path);
        let send = self
            .authorize(self.client.post(&url))
            .header("x-request-id", &request_id)
            .header("accept", "text/plain")
            .json(&request)
            .send()
            .instrument(span.clone());
        let response = tokio::time::timeout(idle, send)
            .await
            .map_err(|_| {
                tracing::error!(%request_id, idle_ms = idle.as_millis() as u64, "chat request timed out");
                idle_timeout(idle)
            })?
            .map_err(|e| {
                tracing::error!(%request_id, error = %e, "chat request failed");
                StreamError::TransportFailure(format!("connection error: {e}"))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .instrument(span)
                .await
                .unwrap_or_else(|_| "failed to read body".into());
            tracing::error!(%request_id, status = %status, body = %body, "chat request returned error");
            return Err(map_http_error(status, &body));
        }

        tracing::debug!(%request_id, "chat stream starting");

        let stream = futures_util::stream::unfold(
            (Box::pin(response.bytes_stream()), Utf8Decoder::default(), false),
            move |(mut bytes, mut decoder, done)| async move {
                if done {
                    return None;
                }
                loop {
                    let Ok(next) = tokio::time::timeout(idle, bytes.next()).await else {
                        tracing::warn!(idle_ms = idle.as_millis() as u64, "chat stream went quiet");
                        return Some((Err(idle_timeout(idle)), (bytes, decoder, true)));
                    };
                    match next {
                        Some(Ok(chunk)) => {
                            let text = decoder.push(&chunk);
                            if !text.is_empty() {
                                return Some((Ok(text), (bytes, decoder, false)));
                            }
                        }
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "chat stream interrupted");
                            return Some((
                                Err(StreamError::TransportFailure(format!(
                                    "stream read error: {e}"
                                ))),
                                (bytes, decoder, true),
                            ));
                        }
                        None => {
                            let rest = decoder.finish();
                            if rest.is_empty() {
                                return None;
                            }
                            return Some((Ok(rest), (bytes, decoder, true)));
                        }
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }
}
