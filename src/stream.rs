//! Query submission and incremental reply consumption.
//!
//! [`StreamConsumer::submit`] turns one user message into a lazy sequence of
//! [`StreamChunk`]s: an optional session binding, the reply fragments as
//! they arrive, and at most one terminal failure. The sequence always ends,
//! so callers never wait on a reply that cannot complete.

use crate::backend::{ChatBackend, ChatRequest};
use crate::conversation::SessionId;
use crate::error::StreamError;
use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

/// One item of a submitted query's reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    /// A session was created for this turn; later turns should reuse it.
    SessionBound(SessionId),
    /// A fragment of reply text.
    Text(String),
    /// The reply cannot continue. Always the last item.
    Failed(StreamError),
}

/// Finite, non-restartable reply sequence.
pub type ChunkStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send>>;

/// Submits messages to a [`ChatBackend`] on behalf of the turn loop.
#[derive(Clone)]
pub struct StreamConsumer {
    backend: Arc<dyn ChatBackend>,
    model: String,
    title_chars: usize,
}

impl StreamConsumer {
    pub fn new(backend: Arc<dyn ChatBackend>, model: impl Into<String>, title_chars: usize) -> Self {
        Self {
            backend,
            model: model.into(),
            title_chars,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Submit `text`, creating a session first when `session` is `None`.
    ///
    /// Nothing happens until the returned stream is polled. Dropping it
    /// abandons the request.
    pub fn submit(&self, text: &str, session: Option<SessionId>) -> ChunkStream {
        let backend = Arc::clone(&self.backend);
        let model = self.model.clone();
        let message = text.to_owned();
        let title = session_title(text, self.title_chars);

        Box::pin(async_stream::stream! {
            let session_id = match session {
                Some(id) => id,
                None => match backend.create_session(&title).await {
                    Ok(id) => {
                        debug!(session = %id, "bound new session");
                        yield StreamChunk::SessionBound(id.clone());
                        id
                    }
                    Err(e) => {
                        warn!(code = e.code(), "session creation failed: {e}");
                        let e = match e {
                            StreamError::SessionUnavailable(_) => e,
                            other => StreamError::SessionUnavailable(other.to_string()),
                        };
                        yield StreamChunk::Failed(e);
                        return;
                    }
                },
            };

            let request = ChatRequest {
                message,
                model,
                session_id: Some(session_id),
            };
            let mut body = match backend.open_stream(request).await {
                Ok(body) => body,
                Err(e) => {
                    warn!(code = e.code(), "chat request failed: {e}");
                    yield StreamChunk::Failed(e);
                    return;
                }
            };

            while let Some(item) = body.next().await {
                match item {
                    Ok(text) if text.is_empty() => {}
                    Ok(text) => yield StreamChunk::Text(text),
                    Err(e) => {
                        warn!(code = e.code(), "reply stream broke: {e}");
                        yield StreamChunk::Failed(e);
                        return;
                    }
                }
            }
        })
    }
}

/// Title for a new session: the first `max_chars` characters of the
/// message, with an ellipsis when cut.
pub fn session_title(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_owned();
    }
    let mut title: String = text.chars().take(max_chars).collect();
    title.truncate(title.trim_end().len());
    title.push('…');
    title
}
