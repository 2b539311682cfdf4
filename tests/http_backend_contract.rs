//! HTTP backend contract tests
//!
//! These tests pin the wire format HttpBackend speaks:
//! - chat submissions carry message, model, and the bound session
//! - bearer credential and request id headers are attached
//! - plain-text reply bodies are surfaced as text fragments
//! - error statuses map to StreamError variants
//! - a backend that goes quiet fails with a transport error

use futures_util::StreamExt;
use parley::backend::{ChatBackend, ChatRequest, HttpBackend};
use parley::config::BackendConfig;
use parley::conversation::SessionId;
use parley::error::StreamError;
use parley::stream::{StreamChunk, StreamConsumer};
use parley::pick_default_model;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use wiremock::matchers::{body_json, header, header_exists, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

const UNSET_TOKEN_ENV: &str = "PARLEY_CONTRACT_TEST_TOKEN_NEVER_SET";

fn backend_for(server: &MockServer, token: Option<&str>) -> HttpBackend {
    let config = BackendConfig {
        base_url: server.uri(),
        token: token.map(str::to_owned),
        token_env: UNSET_TOKEN_ENV.to_owned(),
        ..BackendConfig::default()
    };
    HttpBackend::new(config).expect("client")
}

async fn read_all(backend: &HttpBackend, request: ChatRequest) -> Result<String, StreamError> {
    let mut body = backend.open_stream(request).await?;
    let mut text = String::new();
    while let Some(fragment) = body.next().await {
        text.push_str(&fragment?);
    }
    Ok(text)
}

// ────────────────────────────────────────────────────────────────────────────
// Chat Endpoint
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn chat_request_carries_message_model_and_session() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat"))
        .and(body_json(json!({
            "message": "what time is it",
            "model": "llama3.2:1b",
            "sessionId": "s-1"
        })))
        .and(header("authorization", "Bearer secret"))
        .and(header_exists("x-request-id"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/plain; charset=utf-8")
                .set_body_string("It is noon."),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let backend = backend_for(&mock_server, Some("secret"));
    let text = read_all(
        &backend,
        ChatRequest {
            message: "what time is it".into(),
            model: "llama3.2:1b".into(),
            session_id: Some(SessionId("s-1".into())),
        },
    )
    .await
    .expect("reply");

    assert_eq!(text, "It is noon.");
}

#[tokio::test]
async fn unbound_request_omits_session_and_credential() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat"))
        .and(body_json(json!({"message": "Hello", "model": "m"})))
        .respond_with(ResponseTemplate::new(200).set_body_string("Hi"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let backend = backend_for(&mock_server, None);
    let text = read_all(
        &backend,
        ChatRequest {
            message: "Hello".into(),
            model: "m".into(),
            session_id: None,
        },
    )
    .await
    .expect("reply");
    assert_eq!(text, "Hi");

    let requests = mock_server.received_requests().await.expect("recorded");
    assert!(requests[0].headers.get("authorization").is_none());
}

#[tokio::test]
async fn server_error_maps_to_rejected_with_detail() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat"))
        .respond_with(
            ResponseTemplate::new(500).set_body_json(json!({"detail": "Digital Self not initialized"})),
        )
        .mount(&mock_server)
        .await;

    let backend = backend_for(&mock_server, None);
    let err = read_all(
        &backend,
        ChatRequest {
            message: "Hello".into(),
            model: "m".into(),
            session_id: None,
        },
    )
    .await
    .expect_err("500 must fail");

    assert_eq!(
        err,
        StreamError::ServerRejected {
            status: 500,
            detail: "Digital Self not initialized".into()
        }
    );
}

#[tokio::test]
async fn unauthorized_is_an_auth_failure() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat"))
        .respond_with(ResponseTemplate::new(401).set_body_string("token expired"))
        .mount(&mock_server)
        .await;

    let backend = backend_for(&mock_server, Some("stale"));
    let err = read_all(
        &backend,
        ChatRequest {
            message: "Hello".into(),
            model: "m".into(),
            session_id: None,
        },
    )
    .await
    .expect_err("401 must fail");

    assert!(err.is_auth_failure());
    assert!(err.to_string().contains("token expired"));
}

#[tokio::test]
async fn unreachable_backend_is_transport_failure() {
    let config = BackendConfig {
        base_url: "http://127.0.0.1:1".into(),
        token_env: UNSET_TOKEN_ENV.to_owned(),
        ..BackendConfig::default()
    };
    let backend = HttpBackend::new(config).expect("client");
    let err = backend
        .open_stream(ChatRequest {
            message: "Hello".into(),
            model: "m".into(),
            session_id: None,
        })
        .await
        .err()
        .expect("connection must fail");

    assert!(matches!(err, StreamError::TransportFailure(_)));
}

#[tokio::test]
async fn silent_backend_times_out_before_headers() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
        .mount(&mock_server)
        .await;

    let config = BackendConfig {
        base_url: mock_server.uri(),
        token_env: UNSET_TOKEN_ENV.to_owned(),
        read_idle_timeout_ms: 200,
        ..BackendConfig::default()
    };
    let backend = HttpBackend::new(config).expect("client");
    let err = read_all(
        &backend,
        ChatRequest {
            message: "Hello".into(),
            model: "m".into(),
            session_id: None,
        },
    )
    .await
    .expect_err("stalled backend must fail");

    assert!(matches!(err, StreamError::TransportFailure(_)));
    assert!(err.to_string().contains("no data"));
}

#[tokio::test]
async fn body_that_stops_mid_reply_times_out() {
    // Sends headers and one chunk, then holds the connection open.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut buf = vec![0u8; 4096];
        let _ = socket.read(&mut buf).await;
        socket
            .write_all(
                b"HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ntransfer-encoding: chunked\r\n\r\n5\r\nHello\r\n",
            )
            .await
            .expect("write");
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(socket);
    });

    let config = BackendConfig {
        base_url: format!("http://{addr}"),
        token_env: UNSET_TOKEN_ENV.to_owned(),
        read_idle_timeout_ms: 200,
        ..BackendConfig::default()
    };
    let backend = HttpBackend::new(config).expect("client");
    let mut body = backend
        .open_stream(ChatRequest {
            message: "Hello".into(),
            model: "m".into(),
            session_id: None,
        })
        .await
        .expect("headers arrive");

    assert_eq!(body.next().await.expect("first chunk").expect("text"), "Hello");
    let err = body
        .next()
        .await
        .expect("timeout is reported")
        .expect_err("stall must fail");
    assert!(matches!(err, StreamError::TransportFailure(_)));
    assert!(body.next().await.is_none());
}

#[tokio::test]
async fn request_ids_are_unique_per_submission() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(2)
        .mount(&mock_server)
        .await;

    let backend = backend_for(&mock_server, None);
    for _ in 0..2 {
        read_all(
            &backend,
            ChatRequest {
                message: "Hello".into(),
                model: "m".into(),
                session_id: None,
            },
        )
        .await
        .expect("reply");
    }

    let requests: Vec<Request> = mock_server.received_requests().await.expect("recorded");
    let ids: Vec<_> = requests
        .iter()
        .map(|r| r.headers.get("x-request-id").cloned())
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(ids[0].is_some());
    assert_ne!(ids[0], ids[1]);
}

// ────────────────────────────────────────────────────────────────────────────
// Session Registry and Models
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn create_session_posts_title_and_returns_id() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chats"))
        .and(body_json(json!({"title": "what time is it"})))
        .and(header("authorization", "Bearer secret"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "chat-42"})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let backend = backend_for(&mock_server, Some("secret"));
    let id = backend
        .create_session("what time is it")
        .await
        .expect("session");
    assert_eq!(id, SessionId("chat-42".into()));
}

#[tokio::test]
async fn create_session_failure_is_session_unavailable() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chats"))
        .respond_with(ResponseTemplate::new(503).set_body_string("registry down"))
        .mount(&mock_server)
        .await;

    let backend = backend_for(&mock_server, None);
    let err = backend.create_session("hi").await.expect_err("503");
    assert!(matches!(err, StreamError::SessionUnavailable(ref detail) if detail.contains("registry down")));
}

#[tokio::test]
async fn list_sessions_parses_registry() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/chats"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "b", "title": "Second", "updated_at": "2026-10-02T10:00:00Z"},
            {"id": "a", "title": "First"}
        ])))
        .mount(&mock_server)
        .await;

    let backend = backend_for(&mock_server, None);
    let sessions = backend.list_sessions().await.expect("sessions");
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].id, SessionId("b".into()));
    assert_eq!(sessions[0].updated_at.as_deref(), Some("2026-10-02T10:00:00Z"));
    assert_eq!(sessions[1].title, "First");
    assert!(sessions[1].updated_at.is_none());
}

#[tokio::test]
async fn list_models_and_pick_lightweight_default() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "models": [{"model": "llama3:8b"}, {"model": "llama3.2:1b"}]
        })))
        .mount(&mock_server)
        .await;

    let backend = backend_for(&mock_server, None);
    let models = backend.list_models().await.expect("models");
    assert_eq!(models.len(), 2);
    assert_eq!(
        pick_default_model(&models, None).as_deref(),
        Some("llama3.2:1b")
    );
}

// ────────────────────────────────────────────────────────────────────────────
// Stream Consumer over HTTP
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn consumer_binds_session_before_first_chat() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chats"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "fresh"})))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat"))
        .and(body_json(json!({"message": "hi", "model": "m", "sessionId": "fresh"})))
        .respond_with(ResponseTemplate::new(200).set_body_string("hello there"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let consumer = StreamConsumer::new(Arc::new(backend_for(&mock_server, None)), "m", 40);
    let chunks: Vec<StreamChunk> = consumer.submit("hi", None).collect().await;

    assert_eq!(chunks[0], StreamChunk::SessionBound(SessionId("fresh".into())));
    let text: String = chunks[1..]
        .iter()
        .map(|c| match c {
            StreamChunk::Text(t) => t.as_str(),
            other => panic!("unexpected chunk {other:?}"),
        })
        .collect();
    assert_eq!(text, "hello there");
}
