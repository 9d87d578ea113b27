use std::convert::Infallible;

use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use gatehouse_types::{ErrorKind, GatewayError, RunOptions, StreamChunk};

use crate::dispatch::{self, run_with_session};
use crate::AppState;

/// Caller credential accepted by the auth gate, as presented. Only its
/// SHA-256 fingerprint ever reaches persistence.
#[derive(Clone)]
struct Credential(String);

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/run", post(run))
        .route("/v1/sessions", get(list_sessions))
        .route(
            "/v1/sessions/{id}",
            get(get_session).delete(delete_session),
        )
        .route("/v1/tasks", post(create_task).get(list_tasks))
        .route("/v1/tasks/{id}", get(get_task))
        .route("/v1/tasks/{id}/cancel", post(cancel_task))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/messages", post(messages))
        .layer(middleware::from_fn_with_state(state.clone(), auth_gate))
        .with_state(state)
}

/// Bearer auth for everything except the health probe. The accepted key (or
/// the anonymous placeholder on an open gateway) becomes the request
/// credential.
async fn auth_gate(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }

    let presented = bearer_token(request.headers());
    let credential = if state.api_keys.is_empty() {
        presented.unwrap_or_else(|| "anonymous".to_string())
    } else {
        match presented {
            Some(key) if state.api_keys.contains(&key) => key,
            _ => {
                return DirectError(GatewayError::auth("missing or invalid API key"))
                    .into_response()
            }
        }
    };

    request.extensions_mut().insert(Credential(credential));
    next.run(request).await
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = value.strip_prefix("Bearer ") {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let pool = state.pool.stats();
    let sessions = state.sessions.stats().await.ok();
    Json(json!({
        "healthy": state.pool.healthy(),
        "version": env!("CARGO_PKG_VERSION"),
        "pool": pool,
        "sessions": sessions,
    }))
}

// ---------------------------------------------------------------------
// Direct surface
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RunRequest {
    prompt: String,
    model: Option<String>,
    allowed_tools: Option<Vec<String>>,
    working_directory: Option<String>,
    session_id: Option<String>,
    max_turns: Option<u32>,
}

impl RunRequest {
    fn into_options(self) -> (RunOptions, Option<String>) {
        let options = RunOptions {
            prompt: self.prompt,
            model: self.model,
            allowed_tools: self.allowed_tools,
            working_directory: self.working_directory,
            resume_session_id: None,
            max_turns: self.max_turns,
            stream: false,
            timeout_ms: None,
        };
        (options, self.session_id)
    }
}

/// Shape validation at the HTTP boundary; the runner re-checks the
/// traversal rule before spawn.
fn validate_options(options: &RunOptions) -> Result<(), GatewayError> {
    if options.prompt.trim().is_empty() {
        return Err(GatewayError::invalid_request("prompt must not be empty"));
    }
    if let Some(dir) = &options.working_directory {
        if dir.contains("..") {
            return Err(GatewayError::invalid_request(
                "working_directory must not contain `..`",
            ));
        }
    }
    if options.max_turns == Some(0) {
        return Err(GatewayError::invalid_request("max_turns must be positive"));
    }
    Ok(())
}

async fn run(
    State(state): State<AppState>,
    Extension(credential): Extension<Credential>,
    Json(request): Json<RunRequest>,
) -> Result<Json<Value>, DirectError> {
    let (options, session_id) = request.into_options();
    validate_options(&options)?;

    let cancel = CancellationToken::new();
    // dropped on client disconnect, which aborts the child
    let _guard = cancel.clone().drop_guard();

    let outcome = dispatch::spawn_dispatch(&state, options, session_id, &credential.0, cancel, None)
        .await
        .map_err(|_| GatewayError::internal("dispatch task failed"))??;

    Ok(Json(json!({
        "result": outcome.result.result,
        "session_id": outcome.session_id,
        "model": outcome.result.model,
    })))
}

async fn list_sessions(
    State(state): State<AppState>,
    Extension(credential): Extension<Credential>,
) -> Result<Json<Value>, DirectError> {
    let sessions = state.sessions.list(&credential.0).await?;
    Ok(Json(json!({ "sessions": sessions })))
}

async fn get_session(
    State(state): State<AppState>,
    Extension(credential): Extension<Credential>,
    Path(id): Path<String>,
) -> Result<Json<Value>, DirectError> {
    let session = state.sessions.get(&id, &credential.0).await?;
    Ok(Json(serde_json::to_value(session).unwrap_or_default()))
}

async fn delete_session(
    State(state): State<AppState>,
    Extension(credential): Extension<Credential>,
    Path(id): Path<String>,
) -> Result<Json<Value>, DirectError> {
    state.sessions.delete(&id, &credential.0).await?;
    Ok(Json(json!({ "deleted": true })))
}

async fn create_task(
    State(state): State<AppState>,
    Extension(credential): Extension<Credential>,
    Json(request): Json<RunRequest>,
) -> Result<Response, DirectError> {
    let (options, session_id) = request.into_options();
    validate_options(&options)?;

    // fail fast before persisting a task the executor could never resume
    if let Some(session_id) = &session_id {
        state.sessions.get(session_id, &credential.0).await?;
    }

    let (task, cancel) = state
        .tasks
        .create(&options, session_id.as_deref(), &credential.0)
        .await?;
    dispatch::spawn_task(state.clone(), task.clone(), cancel, credential.0);

    Ok((StatusCode::ACCEPTED, Json(task)).into_response())
}

async fn list_tasks(
    State(state): State<AppState>,
    Extension(credential): Extension<Credential>,
) -> Result<Json<Value>, DirectError> {
    let tasks = state.tasks.list(&credential.0).await?;
    Ok(Json(json!({ "tasks": tasks })))
}

async fn get_task(
    State(state): State<AppState>,
    Extension(credential): Extension<Credential>,
    Path(id): Path<String>,
) -> Result<Json<Value>, DirectError> {
    let task = state.tasks.get(&id, &credential.0).await?;
    Ok(Json(serde_json::to_value(task).unwrap_or_default()))
}

async fn cancel_task(
    State(state): State<AppState>,
    Extension(credential): Extension<Credential>,
    Path(id): Path<String>,
) -> Result<Json<Value>, DirectError> {
    // owner check first so a foreign task reads as absent
    state.tasks.get(&id, &credential.0).await?;
    let cancelled = state.tasks.cancel(&id).await?;
    Ok(Json(json!({ "cancelled": cancelled })))
}

// ---------------------------------------------------------------------
// OpenAI-compatible surface
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ChatMessage {
    role: String,
    content: Value,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionsRequest {
    model: Option<String>,
    messages: Vec<ChatMessage>,
    #[serde(default)]
    stream: bool,
}

async fn chat_completions(
    State(state): State<AppState>,
    Extension(credential): Extension<Credential>,
    Json(request): Json<ChatCompletionsRequest>,
) -> Result<Json<Value>, OpenAiError> {
    if request.stream {
        return Err(GatewayError::streaming_not_supported(
            "stream=true is not supported on this endpoint; use /v1/messages",
        )
        .into());
    }

    let prompt = flatten_messages(None, &request.messages);
    let options = RunOptions {
        prompt,
        model: request.model,
        ..RunOptions::default()
    };
    validate_options(&options)?;

    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let outcome = dispatch::spawn_dispatch(&state, options, None, &credential.0, cancel, None)
        .await
        .map_err(|_| GatewayError::internal("dispatch task failed"))??;

    Ok(Json(json!({
        "id": format!("chatcmpl-{}", Uuid::new_v4().simple()),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": outcome.result.model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": outcome.result.result },
            "finish_reason": "stop",
        }],
        "usage": { "prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0 },
    })))
}

// ---------------------------------------------------------------------
// Anthropic-compatible surface
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct MessagesRequest {
    model: Option<String>,
    messages: Vec<ChatMessage>,
    system: Option<Value>,
    #[serde(default)]
    stream: bool,
}

async fn messages(
    State(state): State<AppState>,
    Extension(credential): Extension<Credential>,
    Json(request): Json<MessagesRequest>,
) -> Response {
    let prompt = flatten_messages(request.system.as_ref(), &request.messages);
    let options = RunOptions {
        prompt,
        model: request.model,
        stream: request.stream,
        ..RunOptions::default()
    };
    if let Err(err) = validate_options(&options) {
        return AnthropicError(err).into_response();
    }

    if options.stream {
        return stream_messages(state, options, credential.0).await;
    }

    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let outcome = dispatch::spawn_dispatch(&state, options, None, &credential.0, cancel, None)
        .await
        .unwrap_or_else(|_| Err(GatewayError::internal("dispatch task failed")));
    match outcome {
        Ok(outcome) => Json(json!({
            "id": format!("msg_{}", Uuid::new_v4().simple()),
            "type": "message",
            "role": "assistant",
            "model": outcome.result.model,
            "content": [{ "type": "text", "text": outcome.result.result }],
            "stop_reason": "end_turn",
            "usage": { "input_tokens": 0, "output_tokens": 0 },
        }))
        .into_response(),
        Err(err) => AnthropicError(err).into_response(),
    }
}

/// SSE rendering of a streamed run. Chunk order is preserved; dropping the
/// response body fires the cancel token and tears the child down.
async fn stream_messages(state: AppState, options: RunOptions, credential: String) -> Response {
    let (event_tx, event_rx) = tokio::sync::mpsc::unbounded_channel::<Event>();
    let (chunk_tx, mut chunk_rx) = tokio::sync::mpsc::unbounded_channel::<StreamChunk>();

    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    let message_id = format!("msg_{}", Uuid::new_v4().simple());
    let model = options
        .model
        .clone()
        .unwrap_or_else(|| "default".to_string());

    tokio::spawn(async move {
        let _ = event_tx.send(sse_event(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": message_id,
                    "type": "message",
                    "role": "assistant",
                    "model": model,
                    "content": [],
                    "stop_reason": null,
                },
            }),
        ));
        let _ = event_tx.send(sse_event(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": 0,
                "content_block": { "type": "text", "text": "" },
            }),
        ));

        let submit = {
            let state = state.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_with_session(&state, options, None, &credential, cancel, Some(chunk_tx)).await
            })
        };

        let mut stop_reason = "end_turn".to_string();
        while let Some(chunk) = chunk_rx.recv().await {
            match chunk {
                StreamChunk::Delta { text } => {
                    let _ = event_tx.send(sse_event(
                        "content_block_delta",
                        json!({
                            "type": "content_block_delta",
                            "index": 0,
                            "delta": { "type": "text_delta", "text": text },
                        }),
                    ));
                }
                StreamChunk::End { stop_reason: reason } => stop_reason = reason,
            }
        }

        match submit.await {
            Ok(Ok(_)) => {
                let _ = event_tx.send(sse_event(
                    "content_block_stop",
                    json!({ "type": "content_block_stop", "index": 0 }),
                ));
                let _ = event_tx.send(sse_event(
                    "message_delta",
                    json!({
                        "type": "message_delta",
                        "delta": { "stop_reason": stop_reason },
                    }),
                ));
                let _ = event_tx.send(sse_event("message_stop", json!({ "type": "message_stop" })));
            }
            Ok(Err(err)) => {
                debug!(code = err.code(), "streamed run failed");
                let _ = event_tx.send(sse_event(
                    "error",
                    json!({
                        "type": "error",
                        "error": { "type": err.code(), "message": err.message },
                    }),
                ));
            }
            Err(_) => {
                let _ = event_tx.send(sse_event(
                    "error",
                    json!({
                        "type": "error",
                        "error": { "type": "internal", "message": "stream driver failed" },
                    }),
                ));
            }
        }
    });

    let stream = UnboundedReceiverStream::new(event_rx).map(move |event| {
        // the drop guard rides along with the body; a disconnect cancels
        let _ = &guard;
        Ok::<_, Infallible>(event)
    });

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn sse_event(name: &str, data: Value) -> Event {
    Event::default().event(name).data(data.to_string())
}

/// Flatten a chat transcript into the single prompt the CLI accepts.
fn flatten_messages(system: Option<&Value>, messages: &[ChatMessage]) -> String {
    let mut parts = Vec::new();
    if let Some(text) = system.and_then(content_text) {
        parts.push(format!("System: {text}"));
    }
    for message in messages {
        let Some(text) = content_text(&message.content) else {
            continue;
        };
        let prefix = match message.role.as_str() {
            "system" => "System",
            "assistant" => "Assistant",
            _ => "Human",
        };
        parts.push(format!("{prefix}: {text}"));
    }
    parts.join("\n\n")
}

/// Message content is a string or a list of text blocks.
fn content_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Array(blocks) => {
            let texts: Vec<&str> = blocks
                .iter()
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect();
            (!texts.is_empty()).then(|| texts.join("\n"))
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------
// Error envelopes
// ---------------------------------------------------------------------

fn status_of(err: &GatewayError) -> StatusCode {
    StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

struct DirectError(GatewayError);

impl From<GatewayError> for DirectError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for DirectError {
    fn into_response(self) -> Response {
        let err = self.0;
        (
            status_of(&err),
            Json(json!({
                "error": {
                    "code": err.code(),
                    "message": err.message,
                    "details": err.details,
                },
            })),
        )
            .into_response()
    }
}

struct OpenAiError(GatewayError);

impl From<GatewayError> for OpenAiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for OpenAiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let error_type = match err.kind {
            ErrorKind::Auth | ErrorKind::UpstreamAuth => "authentication_error",
            ErrorKind::RateLimit | ErrorKind::QueueFull | ErrorKind::SessionLimit => {
                "rate_limit_error"
            }
            ErrorKind::InvalidRequest
            | ErrorKind::InvalidModel
            | ErrorKind::StreamingNotSupported
            | ErrorKind::SessionNotFound
            | ErrorKind::TaskNotFound => "invalid_request_error",
            _ => "api_error",
        };
        (
            status_of(&err),
            Json(json!({
                "error": {
                    "message": err.message,
                    "type": error_type,
                    "code": err.code(),
                },
            })),
        )
            .into_response()
    }
}

struct AnthropicError(GatewayError);

impl IntoResponse for AnthropicError {
    fn into_response(self) -> Response {
        let err = self.0;
        (
            status_of(&err),
            Json(json!({
                "type": "error",
                "error": { "type": err.code(), "message": err.message },
            })),
        )
            .into_response()
    }
}
