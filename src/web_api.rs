//! Web API server: both delivery transports over HTTP.
//!
//! ## Endpoints
//!
//! - `POST /api/v1/stories/stream` — SSE chunk streaming (`data: ` frames)
//! - `POST /api/v1/stories/generate` — submit a polling task, returns `{taskId}`
//! - `GET  /api/v1/stories/status?taskId=…` — query a polling task
//! - `GET  /api/v1/stories/recent` — the live recent-history list
//! - `GET  /health` — health check
//! - `GET  /metrics` — Prometheus metrics
//!
//! ## Delivery disciplines
//!
//! The SSE engine drives the model's chunk stream straight onto the wire
//! (state machine per request: Idle → Streaming → Completed | Failed),
//! persisting the accumulated text before the terminal `{"done": true}`
//! frame. The polling engine registers a task, runs generation detached
//! from the request cycle, and lets clients poll the task store. Both
//! persist exactly one story per successful generation; persistence
//! failures are logged and never block delivery of generated text.

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{Config, DeliveryConfig};
use crate::history::HistoryFeed;
use crate::metrics;
use crate::model::{ChunkStream, StoryModel};
use crate::repository::{Story, StoryRepository};
use crate::sse::StreamEvent;
use crate::store::{GenerationTask, TaskStore};
use crate::{derive_title, StoryError};

// ============================================================================
// Types & Configuration
// ============================================================================

/// JSON body for both submission endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// The story prompt. Must be non-empty after trimming.
    pub prompt: String,
}

/// JSON response for `POST /api/v1/stories/generate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    /// Opaque identifier for the registered task.
    #[serde(rename = "taskId")]
    pub task_id: String,
}

/// Query parameters for `GET /api/v1/stories/status`.
#[derive(Debug, Deserialize)]
struct StatusQuery {
    #[serde(rename = "taskId")]
    task_id: Option<String>,
}

/// Capacity of the per-request SSE event channel.
const SSE_CHANNEL_CAPACITY: usize = 32;

/// Shared application state available to all handlers.
struct AppState {
    model: Arc<dyn StoryModel>,
    repository: Arc<dyn StoryRepository>,
    tasks: Arc<TaskStore>,
    history: HistoryFeed,
    delivery: DeliveryConfig,
}

// ============================================================================
// Server
// ============================================================================

/// Start the web API server.
///
/// Spawns the task-store reaper and the history feed, binds to
/// `config.server`, and serves both delivery transports. Blocks until the
/// server shuts down.
///
/// # Errors
///
/// Returns an error if the history feed cannot load, the address cannot be
/// bound, or the server fails.
pub async fn start_server(
    config: Config,
    model: Arc<dyn StoryModel>,
    repository: Arc<dyn StoryRepository>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting story-relay server on http://{}", addr);

    let tasks = TaskStore::new(config.delivery.task_retention());
    let reaper_shutdown = CancellationToken::new();
    tasks.spawn_reaper(config.delivery.reaper_interval(), reaper_shutdown.clone());

    let history =
        HistoryFeed::start(Arc::clone(&repository), config.delivery.history_limit).await?;

    let state = Arc::new(AppState {
        model,
        repository,
        tasks,
        history,
        delivery: config.delivery.clone(),
    });

    let app = Router::new()
        .route("/api/v1/stories/stream", post(sse_stream_handler))
        .route("/api/v1/stories/generate", post(submit_handler))
        .route("/api/v1/stories/status", get(status_handler))
        .route("/api/v1/stories/recent", get(recent_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(middleware::from_fn_with_state(
            config.server.max_request_size,
            body_size_middleware,
        ))
        .layer(CorsLayer::permissive())
        .with_state(state);

    info!("Web API ready on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    reaper_shutdown.cancel();
    Ok(())
}

// ============================================================================
// Middleware
// ============================================================================

/// Adds a unique `X-Request-ID` header to every response.
///
/// If the client sends an `X-Request-ID` header, it is preserved; otherwise
/// a new UUID v4 is generated.
async fn request_id_middleware(req: Request<Body>, next: Next) -> Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut response = next.run(req).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }

    response
}

/// Rejects requests whose `Content-Length` exceeds `max_size` with 413.
async fn body_size_middleware(
    State(max_size): State<usize>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if let Some(content_length) = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<usize>().ok())
    {
        if content_length > max_size {
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(serde_json::json!({"error": "Request body too large"})),
            )
                .into_response();
        }
    }

    next.run(req).await
}

// ============================================================================
// SSE Delivery Engine
// ============================================================================

/// `POST /api/v1/stories/stream` — stream a generation as SSE frames.
///
/// Each upstream fragment is emitted immediately as `{"content": …}` and
/// appended to an in-memory accumulator. When the upstream ends, the
/// accumulated text is persisted and a terminal `{"done": true}` frame is
/// sent. Any pre-completion failure emits a single `{"error": …}` frame.
/// One upstream attempt per request; no retry.
///
/// Request-level failures (empty prompt, upstream refusal before stream
/// start) surface as a non-2xx JSON response instead of a stream.
async fn sse_stream_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GenerateRequest>,
) -> Result<Response, AppError> {
    let prompt = validated_prompt(&req.prompt)?;

    metrics::inc_started("sse");
    info!(prompt = %prompt, "starting SSE generation");

    // Idle → Streaming: a failure here is a request-level error, reported
    // before any stream bytes are sent.
    let chunks = state.model.stream(&prompt).await.map_err(|e| {
        metrics::inc_failed("sse", failure_reason(&e));
        AppError(e)
    })?;

    let (tx, rx) = mpsc::channel::<StreamEvent>(SSE_CHANNEL_CAPACITY);
    tokio::spawn(deliver_sse(state, prompt, chunks, tx));

    let events = ReceiverStream::new(rx)
        .map(|event| Ok::<_, Infallible>(Event::default().data(event.to_json())));

    let response = (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        Sse::new(events).keep_alive(KeepAlive::default()),
    );
    Ok(response.into_response())
}

/// Drive the model's chunk stream onto the SSE channel.
///
/// Streaming → Completed: persist, then emit `{"done": true}`. A failed
/// insert is logged but never suppresses the terminal frame — the user
/// already has the text.
/// Streaming → Failed: emit a single `{"error": …}` frame and stop.
async fn deliver_sse(
    state: Arc<AppState>,
    prompt: String,
    mut chunks: ChunkStream,
    tx: mpsc::Sender<StreamEvent>,
) {
    let started = Instant::now();
    let mut accumulated = String::new();
    let chunk_delay = state.delivery.chunk_delay();

    while let Some(item) = chunks.next().await {
        match item {
            Ok(fragment) => {
                accumulated.push_str(&fragment);
                if tx.send(StreamEvent::Content(fragment)).await.is_err() {
                    info!("SSE client disconnected mid-stream");
                    metrics::inc_failed("sse", "disconnect");
                    return;
                }
                // Presentation pacing only; disabled by default.
                if !chunk_delay.is_zero() {
                    tokio::time::sleep(chunk_delay).await;
                }
            }
            Err(e) => {
                warn!(error = %e, "SSE generation failed mid-stream");
                metrics::inc_failed("sse", failure_reason(&e));
                let _ = tx.send(StreamEvent::Error(e.to_string())).await;
                return;
            }
        }
    }

    let content = accumulated.trim();
    if let Err(e) = state
        .repository
        .insert(&derive_title(&prompt), content)
        .await
    {
        // Logged only; the terminal frame is still delivered.
        error!(error = %e, "failed to persist story");
    } else {
        info!(chars = content.len(), "story persisted");
    }

    metrics::inc_completed("sse");
    metrics::observe_duration("sse", started.elapsed());
    let _ = tx.send(StreamEvent::Done).await;
}

// ============================================================================
// Polling Delivery Engine
// ============================================================================

/// `POST /api/v1/stories/generate` — register a polling task.
///
/// Allocates a fresh task identifier, registers it in status `generating`,
/// launches the background generation routine detached from the request
/// cycle, and returns `{taskId}` immediately.
async fn submit_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<SubmitResponse>, AppError> {
    let prompt = validated_prompt(&req.prompt)?;

    let task_id = Uuid::new_v4().to_string();
    state.tasks.create(&task_id);
    metrics::inc_started("polling");
    metrics::set_active_tasks(state.tasks.len());

    info!(task_id = %task_id, prompt = %prompt, "starting polling generation");
    tokio::spawn(generate_in_background(
        Arc::clone(&state),
        task_id.clone(),
        prompt,
    ));

    Ok(Json(SubmitResponse { task_id }))
}

/// Background generation routine; runs once per submitted task.
///
/// Emits synthetic progress ticks so pollers have something to show, then
/// performs one non-streaming model call, persists the story, and marks the
/// task terminal. The task entry stays queryable until the reaper evicts it
/// after the retention window.
async fn generate_in_background(state: Arc<AppState>, task_id: String, prompt: String) {
    let started = Instant::now();
    let tick = state.delivery.progress_tick();

    for progress in (10..=90).step_by(10) {
        state.tasks.update_progress(&task_id, progress, "");
        tokio::time::sleep(tick).await;
    }

    match state.model.complete(&prompt).await {
        Ok(text) => {
            let content = text.trim().to_string();
            if let Err(e) = state
                .repository
                .insert(&derive_title(&prompt), &content)
                .await
            {
                // Logged only; completion is still reported to pollers.
                error!(task_id = %task_id, error = %e, "failed to persist story");
            }
            state.tasks.complete(&task_id, content);
            metrics::inc_completed("polling");
            metrics::observe_duration("polling", started.elapsed());
            info!(task_id = %task_id, "polling generation complete");
        }
        Err(e) => {
            warn!(task_id = %task_id, error = %e, "polling generation failed");
            metrics::inc_failed("polling", failure_reason(&e));
            state.tasks.fail(&task_id, e.to_string());
        }
    }
    metrics::set_active_tasks(state.tasks.len());
}

/// `GET /api/v1/stories/status?taskId=…` — query a polling task.
///
/// Unknown or expired identifiers yield a synthetic `not_found` snapshot
/// with HTTP 404; a missing parameter yields 400.
async fn status_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatusQuery>,
) -> Response {
    let Some(task_id) = params.task_id else {
        return AppError(StoryError::Validation("No taskId provided".into())).into_response();
    };

    match state.tasks.get(&task_id) {
        Some(task) => Json(task).into_response(),
        None => (StatusCode::NOT_FOUND, Json(GenerationTask::not_found())).into_response(),
    }
}

// ============================================================================
// History & Utility Handlers
// ============================================================================

/// `GET /api/v1/stories/recent` — the live recent-history list.
async fn recent_handler(State(state): State<Arc<AppState>>) -> Json<Vec<Story>> {
    Json(state.history.stories())
}

/// `GET /health` — health check endpoint.
async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `GET /metrics` — Prometheus metrics endpoint.
async fn metrics_handler() -> String {
    metrics::gather_metrics()
}

// ============================================================================
// Validation & Error Type
// ============================================================================

/// Trim the prompt and reject empty/whitespace-only input before any
/// upstream activity.
fn validated_prompt(raw: &str) -> Result<String, AppError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AppError(StoryError::Validation(
            "prompt must not be empty".into(),
        )));
    }
    Ok(trimmed.to_string())
}

/// Coarse failure label for metrics.
fn failure_reason(error: &StoryError) -> &'static str {
    match error {
        StoryError::Validation(_) => "validation",
        StoryError::Upstream { .. } => "upstream",
        StoryError::Transport(_) => "transport",
        StoryError::Persistence(_) => "persistence",
        StoryError::NotFound(_) => "not_found",
        StoryError::Config(_) => "config",
        StoryError::Other(_) => "other",
    }
}

/// Request-boundary wrapper turning [`StoryError`] into a structured JSON
/// response. Every handler failure flows through here, so no error closes
/// the connection without a payload.
#[derive(Debug)]
struct AppError(StoryError);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            StoryError::Validation(_) => StatusCode::BAD_REQUEST,
            StoryError::NotFound(_) => StatusCode::NOT_FOUND,
            StoryError::Upstream { .. } | StoryError::Transport(_) => StatusCode::BAD_GATEWAY,
            StoryError::Persistence(_) | StoryError::Config(_) | StoryError::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (
            status,
            Json(serde_json::json!({"error": self.0.to_string()})),
        )
            .into_response()
    }
}
