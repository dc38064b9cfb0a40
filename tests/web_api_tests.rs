//! Integration tests for `src/web_api.rs`.
//!
//! Tests spawn a real HTTP server on a unique port and exercise both
//! delivery transports via `reqwest`. The in-memory repository is shared
//! with the test so persistence can be verified without a database.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use story_relay::config::Config;
use story_relay::model::ChunkStream;
use story_relay::sse::{SseFrameDecoder, StreamEvent};
use story_relay::{EchoModel, MemoryRepository, StoryError, StoryModel, StoryRepository};

// ============================================================================
// Test Infrastructure
// ============================================================================

/// Atomic counter for unique per-test port allocation.
/// Starts high to avoid collisions with common services.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(29400);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Test config with fast timers so polling scenarios finish quickly.
fn test_config(port: u16) -> Config {
    let mut config = Config::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = port;
    config.delivery.progress_tick_ms = 20;
    config.delivery.reaper_interval_secs = 1;
    config
}

/// Spawn a server with the given model and return its base URL plus the
/// repository handle for persistence assertions.
async fn spawn_server(model: Arc<dyn StoryModel>) -> (String, Arc<MemoryRepository>) {
    let _ = story_relay::metrics::init_metrics();
    let port = next_port();
    let repository = Arc::new(MemoryRepository::new());
    let repo_handle = Arc::clone(&repository);
    let config = test_config(port);

    tokio::spawn(async move {
        let _ = story_relay::web_api::start_server(config, model, repository).await;
    });
    // Give the server a moment to bind.
    tokio::time::sleep(Duration::from_millis(300)).await;
    (format!("http://127.0.0.1:{port}"), repo_handle)
}

async fn spawn_echo_server() -> (String, Arc<MemoryRepository>) {
    spawn_server(Arc::new(EchoModel::with_delay(5))).await
}

fn client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .expect("reqwest client must build in tests")
}

/// Collect every SSE event from a streaming response, in arrival order.
async fn collect_events(response: reqwest::Response) -> Vec<StreamEvent> {
    let mut bytes = response.bytes_stream();
    let mut decoder = SseFrameDecoder::new();
    let mut events = Vec::new();

    while let Some(chunk) = bytes.next().await {
        let chunk = chunk.expect("stream chunk");
        for payload in decoder.push(&chunk) {
            if let Some(event) = StreamEvent::parse(&payload) {
                let terminal = event.is_terminal();
                events.push(event);
                if terminal {
                    return events;
                }
            }
        }
    }
    events
}

/// A model whose requests are refused before any stream starts.
struct RefusingModel;

#[async_trait]
impl StoryModel for RefusingModel {
    async fn complete(&self, _prompt: &str) -> Result<String, StoryError> {
        Err(StoryError::Upstream { status: 500 })
    }

    async fn stream(&self, _prompt: &str) -> Result<ChunkStream, StoryError> {
        Err(StoryError::Upstream { status: 500 })
    }
}

/// A model whose stream fails after the first fragment.
struct MidStreamFailureModel;

#[async_trait]
impl StoryModel for MidStreamFailureModel {
    async fn complete(&self, _prompt: &str) -> Result<String, StoryError> {
        Err(StoryError::Upstream { status: 500 })
    }

    async fn stream(&self, _prompt: &str) -> Result<ChunkStream, StoryError> {
        let items: VecDeque<Result<String, StoryError>> = VecDeque::from([
            Ok("Once ".to_string()),
            Err(StoryError::Upstream { status: 500 }),
        ]);
        Ok(futures::stream::iter(items).boxed())
    }
}

// ============================================================================
// Health & Metrics
// ============================================================================

#[tokio::test]
async fn test_health_endpoint_reports_healthy() {
    let (base, _repo) = spawn_echo_server().await;
    let resp = client().get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_metrics_endpoint_serves_prometheus_text() {
    let (base, _repo) = spawn_echo_server().await;

    // Record at least one sample so the counter family is rendered.
    story_relay::metrics::inc_started("sse");

    let resp = client().get(format!("{base}/metrics")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.text().await.unwrap();
    assert!(body.contains("storyrelay_generations_total"));
}

// ============================================================================
// SSE Delivery
// ============================================================================

#[tokio::test]
async fn test_sse_streams_content_then_done() {
    let (base, _repo) = spawn_echo_server().await;
    let resp = client()
        .post(format!("{base}/api/v1/stories/stream"))
        .json(&json!({"prompt": "A robot discovers emotions"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("text/event-stream"))
        .unwrap_or(false));

    let events = collect_events(resp).await;
    assert!(events.len() >= 2, "expected content frames plus done");
    assert_eq!(events.last(), Some(&StreamEvent::Done));
    assert!(events[..events.len() - 1]
        .iter()
        .all(|e| matches!(e, StreamEvent::Content(_))));
}

#[tokio::test]
async fn test_sse_frame_concatenation_equals_persisted_content() {
    let (base, repo) = spawn_echo_server().await;
    let resp = client()
        .post(format!("{base}/api/v1/stories/stream"))
        .json(&json!({"prompt": "a quiet lighthouse keeper"}))
        .send()
        .await
        .unwrap();

    let events = collect_events(resp).await;
    let concatenated: String = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Content(c) => Some(c.as_str()),
            _ => None,
        })
        .collect();

    // Persistence happens before the terminal frame, so it is visible now.
    let stories = repo.recent(5).await.unwrap();
    assert_eq!(stories.len(), 1);
    assert_eq!(stories[0].content, concatenated.trim());
    assert_eq!(stories[0].title, "a quiet lighthouse keeper");
}

#[tokio::test]
async fn test_sse_long_prompt_title_is_truncated() {
    let (base, repo) = spawn_echo_server().await;
    let prompt = "a".repeat(80);
    let resp = client()
        .post(format!("{base}/api/v1/stories/stream"))
        .json(&json!({"prompt": prompt}))
        .send()
        .await
        .unwrap();
    collect_events(resp).await;

    let stories = repo.recent(5).await.unwrap();
    assert_eq!(stories[0].title.chars().count(), 53);
    assert!(stories[0].title.ends_with("..."));
}

#[tokio::test]
async fn test_sse_empty_prompt_rejected_before_upstream() {
    let (base, repo) = spawn_echo_server().await;
    let resp = client()
        .post(format!("{base}/api/v1/stories/stream"))
        .json(&json!({"prompt": "   "}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().is_some());
    assert!(repo.recent(5).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_sse_upstream_refusal_is_request_level_failure() {
    let (base, repo) = spawn_server(Arc::new(RefusingModel)).await;
    let resp = client()
        .post(format!("{base}/api/v1/stories/stream"))
        .json(&json!({"prompt": "doomed"}))
        .send()
        .await
        .unwrap();
    // Failure before stream start: non-2xx JSON, not an event stream.
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("500"));
    assert!(repo.recent(5).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_sse_mid_stream_failure_emits_single_error_frame() {
    let (base, repo) = spawn_server(Arc::new(MidStreamFailureModel)).await;
    let resp = client()
        .post(format!("{base}/api/v1/stories/stream"))
        .json(&json!({"prompt": "doomed"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let events = collect_events(resp).await;
    assert_eq!(events[0], StreamEvent::Content("Once ".to_string()));
    assert!(matches!(events.last(), Some(StreamEvent::Error(_))));
    let errors = events
        .iter()
        .filter(|e| matches!(e, StreamEvent::Error(_)))
        .count();
    assert_eq!(errors, 1);
    // No story is persisted for a failed generation.
    assert!(repo.recent(5).await.unwrap().is_empty());
}

// ============================================================================
// Polling Delivery
// ============================================================================

async fn poll_until_terminal(client: &Client, base: &str, task_id: &str) -> Vec<Value> {
    let mut observed = Vec::new();
    for _ in 0..200 {
        tokio::time::sleep(Duration::from_millis(25)).await;
        let resp = client
            .get(format!("{base}/api/v1/stories/status"))
            .query(&[("taskId", task_id)])
            .send()
            .await
            .unwrap();
        let body: Value = resp.json().await.unwrap();
        let status = body["status"].as_str().unwrap().to_string();
        observed.push(body);
        if status == "complete" || status == "error" {
            return observed;
        }
    }
    panic!("task never reached a terminal status");
}

#[tokio::test]
async fn test_polling_submit_returns_task_id() {
    let (base, _repo) = spawn_echo_server().await;
    let resp = client()
        .post(format!("{base}/api/v1/stories/generate"))
        .json(&json!({"prompt": "A robot discovers emotions"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert!(!body["taskId"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_polling_progress_monotone_until_complete() {
    let (base, repo) = spawn_echo_server().await;
    let http = client();
    let submit: Value = http
        .post(format!("{base}/api/v1/stories/generate"))
        .json(&json!({"prompt": "A robot discovers emotions"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let task_id = submit["taskId"].as_str().unwrap();

    let observed = poll_until_terminal(&http, &base, task_id).await;

    let progresses: Vec<u64> = observed
        .iter()
        .map(|b| b["progress"].as_u64().unwrap_or(0))
        .collect();
    assert!(
        progresses.windows(2).all(|w| w[0] <= w[1]),
        "progress regressed: {progresses:?}"
    );

    let last = observed.last().unwrap();
    assert_eq!(last["status"], "complete");
    assert_eq!(last["progress"], 100);
    let content = last["content"].as_str().unwrap();
    assert!(!content.is_empty());

    // Exactly one story, matching the reported content.
    let stories = repo.recent(5).await.unwrap();
    assert_eq!(stories.len(), 1);
    assert_eq!(stories[0].content, content);
}

#[tokio::test]
async fn test_polling_completed_task_queries_are_idempotent() {
    let (base, _repo) = spawn_echo_server().await;
    let http = client();
    let submit: Value = http
        .post(format!("{base}/api/v1/stories/generate"))
        .json(&json!({"prompt": "an idempotent tortoise"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let task_id = submit["taskId"].as_str().unwrap();
    poll_until_terminal(&http, &base, task_id).await;

    let mut snapshots = Vec::new();
    for _ in 0..3 {
        let body: Value = http
            .get(format!("{base}/api/v1/stories/status"))
            .query(&[("taskId", task_id)])
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        snapshots.push(body);
    }
    assert_eq!(snapshots[0], snapshots[1]);
    assert_eq!(snapshots[1], snapshots[2]);
}

#[tokio::test]
async fn test_polling_upstream_failure_marks_task_error() {
    let (base, repo) = spawn_server(Arc::new(RefusingModel)).await;
    let http = client();
    let submit: Value = http
        .post(format!("{base}/api/v1/stories/generate"))
        .json(&json!({"prompt": "doomed"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let task_id = submit["taskId"].as_str().unwrap();

    let observed = poll_until_terminal(&http, &base, task_id).await;
    let last = observed.last().unwrap();
    assert_eq!(last["status"], "error");
    assert_eq!(last["progress"], 0);
    assert!(last["error"].as_str().unwrap().contains("500"));
    assert!(repo.recent(5).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_polling_empty_prompt_rejected() {
    let (base, _repo) = spawn_echo_server().await;
    let resp = client()
        .post(format!("{base}/api/v1/stories/generate"))
        .json(&json!({"prompt": ""}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_status_unknown_task_returns_404_not_found() {
    let (base, _repo) = spawn_echo_server().await;
    let resp = client()
        .get(format!("{base}/api/v1/stories/status"))
        .query(&[("taskId", "no-such-task")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "not_found");
    assert!(!body["error"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_status_missing_task_id_returns_400() {
    let (base, _repo) = spawn_echo_server().await;
    let resp = client()
        .get(format!("{base}/api/v1/stories/status"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().is_some());
}

// ============================================================================
// Recent History
// ============================================================================

#[tokio::test]
async fn test_recent_returns_top_five_newest_first() {
    let (base, repo) = spawn_echo_server().await;
    for i in 0..6 {
        repo.insert(&format!("story-{i}"), "text").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    // Let the history feed absorb the inserts.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let body: Value = client()
        .get(format!("{base}/api/v1/stories/recent"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let stories = body.as_array().unwrap();
    assert_eq!(stories.len(), 5);
    assert_eq!(stories[0]["title"], "story-5");
    assert_eq!(stories[4]["title"], "story-1");
}

#[tokio::test]
async fn test_recent_updates_after_sse_generation() {
    let (base, _repo) = spawn_echo_server().await;
    let resp = client()
        .post(format!("{base}/api/v1/stories/stream"))
        .json(&json!({"prompt": "the newest story"}))
        .send()
        .await
        .unwrap();
    collect_events(resp).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let body: Value = client()
        .get(format!("{base}/api/v1/stories/recent"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body.as_array().unwrap()[0]["title"], "the newest story");
}
