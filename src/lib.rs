//! # story-relay
//!
//! A demonstration service contrasting two real-time delivery mechanisms
//! for an LLM text-generation workload: Server-Sent Events (SSE) streaming
//! and interval-based polling.
//!
//! ## Architecture
//!
//! ```text
//! prompt ──> web_api ──┬─ SSE:     model stream ─> data: frames ─> repository
//!                      └─ Polling: task store <─ background job ─> repository
//!                                      ▲
//!                                 status queries
//! ```
//!
//! The server side (`web_api`) exposes both transports over HTTP; the client
//! side (`client`) drives either transport through a single state machine.
//! Finished stories land in a [`repository::StoryRepository`] whose insert
//! feed powers a live [`history::HistoryFeed`].

// ── Lint policy (aerospace-grade) ─────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod client;
pub mod config;
pub mod history;
pub mod metrics;
pub mod model;
pub mod repository;
pub mod sse;
pub mod store;
pub mod web_api;

// Re-exports for convenience
pub use client::{GenerationController, Notifier, TracingNotifier, Transport, UiState};
pub use config::Config;
pub use history::HistoryFeed;
pub use model::{EchoModel, OpenAiModel, StoryModel};
pub use repository::{MemoryRepository, Story, StoryRepository};
pub use sse::StreamEvent;
pub use store::{GenerationTask, TaskStatus, TaskStore};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"` — structured JSON output for production log aggregators
/// - anything else (including unset) — human-readable pretty output
///   for local development
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`StoryError::Other`] if the global subscriber has already been
/// set (e.g. by a previous call or a test harness).
pub fn init_tracing() -> Result<(), StoryError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| StoryError::Other(format!("tracing init failed: {e}")))
}

/// Top-level error taxonomy for both delivery transports.
///
/// Every failure surface in the crate maps to a variant here. All variants
/// implement `std::error::Error` via [`thiserror`]. The web API converts
/// each variant to a structured JSON response with an appropriate status
/// code; no error leaks as an unhandled failure without a payload.
#[derive(Error, Debug)]
pub enum StoryError {
    /// Request rejected before any network activity (e.g. empty prompt).
    #[error("invalid request: {0}")]
    Validation(String),

    /// The upstream language-model API returned a non-success status.
    #[error("upstream API error: status {status}")]
    Upstream {
        /// HTTP status code returned by the upstream API.
        status: u16,
    },

    /// Network failure reading a stream, or a non-OK HTTP response from
    /// the delivery server. Treated identically to [`StoryError::Upstream`]
    /// by the client-side controller.
    #[error("transport error: {0}")]
    Transport(String),

    /// Story insert failed. Logged only; never surfaced to the user and
    /// never blocks delivery of generated text.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Unknown or expired polling task.
    #[error("task not found: {0}")]
    NotFound(String),

    /// A configuration value is missing or invalid (e.g., missing env var).
    ///
    /// Returned at construction time so misconfiguration surfaces
    /// immediately rather than at the first generation call.
    #[error("configuration error: {0}")]
    Config(String),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

/// Maximum prompt prefix length used for story titles.
const TITLE_MAX_CHARS: usize = 50;

/// Derive a story title from its prompt.
///
/// Prompts of at most 50 characters are used verbatim; longer prompts are
/// truncated to their first 50 characters with a `"..."` suffix, so a title
/// is never longer than 53 characters.
///
/// # Example
///
/// ```rust
/// use story_relay::derive_title;
/// assert_eq!(derive_title("A robot discovers emotions"), "A robot discovers emotions");
/// ```
pub fn derive_title(prompt: &str) -> String {
    if prompt.chars().count() > TITLE_MAX_CHARS {
        let head: String = prompt.chars().take(TITLE_MAX_CHARS).collect();
        format!("{head}...")
    } else {
        prompt.to_string()
    }
}
