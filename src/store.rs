//! In-memory polling task registry.
//!
//! Tracks one [`GenerationTask`] per submitted polling request. The store is
//! an injected, explicitly-owned value (always behind an `Arc`), never a
//! module-level singleton, so lifecycle and testability stay explicit.
//!
//! ## Concurrency
//!
//! Each task has exactly one background writer; status queries may read
//! concurrently. Writes replace the whole task value, so readers always
//! observe a fully-formed snapshot. [`DashMap`] provides the sharded
//! locking underneath.
//!
//! ## Invariants
//!
//! - `progress` is monotonically non-decreasing while status is
//!   `generating`; stale lower values never overwrite higher ones.
//! - `complete` and `error` are terminal; all later writes are ignored.
//! - Terminal tasks are evicted by the reaper after the retention window,
//!   regardless of whether they were ever queried.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Processing state of a polling generation task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// The background routine is still producing text.
    Generating,
    /// Generation finished successfully; content is final. Terminal.
    Complete,
    /// Generation failed; `error` carries the message. Terminal.
    Error,
    /// Synthetic status for unknown or expired task identifiers.
    /// Never stored; only ever synthesized in responses.
    NotFound,
}

impl TaskStatus {
    /// Returns true for one-way, final states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

/// Snapshot of one polling generation task.
///
/// Doubles as the wire shape of the status-query response; `content` is
/// omitted while empty and `error` while absent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenerationTask {
    /// Current processing status.
    pub status: TaskStatus,
    /// Accumulated text so far (final text once complete).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    /// Progress in percent, 0-100.
    #[serde(default)]
    pub progress: u8,
    /// Failure message, present only when status is `error` (or
    /// `not_found` in synthesized responses).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GenerationTask {
    /// Fresh task as registered at submission time.
    fn new() -> Self {
        Self {
            status: TaskStatus::Generating,
            content: String::new(),
            progress: 0,
            error: None,
        }
    }

    /// Synthesized snapshot for unknown or expired identifiers.
    pub fn not_found() -> Self {
        Self {
            status: TaskStatus::NotFound,
            content: String::new(),
            progress: 0,
            error: Some("Task not found or expired".to_string()),
        }
    }
}

/// Stored entry: the public snapshot plus eviction bookkeeping.
struct TaskEntry {
    task: GenerationTask,
    finished_at: Option<Instant>,
}

/// Process-wide registry of in-flight and recently finished polling tasks.
///
/// Construct with [`TaskStore::new`] and share via `Arc`; spawn the reaper
/// with [`TaskStore::spawn_reaper`] to enforce the retention window.
pub struct TaskStore {
    tasks: DashMap<String, TaskEntry>,
    retention: Duration,
}

impl TaskStore {
    /// Create a store whose finished tasks are retained for `retention`.
    pub fn new(retention: Duration) -> Arc<Self> {
        Arc::new(Self {
            tasks: DashMap::new(),
            retention,
        })
    }

    /// Register a fresh task in status `generating`, progress 0.
    pub fn create(&self, id: &str) {
        self.tasks.insert(
            id.to_string(),
            TaskEntry {
                task: GenerationTask::new(),
                finished_at: None,
            },
        );
    }

    /// Record a synthetic progress update.
    ///
    /// Ignored on terminal tasks and on unknown identifiers. Progress is
    /// clamped monotonic: a stale lower value never overwrites a higher one.
    pub fn update_progress(&self, id: &str, progress: u8, content: &str) {
        if let Some(mut entry) = self.tasks.get_mut(id) {
            if entry.task.status.is_terminal() || progress < entry.task.progress {
                return;
            }
            entry.task = GenerationTask {
                status: TaskStatus::Generating,
                content: content.to_string(),
                progress: progress.min(100),
                error: None,
            };
        }
    }

    /// Transition a task to `complete` with its final content.
    ///
    /// Ignored if the task is already terminal (status transitions are
    /// one-way) or unknown.
    pub fn complete(&self, id: &str, content: String) {
        if let Some(mut entry) = self.tasks.get_mut(id) {
            if entry.task.status.is_terminal() {
                return;
            }
            entry.task = GenerationTask {
                status: TaskStatus::Complete,
                content,
                progress: 100,
                error: None,
            };
            entry.finished_at = Some(Instant::now());
        }
    }

    /// Transition a task to `error` with a failure message.
    ///
    /// Ignored if the task is already terminal or unknown.
    pub fn fail(&self, id: &str, message: String) {
        if let Some(mut entry) = self.tasks.get_mut(id) {
            if entry.task.status.is_terminal() {
                return;
            }
            entry.task = GenerationTask {
                status: TaskStatus::Error,
                content: String::new(),
                progress: 0,
                error: Some(message),
            };
            entry.finished_at = Some(Instant::now());
        }
    }

    /// Return a snapshot of the task, or `None` if unknown or evicted.
    pub fn get(&self, id: &str) -> Option<GenerationTask> {
        self.tasks.get(id).map(|entry| entry.task.clone())
    }

    /// Number of tracked tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the store tracks no tasks.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Evict terminal tasks older than the retention window.
    ///
    /// Returns the number of evicted entries.
    pub fn sweep(&self) -> usize {
        let before = self.tasks.len();
        let retention = self.retention;
        self.tasks.retain(|_, entry| match entry.finished_at {
            Some(finished_at) => finished_at.elapsed() < retention,
            None => true,
        });
        let evicted = before - self.tasks.len();
        if evicted > 0 {
            debug!(evicted, remaining = self.tasks.len(), "task store swept");
        }
        evicted
    }

    /// Spawn the background reaper that sweeps at a fixed interval until
    /// `shutdown` is cancelled.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("task reaper shutting down");
                        return;
                    }
                    _ = ticker.tick() => {
                        store.sweep();
                    }
                }
            }
        })
    }
}
