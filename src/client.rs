//! Client-side generation controller.
//!
//! One state machine drives both delivery transports, parameterized by the
//! active [`Transport`] selection. It owns the UI-observable state (current
//! text, progress, generating flag) exclusively, so stale text from an
//! inactive transport can never leak into view.
//!
//! ## Lifecycle
//!
//! At most one generation is active at a time. Starting a new generation or
//! switching transport cancels the in-flight one: the SSE byte stream is
//! dropped (releasing the connection) and the polling loop issues no
//! further queries. Stale writes from a superseded generation are discarded
//! by an epoch guard.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::sse::{SseFrameDecoder, StreamEvent};
use crate::store::{GenerationTask, TaskStatus};
use crate::web_api::SubmitResponse;
use crate::StoryError;

/// Delivery transport selection. Mutually exclusive; switchable only
/// between generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Server-Sent Events streaming.
    Sse,
    /// Interval-based status polling.
    Polling,
}

impl std::str::FromStr for Transport {
    type Err = StoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sse" => Ok(Self::Sse),
            "polling" => Ok(Self::Polling),
            other => Err(StoryError::Validation(format!(
                "unknown transport '{other}' (expected 'sse' or 'polling')"
            ))),
        }
    }
}

/// UI-observable state, owned exclusively by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UiState {
    /// The prompt of the current (or last) generation.
    pub prompt: String,
    /// Active transport selection.
    pub transport: Transport,
    /// Whether a generation is in flight. Every failure path resets this
    /// to `false`; the UI is never left stuck in a generating state.
    pub is_generating: bool,
    /// Text accumulated so far (final text once finished).
    pub current_text: String,
    /// Progress in percent; only meaningful for the polling transport.
    pub progress: u8,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            transport: Transport::Sse,
            is_generating: false,
            current_text: String::new(),
            progress: 0,
        }
    }
}

/// Outcome-notification capability (a toast, a log line, a test probe).
pub trait Notifier: Send + Sync {
    /// Report a successful outcome.
    fn success(&self, title: &str, body: &str);
    /// Report a failed outcome.
    fn failure(&self, title: &str, body: &str);
}

/// Default notifier that reports outcomes through `tracing`.
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn success(&self, title: &str, body: &str) {
        info!(title = title, "{body}");
    }

    fn failure(&self, title: &str, body: &str) {
        warn!(title = title, "{body}");
    }
}

/// The in-flight generation, if any.
struct ActiveGeneration {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Client-side state machine driving either delivery transport.
///
/// ## Example
///
/// ```no_run
/// use std::sync::Arc;
/// use story_relay::config::ClientConfig;
/// use story_relay::{GenerationController, TracingNotifier};
///
/// # async fn example() -> Result<(), story_relay::StoryError> {
/// let controller = GenerationController::new(
///     "http://localhost:8080",
///     ClientConfig::default(),
///     Arc::new(TracingNotifier),
/// );
/// controller.start_generation("A robot discovers emotions")?;
/// controller.wait_idle().await;
/// println!("{}", controller.state().current_text);
/// # Ok(()) }
/// ```
pub struct GenerationController {
    http: reqwest::Client,
    base_url: String,
    config: ClientConfig,
    notifier: Arc<dyn Notifier>,
    state: watch::Sender<UiState>,
    /// Bumped on every start/cancel; writes tagged with an older epoch are
    /// discarded.
    epoch: AtomicU64,
    active: Mutex<Option<ActiveGeneration>>,
}

impl GenerationController {
    /// Create a controller targeting a story-relay server.
    pub fn new(
        base_url: impl Into<String>,
        config: ClientConfig,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(UiState::default());
        Arc::new(Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            config,
            notifier,
            state,
            epoch: AtomicU64::new(0),
            active: Mutex::new(None),
        })
    }

    /// Snapshot of the current UI state.
    pub fn state(&self) -> UiState {
        self.state.borrow().clone()
    }

    /// Watch receiver that changes on every state update.
    pub fn subscribe(&self) -> watch::Receiver<UiState> {
        self.state.subscribe()
    }

    /// Select the delivery transport, cancelling any in-flight generation.
    pub fn set_transport(&self, transport: Transport) {
        self.cancel_active();
        self.state.send_modify(|state| {
            state.transport = transport;
            state.is_generating = false;
        });
    }

    /// Start a generation over the currently selected transport.
    ///
    /// Rejects empty/whitespace prompts with a user-visible validation
    /// error **before any network activity**. An in-flight generation is
    /// cancelled first; only one may be active at a time.
    ///
    /// # Errors
    ///
    /// Returns [`StoryError::Validation`] for an empty prompt. Transport
    /// and upstream failures surface through the [`Notifier`], not here —
    /// the generation runs detached.
    pub fn start_generation(self: &Arc<Self>, prompt: &str) -> Result<(), StoryError> {
        let trimmed = prompt.trim().to_string();
        if trimmed.is_empty() {
            self.notifier
                .failure("Prompt Required", "Please enter a story prompt");
            return Err(StoryError::Validation("prompt must not be empty".into()));
        }

        self.cancel_active();
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;

        self.state.send_modify(|state| {
            state.prompt = trimmed.clone();
            state.is_generating = true;
            state.current_text.clear();
            state.progress = 0;
        });

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(self).run_generation(trimmed, epoch, cancel.clone()));

        let mut active = self.lock_active();
        *active = Some(ActiveGeneration { cancel, handle });
        Ok(())
    }

    /// Cancel the in-flight generation, if any.
    ///
    /// The epoch bump discards any state write the cancelled task might
    /// still have in flight; aborting at the next suspension point drops
    /// the stream reader / stops the poll timer.
    pub fn cancel_active(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        if let Some(previous) = self.lock_active().take() {
            previous.cancel.cancel();
            previous.handle.abort();
        }
    }

    /// Wait until no generation is in flight.
    pub async fn wait_idle(&self) {
        let mut rx = self.state.subscribe();
        loop {
            if !rx.borrow_and_update().is_generating {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Apply a state mutation only if `epoch` is still current.
    fn apply(&self, epoch: u64, mutate: impl FnOnce(&mut UiState)) {
        self.state.send_if_modified(|state| {
            if self.epoch.load(Ordering::Acquire) != epoch {
                return false;
            }
            mutate(state);
            true
        });
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<ActiveGeneration>> {
        // A poisoned lock only means another thread panicked while holding
        // it; the Option inside is still valid.
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Drive one generation to a terminal state.
    async fn run_generation(self: Arc<Self>, prompt: String, epoch: u64, cancel: CancellationToken) {
        let transport = self.state.borrow().transport;
        let outcome = match transport {
            Transport::Sse => self.run_sse(&prompt, epoch, &cancel).await,
            Transport::Polling => self.run_polling(&prompt, epoch, &cancel).await,
        };

        // A superseded or cancelled generation reports nothing.
        if cancel.is_cancelled() || self.epoch.load(Ordering::Acquire) != epoch {
            return;
        }

        self.apply(epoch, |state| state.is_generating = false);
        match outcome {
            Ok(()) => self.notifier.success(
                "Story Complete!",
                "Your story has been generated successfully.",
            ),
            Err(e) => self.notifier.failure("Generation Failed", &e.to_string()),
        }
    }

    /// SSE transport: read the event stream, applying fragments in arrival
    /// order. A terminal `{"error"}` frame, a non-OK response, and an
    /// outright network failure all receive identical treatment.
    async fn run_sse(
        &self,
        prompt: &str,
        epoch: u64,
        cancel: &CancellationToken,
    ) -> Result<(), StoryError> {
        let url = format!("{}/api/v1/stories/stream", self.base_url);
        let request = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "prompt": prompt }))
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = request => {
                result.map_err(|e| StoryError::Transport(format!("opening stream: {e}")))?
            }
        };
        if !response.status().is_success() {
            return Err(StoryError::Transport(format!(
                "stream request failed: status {}",
                response.status()
            )));
        }

        let mut bytes = response.bytes_stream();
        let mut decoder = SseFrameDecoder::new();
        let mut accumulated = String::new();

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                chunk = bytes.next() => chunk,
            };

            match chunk {
                Some(Ok(chunk)) => {
                    for payload in decoder.push(&chunk) {
                        match StreamEvent::parse(&payload) {
                            Some(StreamEvent::Content(fragment)) => {
                                accumulated.push_str(&fragment);
                                let text = accumulated.clone();
                                self.apply(epoch, move |state| state.current_text = text);
                            }
                            Some(StreamEvent::Done) => return Ok(()),
                            Some(StreamEvent::Error(message)) => {
                                return Err(StoryError::Transport(message));
                            }
                            // Malformed frame: partial-chunk tolerance.
                            None => {}
                        }
                    }
                }
                Some(Err(e)) => {
                    return Err(StoryError::Transport(format!("reading stream: {e}")));
                }
                None => {
                    return Err(StoryError::Transport(
                        "stream ended without a terminal event".into(),
                    ));
                }
            }
        }
    }

    /// Polling transport: submit, then query at a fixed interval until a
    /// terminal status is observed.
    async fn run_polling(
        &self,
        prompt: &str,
        epoch: u64,
        cancel: &CancellationToken,
    ) -> Result<(), StoryError> {
        let submit_url = format!("{}/api/v1/stories/generate", self.base_url);
        let request = self
            .http
            .post(&submit_url)
            .json(&serde_json::json!({ "prompt": prompt }))
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = request => {
                result.map_err(|e| StoryError::Transport(format!("submitting task: {e}")))?
            }
        };
        if !response.status().is_success() {
            return Err(StoryError::Transport(format!(
                "task submission failed: status {}",
                response.status()
            )));
        }
        let submit: SubmitResponse = response
            .json()
            .await
            .map_err(|e| StoryError::Transport(format!("parsing submission: {e}")))?;

        let status_url = format!("{}/api/v1/stories/status", self.base_url);
        let started = Instant::now();
        let mut last_progress = 0u8;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }

            let request = self
                .http
                .get(&status_url)
                .query(&[("taskId", submit.task_id.as_str())])
                .send();
            let response = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                result = request => {
                    result.map_err(|e| StoryError::Transport(format!("polling status: {e}")))?
                }
            };

            // The 404 body is a well-formed not_found snapshot, so every
            // status code funnels through the same decode path.
            let task: GenerationTask = response
                .json()
                .await
                .map_err(|e| StoryError::Transport(format!("parsing status: {e}")))?;

            match task.status {
                TaskStatus::Generating => {
                    // An out-of-order response must never regress progress.
                    if task.progress >= last_progress {
                        last_progress = task.progress;
                        let (text, progress) = (task.content, task.progress);
                        self.apply(epoch, move |state| {
                            state.current_text = text;
                            state.progress = progress;
                        });
                    }
                }
                TaskStatus::Complete => {
                    let text = task.content;
                    self.apply(epoch, move |state| {
                        state.current_text = text;
                        state.progress = 100;
                    });
                    return Ok(());
                }
                TaskStatus::Error => {
                    let message = task
                        .error
                        .unwrap_or_else(|| "Failed to generate story".to_string());
                    return Err(StoryError::Other(message));
                }
                TaskStatus::NotFound => {
                    // The task may not be visible yet; tolerate within the
                    // grace window, then escalate to a terminal failure.
                    if started.elapsed() > self.config.not_found_grace() {
                        return Err(StoryError::NotFound(submit.task_id.clone()));
                    }
                }
            }
        }
    }
}
