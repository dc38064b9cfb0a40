//! Story model abstraction and implementations.
//!
//! Provides the [`StoryModel`] trait and two implementations:
//! - [`EchoModel`]: testing/demo model, no network dependencies
//! - [`OpenAiModel`]: OpenAI chat-completions API (streamed or single-shot)
//!
//! ## Environment Variables
//!
//! - `OPENAI_API_KEY`: Required for [`OpenAiModel`]

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

use crate::config::ModelConfig;
use crate::sse::{SseFrameDecoder, DONE_SENTINEL};
use crate::StoryError;

/// A lazy, finite, non-restartable sequence of generated text fragments.
///
/// Terminated by either the upstream end-of-stream sentinel (stream ends)
/// or a single `Err` item (stream ends after it). Fragments must be applied
/// in arrival order.
pub type ChunkStream = BoxStream<'static, Result<String, StoryError>>;

/// Trait for text-generation backends.
///
/// Implementations must be thread-safe (Send + Sync) for use across tasks.
/// The trait is object-safe to allow dynamic dispatch via `Arc<dyn StoryModel>`.
///
/// Callers are responsible for prompt validation; both operations assume a
/// non-empty, trimmed prompt.
#[async_trait]
pub trait StoryModel: Send + Sync {
    /// Generate the complete text for a prompt in a single call.
    async fn complete(&self, prompt: &str) -> Result<String, StoryError>;

    /// Generate text as an incrementally delivered chunk stream.
    ///
    /// A request-level failure (connection refused, non-success status)
    /// surfaces as the returned `Err`; failures mid-stream surface as an
    /// `Err` item inside the stream.
    async fn stream(&self, prompt: &str) -> Result<ChunkStream, StoryError>;
}

// ============================================================================
// Echo Model (Testing)
// ============================================================================

/// Dummy echo model for testing and offline demos.
///
/// `complete` returns the trimmed prompt; `stream` yields the prompt's
/// words as individual fragments with a configurable delay between them.
pub struct EchoModel {
    /// Simulated generation delay per fragment.
    pub delay_ms: u64,
}

impl EchoModel {
    /// Create an echo model with a small default delay.
    pub fn new() -> Self {
        Self { delay_ms: 10 }
    }

    /// Create an echo model with an explicit per-fragment delay.
    pub fn with_delay(delay_ms: u64) -> Self {
        Self { delay_ms }
    }
}

impl Default for EchoModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoryModel for EchoModel {
    async fn complete(&self, prompt: &str) -> Result<String, StoryError> {
        tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        Ok(prompt.trim().to_string())
    }

    async fn stream(&self, prompt: &str) -> Result<ChunkStream, StoryError> {
        let fragments: Vec<String> = prompt
            .split_whitespace()
            .map(|word| format!("{word} "))
            .collect();
        let delay = Duration::from_millis(self.delay_ms);

        let stream = futures::stream::iter(fragments).then(move |fragment| async move {
            tokio::time::sleep(delay).await;
            Ok(fragment)
        });
        Ok(stream.boxed())
    }
}

// ============================================================================
// OpenAI Model
// ============================================================================

/// Chat-completions request payload.
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

/// One chat message in the request.
#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

/// Single-shot chat-completions response.
#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

/// One streamed chat-completions frame payload.
#[derive(Debug, Deserialize)]
struct ChatStreamChunk {
    #[serde(default)]
    choices: Vec<ChatStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChoice {
    delta: ChatDelta,
}

#[derive(Debug, Deserialize)]
struct ChatDelta {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI chat-completions model.
///
/// Built from a [`ModelConfig`]; the API key is read from the
/// `OPENAI_API_KEY` environment variable at construction.
///
/// ## Example
///
/// ```no_run
/// use story_relay::config::ModelConfig;
/// use story_relay::OpenAiModel;
///
/// # fn example() -> Result<(), story_relay::StoryError> {
/// let model = OpenAiModel::from_env(&ModelConfig::default())?;
/// # Ok(()) }
/// ```
pub struct OpenAiModel {
    client: reqwest::Client,
    api_key: String,
    api_url: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    system_prompt: String,
    timeout: Duration,
}

impl OpenAiModel {
    /// Create a model from config, reading the key from `OPENAI_API_KEY`.
    ///
    /// # Errors
    ///
    /// Returns [`StoryError::Config`] if the environment variable is unset,
    /// so misconfiguration surfaces at startup rather than at the first
    /// generation request.
    pub fn from_env(config: &ModelConfig) -> Result<Self, StoryError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| StoryError::Config("OPENAI_API_KEY environment variable not set".into()))?;
        Ok(Self::new(config, api_key))
    }

    /// Create a model from config with an explicit API key.
    pub fn new(config: &ModelConfig, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            api_url: config.api_url.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            system_prompt: config.system_prompt.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Override the endpoint URL (e.g. for a compatible local server).
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    /// Override the upstream request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Issue the upstream request, streamed or not.
    async fn send_request(&self, prompt: &str, stream: bool) -> Result<reqwest::Response, StoryError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &self.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            stream,
        };

        let response = self
            .client
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| StoryError::Transport(format!("model request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(StoryError::Upstream {
                status: response.status().as_u16(),
            });
        }
        Ok(response)
    }
}

/// Driver state for the upstream SSE decode loop.
struct UpstreamStream {
    bytes: BoxStream<'static, reqwest::Result<Bytes>>,
    decoder: SseFrameDecoder,
    pending: VecDeque<String>,
    finished: bool,
}

impl UpstreamStream {
    /// Produce the next fragment, or `None` at end of stream.
    ///
    /// Frame handling mirrors the upstream wire contract: the `[DONE]`
    /// sentinel ends the stream and is never JSON-parsed; malformed frames
    /// are skipped; empty deltas are filtered out.
    async fn next_fragment(&mut self) -> Option<Result<String, StoryError>> {
        loop {
            if self.finished {
                return None;
            }

            if let Some(payload) = self.pending.pop_front() {
                if payload == DONE_SENTINEL {
                    self.finished = true;
                    return None;
                }
                match serde_json::from_str::<ChatStreamChunk>(&payload) {
                    Ok(chunk) => {
                        let content = chunk
                            .choices
                            .into_iter()
                            .next()
                            .and_then(|choice| choice.delta.content);
                        match content {
                            Some(text) if !text.is_empty() => return Some(Ok(text)),
                            _ => continue,
                        }
                    }
                    // Malformed frame: skip without aborting the stream.
                    Err(_) => continue,
                }
            }

            match self.bytes.next().await {
                Some(Ok(chunk)) => self.pending.extend(self.decoder.push(&chunk)),
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(StoryError::Transport(format!(
                        "reading model stream: {e}"
                    ))));
                }
                None => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }
}

#[async_trait]
impl StoryModel for OpenAiModel {
    async fn complete(&self, prompt: &str) -> Result<String, StoryError> {
        let response = self.send_request(prompt, false).await?;

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| StoryError::Transport(format!("parsing model response: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| StoryError::Transport("no choices in model response".into()))
    }

    async fn stream(&self, prompt: &str) -> Result<ChunkStream, StoryError> {
        let response = self.send_request(prompt, true).await?;

        let state = UpstreamStream {
            bytes: response.bytes_stream().boxed(),
            decoder: SseFrameDecoder::new(),
            pending: VecDeque::new(),
            finished: false,
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            state.next_fragment().await.map(|item| (item, state))
        });
        Ok(stream.boxed())
    }
}
