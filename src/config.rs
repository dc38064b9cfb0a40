//! Declarative service configuration.
//!
//! ## Responsibility
//! Parse and validate TOML configuration for the server, the upstream model
//! call, and the two delivery disciplines. Run with:
//! ```text
//! cargo run -- --config relay.toml
//! ```
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same [`Config`]
//! - Validated: all semantic constraints are checked before a config is used
//! - Type-safe: invalid field combinations are caught at parse time via serde
//! - Schema-exportable: JSON Schema derives enable IDE autocomplete
//!
//! ## NOT Responsible For
//! - Building the runtime router from config (that belongs to `web_api`)
//! - Talking to the model API (that belongs to `model`)

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::StoryError;

// ── Default value functions ──────────────────────────────────────────────

/// Default bind host: all interfaces.
fn default_host() -> String {
    "0.0.0.0".to_string()
}

/// Default HTTP port.
fn default_port() -> u16 {
    8080
}

/// Default maximum request body size: 64 KiB (prompts are small).
fn default_max_request_size() -> usize {
    64 * 1024
}

/// Default upstream model name.
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

/// Default chat-completions endpoint.
fn default_api_url() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

/// Default generation budget.
fn default_max_tokens() -> u32 {
    500
}

/// Default sampling temperature.
fn default_temperature() -> f32 {
    0.8
}

/// Default system prompt for the storyteller persona.
fn default_system_prompt() -> String {
    "You are a creative storyteller. Write engaging short stories \
     (2-3 paragraphs) based on the given prompt. Make them vivid and imaginative."
        .to_string()
}

/// Default upstream request timeout: 60 seconds.
fn default_timeout_secs() -> u64 {
    60
}

/// Default inter-chunk SSE pacing delay: disabled.
fn default_chunk_delay_ms() -> u64 {
    0
}

/// Default interval between synthetic progress ticks: 500ms.
fn default_progress_tick_ms() -> u64 {
    500
}

/// Default retention window for finished polling tasks: 5 minutes.
fn default_task_retention_secs() -> u64 {
    300
}

/// Default reaper sweep interval: 30 seconds.
fn default_reaper_interval_secs() -> u64 {
    30
}

/// Default recent-history list size.
fn default_history_limit() -> usize {
    5
}

/// Default client poll interval: 1 second.
fn default_poll_interval_ms() -> u64 {
    1000
}

/// Default grace window before `not_found` becomes a terminal failure.
fn default_not_found_grace_secs() -> u64 {
    10
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for a story-relay instance.
///
/// Deserialized from a TOML file and validated before use. Every field has
/// a documented default, so an empty file is a valid configuration.
///
/// # Example
///
/// ```toml
/// [server]
/// host = "127.0.0.1"
/// port = 9090
///
/// [model]
/// model = "gpt-4o-mini"
/// temperature = 0.8
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct Config {
    /// HTTP server bind settings.
    pub server: ServerConfig,
    /// Upstream model call parameters.
    pub model: ModelConfig,
    /// Server-side delivery pacing and task retention.
    pub delivery: DeliveryConfig,
    /// Client-side controller timing.
    pub client: ClientConfig,
}

/// HTTP server bind settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// IP address or hostname to bind to (e.g. `"0.0.0.0"` for all interfaces).
    pub host: String,
    /// TCP port the server listens on.
    pub port: u16,
    /// Maximum allowed request body size in bytes.
    pub max_request_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_request_size: default_max_request_size(),
        }
    }
}

/// Upstream model call parameters.
///
/// The API key is deliberately not part of the file; it is read from the
/// `OPENAI_API_KEY` environment variable at model construction.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    /// Model identifier sent to the chat-completions endpoint.
    pub model: String,
    /// Chat-completions endpoint URL.
    pub api_url: String,
    /// Maximum tokens to generate per story.
    pub max_tokens: u32,
    /// Sampling temperature (0.0 - 2.0).
    pub temperature: f32,
    /// System prompt establishing the storyteller persona.
    pub system_prompt: String,
    /// Upstream request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            api_url: default_api_url(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            system_prompt: default_system_prompt(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Server-side delivery pacing and task retention.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Optional fixed delay between SSE chunk emissions, in milliseconds.
    ///
    /// Purely a presentation affordance to make incremental delivery
    /// visible to a human observer; 0 disables it.
    pub chunk_delay_ms: u64,
    /// Interval between synthetic progress updates for polling tasks.
    pub progress_tick_ms: u64,
    /// How long a finished task stays queryable before eviction.
    pub task_retention_secs: u64,
    /// How often the reaper sweeps for expired tasks.
    pub reaper_interval_secs: u64,
    /// Number of stories kept in the recent-history view.
    pub history_limit: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            chunk_delay_ms: default_chunk_delay_ms(),
            progress_tick_ms: default_progress_tick_ms(),
            task_retention_secs: default_task_retention_secs(),
            reaper_interval_secs: default_reaper_interval_secs(),
            history_limit: default_history_limit(),
        }
    }
}

/// Client-side controller timing.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Fixed interval between status queries, in milliseconds.
    pub poll_interval_ms: u64,
    /// Maximum wait window during which `not_found` responses are tolerated
    /// (the task may not yet be visible). Once elapsed, `not_found` is
    /// escalated to a terminal failure.
    pub not_found_grace_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            not_found_grace_secs: default_not_found_grace_secs(),
        }
    }
}

// ── Loading & validation ─────────────────────────────────────────────────

impl Config {
    /// Parse a configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns [`StoryError::Config`] on parse failure or constraint
    /// violation.
    pub fn from_toml_str(raw: &str) -> Result<Self, StoryError> {
        let config: Self =
            toml::from_str(raw).map_err(|e| StoryError::Config(format!("TOML parse: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`StoryError::Config`] if the file cannot be read, parsed,
    /// or validated.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, StoryError> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            StoryError::Config(format!("read {}: {e}", path.as_ref().display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Check semantic constraints that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`StoryError::Config`] naming the first violated constraint.
    pub fn validate(&self) -> Result<(), StoryError> {
        if self.server.host.is_empty() {
            return Err(StoryError::Config("server.host must not be empty".into()));
        }
        if self.server.max_request_size == 0 {
            return Err(StoryError::Config(
                "server.max_request_size must be positive".into(),
            ));
        }
        if self.model.model.is_empty() {
            return Err(StoryError::Config("model.model must not be empty".into()));
        }
        if self.model.max_tokens == 0 {
            return Err(StoryError::Config("model.max_tokens must be positive".into()));
        }
        if !(0.0..=2.0).contains(&self.model.temperature) {
            return Err(StoryError::Config(
                "model.temperature must be in [0.0, 2.0]".into(),
            ));
        }
        if self.delivery.progress_tick_ms == 0 {
            return Err(StoryError::Config(
                "delivery.progress_tick_ms must be positive".into(),
            ));
        }
        if self.delivery.reaper_interval_secs == 0 {
            return Err(StoryError::Config(
                "delivery.reaper_interval_secs must be positive".into(),
            ));
        }
        if self.delivery.history_limit == 0 {
            return Err(StoryError::Config(
                "delivery.history_limit must be positive".into(),
            ));
        }
        if self.client.poll_interval_ms == 0 {
            return Err(StoryError::Config(
                "client.poll_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl DeliveryConfig {
    /// Inter-chunk SSE pacing delay as a [`Duration`].
    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }

    /// Progress tick interval as a [`Duration`].
    pub fn progress_tick(&self) -> Duration {
        Duration::from_millis(self.progress_tick_ms)
    }

    /// Task retention window as a [`Duration`].
    pub fn task_retention(&self) -> Duration {
        Duration::from_secs(self.task_retention_secs)
    }

    /// Reaper sweep interval as a [`Duration`].
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }
}

impl ClientConfig {
    /// Poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Not-found grace window as a [`Duration`].
    pub fn not_found_grace(&self) -> Duration {
        Duration::from_secs(self.not_found_grace_secs)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_toml_is_valid_default_config() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_defaults_match_original_service_parameters() {
        let config = Config::default();
        assert_eq!(config.model.model, "gpt-4o-mini");
        assert_eq!(config.model.max_tokens, 500);
        assert_eq!(config.delivery.progress_tick_ms, 500);
        assert_eq!(config.delivery.task_retention_secs, 300);
        assert_eq!(config.delivery.history_limit, 5);
        assert_eq!(config.client.poll_interval_ms, 1000);
    }

    #[test]
    fn test_partial_toml_overrides_only_named_fields() {
        let config = Config::from_toml_str(
            r#"
            [server]
            port = 9090

            [delivery]
            chunk_delay_ms = 40
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.delivery.chunk_delay_ms, 40);
        assert_eq!(config.delivery.progress_tick_ms, 500);
    }

    #[test]
    fn test_zero_max_tokens_rejected() {
        let result = Config::from_toml_str("[model]\nmax_tokens = 0\n");
        assert!(matches!(result, Err(StoryError::Config(_))));
    }

    #[test]
    fn test_out_of_range_temperature_rejected() {
        let result = Config::from_toml_str("[model]\ntemperature = 2.5\n");
        assert!(matches!(result, Err(StoryError::Config(_))));
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let result = Config::from_toml_str("[client]\npoll_interval_ms = 0\n");
        assert!(matches!(result, Err(StoryError::Config(_))));
    }

    #[test]
    fn test_malformed_toml_reports_config_error() {
        let result = Config::from_toml_str("[server\nport = ");
        assert!(matches!(result, Err(StoryError::Config(_))));
    }

    #[test]
    fn test_from_path_round_trips() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[client]\nnot_found_grace_secs = 3").unwrap();
        let config = Config::from_path(file.path()).unwrap();
        assert_eq!(config.client.not_found_grace(), Duration::from_secs(3));
    }

    #[test]
    fn test_missing_file_reports_config_error() {
        let result = Config::from_path("/nonexistent/relay.toml");
        assert!(matches!(result, Err(StoryError::Config(_))));
    }

    #[test]
    fn test_duration_helpers() {
        let config = Config::default();
        assert_eq!(config.delivery.chunk_delay(), Duration::ZERO);
        assert_eq!(config.delivery.progress_tick(), Duration::from_millis(500));
        assert_eq!(config.delivery.task_retention(), Duration::from_secs(300));
        assert_eq!(config.client.poll_interval(), Duration::from_secs(1));
    }
}
