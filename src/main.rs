//! Demo server binary for story-relay.
//!
//! Serves both delivery transports backed by an in-memory repository.
//!
//! ## Environment Variables
//!
//! - `OPENAI_API_KEY` — use the real model API; unset falls back to the
//!   offline echo model
//! - `LOG_FORMAT=json` — structured JSON output (production)
//! - `RUST_LOG=info` — log level filter

use std::sync::Arc;

use story_relay::{
    init_tracing, metrics, Config, EchoModel, MemoryRepository, OpenAiModel, StoryModel,
    StoryRepository,
};
use tracing::info;

/// Read an optional `--config <path>` argument.
fn config_path() -> Option<String> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
    }
    None
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let _ = init_tracing();
    metrics::init_metrics()?;

    let config = match config_path() {
        Some(path) => Config::from_path(&path)?,
        None => Config::default(),
    };

    let model: Arc<dyn StoryModel> = if std::env::var("OPENAI_API_KEY").is_ok() {
        info!(model = %config.model.model, "using OpenAI model");
        Arc::new(OpenAiModel::from_env(&config.model)?)
    } else {
        info!("OPENAI_API_KEY not set, using echo model");
        Arc::new(EchoModel::with_delay(50))
    };

    let repository: Arc<dyn StoryRepository> = Arc::new(MemoryRepository::new());

    info!(
        "POST /api/v1/stories/stream   — SSE streaming delivery\n\
         POST /api/v1/stories/generate — polling task submission\n\
         GET  /api/v1/stories/status   — polling status query\n\
         GET  /api/v1/stories/recent   — recent history"
    );

    story_relay::web_api::start_server(config, model, repository).await
}
