//! Demo client binary driving the generation controller.
//!
//! Run the server first, then:
//! ```bash
//! cargo run --bin story-client -- sse "A robot discovers emotions"
//! cargo run --bin story-client -- polling "A robot discovers emotions"
//! ```

use std::sync::Arc;

use story_relay::config::ClientConfig;
use story_relay::{init_tracing, GenerationController, TracingNotifier, Transport};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let _ = init_tracing();

    let mut args = std::env::args().skip(1);
    let transport: Transport = args
        .next()
        .unwrap_or_else(|| "sse".to_string())
        .parse()?;
    let prompt = args.collect::<Vec<_>>().join(" ");
    let base_url =
        std::env::var("STORY_RELAY_URL").unwrap_or_else(|_| "http://127.0.0.1:8080".to_string());

    let controller = GenerationController::new(
        base_url,
        ClientConfig::default(),
        Arc::new(TracingNotifier),
    );
    controller.set_transport(transport);

    let mut view = controller.subscribe();
    controller.start_generation(&prompt)?;

    // Print the text as it grows, the way a UI would render it.
    let mut printed = 0;
    while view.changed().await.is_ok() {
        let state = view.borrow_and_update().clone();
        let text = state.current_text;
        if text.len() > printed {
            print!("{}", &text[printed..]);
            printed = text.len();
        }
        if !state.is_generating {
            break;
        }
    }
    println!();

    info!(transport = ?transport, "generation finished");
    Ok(())
}
