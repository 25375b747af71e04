// Envoy conversation orchestrator
// Main entry point for the envoy binary

use clap::Parser;
use envoy_engine::cli::{Cli, Command};
use envoy_engine::config::Config;
use envoy_engine::handlers::{handle_ask, handle_history, handle_serve, OutputFormat};
use envoy_engine::telemetry::init_telemetry_with_level;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // --log wins over the config file; RUST_LOG wins over both
    let level = cli.log.as_deref().unwrap_or(&config.core.log_level);
    init_telemetry_with_level(level);

    let version = env!("CARGO_PKG_VERSION");
    let commit = env!("GIT_COMMIT_HASH");
    let timestamp = env!("BUILD_TIMESTAMP");

    tracing::info!("Envoy v{} ({} - {})", version, commit, timestamp);

    match cli.command {
        Command::Serve { host, port } => {
            tracing::info!("Starting server...");
            handle_serve(host, port, &config).await
        }

        Command::Ask {
            message,
            conversation,
            ephemeral,
        } => handle_ask(message, conversation, ephemeral, &config, format).await,

        Command::History {
            conversation_id,
            limit,
        } => handle_history(conversation_id, limit, &config, format).await,
    }
}
