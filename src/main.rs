use anyhow::Result;
use clap::Parser;

use claudish::{cli, logging, server};

#[tokio::main]
async fn main() -> Result<()> {
    let config = cli::Cli::parse().into_config();

    // Keep the appender guard alive for the process lifetime
    let _log_guard = logging::init(&config);

    if config.monitor {
        tracing::info!("Starting in monitor mode (passthrough to Anthropic)");
    } else if let Some(model) = &config.default_model {
        tracing::info!("Default target: {}", model);
    }
    if !config.roles.is_empty() {
        tracing::info!(
            "Role mappings: opus={:?} sonnet={:?} haiku={:?} subagent={:?}",
            config.roles.opus,
            config.roles.sonnet,
            config.roles.haiku,
            config.roles.subagent
        );
    }

    // Graceful shutdown: ctrl-c flips the oneshot, the server stops
    // accepting and drains in-flight streams
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let server_handle = tokio::spawn(server::start_server(config, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");
    let _ = shutdown_tx.send(());
    let _ = server_handle.await;

    tracing::info!("Shutdown complete");
    Ok(())
}
