//! egress6 CLI library - argument parsing and process lifecycle.

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Cli;
use egress6_core::config::load_dotenv;
use egress6_core::observability;
use egress6_proxy::{ProxyConfig, ProxyServer};

/// Run the CLI: parse args, start the proxy and serve until Ctrl-C.
pub fn run_cli() -> Result<()> {
    // .env values must be visible before clap reads its env fallbacks.
    load_dotenv();
    observability::init_tracing();

    let cli = Cli::parse();
    let config = cli.proxy_config().context("Invalid configuration")?;

    let rt = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    rt.block_on(serve(config))
}

async fn serve(config: ProxyConfig) -> Result<()> {
    let server = ProxyServer::bind(&config)
        .await
        .with_context(|| format!("Failed to listen on {}", config.listen))?;

    tracing::info!(
        listen = %server.local_addr()?,
        cidr = %config.cidr,
        auth = !config.credential.is_empty(),
        freebind = config.dial.freebind,
        "egress6 proxy started"
    );
    server.serve(shutdown_signal()).await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for Ctrl-C, running until killed: {}", e);
        std::future::pending::<()>().await;
    }
}
