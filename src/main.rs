use std::sync::Arc;

use rmcp::{transport::stdio, ServiceExt};

use parley::config::Config;
use parley::gateway;
use parley::gateway::nonce::{spawn_sweeper, NonceStore};
use parley::server::ParleyServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(default_level().into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // Load .env file if present (silently ignored if missing)
    dotenvy::dotenv().ok();

    tracing::info!("parley starting");

    let config = Config::from_env();

    // Gateway listeners are load-bearing: a startup configuration failure
    // (missing credentials, port conflict) terminates with status 1.
    let nonces = Arc::new(NonceStore::new());
    let _gateway_handles = gateway::spawn_listeners(&config, nonces.clone())
        .await
        .inspect_err(|e| tracing::error!("gateway startup failed: {e:#}"))?;
    let _sweeper = spawn_sweeper(nonces);

    let server = ParleyServer::new(config).await;

    let service = server
        .serve(stdio())
        .await
        .inspect_err(|e| tracing::error!("serving error: {e:?}"))?;

    service.waiting().await?;

    tracing::info!("parley shutting down");
    Ok(())
}

/// LOG_LEVEL maps onto the default tracing directive; RUST_LOG still wins
/// when set.
fn default_level() -> tracing::Level {
    match std::env::var("LOG_LEVEL").ok().as_deref() {
        Some("error") => tracing::Level::ERROR,
        Some("warn") => tracing::Level::WARN,
        Some("debug") => tracing::Level::DEBUG,
        _ => tracing::Level::INFO,
    }
}
