use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chathub::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let config = Config::parse();
    let listener = TcpListener::bind(&config.listen).await?;

    info!("Chat hub listening on {}", listener.local_addr()?);

    chathub::serve(listener, config, shutdown_signal()).await
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Terminating: interrupt"),
        Err(e) => {
            error!("Failed to listen for interrupt: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
