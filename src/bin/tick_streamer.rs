use std::path::PathBuf;

use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use portal_ingest::config::Config;
use portal_ingest::tick_stream;
use portal_ingest::ServiceContext;

#[derive(Parser)]
struct Args {
    config_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config_path)?;
    let ctx = ServiceContext::build(config).await?;

    info!(instrument_count = ctx.instruments.len(), "tick streamer starting");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(tick_stream::run(ctx.broker, ctx.store, ctx.instruments, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — unsubscribing and stopping tick streamer");
    let _ = shutdown_tx.send(true);
    let _ = handle.await;
    Ok(())
}
