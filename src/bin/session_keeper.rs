use std::path::PathBuf;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use portal_ingest::config::Config;
use portal_ingest::session_keeper;
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

    info!("session keeper starting");
    tokio::spawn(session_keeper::run(ctx.broker));

    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping session keeper");
    Ok(())
}
