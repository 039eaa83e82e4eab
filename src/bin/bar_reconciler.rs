use std::path::PathBuf;

use chrono::{Duration as ChronoDuration, Timelike, Utc};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use portal_ingest::config::Config;
use portal_ingest::{dashboard, reconciler, ServiceContext};

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
    let dashboard_csv_path = ctx.config.dashboard_csv_path.clone();

    info!(instrument_count = ctx.instruments.len(), "bar reconciler starting");

    tokio::spawn(async move {
        run_forever(ctx, dashboard_csv_path).await;
    });

    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping bar reconciler");
    Ok(())
}

/// Outer minute loop: wait until wall clock reaches a new minute past the
/// 10-second mark, reconcile the previous minute for every instrument, emit
/// the status CSV, repeat.
async fn run_forever(ctx: ServiceContext, dashboard_csv_path: String) -> ! {
    let mut last_minute: Option<u32> = None;

    loop {
        let now = Utc::now();
        if now.second() > 10 && last_minute != Some(now.minute()) {
            last_minute = Some(now.minute());

            let target = now
                .with_second(0)
                .unwrap()
                .with_nanosecond(0)
                .unwrap()
                - ChronoDuration::minutes(1);

            info!(target = %target, "reconciling minute");
            reconciler::run_minute(
                &ctx.broker,
                ctx.store.as_ref(),
                ctx.calendar.as_ref(),
                &ctx.instruments,
                now,
                target,
            )
            .await;

            if let Err(err) = dashboard::write(ctx.store.as_ref(), &ctx.instruments, &dashboard_csv_path).await {
                warn!(%err, "failed to write dashboard CSV");
            }
        } else {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    }
}
