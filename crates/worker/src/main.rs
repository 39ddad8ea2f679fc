#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Portaria background worker.
//!
//! Runs the three long-lived services: the change-feed listener, the
//! hourly expiration sweeper, and the stale-session reaper. The api
//! binary owns the schema; this process only opens a pool.

mod reaper;

use std::sync::Arc;
use std::time::Duration;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use portaria_membership::teardown::ScheduledTeardowns;
use portaria_membership::{ChangeFeedListener, EngineContext, ExpirationSweeper};
use portaria_shared::{create_pool, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    info!("Starting portaria-worker");

    let pool = create_pool(&config.database_url, 5).await?;
    let ctx = EngineContext::production(&config, pool);
    let teardowns = Arc::new(ScheduledTeardowns::new(ctx.directory.clone()));

    let sweeper = Arc::new(ExpirationSweeper::new(
        ctx.clone(),
        teardowns,
        Duration::from_secs(config.sweep_period_secs),
        Duration::from_secs(config.sweep_initial_delay_secs),
    ));
    sweeper.restart();
    info!(
        period_secs = config.sweep_period_secs,
        "Expiration sweeper scheduled"
    );

    let listener = Arc::new(ChangeFeedListener::new(ctx.clone(), sweeper.clone()));
    tokio::spawn(listener.run());
    info!("Change-feed listener started");

    let scheduler = JobScheduler::new().await?;
    let reaper_ctx = ctx.clone();
    scheduler
        .add(Job::new_async("0 */10 * * * *", move |_uuid, _l| {
            let ctx = reaper_ctx.clone();
            Box::pin(async move {
                let now = time::OffsetDateTime::now_utc();
                if let Err(e) = reaper::reap_stale_sessions(&ctx, now).await {
                    error!(error = %e, "Session reaper pass failed");
                }
            })
        })?)
        .await?;
    scheduler.start().await?;
    info!("Scheduled: stale-session reaper (every 10 minutes)");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping");
    Ok(())
}
