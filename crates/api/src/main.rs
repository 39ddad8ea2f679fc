//! Portaria API binary: webhook and panel ingress.

use std::sync::Arc;

use tower_http::trace::TraceLayer;
use tracing::info;

use portaria_api::{create_router, AppState};
use portaria_membership::teardown::ScheduledTeardowns;
use portaria_membership::{EngineContext, PanelFlows};
use portaria_shared::{create_pool, run_migrations, Config};

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
    info!(port = config.port, "Starting portaria-api");

    // The api owns the schema; the worker only opens a pool.
    let pool = create_pool(&config.database_url, 10).await?;
    run_migrations(&pool).await?;

    let ctx = EngineContext::production(&config, pool);
    let teardowns = Arc::new(ScheduledTeardowns::new(ctx.directory.clone()));
    let flows = PanelFlows::new(ctx.clone(), teardowns);
    let state = AppState::new(ctx, flows, config.mp_webhook_secret.clone());

    let app = create_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(addr = %listener.local_addr()?, "Listening");
    axum::serve(listener, app).await?;
    Ok(())
}
