//! Vetline API Server
//!
//! Subscription-billing backend for the consultation marketplace:
//! provider event reconciliation, entitlement-gated session starts, and
//! the thin subscription surface.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vetline_api::{routes::create_router, AppState, Config};
use vetline_shared::{create_migration_pool, create_pool, run_migrations};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,vetline_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Vetline API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;
    tracing::info!("Database connection established");

    // Migrations go through the direct URL when one is configured; pooler
    // connections break the advisory locks sqlx takes while migrating.
    let migration_url = config
        .database_direct_url
        .as_ref()
        .unwrap_or(&config.database_url);
    let migration_pool = create_migration_pool(migration_url).await?;
    run_migrations(&migration_pool).await?;
    migration_pool.close().await;

    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(pool, config);
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "Listening");
    axum::serve(listener, router).await?;

    Ok(())
}
