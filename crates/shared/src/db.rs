//! Database pool construction and migrations

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// Create the main connection pool.
///
/// Sized for a request-serving process behind a pooler; statement-level
/// timeouts are left to the server configuration.
pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(300))
        .connect(database_url)
        .await
}

/// Create a pool for running migrations.
///
/// Uses a single connection with generous timeouts; migrations must run
/// against a direct connection (PgBouncer transaction pooling breaks the
/// advisory locks sqlx takes while migrating).
pub async fn create_migration_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(60))
        .connect(database_url)
        .await
}

/// Run embedded migrations against the given pool.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    tracing::info!("Running database migrations");
    sqlx::migrate!("../../migrations").run(pool).await?;
    tracing::info!("Database migrations complete");
    Ok(())
}
