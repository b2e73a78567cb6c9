//! Application state

use std::sync::Arc;

use sqlx::PgPool;

use vetline_billing::{EntitlementLedger, EventReconciler, PgLedger};

use crate::auth::JwtManager;
use crate::config::Config;
use crate::idempotency::IdempotencyCache;

/// Shared application state, cloned per request.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub jwt_manager: JwtManager,
    /// Entitlement ledger behind the protocol trait so session flows never
    /// depend on the concrete store.
    pub ledger: Arc<dyn EntitlementLedger>,
    pub reconciler: EventReconciler,
    pub idempotency: IdempotencyCache,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret);
        if jwt_manager.verification_enabled() {
            tracing::info!("JWT signature verification enabled");
        } else {
            tracing::warn!(
                "JWT_SECRET not configured - bearer tokens are decoded WITHOUT signature \
                 verification; only acceptable behind a verifying gateway"
            );
        }

        if config.internal_event_secret.is_empty() {
            tracing::warn!(
                "INTERNAL_EVENT_SECRET not configured - billing event ingestion will reject \
                 all deliveries"
            );
        }

        if config.allow_dev_headers {
            tracing::warn!("development identity headers enabled (ALLOW_DEV_HEADERS)");
        }

        let ledger: Arc<dyn EntitlementLedger> = Arc::new(PgLedger::new(pool.clone()));
        let reconciler = EventReconciler::new(pool.clone());
        let idempotency = IdempotencyCache::new();

        // Periodic sweep of expired idempotency entries; lazy expiry keeps
        // replays correct in between runs.
        let cache_for_sweep = idempotency.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
            loop {
                interval.tick().await;
                cache_for_sweep.sweep_expired().await;
            }
        });

        Self {
            pool,
            config,
            jwt_manager,
            ledger,
            reconciler,
            idempotency,
        }
    }
}
