//! HTTP router assembly
//!
//! An inbound mutating request passes through the idempotency cache
//! (outermost, short-circuits on replay), then identity binding, then the
//! handler. Provider events arrive on the internal ingestion path, which
//! bypasses per-user identity entirely.

pub mod billing_events;
pub mod health;
pub mod sessions;
pub mod subscriptions;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::auth::{optional_identity, require_identity};
use crate::idempotency::idempotency_replay;
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    // Layer order matters: the last layer added runs first, so the replay
    // cache sits outside identity binding.
    let authed_mutations = Router::new()
        .route("/sessions/start", post(sessions::start_session))
        .route("/sessions/end", post(sessions::end_session))
        .route("/sessions/abort", post(sessions::abort_session))
        .route(
            "/billing/subscription/cancel",
            post(subscriptions::cancel_subscription),
        )
        .route(
            "/billing/subscription/resume",
            post(subscriptions::resume_subscription),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_identity,
        ))
        .layer(middleware::from_fn_with_state(
            state.idempotency.clone(),
            idempotency_replay,
        ));

    let authed_reads = Router::new()
        .route("/billing/subscription", get(subscriptions::get_subscription))
        .route("/billing/usage", get(subscriptions::get_usage))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_identity,
        ));

    let internal = Router::new()
        .route("/internal/billing/events", post(billing_events::ingest_event))
        .route(
            "/internal/billing/invariants",
            get(billing_events::run_invariant_checks),
        );

    // Health is public; a credential, when present, still binds (and
    // heartbeats) without being required.
    let public = Router::new()
        .route("/health", get(health::health))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            optional_identity,
        ));

    Router::new()
        .merge(public)
        .merge(authed_mutations)
        .merge(authed_reads)
        .merge(internal)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
