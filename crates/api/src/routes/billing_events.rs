//! Payment provider event ingestion
//!
//! `POST /internal/billing/events` is an authenticated machine channel,
//! not an end-user surface: deliveries carry a shared secret compared in
//! constant time. Every structurally valid envelope is acknowledged —
//! duplicates, warnings and caught processing failures included — because
//! the event is durably ledgered either way; only a bad secret, a
//! malformed envelope, or a ledger-claim failure withholds the ack.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use subtle::ConstantTimeEq;

use vetline_billing::{BillingError, EventEnvelope, InvariantChecker};

use crate::state::AppState;

/// Constant-time equality; timing-safe comparison is a correctness
/// requirement on this channel, not a style choice.
fn secrets_match(provided: &str, expected: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

fn check_internal_secret(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let provided = headers
        .get("x-internal-secret")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if secrets_match(provided, &state.config.internal_event_secret) {
        Ok(())
    } else {
        tracing::warn!("billing event delivery rejected: invalid internal secret");
        Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "ok": false, "error": "invalid internal secret" })),
        )
            .into_response())
    }
}

pub async fn ingest_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    envelope: Result<Json<EventEnvelope>, JsonRejection>,
) -> Response {
    if let Err(response) = check_internal_secret(&state, &headers) {
        return response;
    }

    let Json(envelope) = match envelope {
        Ok(envelope) => envelope,
        Err(rejection) => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({ "ok": false, "error": rejection.body_text() })),
            )
                .into_response();
        }
    };

    match state.reconciler.ingest(&envelope).await {
        Ok(result) => (StatusCode::OK, Json(json!({ "ok": true, "result": result }))).into_response(),
        Err(BillingError::MalformedPayload(message)) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "ok": false, "error": message })),
        )
            .into_response(),
        Err(e) => {
            // Ledger claim failed: withhold the ack so the provider
            // redelivers.
            tracing::error!(
                event_id = %envelope.id,
                error = %e,
                "event not acknowledged, ledger unavailable"
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "ok": false, "error": "event ledger unavailable" })),
            )
                .into_response()
        }
    }
}

/// Diagnostics: run billing consistency checks. Same machine channel and
/// secret as ingestion.
pub async fn run_invariant_checks(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(response) = check_internal_secret(&state, &headers) {
        return response;
    }

    match InvariantChecker::new(state.pool.clone()).run_all_checks().await {
        Ok(summary) => (StatusCode::OK, Json(json!({ "ok": true, "result": summary }))).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "invariant checks failed to run");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "ok": false, "error": "checks unavailable" })),
            )
                .into_response()
        }
    }
}
