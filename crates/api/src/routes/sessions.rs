//! Consultation session lifecycle
//!
//! Start reserves entitlement before the session row becomes visible; end
//! commits the claim; abort releases it. A crash between reserve and the
//! session insert leaves a recoverable `reserved` consumption for the
//! external sweep, never a session the user can see but was not charged
//! for.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Extension, Json};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use vetline_billing::{FinalizeOutcome, FundingSource, ReserveOutcome};
use vetline_shared::ConsumptionKind;

use crate::auth::Identity;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StartSessionRequest {
    pub kind: ConsumptionKind,
}

#[derive(Debug, Deserialize)]
pub struct FinishSessionRequest {
    pub session_id: Uuid,
    pub consumption_id: Uuid,
}

pub async fn start_session(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(request): Json<StartSessionRequest>,
) -> ApiResult<impl IntoResponse> {
    let session_id = Uuid::new_v4();

    let outcome = state
        .ledger
        .reserve(identity.subject, request.kind, session_id)
        .await?;

    match outcome {
        ReserveOutcome::Reserved {
            consumption_id,
            funded,
        } => {
            let inserted = sqlx::query(
                r#"
                INSERT INTO consult_sessions (id, user_id, kind, status, consumption_id)
                VALUES ($1, $2, $3, 'started', $4)
                "#,
            )
            .bind(session_id)
            .bind(identity.subject)
            .bind(request.kind.as_str())
            .bind(consumption_id)
            .execute(&state.pool)
            .await;

            if let Err(e) = inserted {
                // The session never became visible; give the claim back.
                if let Err(release_err) =
                    state.ledger.release(identity.subject, consumption_id).await
                {
                    tracing::error!(
                        consumption_id = %consumption_id,
                        error = %release_err,
                        "failed to release reservation after session insert failure; \
                         sweep will reclaim it"
                    );
                }
                return Err(e.into());
            }

            tracing::info!(
                user_id = %identity.subject,
                session_id = %session_id,
                consumption_id = %consumption_id,
                kind = %request.kind,
                "consultation session started"
            );

            Ok((
                StatusCode::OK,
                Json(json!({
                    "session_id": session_id,
                    "consumption_id": consumption_id,
                    "credit": funded == FundingSource::Credit,
                })),
            ))
        }
        ReserveOutcome::Exhausted => Ok((
            StatusCode::OK,
            Json(json!({
                "exhausted": true,
                "overage": true,
            })),
        )),
        ReserveOutcome::NoActiveSubscription => Ok((
            StatusCode::PAYMENT_REQUIRED,
            Json(json!({
                "error": "subscription_required",
                "message": "An active subscription is required to start a consultation.",
                "code": 402,
            })),
        )),
    }
}

pub async fn end_session(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(request): Json<FinishSessionRequest>,
) -> ApiResult<impl IntoResponse> {
    // Commit first: the claim must be permanent before the session reads
    // as ended. Committing an already-finalized claim is a benign no-op.
    let outcome = state
        .ledger
        .commit(identity.subject, request.consumption_id)
        .await?;

    let rows = sqlx::query(
        r#"
        UPDATE consult_sessions
        SET status = 'ended', ended_at = NOW()
        WHERE id = $1 AND user_id = $2 AND status = 'started'
        "#,
    )
    .bind(request.session_id)
    .bind(identity.subject)
    .execute(&state.pool)
    .await?
    .rows_affected();

    if rows == 0 && outcome == FinalizeOutcome::NotFoundOrFinalized {
        return Err(ApiError::NotFound("session"));
    }

    tracing::info!(
        user_id = %identity.subject,
        session_id = %request.session_id,
        committed = outcome == FinalizeOutcome::Finalized,
        "consultation session ended"
    );

    Ok(Json(json!({
        "session_id": request.session_id,
        "committed": outcome == FinalizeOutcome::Finalized,
    })))
}

pub async fn abort_session(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(request): Json<FinishSessionRequest>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state
        .ledger
        .release(identity.subject, request.consumption_id)
        .await?;

    let rows = sqlx::query(
        r#"
        UPDATE consult_sessions
        SET status = 'aborted', ended_at = NOW()
        WHERE id = $1 AND user_id = $2 AND status = 'started'
        "#,
    )
    .bind(request.session_id)
    .bind(identity.subject)
    .execute(&state.pool)
    .await?
    .rows_affected();

    if rows == 0 && outcome == FinalizeOutcome::NotFoundOrFinalized {
        return Err(ApiError::NotFound("session"));
    }

    tracing::info!(
        user_id = %identity.subject,
        session_id = %request.session_id,
        released = outcome == FinalizeOutcome::Finalized,
        "consultation session aborted"
    );

    Ok(Json(json!({
        "session_id": request.session_id,
        "released": outcome == FinalizeOutcome::Finalized,
    })))
}
