//! Subscription surface
//!
//! Thin read and flag endpoints over the caller's own subscription. The
//! provider-side cancellation call lives with the payment collaborator;
//! these handlers own only the local cancel-at-period-end flag, which the
//! next provider event confirms or corrects.

use axum::{extract::State, response::IntoResponse, Extension, Json};
use serde::Serialize;
use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::Identity;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct SubscriptionView {
    pub id: Uuid,
    pub plan_id: Option<Uuid>,
    pub status: String,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    pub pet_count: i32,
}

pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<impl IntoResponse> {
    let subscription: Option<SubscriptionView> = sqlx::query_as(
        r#"
        SELECT id, plan_id, status, current_period_start, current_period_end,
               cancel_at_period_end, pet_count
        FROM subscriptions
        WHERE user_id = $1 AND status IN ('trialing', 'active', 'past_due')
        "#,
    )
    .bind(identity.subject)
    .fetch_optional(&state.pool)
    .await?;

    subscription
        .map(Json)
        .ok_or(ApiError::NotFound("subscription"))
}

pub async fn get_usage(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<impl IntoResponse> {
    let snapshot = state.ledger.current_usage(identity.subject).await?;
    snapshot.map(Json).ok_or(ApiError::NotFound("subscription"))
}

async fn set_cancel_flag(
    state: &AppState,
    identity: &Identity,
    cancel: bool,
) -> ApiResult<impl IntoResponse> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        UPDATE subscriptions
        SET cancel_at_period_end = $1, updated_at = NOW()
        WHERE user_id = $2 AND status IN ('trialing', 'active', 'past_due')
        RETURNING id
        "#,
    )
    .bind(cancel)
    .bind(identity.subject)
    .fetch_optional(&state.pool)
    .await?;

    let Some((subscription_id,)) = row else {
        return Err(ApiError::NotFound("subscription"));
    };

    tracing::info!(
        user_id = %identity.subject,
        subscription_id = %subscription_id,
        cancel_at_period_end = cancel,
        "cancel-at-period-end flag updated"
    );

    Ok(Json(json!({
        "subscription_id": subscription_id,
        "cancel_at_period_end": cancel,
    })))
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<impl IntoResponse> {
    set_cancel_flag(&state, &identity, true).await
}

pub async fn resume_subscription(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<impl IntoResponse> {
    set_cancel_flag(&state, &identity, false).await
}
