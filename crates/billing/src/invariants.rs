//! Billing invariant checks
//!
//! Runnable consistency queries over billing state, intended for the
//! internal diagnostics endpoint and for sweeps after event replays.
//! Checks only read, never write, and each violation carries enough
//! context to debug.

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// A single invariant violation.
#[derive(Debug, Clone, Serialize)]
pub struct InvariantViolation {
    pub invariant: String,
    pub subject_ids: Vec<Uuid>,
    pub description: String,
}

/// Summary of one full check run.
#[derive(Debug, Clone, Serialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub healthy: bool,
    pub violations: Vec<InvariantViolation>,
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleLiveRow {
    user_id: Uuid,
    sub_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct OverconsumedRow {
    id: Uuid,
    subscription_id: Uuid,
    consumed_chat: i32,
    included_chat: i32,
    consumed_video: i32,
    included_video: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct UnfinalizedRow {
    id: Uuid,
    state: String,
}

#[derive(Debug, sqlx::FromRow)]
struct StaleReservedRow {
    id: Uuid,
    session_id: Uuid,
    created_at: OffsetDateTime,
}

/// Runs billing consistency checks.
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let mut violations = Vec::new();
        violations.extend(self.check_single_live_subscription().await?);
        violations.extend(self.check_consumed_within_bounds().await?);
        violations.extend(self.check_terminal_consumptions_finalized().await?);
        violations.extend(self.check_stale_reservations().await?);

        Ok(InvariantCheckSummary {
            checked_at: OffsetDateTime::now_utc(),
            checks_run: 4,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// At most one live subscription per user; more would double-charge.
    async fn check_single_live_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleLiveRow> = sqlx::query_as(
            r#"
            SELECT user_id, COUNT(*) AS sub_count
            FROM subscriptions
            WHERE status IN ('trialing', 'active', 'past_due')
            GROUP BY user_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_live_subscription".to_string(),
                subject_ids: vec![row.user_id],
                description: format!(
                    "user holds {} live subscriptions (expected 1)",
                    row.sub_count
                ),
            })
            .collect())
    }

    /// Consumed beyond included means a reservation bypassed the counter
    /// lock or a credit draw went missing.
    async fn check_consumed_within_bounds(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OverconsumedRow> = sqlx::query_as(
            r#"
            SELECT id, subscription_id,
                   consumed_chat, included_chat, consumed_video, included_video
            FROM usage_counters
            WHERE consumed_chat > included_chat OR consumed_video > included_video
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "consumed_within_included".to_string(),
                subject_ids: vec![row.subscription_id],
                description: format!(
                    "counter {} consumed beyond included (chat {}/{}, video {}/{})",
                    row.id,
                    row.consumed_chat,
                    row.included_chat,
                    row.consumed_video,
                    row.included_video
                ),
            })
            .collect())
    }

    /// Terminal consumptions must carry their finalize timestamp.
    async fn check_terminal_consumptions_finalized(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnfinalizedRow> = sqlx::query_as(
            r#"
            SELECT id, state
            FROM consumptions
            WHERE state IN ('committed', 'released') AND finalized_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "terminal_consumption_finalized".to_string(),
                subject_ids: vec![row.id],
                description: format!("consumption in state {} has no finalized_at", row.state),
            })
            .collect())
    }

    /// Reservations older than an hour were leaked by a crash between
    /// session start and its terminal outcome; the external sweep should
    /// reclaim them.
    async fn check_stale_reservations(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StaleReservedRow> = sqlx::query_as(
            r#"
            SELECT id, session_id, created_at
            FROM consumptions
            WHERE state = 'reserved' AND created_at < NOW() - INTERVAL '1 hour'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_stale_reservations".to_string(),
                subject_ids: vec![row.id],
                description: format!(
                    "reservation for session {} held since {}",
                    row.session_id, row.created_at
                ),
            })
            .collect())
    }
}
