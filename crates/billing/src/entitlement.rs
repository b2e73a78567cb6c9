//! Entitlement consumption protocol
//!
//! Gates the start of a metered consultation on available entitlement via
//! a reserve → (commit | release) lifecycle. Each operation runs in one
//! store transaction with the caller's identity bound, so the
//! check-then-increment on the usage counter cannot race with a concurrent
//! reservation for the same subscription: both serialize on the counter
//! row lock.
//!
//! The protocol is expressed as the [`EntitlementLedger`] trait — the
//! contract the engine requires from whatever ledger implementation backs
//! it. [`PgLedger`] is the production backing; [`InMemoryLedger`] carries
//! the same semantics for protocol tests.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use vetline_shared::{ConsumptionKind, CreditCode, SubscriptionStatus};

use crate::error::{BillingError, BillingResult};

/// Bind the caller's verified identity to the transaction's session state.
///
/// `set_config(..., true)` is transaction-local, so row-level authorization
/// checks inside the store can reference the current caller without the
/// identity being threaded through as an explicit SQL parameter, and
/// nothing leaks past commit/rollback.
pub async fn bind_identity(
    tx: &mut Transaction<'_, Postgres>,
    subject: Uuid,
) -> BillingResult<()> {
    sqlx::query("SELECT set_config('vetline.current_user', $1, true)")
        .bind(subject.to_string())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// What funded a successful reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FundingSource {
    /// The period's included units.
    Included,
    /// A purchased credit drawn as overage fallback.
    Credit,
}

/// Result of a reserve call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ReserveOutcome {
    Reserved {
        consumption_id: Uuid,
        funded: FundingSource,
    },
    /// Neither included capacity nor a matching credit is available.
    /// Deterministic report; what to offer the user next is the caller's
    /// policy, not the protocol's.
    Exhausted,
    /// The caller holds no subscription allowed to start sessions.
    NoActiveSubscription,
}

/// Result of a commit or release call.
///
/// `NotFoundOrFinalized` is a benign no-op: after a crash and retry the
/// caller cannot always know which branch ran first, so finalizing an
/// already-finalized consumption must never be an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeOutcome {
    Finalized,
    NotFoundOrFinalized,
}

/// Remaining purchased units for one credit code.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CreditBalance {
    pub code: String,
    pub remaining_units: i64,
}

/// Snapshot of the caller's current-period usage.
#[derive(Debug, Clone, Serialize)]
pub struct UsageSnapshot {
    pub subscription_id: Uuid,
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
    pub included_chat: i32,
    pub consumed_chat: i32,
    pub included_video: i32,
    pub consumed_video: i32,
    pub credits: Vec<CreditBalance>,
}

/// Protocol contract between session flows and the entitlement store.
#[async_trait]
pub trait EntitlementLedger: Send + Sync {
    /// Atomically claim one unit of entitlement for a new session.
    async fn reserve(
        &self,
        user_id: Uuid,
        kind: ConsumptionKind,
        session_id: Uuid,
    ) -> BillingResult<ReserveOutcome>;

    /// Make a reserved claim permanent. Idempotent.
    async fn commit(&self, user_id: Uuid, consumption_id: Uuid) -> BillingResult<FinalizeOutcome>;

    /// Return a reserved claim, restoring the counter or refunding the
    /// drawn credit. Idempotent.
    async fn release(&self, user_id: Uuid, consumption_id: Uuid) -> BillingResult<FinalizeOutcome>;

    /// Current-period counter plus credit balances, `None` when the caller
    /// has no live subscription.
    async fn current_usage(&self, user_id: Uuid) -> BillingResult<Option<UsageSnapshot>>;
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    plan_id: Option<Uuid>,
    status: String,
    current_period_start: OffsetDateTime,
    current_period_end: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct CounterRow {
    id: Uuid,
    included: i32,
    consumed: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct ReleasedRow {
    subscription_id: Uuid,
    kind: String,
    credit_id: Option<Uuid>,
    created_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct UsageRow {
    subscription_id: Uuid,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
    included_chat: i32,
    consumed_chat: i32,
    included_video: i32,
    consumed_video: i32,
}

fn counter_columns(kind: ConsumptionKind) -> (&'static str, &'static str) {
    match kind {
        ConsumptionKind::Chat => ("included_chat", "consumed_chat"),
        ConsumptionKind::Video => ("included_video", "consumed_video"),
    }
}

/// Postgres-backed entitlement ledger.
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EntitlementLedger for PgLedger {
    async fn reserve(
        &self,
        user_id: Uuid,
        kind: ConsumptionKind,
        session_id: Uuid,
    ) -> BillingResult<ReserveOutcome> {
        let mut tx = self.pool.begin().await?;
        bind_identity(&mut tx, user_id).await?;

        // Lock the subscription row first so reserve and reconciliation of
        // the same subscription serialize.
        let sub: Option<SubscriptionRow> = sqlx::query_as(
            r#"
            SELECT id, plan_id, status, current_period_start, current_period_end
            FROM subscriptions
            WHERE user_id = $1 AND status IN ('trialing', 'active', 'past_due')
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(sub) = sub else {
            return Ok(ReserveOutcome::NoActiveSubscription);
        };

        let status = SubscriptionStatus::from_str(&sub.status)
            .map_err(|e| BillingError::Internal(e.to_string()))?;
        if !status.can_consume() {
            tracing::info!(
                user_id = %user_id,
                subscription_id = %sub.id,
                status = %status,
                "reservation refused: subscription cannot consume"
            );
            return Ok(ReserveOutcome::NoActiveSubscription);
        }

        // Lazily materialize the period counter from the plan.
        sqlx::query(
            r#"
            INSERT INTO usage_counters (
                subscription_id, period_start, period_end,
                included_chat, included_video
            )
            SELECT $1, $2, $3,
                   COALESCE(p.included_chat_units, 0),
                   COALESCE(p.included_video_units, 0)
            FROM (SELECT 1) AS one
            LEFT JOIN plans p ON p.id = $4
            ON CONFLICT (subscription_id, period_start) DO NOTHING
            "#,
        )
        .bind(sub.id)
        .bind(sub.current_period_start)
        .bind(sub.current_period_end)
        .bind(sub.plan_id)
        .execute(&mut *tx)
        .await?;

        let (included_col, consumed_col) = counter_columns(kind);
        let counter_sql = format!(
            "SELECT id, {included_col} AS included, {consumed_col} AS consumed \
             FROM usage_counters \
             WHERE subscription_id = $1 AND period_start = $2 \
             FOR UPDATE"
        );
        let counter: CounterRow = sqlx::query_as(&counter_sql)
            .bind(sub.id)
            .bind(sub.current_period_start)
            .fetch_one(&mut *tx)
            .await?;

        if counter.consumed < counter.included {
            let bump_sql = format!(
                "UPDATE usage_counters SET {consumed_col} = {consumed_col} + 1 WHERE id = $1"
            );
            sqlx::query(&bump_sql).bind(counter.id).execute(&mut *tx).await?;

            let (consumption_id,): (Uuid,) = sqlx::query_as(
                r#"
                INSERT INTO consumptions (subscription_id, kind, session_id, state)
                VALUES ($1, $2, $3, 'reserved')
                RETURNING id
                "#,
            )
            .bind(sub.id)
            .bind(kind.as_str())
            .bind(session_id)
            .fetch_one(&mut *tx)
            .await?;

            tx.commit().await?;
            tracing::info!(
                user_id = %user_id,
                subscription_id = %sub.id,
                consumption_id = %consumption_id,
                kind = %kind,
                "entitlement reserved from included units"
            );
            return Ok(ReserveOutcome::Reserved {
                consumption_id,
                funded: FundingSource::Included,
            });
        }

        // Included units exhausted: draw one unit from the oldest matching
        // credit.
        let credit: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM credits
            WHERE user_id = $1 AND code = $2 AND remaining_units > 0
            ORDER BY purchased_at ASC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .bind(kind.credit_code().as_str())
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((credit_id,)) = credit {
            sqlx::query("UPDATE credits SET remaining_units = remaining_units - 1 WHERE id = $1")
                .bind(credit_id)
                .execute(&mut *tx)
                .await?;

            let (consumption_id,): (Uuid,) = sqlx::query_as(
                r#"
                INSERT INTO consumptions (subscription_id, kind, session_id, credit_id, state)
                VALUES ($1, $2, $3, $4, 'reserved')
                RETURNING id
                "#,
            )
            .bind(sub.id)
            .bind(kind.as_str())
            .bind(session_id)
            .bind(credit_id)
            .fetch_one(&mut *tx)
            .await?;

            tx.commit().await?;
            tracing::info!(
                user_id = %user_id,
                subscription_id = %sub.id,
                consumption_id = %consumption_id,
                credit_id = %credit_id,
                kind = %kind,
                "entitlement reserved from purchased credit"
            );
            return Ok(ReserveOutcome::Reserved {
                consumption_id,
                funded: FundingSource::Credit,
            });
        }

        // Dropping the transaction rolls back; nothing was mutated.
        tracing::info!(
            user_id = %user_id,
            subscription_id = %sub.id,
            kind = %kind,
            "entitlement exhausted"
        );
        Ok(ReserveOutcome::Exhausted)
    }

    async fn commit(&self, user_id: Uuid, consumption_id: Uuid) -> BillingResult<FinalizeOutcome> {
        let mut tx = self.pool.begin().await?;
        bind_identity(&mut tx, user_id).await?;

        // The state guard makes committed/released terminal; the join on
        // subscriptions scopes the finalize to the caller's own rows.
        let rows = sqlx::query(
            r#"
            UPDATE consumptions c
            SET state = 'committed', finalized_at = NOW()
            FROM subscriptions s
            WHERE c.id = $1
              AND c.state = 'reserved'
              AND c.subscription_id = s.id
              AND s.user_id = $2
            "#,
        )
        .bind(consumption_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        if rows == 0 {
            tracing::info!(
                user_id = %user_id,
                consumption_id = %consumption_id,
                "commit no-op: not found or already finalized"
            );
            return Ok(FinalizeOutcome::NotFoundOrFinalized);
        }
        Ok(FinalizeOutcome::Finalized)
    }

    async fn release(&self, user_id: Uuid, consumption_id: Uuid) -> BillingResult<FinalizeOutcome> {
        let mut tx = self.pool.begin().await?;
        bind_identity(&mut tx, user_id).await?;

        let released: Option<ReleasedRow> = sqlx::query_as(
            r#"
            UPDATE consumptions c
            SET state = 'released', finalized_at = NOW()
            FROM subscriptions s
            WHERE c.id = $1
              AND c.state = 'reserved'
              AND c.subscription_id = s.id
              AND s.user_id = $2
            RETURNING c.subscription_id, c.kind, c.credit_id, c.created_at
            "#,
        )
        .bind(consumption_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(released) = released else {
            return Ok(FinalizeOutcome::NotFoundOrFinalized);
        };

        if let Some(credit_id) = released.credit_id {
            sqlx::query("UPDATE credits SET remaining_units = remaining_units + 1 WHERE id = $1")
                .bind(credit_id)
                .execute(&mut *tx)
                .await?;
        } else {
            let kind = ConsumptionKind::from_str(&released.kind)
                .map_err(|e| BillingError::Internal(e.to_string()))?;
            let (_, consumed_col) = counter_columns(kind);
            // The counter of the period the reservation was taken in, which
            // may no longer be the subscription's current period.
            let refund_sql = format!(
                "UPDATE usage_counters \
                 SET {consumed_col} = GREATEST({consumed_col} - 1, 0) \
                 WHERE subscription_id = $1 \
                   AND period_start <= $2 AND period_end > $2"
            );
            sqlx::query(&refund_sql)
                .bind(released.subscription_id)
                .bind(released.created_at)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        tracing::info!(
            user_id = %user_id,
            consumption_id = %consumption_id,
            "reservation released"
        );
        Ok(FinalizeOutcome::Finalized)
    }

    async fn current_usage(&self, user_id: Uuid) -> BillingResult<Option<UsageSnapshot>> {
        let row: Option<UsageRow> = sqlx::query_as(
            r#"
            SELECT s.id AS subscription_id,
                   s.current_period_start AS period_start,
                   s.current_period_end AS period_end,
                   COALESCE(u.included_chat, p.included_chat_units, 0) AS included_chat,
                   COALESCE(u.consumed_chat, 0) AS consumed_chat,
                   COALESCE(u.included_video, p.included_video_units, 0) AS included_video,
                   COALESCE(u.consumed_video, 0) AS consumed_video
            FROM subscriptions s
            LEFT JOIN usage_counters u
                   ON u.subscription_id = s.id AND u.period_start = s.current_period_start
            LEFT JOIN plans p ON p.id = s.plan_id
            WHERE s.user_id = $1 AND s.status IN ('trialing', 'active', 'past_due')
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let credits: Vec<CreditBalance> = sqlx::query_as(
            r#"
            SELECT code, SUM(remaining_units)::BIGINT AS remaining_units
            FROM credits
            WHERE user_id = $1 AND remaining_units > 0
            GROUP BY code
            ORDER BY code
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(UsageSnapshot {
            subscription_id: row.subscription_id,
            period_start: row.period_start,
            period_end: row.period_end,
            included_chat: row.included_chat,
            consumed_chat: row.consumed_chat,
            included_video: row.included_video,
            consumed_video: row.consumed_video,
            credits,
        }))
    }
}

/// A purchased credit in the in-memory ledger.
#[derive(Debug, Clone)]
pub struct MemCredit {
    pub id: Uuid,
    pub code: CreditCode,
    pub remaining_units: i32,
}

/// A subscription with its current-period counter in the in-memory ledger.
#[derive(Debug, Clone)]
pub struct MemSubscription {
    pub subscription_id: Uuid,
    pub status: SubscriptionStatus,
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
    pub included_chat: i32,
    pub consumed_chat: i32,
    pub included_video: i32,
    pub consumed_video: i32,
    pub credits: Vec<MemCredit>,
}

impl MemSubscription {
    pub fn active(included_chat: i32, included_video: i32) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            subscription_id: Uuid::new_v4(),
            status: SubscriptionStatus::Active,
            period_start: now,
            period_end: now + time::Duration::days(30),
            included_chat,
            consumed_chat: 0,
            included_video,
            consumed_video: 0,
            credits: Vec::new(),
        }
    }

    pub fn with_credit(mut self, code: CreditCode, remaining_units: i32) -> Self {
        self.credits.push(MemCredit {
            id: Uuid::new_v4(),
            code,
            remaining_units,
        });
        self
    }

    fn units(&mut self, kind: ConsumptionKind) -> (&mut i32, i32) {
        match kind {
            ConsumptionKind::Chat => (&mut self.consumed_chat, self.included_chat),
            ConsumptionKind::Video => (&mut self.consumed_video, self.included_video),
        }
    }
}

#[derive(Debug, Clone)]
struct MemConsumption {
    user_id: Uuid,
    kind: ConsumptionKind,
    credit_id: Option<Uuid>,
    state: vetline_shared::ConsumptionState,
}

#[derive(Default)]
struct MemState {
    subscriptions: HashMap<Uuid, MemSubscription>,
    consumptions: HashMap<Uuid, MemConsumption>,
}

/// In-memory ledger with the protocol semantics of [`PgLedger`].
///
/// The mutex plays the part of the counter-row lock: reserve's
/// check-then-increment is atomic under it.
#[derive(Clone, Default)]
pub struct InMemoryLedger {
    state: Arc<Mutex<MemState>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_subscription(&self, user_id: Uuid, subscription: MemSubscription) {
        self.state
            .lock()
            .await
            .subscriptions
            .insert(user_id, subscription);
    }

    /// Remaining units on a user's credits, for test assertions.
    pub async fn credit_units(&self, user_id: Uuid, code: CreditCode) -> i32 {
        let state = self.state.lock().await;
        state
            .subscriptions
            .get(&user_id)
            .map(|sub| {
                sub.credits
                    .iter()
                    .filter(|c| c.code == code)
                    .map(|c| c.remaining_units)
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Consumed count on the current period counter, for test assertions.
    pub async fn consumed(&self, user_id: Uuid, kind: ConsumptionKind) -> i32 {
        let state = self.state.lock().await;
        state
            .subscriptions
            .get(&user_id)
            .map(|sub| match kind {
                ConsumptionKind::Chat => sub.consumed_chat,
                ConsumptionKind::Video => sub.consumed_video,
            })
            .unwrap_or(0)
    }
}

#[async_trait]
impl EntitlementLedger for InMemoryLedger {
    async fn reserve(
        &self,
        user_id: Uuid,
        kind: ConsumptionKind,
        _session_id: Uuid,
    ) -> BillingResult<ReserveOutcome> {
        let mut state = self.state.lock().await;

        let Some(sub) = state.subscriptions.get_mut(&user_id) else {
            return Ok(ReserveOutcome::NoActiveSubscription);
        };
        if !sub.status.can_consume() {
            return Ok(ReserveOutcome::NoActiveSubscription);
        }

        let (consumed, included) = sub.units(kind);
        if *consumed < included {
            *consumed += 1;
            let consumption_id = Uuid::new_v4();
            state.consumptions.insert(
                consumption_id,
                MemConsumption {
                    user_id,
                    kind,
                    credit_id: None,
                    state: vetline_shared::ConsumptionState::Reserved,
                },
            );
            return Ok(ReserveOutcome::Reserved {
                consumption_id,
                funded: FundingSource::Included,
            });
        }

        let code = kind.credit_code();
        if let Some(credit) = sub
            .credits
            .iter_mut()
            .find(|c| c.code == code && c.remaining_units > 0)
        {
            credit.remaining_units -= 1;
            let credit_id = credit.id;
            let consumption_id = Uuid::new_v4();
            state.consumptions.insert(
                consumption_id,
                MemConsumption {
                    user_id,
                    kind,
                    credit_id: Some(credit_id),
                    state: vetline_shared::ConsumptionState::Reserved,
                },
            );
            return Ok(ReserveOutcome::Reserved {
                consumption_id,
                funded: FundingSource::Credit,
            });
        }

        Ok(ReserveOutcome::Exhausted)
    }

    async fn commit(&self, user_id: Uuid, consumption_id: Uuid) -> BillingResult<FinalizeOutcome> {
        let mut state = self.state.lock().await;
        match state.consumptions.get_mut(&consumption_id) {
            Some(c)
                if c.user_id == user_id
                    && c.state == vetline_shared::ConsumptionState::Reserved =>
            {
                c.state = vetline_shared::ConsumptionState::Committed;
                Ok(FinalizeOutcome::Finalized)
            }
            _ => Ok(FinalizeOutcome::NotFoundOrFinalized),
        }
    }

    async fn release(&self, user_id: Uuid, consumption_id: Uuid) -> BillingResult<FinalizeOutcome> {
        let mut state = self.state.lock().await;

        let (kind, credit_id) = match state.consumptions.get_mut(&consumption_id) {
            Some(c)
                if c.user_id == user_id
                    && c.state == vetline_shared::ConsumptionState::Reserved =>
            {
                c.state = vetline_shared::ConsumptionState::Released;
                (c.kind, c.credit_id)
            }
            _ => return Ok(FinalizeOutcome::NotFoundOrFinalized),
        };

        if let Some(sub) = state.subscriptions.get_mut(&user_id) {
            match credit_id {
                Some(credit_id) => {
                    if let Some(credit) = sub.credits.iter_mut().find(|c| c.id == credit_id) {
                        credit.remaining_units += 1;
                    }
                }
                None => {
                    let (consumed, _) = sub.units(kind);
                    *consumed = (*consumed - 1).max(0);
                }
            }
        }

        Ok(FinalizeOutcome::Finalized)
    }

    async fn current_usage(&self, user_id: Uuid) -> BillingResult<Option<UsageSnapshot>> {
        let state = self.state.lock().await;
        let Some(sub) = state.subscriptions.get(&user_id) else {
            return Ok(None);
        };

        let mut by_code: HashMap<&'static str, i64> = HashMap::new();
        for credit in &sub.credits {
            if credit.remaining_units > 0 {
                *by_code.entry(credit.code.as_str()).or_default() += i64::from(credit.remaining_units);
            }
        }
        let mut credits: Vec<CreditBalance> = by_code
            .into_iter()
            .map(|(code, remaining_units)| CreditBalance {
                code: code.to_string(),
                remaining_units,
            })
            .collect();
        credits.sort_by(|a, b| a.code.cmp(&b.code));

        Ok(Some(UsageSnapshot {
            subscription_id: sub.subscription_id,
            period_start: sub.period_start,
            period_end: sub.period_end,
            included_chat: sub.included_chat,
            consumed_chat: sub.consumed_chat,
            included_video: sub.included_video,
            consumed_video: sub.consumed_video,
            credits,
        }))
    }
}
