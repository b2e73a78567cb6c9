//! Plan catalog
//!
//! Maps a provider-reported price id to exactly one active local plan and
//! owns the billing-period arithmetic used when an event omits explicit
//! period bounds.

use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingResult;

/// Billing interval of a plan's recurring price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingInterval {
    Month,
    Year,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Month => "month",
            BillingInterval::Year => "year",
        }
    }

    fn from_column(raw: &str) -> Self {
        match raw {
            "year" => BillingInterval::Year,
            _ => BillingInterval::Month,
        }
    }
}

/// Infer a period end from its start and the plan's billing interval.
///
/// Flat 30/365-day approximation: slim event payloads sometimes omit period
/// bounds entirely, and the next delivery carrying real bounds corrects the
/// row. Known accuracy trade-off, not a billing computation.
pub fn infer_period_end(start: OffsetDateTime, interval: BillingInterval) -> OffsetDateTime {
    match interval {
        BillingInterval::Month => start + Duration::days(30),
        BillingInterval::Year => start + Duration::days(365),
    }
}

/// A subscription plan with its metered allowances.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub provider_price_id: String,
    pub billing_interval: String,
    pub included_chat_units: i32,
    pub included_video_units: i32,
    pub active: bool,
}

impl Plan {
    pub fn interval(&self) -> BillingInterval {
        BillingInterval::from_column(&self.billing_interval)
    }
}

/// Catalog lookups against the plans table.
#[derive(Clone)]
pub struct PlanCatalog {
    pool: PgPool,
}

impl PlanCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Resolve a provider price id to its active plan.
    ///
    /// The unique constraint on `provider_price_id` guarantees at most one
    /// match; an unmapped price resolves to `None` and leaves the caller's
    /// plan unchanged.
    pub async fn resolve_price(&self, price_id: &str) -> BillingResult<Option<Plan>> {
        let plan: Option<Plan> = sqlx::query_as(
            r#"
            SELECT id, code, name, provider_price_id, billing_interval,
                   included_chat_units, included_video_units, active
            FROM plans
            WHERE provider_price_id = $1 AND active
            "#,
        )
        .bind(price_id)
        .fetch_optional(&self.pool)
        .await?;

        if plan.is_none() {
            tracing::warn!(price_id = %price_id, "provider price id maps to no active plan");
        }

        Ok(plan)
    }
}
