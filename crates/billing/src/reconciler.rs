//! Provider event reconciliation
//!
//! Merges externally-sourced billing lifecycle events into local
//! subscription state exactly once. Deliveries may arrive out of order,
//! duplicated, or with partial payloads; the unique constraint on the
//! billing event ledger is the sole at-most-once mechanism, and a
//! three-tier identifier resolution copes with events that reference
//! subscriptions the local store has not fully synced yet.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use vetline_shared::SubscriptionStatus;

use crate::error::{BillingError, BillingResult};
use crate::plans::{infer_period_end, Plan, PlanCatalog};
use crate::sql::UpdateBuilder;

/// Inbound event envelope from the payment provider.
#[derive(Debug, Clone, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl EventEnvelope {
    /// Structural validation; failures here are rejected before the event
    /// is ledgered.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.id.trim().is_empty() {
            return Err("event id is empty");
        }
        if self.event_type.trim().is_empty() {
            return Err("event type is empty");
        }
        Ok(())
    }
}

/// Provider-shaped subscription object; every field optional because slim
/// payloads are the norm, not the exception.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct SubscriptionPayload {
    id: Option<String>,
    customer: Option<String>,
    status: Option<String>,
    price: Option<String>,
    items: Option<ItemList>,
    current_period_start: Option<i64>,
    current_period_end: Option<i64>,
    cancel_at_period_end: Option<bool>,
    quantity: Option<i32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ItemList {
    data: Vec<Item>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct Item {
    price: Option<PriceRef>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct PriceRef {
    id: String,
}

impl SubscriptionPayload {
    /// The reported price id: top-level `price` first, first line item as
    /// the fallback.
    fn price_id(&self) -> Option<&str> {
        if let Some(price) = &self.price {
            return Some(price.as_str());
        }
        self.items
            .as_ref()
            .and_then(|items| items.data.first())
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.as_str())
    }

    fn period_start(&self) -> Option<OffsetDateTime> {
        self.current_period_start
            .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok())
    }

    fn period_end(&self) -> Option<OffsetDateTime> {
        self.current_period_end
            .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct InvoicePayload {
    id: Option<String>,
    subscription: Option<String>,
    customer: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct CheckoutPayload {
    id: Option<String>,
    customer: Option<String>,
    metadata: HashMap<String, String>,
}

/// Map the provider's status vocabulary onto the canonical set.
///
/// Payment-limbo statuses gate consumption as `past_due`; an unrecognized
/// status maps to `active` so vocabulary drift on the provider side keeps
/// service on rather than shutting a paying user out.
pub fn map_provider_status(raw: &str) -> SubscriptionStatus {
    match raw {
        "trialing" => SubscriptionStatus::Trialing,
        "active" => SubscriptionStatus::Active,
        "past_due" => SubscriptionStatus::PastDue,
        "canceled" => SubscriptionStatus::Canceled,
        "incomplete" | "incomplete_expired" | "unpaid" => SubscriptionStatus::PastDue,
        _ => SubscriptionStatus::Active,
    }
}

/// How an event was matched to a local subscription row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMode {
    ProviderSubscriptionId,
    ProviderCustomerId,
    InvoiceSubscription,
}

/// Structured result of ingesting one event.
///
/// Everything here except `Failed` is a normal, expected outcome; the
/// ingestion endpoint acknowledges all of them because the event has been
/// durably recorded either way.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// Duplicate delivery; nothing ran.
    Skipped { reason: String },
    /// An existing subscription row was updated.
    Updated { count: u64, resolution: ResolutionMode },
    /// A new subscription row was inserted (tier iii).
    Inserted,
    /// A customer↔user mapping was recorded from a checkout session.
    CustomerMapped,
    /// Event type has no handler; ledgered for forward compatibility.
    Unhandled,
    /// Event consumed but produced no state change.
    Warning { reason: String },
    /// Post-dedup processing error, caught and reported instead of raised.
    Failed { message: String },
}

impl ReconcileOutcome {
    /// Short tag recorded on the ledger row.
    pub fn tag(&self) -> &'static str {
        match self {
            ReconcileOutcome::Skipped { .. } => "skipped",
            ReconcileOutcome::Updated { .. } => "updated",
            ReconcileOutcome::Inserted => "inserted",
            ReconcileOutcome::CustomerMapped => "customer_mapped",
            ReconcileOutcome::Unhandled => "unhandled",
            ReconcileOutcome::Warning { .. } => "warning",
            ReconcileOutcome::Failed { .. } => "failed",
        }
    }
}

/// Applies provider events to local subscription state.
#[derive(Clone)]
pub struct EventReconciler {
    pool: PgPool,
    plans: PlanCatalog,
}

impl EventReconciler {
    pub fn new(pool: PgPool) -> Self {
        let plans = PlanCatalog::new(pool.clone());
        Self { pool, plans }
    }

    /// Ingest one event envelope.
    ///
    /// Step 1 atomically claims the event id in the ledger; a rejected
    /// insert means duplicate delivery and short-circuits. A *failed*
    /// insert (store unavailable) propagates as an error so the endpoint
    /// withholds acknowledgment and the provider redelivers. Everything
    /// after the claim is caught and reported as `Failed` — a malformed
    /// payload will never succeed on retry, so provoking a retry storm
    /// over it helps nobody.
    pub async fn ingest(&self, envelope: &EventEnvelope) -> BillingResult<ReconcileOutcome> {
        envelope
            .validate()
            .map_err(|reason| BillingError::MalformedPayload(reason.to_string()))?;

        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO billing_events (event_id, event_type)
            VALUES ($1, $2)
            ON CONFLICT (event_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&envelope.id)
        .bind(&envelope.event_type)
        .fetch_optional(&self.pool)
        .await?;

        let Some((ledger_id,)) = claimed else {
            tracing::info!(
                event_id = %envelope.id,
                event_type = %envelope.event_type,
                "duplicate event delivery, skipping"
            );
            return Ok(ReconcileOutcome::Skipped {
                reason: "duplicate".to_string(),
            });
        };

        let (outcome, subscription_id) = match self.apply(envelope).await {
            Ok(applied) => applied,
            Err(e) => {
                tracing::error!(
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    error = %e,
                    "event processing failed after ledger claim"
                );
                (
                    ReconcileOutcome::Failed {
                        message: e.to_string(),
                    },
                    None,
                )
            }
        };

        self.record_result(ledger_id, &outcome, subscription_id)
            .await;

        tracing::info!(
            event_id = %envelope.id,
            event_type = %envelope.event_type,
            outcome = outcome.tag(),
            "event reconciled"
        );

        Ok(outcome)
    }

    async fn apply(
        &self,
        envelope: &EventEnvelope,
    ) -> BillingResult<(ReconcileOutcome, Option<Uuid>)> {
        match envelope.event_type.as_str() {
            "customer.subscription.created" | "customer.subscription.updated" => {
                self.apply_subscription(envelope, false).await
            }
            "customer.subscription.deleted" => self.apply_subscription(envelope, true).await,
            "invoice.payment_succeeded" => {
                self.apply_invoice(envelope, SubscriptionStatus::Active).await
            }
            "invoice.payment_failed" => {
                self.apply_invoice(envelope, SubscriptionStatus::PastDue).await
            }
            "checkout.session.completed" => self.apply_checkout(envelope).await,
            other => {
                tracing::info!(
                    event_id = %envelope.id,
                    event_type = %other,
                    "no handler for event type"
                );
                Ok((ReconcileOutcome::Unhandled, None))
            }
        }
    }

    /// Subscription lifecycle events: three-tier resolution.
    ///
    /// (i) match by provider subscription id; (ii) match by provider
    /// customer id on the single newest row still missing its subscription
    /// id (checkout completed before the subscription object synced),
    /// adopting the id; (iii) insert a fresh row when a customer→user
    /// mapping and a resolvable plan exist, inferring the period when the
    /// payload omits it.
    async fn apply_subscription(
        &self,
        envelope: &EventEnvelope,
        deleted: bool,
    ) -> BillingResult<(ReconcileOutcome, Option<Uuid>)> {
        let payload: SubscriptionPayload = serde_json::from_value(envelope.data.clone())
            .map_err(|e| BillingError::MalformedPayload(e.to_string()))?;

        let plan = match payload.price_id() {
            Some(price_id) => self.plans.resolve_price(price_id).await?,
            None => None,
        };

        let status = if deleted {
            SubscriptionStatus::Canceled
        } else {
            payload
                .status
                .as_deref()
                .map(map_provider_status)
                .unwrap_or(SubscriptionStatus::Active)
        };

        let period_start = payload.period_start();
        let period_end = payload.period_end();

        let mut update = UpdateBuilder::new().set("status", status.as_str());
        if let Some(plan) = &plan {
            update = update.set("plan_id", plan.id);
        }
        if let Some(start) = period_start {
            update = update.set("current_period_start", start);
        }
        if let Some(end) = period_end {
            update = update.set("current_period_end", end);
        }
        if let Some(flag) = payload.cancel_at_period_end {
            update = update.set("cancel_at_period_end", flag);
        }
        if let Some(quantity) = payload.quantity {
            update = update.set("pet_count", quantity);
        }

        // Tier (i): provider subscription id.
        if let Some(provider_sub_id) = &payload.id {
            let (set_clause, next) = update.compile();
            let sql = format!(
                "UPDATE subscriptions {set_clause} \
                 WHERE provider_subscription_id = ${next} RETURNING id"
            );
            let query = sqlx::query_as::<_, (Uuid,)>(&sql);
            let row: Option<(Uuid,)> = update
                .bind_values_as(query)
                .bind(provider_sub_id)
                .fetch_optional(&self.pool)
                .await?;

            if let Some((subscription_id,)) = row {
                self.ensure_counter(subscription_id, plan.as_ref(), period_start, period_end)
                    .await?;
                return Ok((
                    ReconcileOutcome::Updated {
                        count: 1,
                        resolution: ResolutionMode::ProviderSubscriptionId,
                    },
                    Some(subscription_id),
                ));
            }
        }

        // Tier (ii): provider customer id on a row not yet carrying its
        // subscription id.
        if let Some(customer_id) = &payload.customer {
            let (set_clause, next) = update.compile();
            let adopt = match &payload.id {
                Some(_) => format!(", provider_subscription_id = ${}", next + 1),
                None => String::new(),
            };
            let match_placeholder = next;
            let sql = format!(
                "UPDATE subscriptions {set_clause}{adopt} \
                 WHERE id = (\
                     SELECT id FROM subscriptions \
                     WHERE provider_customer_id = ${match_placeholder} \
                       AND provider_subscription_id IS NULL \
                     ORDER BY created_at DESC LIMIT 1\
                 ) RETURNING id"
            );
            let query = sqlx::query_as::<_, (Uuid,)>(&sql);
            let mut query = update.bind_values_as(query).bind(customer_id);
            if let Some(provider_sub_id) = &payload.id {
                query = query.bind(provider_sub_id);
            }
            let row: Option<(Uuid,)> = query.fetch_optional(&self.pool).await?;

            if let Some((subscription_id,)) = row {
                self.ensure_counter(subscription_id, plan.as_ref(), period_start, period_end)
                    .await?;
                return Ok((
                    ReconcileOutcome::Updated {
                        count: 1,
                        resolution: ResolutionMode::ProviderCustomerId,
                    },
                    Some(subscription_id),
                ));
            }
        }

        // Tier (iii): insert, given a mapped user and a resolvable plan.
        self.insert_subscription(&payload, plan.as_ref(), status, period_start, period_end)
            .await
    }

    async fn insert_subscription(
        &self,
        payload: &SubscriptionPayload,
        plan: Option<&Plan>,
        status: SubscriptionStatus,
        period_start: Option<OffsetDateTime>,
        period_end: Option<OffsetDateTime>,
    ) -> BillingResult<(ReconcileOutcome, Option<Uuid>)> {
        let missing_context = || {
            (
                ReconcileOutcome::Warning {
                    reason: "no_matching_row_and_missing_context".to_string(),
                },
                None,
            )
        };

        let Some(customer_id) = &payload.customer else {
            return Ok(missing_context());
        };
        let Some(plan) = plan else {
            return Ok(missing_context());
        };

        let user_id: Option<(Uuid,)> = sqlx::query_as(
            "SELECT user_id FROM customer_mappings WHERE provider_customer_id = $1",
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some((user_id,)) = user_id else {
            return Ok(missing_context());
        };

        // Inferred bounds are an approximation the next delivery corrects.
        let start = period_start.unwrap_or_else(OffsetDateTime::now_utc);
        let end = period_end.unwrap_or_else(|| infer_period_end(start, plan.interval()));

        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO subscriptions (
                user_id, plan_id, status,
                current_period_start, current_period_end,
                cancel_at_period_end, provider_subscription_id,
                provider_customer_id, pet_count
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (user_id) WHERE status IN ('trialing', 'active', 'past_due')
            DO NOTHING
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(plan.id)
        .bind(status.as_str())
        .bind(start)
        .bind(end)
        .bind(payload.cancel_at_period_end.unwrap_or(false))
        .bind(&payload.id)
        .bind(customer_id)
        .bind(payload.quantity.unwrap_or(1))
        .fetch_optional(&self.pool)
        .await?;

        let Some((subscription_id,)) = inserted else {
            tracing::warn!(
                customer_id = %customer_id,
                user_id = %user_id,
                "insert skipped: user already holds a live subscription"
            );
            return Ok((
                ReconcileOutcome::Warning {
                    reason: "live_subscription_exists".to_string(),
                },
                None,
            ));
        };

        self.ensure_counter(subscription_id, Some(plan), Some(start), Some(end))
            .await?;

        tracing::info!(
            subscription_id = %subscription_id,
            user_id = %user_id,
            plan = %plan.code,
            "subscription inserted from provider event"
        );

        Ok((ReconcileOutcome::Inserted, Some(subscription_id)))
    }

    /// Invoice outcomes only flip the status of an already-known
    /// subscription.
    async fn apply_invoice(
        &self,
        envelope: &EventEnvelope,
        status: SubscriptionStatus,
    ) -> BillingResult<(ReconcileOutcome, Option<Uuid>)> {
        let payload: InvoicePayload = serde_json::from_value(envelope.data.clone())
            .map_err(|e| BillingError::MalformedPayload(e.to_string()))?;

        let Some(provider_sub_id) = &payload.subscription else {
            tracing::warn!(
                event_id = %envelope.id,
                invoice_id = ?payload.id,
                customer = ?payload.customer,
                "invoice event without subscription reference"
            );
            return Ok((
                ReconcileOutcome::Warning {
                    reason: "invoice_without_subscription".to_string(),
                },
                None,
            ));
        };

        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET status = $1, updated_at = NOW()
            WHERE provider_subscription_id = $2
            RETURNING id
            "#,
        )
        .bind(status.as_str())
        .bind(provider_sub_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((subscription_id,)) => Ok((
                ReconcileOutcome::Updated {
                    count: 1,
                    resolution: ResolutionMode::InvoiceSubscription,
                },
                Some(subscription_id),
            )),
            None => Ok((
                ReconcileOutcome::Warning {
                    reason: "unknown_subscription_reference".to_string(),
                },
                None,
            )),
        }
    }

    /// Checkout completion records the customer↔user mapping that tier
    /// (iii) resolution later relies on.
    async fn apply_checkout(
        &self,
        envelope: &EventEnvelope,
    ) -> BillingResult<(ReconcileOutcome, Option<Uuid>)> {
        let payload: CheckoutPayload = serde_json::from_value(envelope.data.clone())
            .map_err(|e| BillingError::MalformedPayload(e.to_string()))?;

        let user_id = payload
            .metadata
            .get("user_id")
            .and_then(|raw| Uuid::parse_str(raw).ok());

        let (Some(customer_id), Some(user_id)) = (&payload.customer, user_id) else {
            tracing::info!(
                event_id = %envelope.id,
                session_id = ?payload.id,
                "checkout session without mapping context"
            );
            return Ok((
                ReconcileOutcome::Warning {
                    reason: "missing_mapping_context".to_string(),
                },
                None,
            ));
        };

        sqlx::query(
            r#"
            INSERT INTO customer_mappings (provider_customer_id, user_id)
            VALUES ($1, $2)
            ON CONFLICT (provider_customer_id) DO UPDATE SET user_id = EXCLUDED.user_id
            "#,
        )
        .bind(customer_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            customer_id = %customer_id,
            user_id = %user_id,
            "customer mapping recorded from checkout session"
        );

        Ok((ReconcileOutcome::CustomerMapped, None))
    }

    /// Materialize the usage counter for a period once plan and bounds are
    /// both known. Idempotent; the reserve path also creates counters
    /// lazily, so the two never conflict.
    async fn ensure_counter(
        &self,
        subscription_id: Uuid,
        plan: Option<&Plan>,
        period_start: Option<OffsetDateTime>,
        period_end: Option<OffsetDateTime>,
    ) -> BillingResult<()> {
        let (Some(plan), Some(start), Some(end)) = (plan, period_start, period_end) else {
            return Ok(());
        };

        sqlx::query(
            r#"
            INSERT INTO usage_counters (
                subscription_id, period_start, period_end,
                included_chat, included_video
            )
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (subscription_id, period_start) DO NOTHING
            "#,
        )
        .bind(subscription_id)
        .bind(start)
        .bind(end)
        .bind(plan.included_chat_units)
        .bind(plan.included_video_units)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Best-effort: annotate the ledger row we claimed with the outcome and
    /// resolved subscription. The ledger entry itself already stands; a
    /// failure here loses diagnostics, not correctness.
    async fn record_result(
        &self,
        ledger_id: Uuid,
        outcome: &ReconcileOutcome,
        subscription_id: Option<Uuid>,
    ) {
        let result = sqlx::query(
            "UPDATE billing_events SET outcome = $1, subscription_id = $2 WHERE id = $3",
        )
        .bind(outcome.tag())
        .bind(subscription_id)
        .bind(ledger_id)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::warn!(
                ledger_id = %ledger_id,
                error = %e,
                "failed to annotate billing event ledger row"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_the_table() {
        let cases = [
            ("trialing", SubscriptionStatus::Trialing),
            ("active", SubscriptionStatus::Active),
            ("past_due", SubscriptionStatus::PastDue),
            ("canceled", SubscriptionStatus::Canceled),
            ("incomplete", SubscriptionStatus::PastDue),
            ("incomplete_expired", SubscriptionStatus::PastDue),
            ("unpaid", SubscriptionStatus::PastDue),
            ("some_future_status", SubscriptionStatus::Active),
        ];
        for (raw, expected) in cases {
            assert_eq!(map_provider_status(raw), expected, "status {raw}");
        }
    }

    #[test]
    fn envelope_validation_rejects_blank_fields() {
        let envelope = EventEnvelope {
            id: "  ".to_string(),
            event_type: "customer.subscription.updated".to_string(),
            data: serde_json::json!({}),
        };
        assert!(envelope.validate().is_err());

        let envelope = EventEnvelope {
            id: "evt_1".to_string(),
            event_type: String::new(),
            data: serde_json::json!({}),
        };
        assert!(envelope.validate().is_err());
    }

    #[test]
    fn envelope_parses_without_data() {
        let envelope: EventEnvelope =
            serde_json::from_str(r#"{"id": "evt_1", "type": "customer.created"}"#).unwrap();
        assert_eq!(envelope.id, "evt_1");
        assert!(envelope.validate().is_ok());
    }

    #[test]
    fn price_id_prefers_top_level_then_first_item() {
        let payload: SubscriptionPayload = serde_json::from_value(serde_json::json!({
            "price": "price_top",
            "items": {"data": [{"price": {"id": "price_item"}}]}
        }))
        .unwrap();
        assert_eq!(payload.price_id(), Some("price_top"));

        let payload: SubscriptionPayload = serde_json::from_value(serde_json::json!({
            "items": {"data": [{"price": {"id": "price_item"}}]}
        }))
        .unwrap();
        assert_eq!(payload.price_id(), Some("price_item"));

        let payload: SubscriptionPayload = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(payload.price_id(), None);
    }

    #[test]
    fn slim_subscription_payload_parses() {
        // The provider may send little more than an id and a status.
        let payload: SubscriptionPayload = serde_json::from_value(serde_json::json!({
            "id": "sub_1",
            "status": "active"
        }))
        .unwrap();
        assert_eq!(payload.id.as_deref(), Some("sub_1"));
        assert!(payload.period_start().is_none());
        assert!(payload.cancel_at_period_end.is_none());
    }

    #[test]
    fn unix_period_bounds_convert() {
        let payload: SubscriptionPayload = serde_json::from_value(serde_json::json!({
            "current_period_start": 1_700_000_000i64,
            "current_period_end": 1_702_592_000i64
        }))
        .unwrap();
        let start = payload.period_start().unwrap();
        let end = payload.period_end().unwrap();
        assert!(end > start);
        assert_eq!(start.unix_timestamp(), 1_700_000_000);
    }

    #[test]
    fn outcome_serializes_with_tag() {
        let outcome = ReconcileOutcome::Updated {
            count: 1,
            resolution: ResolutionMode::ProviderCustomerId,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "updated");
        assert_eq!(json["resolution"], "provider_customer_id");
        assert_eq!(outcome.tag(), "updated");

        let skipped = ReconcileOutcome::Skipped {
            reason: "duplicate".to_string(),
        };
        let json = serde_json::to_value(&skipped).unwrap();
        assert_eq!(json["outcome"], "skipped");
        assert_eq!(json["reason"], "duplicate");
    }
}
