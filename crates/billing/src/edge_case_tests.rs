// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Billing Engine
//!
//! Tests critical boundary conditions in:
//! - Entitlement reservation (ENT-R01 to ENT-R08)
//! - Commit/release idempotence (ENT-F01 to ENT-F05)
//! - Usage snapshots (ENT-U01 to ENT-U02)
//! - Provider status mapping and period inference (REC-01 to REC-04)

#[cfg(test)]
mod reservation_tests {
    use crate::entitlement::*;
    use uuid::Uuid;
    use vetline_shared::{ConsumptionKind, CreditCode, SubscriptionStatus};

    // =========================================================================
    // ENT-R01: Reserve within included capacity - funds from the period
    // =========================================================================
    #[tokio::test]
    async fn test_reserve_within_included_units() {
        let ledger = InMemoryLedger::new();
        let user = Uuid::new_v4();
        ledger
            .add_subscription(user, MemSubscription::active(2, 0))
            .await;

        let outcome = ledger
            .reserve(user, ConsumptionKind::Chat, Uuid::new_v4())
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            ReserveOutcome::Reserved {
                funded: FundingSource::Included,
                ..
            }
        ));
        assert_eq!(ledger.consumed(user, ConsumptionKind::Chat).await, 1);
    }

    // =========================================================================
    // ENT-R02: included=2, consumed=2, no credits - deterministic exhaustion,
    // counter untouched
    // =========================================================================
    #[tokio::test]
    async fn test_exhaustion_reports_without_mutation() {
        let ledger = InMemoryLedger::new();
        let user = Uuid::new_v4();
        let mut sub = MemSubscription::active(2, 0);
        sub.consumed_chat = 2;
        ledger.add_subscription(user, sub).await;

        let outcome = ledger
            .reserve(user, ConsumptionKind::Chat, Uuid::new_v4())
            .await
            .unwrap();

        assert_eq!(outcome, ReserveOutcome::Exhausted);
        assert_eq!(ledger.consumed(user, ConsumptionKind::Chat).await, 2);
    }

    // =========================================================================
    // ENT-R03: included exhausted, one matching credit - credit funds the
    // reservation and the period counter stays untouched
    // =========================================================================
    #[tokio::test]
    async fn test_credit_fallback_leaves_counter_alone() {
        let ledger = InMemoryLedger::new();
        let user = Uuid::new_v4();
        let mut sub = MemSubscription::active(2, 0).with_credit(CreditCode::ChatUnit, 1);
        sub.consumed_chat = 2;
        ledger.add_subscription(user, sub).await;

        let outcome = ledger
            .reserve(user, ConsumptionKind::Chat, Uuid::new_v4())
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            ReserveOutcome::Reserved {
                funded: FundingSource::Credit,
                ..
            }
        ));
        assert_eq!(ledger.consumed(user, ConsumptionKind::Chat).await, 2);
        assert_eq!(ledger.credit_units(user, CreditCode::ChatUnit).await, 0);
    }

    // =========================================================================
    // ENT-R04: credit of the wrong code never funds a reservation
    // =========================================================================
    #[tokio::test]
    async fn test_mismatched_credit_code_does_not_fund() {
        let ledger = InMemoryLedger::new();
        let user = Uuid::new_v4();
        let mut sub = MemSubscription::active(1, 1).with_credit(CreditCode::VideoUnit, 5);
        sub.consumed_chat = 1;
        ledger.add_subscription(user, sub).await;

        let outcome = ledger
            .reserve(user, ConsumptionKind::Chat, Uuid::new_v4())
            .await
            .unwrap();

        assert_eq!(outcome, ReserveOutcome::Exhausted);
        assert_eq!(ledger.credit_units(user, CreditCode::VideoUnit).await, 5);
    }

    // =========================================================================
    // ENT-R05: no subscription / past_due subscription cannot reserve
    // =========================================================================
    #[tokio::test]
    async fn test_missing_or_past_due_subscription_refused() {
        let ledger = InMemoryLedger::new();
        let nobody = Uuid::new_v4();
        let outcome = ledger
            .reserve(nobody, ConsumptionKind::Video, Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(outcome, ReserveOutcome::NoActiveSubscription);

        let past_due_user = Uuid::new_v4();
        let mut sub = MemSubscription::active(5, 5);
        sub.status = SubscriptionStatus::PastDue;
        ledger.add_subscription(past_due_user, sub).await;

        let outcome = ledger
            .reserve(past_due_user, ConsumptionKind::Video, Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(outcome, ReserveOutcome::NoActiveSubscription);
    }

    // =========================================================================
    // ENT-R06: chat and video counters are independent
    // =========================================================================
    #[tokio::test]
    async fn test_kinds_meter_independently() {
        let ledger = InMemoryLedger::new();
        let user = Uuid::new_v4();
        ledger
            .add_subscription(user, MemSubscription::active(1, 1))
            .await;

        let chat = ledger
            .reserve(user, ConsumptionKind::Chat, Uuid::new_v4())
            .await
            .unwrap();
        let video = ledger
            .reserve(user, ConsumptionKind::Video, Uuid::new_v4())
            .await
            .unwrap();

        assert!(matches!(chat, ReserveOutcome::Reserved { .. }));
        assert!(matches!(video, ReserveOutcome::Reserved { .. }));
        assert_eq!(ledger.consumed(user, ConsumptionKind::Chat).await, 1);
        assert_eq!(ledger.consumed(user, ConsumptionKind::Video).await, 1);
    }

    // =========================================================================
    // ENT-R07: 10 parallel reserves against capacity 5 - exactly 5 succeed
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_reserves_respect_capacity() {
        use std::sync::Arc;
        use tokio::sync::Barrier;

        let ledger = Arc::new(InMemoryLedger::new());
        let user = Uuid::new_v4();
        ledger
            .add_subscription(user, MemSubscription::active(5, 0))
            .await;

        let barrier = Arc::new(Barrier::new(10));
        let mut handles = vec![];

        for _ in 0..10 {
            let ledger = Arc::clone(&ledger);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                ledger
                    .reserve(user, ConsumptionKind::Chat, Uuid::new_v4())
                    .await
                    .unwrap()
            }));
        }

        let mut reserved = 0;
        let mut exhausted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                ReserveOutcome::Reserved { .. } => reserved += 1,
                ReserveOutcome::Exhausted => exhausted += 1,
                other => panic!("unexpected outcome {other:?}"),
            }
        }

        assert_eq!(reserved, 5, "exactly the included capacity may reserve");
        assert_eq!(exhausted, 5);
        assert_eq!(ledger.consumed(user, ConsumptionKind::Chat).await, 5);
    }
}

#[cfg(test)]
mod finalize_tests {
    use crate::entitlement::*;
    use uuid::Uuid;
    use vetline_shared::{ConsumptionKind, CreditCode};

    async fn reserved(ledger: &InMemoryLedger, user: Uuid) -> Uuid {
        match ledger
            .reserve(user, ConsumptionKind::Chat, Uuid::new_v4())
            .await
            .unwrap()
        {
            ReserveOutcome::Reserved { consumption_id, .. } => consumption_id,
            other => panic!("setup expected a reservation, got {other:?}"),
        }
    }

    // =========================================================================
    // ENT-F01: committing twice - second call is a reported no-op
    // =========================================================================
    #[tokio::test]
    async fn test_double_commit_is_noop() {
        let ledger = InMemoryLedger::new();
        let user = Uuid::new_v4();
        ledger
            .add_subscription(user, MemSubscription::active(3, 0))
            .await;
        let cid = reserved(&ledger, user).await;

        assert_eq!(
            ledger.commit(user, cid).await.unwrap(),
            FinalizeOutcome::Finalized
        );
        assert_eq!(
            ledger.commit(user, cid).await.unwrap(),
            FinalizeOutcome::NotFoundOrFinalized
        );
        assert_eq!(ledger.consumed(user, ConsumptionKind::Chat).await, 1);
    }

    // =========================================================================
    // ENT-F02: releasing an already-committed consumption never touches the
    // counter
    // =========================================================================
    #[tokio::test]
    async fn test_release_after_commit_has_no_effect() {
        let ledger = InMemoryLedger::new();
        let user = Uuid::new_v4();
        ledger
            .add_subscription(user, MemSubscription::active(3, 0))
            .await;
        let cid = reserved(&ledger, user).await;

        ledger.commit(user, cid).await.unwrap();
        assert_eq!(
            ledger.release(user, cid).await.unwrap(),
            FinalizeOutcome::NotFoundOrFinalized
        );
        assert_eq!(ledger.consumed(user, ConsumptionKind::Chat).await, 1);
    }

    // =========================================================================
    // ENT-F03: release restores the period counter exactly once
    // =========================================================================
    #[tokio::test]
    async fn test_release_restores_counter_once() {
        let ledger = InMemoryLedger::new();
        let user = Uuid::new_v4();
        ledger
            .add_subscription(user, MemSubscription::active(3, 0))
            .await;
        let cid = reserved(&ledger, user).await;
        assert_eq!(ledger.consumed(user, ConsumptionKind::Chat).await, 1);

        assert_eq!(
            ledger.release(user, cid).await.unwrap(),
            FinalizeOutcome::Finalized
        );
        assert_eq!(ledger.consumed(user, ConsumptionKind::Chat).await, 0);

        // Second release: no double refund.
        assert_eq!(
            ledger.release(user, cid).await.unwrap(),
            FinalizeOutcome::NotFoundOrFinalized
        );
        assert_eq!(ledger.consumed(user, ConsumptionKind::Chat).await, 0);
    }

    // =========================================================================
    // ENT-F04: release refunds a drawn credit, not the counter
    // =========================================================================
    #[tokio::test]
    async fn test_release_refunds_drawn_credit() {
        let ledger = InMemoryLedger::new();
        let user = Uuid::new_v4();
        let mut sub = MemSubscription::active(1, 0).with_credit(CreditCode::ChatUnit, 2);
        sub.consumed_chat = 1;
        ledger.add_subscription(user, sub).await;

        let cid = reserved(&ledger, user).await;
        assert_eq!(ledger.credit_units(user, CreditCode::ChatUnit).await, 1);

        ledger.release(user, cid).await.unwrap();
        assert_eq!(ledger.credit_units(user, CreditCode::ChatUnit).await, 2);
        assert_eq!(ledger.consumed(user, ConsumptionKind::Chat).await, 1);
    }

    // =========================================================================
    // ENT-F05: another caller cannot finalize someone else's reservation
    // =========================================================================
    #[tokio::test]
    async fn test_finalize_is_scoped_to_owner() {
        let ledger = InMemoryLedger::new();
        let owner = Uuid::new_v4();
        let stranger = Uuid::new_v4();
        ledger
            .add_subscription(owner, MemSubscription::active(3, 0))
            .await;
        let cid = reserved(&ledger, owner).await;

        assert_eq!(
            ledger.commit(stranger, cid).await.unwrap(),
            FinalizeOutcome::NotFoundOrFinalized
        );
        // Still reserved for the owner.
        assert_eq!(
            ledger.commit(owner, cid).await.unwrap(),
            FinalizeOutcome::Finalized
        );
    }
}

#[cfg(test)]
mod usage_tests {
    use crate::entitlement::*;
    use uuid::Uuid;
    use vetline_shared::{ConsumptionKind, CreditCode};

    // =========================================================================
    // ENT-U01: snapshot reflects consumption and aggregates credits by code
    // =========================================================================
    #[tokio::test]
    async fn test_usage_snapshot_aggregates_credits() {
        let ledger = InMemoryLedger::new();
        let user = Uuid::new_v4();
        ledger
            .add_subscription(
                user,
                MemSubscription::active(10, 4)
                    .with_credit(CreditCode::ChatUnit, 2)
                    .with_credit(CreditCode::ChatUnit, 3),
            )
            .await;

        ledger
            .reserve(user, ConsumptionKind::Chat, Uuid::new_v4())
            .await
            .unwrap();

        let snapshot = ledger.current_usage(user).await.unwrap().unwrap();
        assert_eq!(snapshot.included_chat, 10);
        assert_eq!(snapshot.consumed_chat, 1);
        assert_eq!(snapshot.included_video, 4);
        assert_eq!(snapshot.consumed_video, 0);
        assert_eq!(snapshot.credits.len(), 1);
        assert_eq!(snapshot.credits[0].code, "chat_unit");
        assert_eq!(snapshot.credits[0].remaining_units, 5);
    }

    // =========================================================================
    // ENT-U02: no live subscription - snapshot is None, not an error
    // =========================================================================
    #[tokio::test]
    async fn test_usage_without_subscription_is_none() {
        let ledger = InMemoryLedger::new();
        assert!(ledger.current_usage(Uuid::new_v4()).await.unwrap().is_none());
    }
}

#[cfg(test)]
mod reconcile_unit_tests {
    use crate::plans::{infer_period_end, BillingInterval};
    use crate::reconciler::map_provider_status;
    use time::macros::datetime;
    use vetline_shared::SubscriptionStatus;

    // =========================================================================
    // REC-01: payment-limbo provider statuses all gate as past_due
    // =========================================================================
    #[test]
    fn test_limbo_statuses_map_to_past_due() {
        for raw in ["incomplete", "incomplete_expired", "unpaid"] {
            assert_eq!(map_provider_status(raw), SubscriptionStatus::PastDue);
        }
    }

    // =========================================================================
    // REC-02: unknown provider status keeps service on
    // =========================================================================
    #[test]
    fn test_unknown_status_defaults_active() {
        assert_eq!(map_provider_status("paused"), SubscriptionStatus::Active);
        assert_eq!(map_provider_status(""), SubscriptionStatus::Active);
    }

    // =========================================================================
    // REC-03: period inference across a leap boundary is still flat days
    // =========================================================================
    #[test]
    fn test_inference_is_flat_days_not_calendar() {
        let start = datetime!(2028-02-01 12:00 UTC);
        // 2028 is a leap year; the approximation deliberately ignores it.
        assert_eq!(
            infer_period_end(start, BillingInterval::Month),
            datetime!(2028-03-02 12:00 UTC)
        );
        assert_eq!(
            infer_period_end(start, BillingInterval::Year),
            datetime!(2029-01-31 12:00 UTC)
        );
    }
}
