// Billing crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Vetline Billing Engine
//!
//! Reconciles external payment-provider lifecycle events into local
//! subscription state and gates metered consultation starts behind a
//! reserve/commit/release entitlement protocol.
//!
//! ## Features
//!
//! - **Event Reconciliation**: idempotent ingestion of out-of-order,
//!   possibly-duplicated provider events, with multi-tier identifier
//!   resolution when payloads are incomplete
//! - **Entitlement Protocol**: two-phase reserve → commit/release claims
//!   against per-period usage counters, with purchased credits as the
//!   overage fallback
//! - **Plan Catalog**: provider price id → plan mapping and billing-period
//!   inference
//! - **Invariant Checks**: runnable consistency queries over billing state

pub mod entitlement;
pub mod error;
pub mod invariants;
pub mod plans;
pub mod reconciler;
pub mod sql;

#[cfg(test)]
mod edge_case_tests;

// Entitlement protocol
pub use entitlement::{
    bind_identity, CreditBalance, EntitlementLedger, FinalizeOutcome, FundingSource,
    InMemoryLedger, MemCredit, MemSubscription, PgLedger, ReserveOutcome, UsageSnapshot,
};

// Error
pub use error::{BillingError, BillingResult};

// Invariants
pub use invariants::{InvariantCheckSummary, InvariantChecker, InvariantViolation};

// Plans
pub use plans::{infer_period_end, BillingInterval, Plan, PlanCatalog};

// Reconciler
pub use reconciler::{
    map_provider_status, EventEnvelope, EventReconciler, ReconcileOutcome, ResolutionMode,
};

// SQL assembly
pub use sql::UpdateBuilder;
