//! Vetline shared crate
//!
//! Types and database plumbing used by both the API server and the
//! billing engine: canonical status enums, pool construction, and the
//! migrations runner.

pub mod db;
pub mod types;

pub use db::{create_migration_pool, create_pool, run_migrations};
pub use types::{ConsumptionKind, ConsumptionState, CreditCode, SubscriptionStatus};
