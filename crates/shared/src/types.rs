//! Canonical billing vocabulary
//!
//! These enums are the local source of truth for status values. Rows store
//! them as TEXT; binding sites use `as_str()` and parsing goes through
//! `FromStr` so an unexpected database value surfaces as an error instead
//! of a silent default.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Canonical subscription lifecycle status.
///
/// At most one subscription per user may be in a non-`Canceled` status;
/// the partial unique index on `subscriptions` enforces this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    /// Statuses counted against the one-active-subscription invariant.
    pub fn is_live(&self) -> bool {
        !matches!(self, SubscriptionStatus::Canceled)
    }

    /// Statuses allowed to start new metered sessions.
    ///
    /// `past_due` keeps the subscription row live but gates consumption
    /// until an `invoice.payment_succeeded` flips it back to `active`.
    pub fn can_consume(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Trialing | SubscriptionStatus::Active
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            other => Err(UnknownValue {
                kind: "subscription status",
                value: other.to_string(),
            }),
        }
    }
}

/// Kind of metered consultation unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumptionKind {
    Chat,
    Video,
}

impl ConsumptionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumptionKind::Chat => "chat",
            ConsumptionKind::Video => "video",
        }
    }

    /// The credit code that can fund this kind when included units run out.
    pub fn credit_code(&self) -> CreditCode {
        match self {
            ConsumptionKind::Chat => CreditCode::ChatUnit,
            ConsumptionKind::Video => CreditCode::VideoUnit,
        }
    }
}

impl std::fmt::Display for ConsumptionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ConsumptionKind {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(ConsumptionKind::Chat),
            "video" => Ok(ConsumptionKind::Video),
            other => Err(UnknownValue {
                kind: "consumption kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Lifecycle state of a consumption (reservation).
///
/// `Committed` and `Released` are terminal; the finalize queries in the
/// ledger guard on `state = 'reserved'` so a row never leaves either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumptionState {
    Reserved,
    Committed,
    Released,
}

impl ConsumptionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumptionState::Reserved => "reserved",
            ConsumptionState::Committed => "committed",
            ConsumptionState::Released => "released",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ConsumptionState::Reserved)
    }
}

impl std::fmt::Display for ConsumptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ConsumptionState {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reserved" => Ok(ConsumptionState::Reserved),
            "committed" => Ok(ConsumptionState::Committed),
            "released" => Ok(ConsumptionState::Released),
            other => Err(UnknownValue {
                kind: "consumption state",
                value: other.to_string(),
            }),
        }
    }
}

/// Purchased-credit unit type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditCode {
    ChatUnit,
    VideoUnit,
}

impl CreditCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditCode::ChatUnit => "chat_unit",
            CreditCode::VideoUnit => "video_unit",
        }
    }
}

impl std::fmt::Display for CreditCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CreditCode {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat_unit" => Ok(CreditCode::ChatUnit),
            "video_unit" => Ok(CreditCode::VideoUnit),
            other => Err(UnknownValue {
                kind: "credit code",
                value: other.to_string(),
            }),
        }
    }
}

/// Error for a TEXT column holding a value outside the canonical set.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownValue {
    pub kind: &'static str,
    pub value: String,
}
