//! Billing error types

/// Errors surfaced by the billing engine.
///
/// Business-level ambiguity (unknown customers, unmapped prices, duplicate
/// events, exhausted entitlement) is expressed through structured outcomes,
/// not through this enum; only infrastructure failures and genuinely
/// malformed input become errors.
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type BillingResult<T> = Result<T, BillingError>;

impl BillingError {
    /// True when retrying the same input could succeed (store trouble),
    /// false when the input itself can never be processed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BillingError::Database(_))
    }
}
