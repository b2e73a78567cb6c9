//! Server configuration from environment

use std::env;

/// Runtime configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string.
    pub database_url: String,
    /// Optional direct (non-pooler) URL used for migrations.
    pub database_direct_url: Option<String>,
    /// Listen address, e.g. `0.0.0.0:8080`.
    pub bind_addr: String,
    /// HS256 verification key for bearer tokens. Empty disables signature
    /// verification (claims are decoded as-is) — acceptable only behind a
    /// gateway that already verified them.
    pub jwt_secret: String,
    /// Shared secret gating `POST /internal/billing/events`.
    pub internal_event_secret: String,
    /// Accept the development-only `x-user-id` / `x-admin` headers.
    pub allow_dev_headers: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

        Ok(Self {
            database_url,
            database_direct_url: env::var("DATABASE_DIRECT_URL").ok(),
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            jwt_secret: env::var("JWT_SECRET").unwrap_or_default(),
            internal_event_secret: env::var("INTERNAL_EVENT_SECRET").unwrap_or_default(),
            allow_dev_headers: env::var("ALLOW_DEV_HEADERS")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        })
    }
}
