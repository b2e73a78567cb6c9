//! Idempotency-key replay cache
//!
//! Makes every mutating handler safe against sequential client retries: a
//! request carrying an `Idempotency-Key` header returns the first
//! response's exact status, body, and a bounded set of headers for the
//! retention window, without re-running the handler.
//!
//! Two concurrent requests with the same unseen key may both execute the
//! handler — there is no distributed lock, and the design prefers that
//! simplicity. The event ledger's unique constraint and the finalize
//! guards of the consumption protocol are the true safety net for
//! effectful operations; this cache optimizes the common
//! sequential-retry case.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{
        header::{HeaderName, HeaderValue, CONTENT_TYPE, LOCATION},
        Method, StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio::sync::RwLock;

/// Retention window for cached responses.
const IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Entry cap; oldest entries are evicted so a client spraying unique keys
/// cannot exhaust memory.
const MAX_CACHE_ENTRIES: usize = 10_000;

/// Responses larger than this are served but not cached.
const MAX_CACHED_BODY_BYTES: usize = 256 * 1024;

/// Headers replayed alongside the cached body.
const REPLAYED_HEADERS: [HeaderName; 2] = [CONTENT_TYPE, LOCATION];

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

#[derive(Clone)]
struct CachedResponse {
    status: StatusCode,
    headers: Vec<(HeaderName, HeaderValue)>,
    body: Bytes,
    recorded_at: Instant,
}

impl CachedResponse {
    fn to_response(&self) -> Response {
        let mut response = Response::new(Body::from(self.body.clone()));
        *response.status_mut() = self.status;
        for (name, value) in &self.headers {
            response.headers_mut().insert(name.clone(), value.clone());
        }
        response
    }
}

/// Process-local replay store. Cheap to clone; all clones share the map.
#[derive(Clone, Default)]
pub struct IdempotencyCache {
    entries: Arc<RwLock<HashMap<String, CachedResponse>>>,
}

impl IdempotencyCache {
    pub fn new() -> Self {
        Self::default()
    }

    async fn lookup(&self, key: &str) -> Option<Response> {
        let entries = self.entries.read().await;
        let entry = entries.get(key)?;
        // Lazy expiry: an aged entry is treated as absent; the sweep
        // physically removes it later.
        if entry.recorded_at.elapsed() >= IDEMPOTENCY_TTL {
            return None;
        }
        Some(entry.to_response())
    }

    async fn store(&self, key: String, status: StatusCode, headers: Vec<(HeaderName, HeaderValue)>, body: Bytes) {
        let mut entries = self.entries.write().await;

        if entries.len() >= MAX_CACHE_ENTRIES {
            if let Some(oldest_key) = entries
                .iter()
                .min_by_key(|(_, v)| v.recorded_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest_key);
                tracing::debug!("evicted oldest idempotency entry to stay under limit");
            }
        }

        entries.insert(
            key,
            CachedResponse {
                status,
                headers,
                body,
                recorded_at: Instant::now(),
            },
        );
    }

    /// Remove expired entries. Run periodically from a background task.
    pub async fn sweep_expired(&self) {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.recorded_at.elapsed() < IDEMPOTENCY_TTL);
        let removed = before - entries.len();
        if removed > 0 {
            tracing::info!(removed, "swept expired idempotency entries");
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

fn is_mutating(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

/// Middleware implementing the replay protocol.
///
/// Keys the client never sent cost nothing: no key, or a non-mutating
/// method, bypasses the cache entirely. Only successful (2xx) responses
/// are recorded; a failed handler run is re-executed on retry and the
/// handler-level guards keep that safe.
pub async fn idempotency_replay(
    State(cache): State<IdempotencyCache>,
    request: Request,
    next: Next,
) -> Response {
    if !is_mutating(request.method()) {
        return next.run(request).await;
    }

    let key = request
        .headers()
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty() && k.len() <= 255)
        .map(String::from);

    let Some(key) = key else {
        return next.run(request).await;
    };

    if let Some(replayed) = cache.lookup(&key).await {
        tracing::info!(key = %key, "idempotent replay, handler skipped");
        return replayed;
    }

    let response = next.run(request).await;
    if !response.status().is_success() {
        return response;
    }

    let (parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(key = %key, error = %e, "failed to buffer response body");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    if bytes.len() <= MAX_CACHED_BODY_BYTES {
        let headers: Vec<(HeaderName, HeaderValue)> = REPLAYED_HEADERS
            .iter()
            .filter_map(|name| {
                parts
                    .headers
                    .get(name)
                    .map(|value| (name.clone(), value.clone()))
            })
            .collect();
        cache
            .store(key, parts.status, headers, bytes.clone())
            .await;
    } else {
        tracing::warn!(key = %key, size = bytes.len(), "response too large to cache");
    }

    Response::from_parts(parts, Body::from(bytes))
}
