//! Request identity binding
//!
//! Resolves a verified caller identity per request and makes it available
//! to exactly the code handling that request: inserted into the request
//! extensions for handlers, and scoped into a task-local for nested
//! transactional code that cannot take it as a parameter. Never a
//! process-wide variable — concurrent requests with different identities
//! must not observe each other.

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// Verified caller identity for one request.
#[derive(Debug, Clone, Serialize)]
pub struct Identity {
    pub subject: Uuid,
    pub email: Option<String>,
    pub role: Option<String>,
    pub admin: bool,
}

tokio::task_local! {
    static CURRENT_IDENTITY: Identity;
}

impl Identity {
    /// The identity bound to the current request's dynamic extent, if any.
    ///
    /// Code outside a request (or in a detached task) sees `None`; absence
    /// is a normal state, not an error.
    pub fn current() -> Option<Identity> {
        CURRENT_IDENTITY.try_with(|identity| identity.clone()).ok()
    }
}

fn extract_bearer_token(request: &Request) -> Option<String> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .map(String::from)
}

/// Development-only identity from the `x-user-id` header, strictly
/// validated as a UUID so arbitrary strings cannot be injected as
/// identifiers. `x-admin: 1|true` grants the admin claim.
fn extract_dev_identity(request: &Request) -> Option<Identity> {
    let raw = request.headers().get("x-user-id")?.to_str().ok()?;
    let subject = Uuid::parse_str(raw.trim()).ok()?;

    let admin = request
        .headers()
        .get("x-admin")
        .and_then(|h| h.to_str().ok())
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    Some(Identity {
        subject,
        email: None,
        role: None,
        admin,
    })
}

fn resolve_identity(state: &AppState, request: &Request) -> Option<Identity> {
    if let Some(token) = extract_bearer_token(request) {
        match state.jwt_manager.verify(&token) {
            Ok(claims) => {
                return Some(Identity {
                    subject: claims.sub,
                    email: claims.email,
                    role: claims.role,
                    admin: claims.admin.unwrap_or(false),
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "bearer token rejected");
                return None;
            }
        }
    }

    if state.config.allow_dev_headers {
        return extract_dev_identity(request);
    }

    None
}

/// Upsert the caller's heartbeat record. Detached on purpose: the parent
/// request must never fail or wait on this.
fn spawn_heartbeat(pool: PgPool, identity: &Identity, user_agent: Option<String>) {
    let subject = identity.subject;
    tokio::spawn(async move {
        let result = sqlx::query(
            r#"
            INSERT INTO user_heartbeats (user_id, last_seen_at, user_agent)
            VALUES ($1, NOW(), $2)
            ON CONFLICT (user_id) DO UPDATE
                SET last_seen_at = NOW(), user_agent = EXCLUDED.user_agent
            "#,
        )
        .bind(subject)
        .bind(user_agent)
        .execute(&pool)
        .await;

        if let Err(e) = result {
            tracing::debug!(user_id = %subject, error = %e, "heartbeat upsert failed");
        }
    });
}

async fn run_with_identity(
    state: AppState,
    mut request: Request,
    next: Next,
    identity: Identity,
) -> Response {
    let user_agent = request
        .headers()
        .get("User-Agent")
        .and_then(|h| h.to_str().ok())
        .map(String::from);
    spawn_heartbeat(state.pool.clone(), &identity, user_agent);

    request.extensions_mut().insert(identity.clone());
    CURRENT_IDENTITY.scope(identity, next.run(request)).await
}

/// Middleware that requires a verified identity; absent or rejected
/// credentials end the request with 401.
pub async fn require_identity(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    match resolve_identity(&state, &request) {
        Some(identity) => {
            tracing::debug!(
                subject = %identity.subject,
                path = %request.uri().path(),
                "identity bound"
            );
            run_with_identity(state, request, next, identity).await
        }
        None => ApiError::Unauthorized.into_response(),
    }
}

/// Middleware that binds an identity when one is present and otherwise
/// lets the request through anonymously.
pub async fn optional_identity(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    match resolve_identity(&state, &request) {
        Some(identity) => run_with_identity(state, request, next, identity).await,
        None => next.run(request).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(subject: Uuid) -> Identity {
        Identity {
            subject,
            email: None,
            role: None,
            admin: false,
        }
    }

    #[tokio::test]
    async fn current_is_none_outside_a_scope() {
        assert!(Identity::current().is_none());
    }

    #[tokio::test]
    async fn scoped_identity_is_visible_to_nested_awaits() {
        let subject = Uuid::new_v4();
        CURRENT_IDENTITY
            .scope(identity(subject), async {
                tokio::task::yield_now().await;
                let seen = Identity::current().map(|i| i.subject);
                assert_eq!(seen, Some(subject));
            })
            .await;
        assert!(Identity::current().is_none());
    }

    #[tokio::test]
    async fn concurrent_scopes_do_not_leak_into_each_other() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let observe = |expected: Uuid| async move {
            for _ in 0..50 {
                tokio::task::yield_now().await;
                let seen = Identity::current().map(|i| i.subject);
                assert_eq!(seen, Some(expected), "identity leaked across tasks");
            }
        };

        let task_a = tokio::spawn(CURRENT_IDENTITY.scope(identity(a), observe(a)));
        let task_b = tokio::spawn(CURRENT_IDENTITY.scope(identity(b), observe(b)));
        task_a.await.unwrap();
        task_b.await.unwrap();
    }

    #[test]
    fn dev_header_requires_uuid_shape() {
        let ok = Request::builder()
            .uri("/")
            .header("x-user-id", "8f14e45f-ceea-4a7a-9c3e-1b2d3f4a5b6c")
            .body(axum::body::Body::empty())
            .unwrap();
        assert!(extract_dev_identity(&ok).is_some());

        let injected = Request::builder()
            .uri("/")
            .header("x-user-id", "1 OR 1=1")
            .body(axum::body::Body::empty())
            .unwrap();
        assert!(extract_dev_identity(&injected).is_none());
    }

    #[test]
    fn dev_admin_flag_variants() {
        for (value, expected) in [("1", true), ("true", true), ("TRUE", true), ("0", false)] {
            let request = Request::builder()
                .uri("/")
                .header("x-user-id", Uuid::new_v4().to_string())
                .header("x-admin", value)
                .body(axum::body::Body::empty())
                .unwrap();
            let identity = extract_dev_identity(&request).unwrap();
            assert_eq!(identity.admin, expected, "x-admin: {value}");
        }
    }
}
