//! HTTP middleware: rate limiting, gateway key and caller identity.

use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use jitgate_engine::Actor;
use jitgate_storage::Role;
use subtle::ConstantTimeEq;

use super::json_error;
use super::state::AppState;

/// Rate limiting middleware. Checks per-IP request rate before routing.
pub(crate) async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    match state.rate_limiter.check(addr.ip()).await {
        Ok(()) => next.run(request).await,
        Err(retry_after) => {
            let body = serde_json::json!({
                "error": "rate limit exceeded",
                "retry_after": retry_after,
            });
            (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response()
        }
    }
}

/// Gateway key check for `/api`.
///
/// If `JITGATE_API_KEY` is set, requests must include either
/// `Authorization: Bearer <key>` or `X-API-Key: <key>`.
pub(crate) async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let Some(expected) = &state.api_key else {
        return next.run(request).await;
    };

    let headers = request.headers();
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let header_key = headers.get("x-api-key").and_then(|v| v.to_str().ok());

    let accepted = bearer
        .or(header_key)
        .map(|presented| keys_match(presented, expected));

    match accepted {
        Some(true) => next.run(request).await,
        Some(false) => json_error(StatusCode::FORBIDDEN, "invalid API key").into_response(),
        None => json_error(StatusCode::UNAUTHORIZED, "authentication required").into_response(),
    }
}

fn keys_match(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Read the caller from the identity headers. Ids start at 1.
fn caller(headers: &HeaderMap) -> Option<Actor> {
    let id = headers
        .get("x-actor-id")?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|id| *id != 0)?;
    let role = Role::from_str(headers.get("x-actor-role")?.to_str().ok()?.trim()).ok()?;
    Some(Actor { id, role })
}

async fn require_role(role: Role, mut request: Request<axum::body::Body>, next: Next) -> Response {
    match caller(request.headers()) {
        Some(actor) if actor.role == role => {
            request.extensions_mut().insert(actor);
            next.run(request).await
        }
        Some(_) => json_error(StatusCode::FORBIDDEN, "role not permitted").into_response(),
        None => json_error(StatusCode::UNAUTHORIZED, "caller identity required").into_response(),
    }
}

pub(crate) async fn require_user(request: Request<axum::body::Body>, next: Next) -> Response {
    require_role(Role::User, request, next).await
}

pub(crate) async fn require_agent(request: Request<axum::body::Body>, next: Next) -> Response {
    require_role(Role::Agent, request, next).await
}

pub(crate) async fn require_auditor(request: Request<axum::body::Body>, next: Next) -> Response {
    require_role(Role::Auditor, request, next).await
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(id: &str, role: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert("x-actor-id", HeaderValue::from_str(id).unwrap());
        map.insert("x-actor-role", HeaderValue::from_str(role).unwrap());
        map
    }

    #[test]
    fn caller_reads_id_and_role() {
        assert_eq!(caller(&headers(" 7 ", "CS")), Some(Actor::agent(7)));
    }

    #[test]
    fn caller_rejects_id_zero_and_garbage() {
        assert_eq!(caller(&headers("0", "CS")), None);
        assert_eq!(caller(&headers("-1", "CS")), None);
        assert_eq!(caller(&headers("7", "ROOT")), None);
        assert_eq!(caller(&HeaderMap::new()), None);
    }
}
