//! `jitgate serve` -- HTTP JSON API over the engine.
//!
//! Identity comes from the upstream identity service: every `/api` request
//! carries `X-Actor-Id` and `X-Actor-Role` (`USER`, `CS` or `AUDITOR`).
//! When `JITGATE_API_KEY` is set, `/api` requests must also present it as
//! `Authorization: Bearer <key>` or `X-API-Key: <key>`.
//!
//! Endpoints:
//! - GET  /health                                   - Server status
//! - POST /api/user/cases                           - Open a case
//! - POST /api/user/cases/{id}/close                - Owner closes a case
//! - GET  /api/cs/cases/open                        - Unclaimed cases
//! - POST /api/cs/cases/{id}/claim                  - Claim a case
//! - POST /api/cs/cases/{id}/start-verification     - Send the owner a challenge
//! - POST /api/cs/cases/{id}/redeem                 - Spend a granted privilege
//! - POST /api/cs/cases/{id}/close                  - Agent closes a case
//! - GET  /api/cs/cases/{id}/audit                  - Audit rows for one case
//! - GET  /api/auditor/logs                         - Whole audit log
//! - GET  /api/auditor/reports                      - Per-case summaries
//! - GET  /api/auditor/cases/{id}/logs              - Audit rows for one case
//! - GET  /verify/{token}                           - Challenge questions
//! - POST /verify/{token}                           - Submit answers
//! - POST /reset-password                           - Owner sets a new password
//!
//! All responses use Content-Type: application/json.

mod error;
mod handlers;
mod middleware;
mod state;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{middleware as axum_middleware, Json, Router};
use jitgate_engine::{config, Gate, GateConfig, SystemClock};
use jitgate_storage::SqliteStorage;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use self::handlers::{
    handle_audit_by_case, handle_audit_reports, handle_audit_trail, handle_claim,
    handle_close, handle_get_challenge, handle_health, handle_not_found, handle_open_case,
    handle_open_queue, handle_redeem, handle_reset_password, handle_start_verification,
    handle_submit_answers,
};
use self::middleware::{
    auth_middleware, rate_limit_middleware, require_agent, require_auditor, require_user,
};
use self::state::{AppState, RateLimiter};
use crate::CliError;

/// Maximum request body size: 64 KB.
const MAX_BODY_SIZE: usize = 64 * 1024;

/// Rate limit window duration in seconds (1 minute).
const RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// Construct a JSON error response with the given status code and message.
fn json_error(status: StatusCode, message: &str) -> impl IntoResponse {
    (status, Json(serde_json::json!({"error": message})))
}

pub(crate) fn build_router(state: Arc<AppState>) -> Router {
    let user = Router::new()
        .route("/cases", post(handle_open_case))
        .route("/cases/{id}/close", post(handle_close))
        .route_layer(axum_middleware::from_fn(require_user));

    let cs = Router::new()
        .route("/cases/open", get(handle_open_queue))
        .route("/cases/{id}/claim", post(handle_claim))
        .route("/cases/{id}/start-verification", post(handle_start_verification))
        .route("/cases/{id}/redeem", post(handle_redeem))
        .route("/cases/{id}/close", post(handle_close))
        .route("/cases/{id}/audit", get(handle_audit_by_case))
        .route_layer(axum_middleware::from_fn(require_agent));

    let auditor = Router::new()
        .route("/logs", get(handle_audit_trail))
        .route("/reports", get(handle_audit_reports))
        .route("/cases/{id}/logs", get(handle_audit_by_case))
        .route_layer(axum_middleware::from_fn(require_auditor));

    let api = Router::new()
        .nest("/user", user)
        .nest("/cs", cs)
        .nest("/auditor", auditor)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route(
            "/verify/{token}",
            get(handle_get_challenge).post(handle_submit_answers),
        )
        .route("/reset-password", post(handle_reset_password))
        .nest("/api", api)
        .fallback(handle_not_found)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}

/// Start the HTTP server over `storage` and block until Ctrl+C.
pub(crate) async fn start_server(storage: SqliteStorage, config: GateConfig) -> Result<(), CliError> {
    let api_key = std::env::var(config::API_KEY_ENV)
        .ok()
        .filter(|k| !k.is_empty());
    if api_key.is_some() {
        info!("API key authentication enabled");
    }
    info!(
        rate_limit = config.server.rate_limit,
        "rate limit per client IP per minute"
    );

    let port = config.server.port;
    let rate_limit = config.server.rate_limit;
    let gate = Gate::new(
        Arc::new(storage),
        config,
        config::resolve_secret_key(),
        Arc::new(SystemClock),
    );
    let state = Arc::new(AppState {
        gate,
        rate_limiter: RateLimiter::new(rate_limit),
        api_key,
    });
    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("jitgate listening on http://{}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("server shut down");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C).
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("received shutdown signal");
}
