//! Route handlers. Each one maps a request onto one engine operation.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use jitgate_engine::{Actor, GateError};
use jitgate_storage::{ActionKind, CaseId, GateStorage, QuestionId, Role};
use serde::Deserialize;

use super::error::ApiError;
use super::json_error;
use super::state::AppState;

type ApiResult<T> = Result<T, ApiError>;

/// Fallback handler for unmatched routes.
pub(crate) async fn handle_not_found() -> impl IntoResponse {
    json_error(StatusCode::NOT_FOUND, "not found")
}

/// GET /health
pub(crate) async fn handle_health() -> impl IntoResponse {
    let response = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    });
    (StatusCode::OK, Json(response))
}

#[derive(Deserialize)]
pub(crate) struct OpenCaseRequest {
    subject: String,
}

/// POST /api/user/cases
pub(crate) async fn handle_open_case(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Json(body): Json<OpenCaseRequest>,
) -> ApiResult<impl IntoResponse> {
    let case = state.gate.claims.open_case(actor, &body.subject).await?;
    Ok((StatusCode::CREATED, Json(case)))
}

/// POST /api/user/cases/{id}/close and /api/cs/cases/{id}/close
pub(crate) async fn handle_close(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(case_id): Path<CaseId>,
) -> ApiResult<impl IntoResponse> {
    state.gate.claims.close(actor, case_id).await?;
    Ok(Json(serde_json::json!({ "status": "CLOSED" })))
}

/// GET /api/cs/cases/open
pub(crate) async fn handle_open_queue(
    State(state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.gate.claims.open_queue().await?))
}

/// POST /api/cs/cases/{id}/claim
pub(crate) async fn handle_claim(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(case_id): Path<CaseId>,
) -> ApiResult<impl IntoResponse> {
    state.gate.claims.claim(actor, case_id).await?;
    Ok(Json(serde_json::json!({ "message": "case claimed" })))
}

/// POST /api/cs/cases/{id}/start-verification
pub(crate) async fn handle_start_verification(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(case_id): Path<CaseId>,
) -> ApiResult<impl IntoResponse> {
    let link = state.gate.verification.start(actor, case_id).await?;
    Ok(Json(serde_json::json!({
        "status": "PENDING",
        "verification_url": link.verification_url,
        "expires_at": link.expires_at.unix_timestamp(),
    })))
}

#[derive(Deserialize)]
pub(crate) struct RedeemRequest {
    action: ActionKind,
}

/// POST /api/cs/cases/{id}/redeem
pub(crate) async fn handle_redeem(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(case_id): Path<CaseId>,
    Json(body): Json<RedeemRequest>,
) -> ApiResult<impl IntoResponse> {
    let redemption = state.gate.ledger.redeem(actor, case_id, body.action).await?;
    Ok(Json(redemption))
}

/// GET /api/cs/cases/{id}/audit and /api/auditor/cases/{id}/logs
///
/// Agents only see the cases they are assigned to.
pub(crate) async fn handle_audit_by_case(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(case_id): Path<CaseId>,
) -> ApiResult<impl IntoResponse> {
    if actor.role == Role::Agent {
        let assignment = state
            .gate
            .storage()
            .get_assignment(case_id)
            .await
            .map_err(GateError::from)?;
        if assignment.map_or(true, |a| a.agent_id != actor.id) {
            return Err(GateError::Unauthorized.into());
        }
    }
    Ok(Json(state.gate.audit.by_case(case_id).await?))
}

/// GET /api/auditor/logs
pub(crate) async fn handle_audit_trail(
    State(state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.gate.audit.trail().await?))
}

/// GET /api/auditor/reports
pub(crate) async fn handle_audit_reports(
    State(state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.gate.audit.case_reports().await?))
}

/// GET /verify/{token}
pub(crate) async fn handle_get_challenge(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let questions = state.gate.verification.get_challenge(&token).await?;
    Ok(Json(serde_json::json!({ "questions": questions })))
}

#[derive(Deserialize)]
pub(crate) struct SubmitRequest {
    answers: HashMap<QuestionId, String>,
}

/// POST /verify/{token}
pub(crate) async fn handle_submit_answers(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    Json(body): Json<SubmitRequest>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state
        .gate
        .verification
        .submit_answers(&token, &body.answers)
        .await?;
    Ok(Json(outcome))
}

#[derive(Deserialize)]
pub(crate) struct ResetRequest {
    token: String,
    new_password: String,
}

/// POST /reset-password
pub(crate) async fn handle_reset_password(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ResetRequest>,
) -> ApiResult<impl IntoResponse> {
    state
        .gate
        .ledger
        .complete_reset(&body.token, &body.new_password)
        .await?;
    Ok(Json(serde_json::json!({ "status": "password updated" })))
}
