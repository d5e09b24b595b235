use std::future::Future;

use time::Duration;

use super::{check, t0, TestResult};
use crate::record::{AuditAction, AuditResult, NewAuditEntry, Role};
use crate::GateStorage;

pub(super) async fn run_audit_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: GateStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "audit",
            "appended_rows_read_back_verbatim",
            appended_rows_read_back_verbatim(factory).await,
        ),
        TestResult::from_result(
            "audit",
            "trail_ordered_by_timestamp",
            trail_ordered_by_timestamp(factory).await,
        ),
        TestResult::from_result(
            "audit",
            "case_filter_excludes_other_cases",
            case_filter_excludes_other_cases(factory).await,
        ),
    ]
}

fn entry(case_id: u64, action: AuditAction, offset_secs: i64) -> NewAuditEntry {
    NewAuditEntry {
        case_id,
        actor_ref: format!("USER-{case_id}"),
        actor_role: Role::User,
        action,
        result: AuditResult::Success,
        context: format!("offset {offset_secs}"),
        timestamp: t0() + Duration::seconds(offset_secs),
    }
}

async fn appended_rows_read_back_verbatim<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: GateStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let mut denied = entry(3, AuditAction::ClaimCase, 0);
    denied.actor_ref = "a1b2c3".to_string();
    denied.actor_role = Role::Agent;
    denied.result = AuditResult::Denied;
    denied.context = "agent already has an active case".to_string();
    let written = storage
        .append_audit(denied)
        .await
        .map_err(|e| format!("append_audit: {e}"))?;

    let rows = storage
        .list_audit(None)
        .await
        .map_err(|e| format!("list_audit: {e}"))?;
    check(rows.len() == 1, format!("expected 1 row, got {}", rows.len()))?;
    let row = &rows[0];
    check(row.id == written.id, "id mismatch")?;
    check(row.actor_ref == "a1b2c3", "actor_ref mismatch")?;
    check(row.actor_role == Role::Agent, "actor_role mismatch")?;
    check(row.action == AuditAction::ClaimCase, "action mismatch")?;
    check(row.result == AuditResult::Denied, "result mismatch")?;
    check(row.context == "agent already has an active case", "context mismatch")?;
    check(row.timestamp == t0(), "timestamp mismatch")
}

async fn trail_ordered_by_timestamp<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: GateStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    for (action, offset) in [
        (AuditAction::CloseCase, 30),
        (AuditAction::OpenCase, 0),
        (AuditAction::ClaimCase, 10),
    ] {
        storage
            .append_audit(entry(1, action, offset))
            .await
            .map_err(|e| format!("append_audit: {e}"))?;
    }
    let actions: Vec<AuditAction> = storage
        .list_audit(None)
        .await
        .map_err(|e| format!("list_audit: {e}"))?
        .into_iter()
        .map(|r| r.action)
        .collect();
    check(
        actions
            == vec![
                AuditAction::OpenCase,
                AuditAction::ClaimCase,
                AuditAction::CloseCase,
            ],
        format!("unexpected order: {actions:?}"),
    )
}

async fn case_filter_excludes_other_cases<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: GateStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    storage
        .append_audit(entry(1, AuditAction::OpenCase, 0))
        .await
        .map_err(|e| format!("append_audit: {e}"))?;
    storage
        .append_audit(entry(2, AuditAction::OpenCase, 1))
        .await
        .map_err(|e| format!("append_audit: {e}"))?;
    storage
        .append_audit(entry(1, AuditAction::ClaimCase, 2))
        .await
        .map_err(|e| format!("append_audit: {e}"))?;

    let rows = storage
        .list_audit(Some(1))
        .await
        .map_err(|e| format!("list_audit: {e}"))?;
    check(rows.len() == 2, format!("expected 2 rows, got {}", rows.len()))?;
    check(rows.iter().all(|r| r.case_id == 1), "foreign case leaked")
}
