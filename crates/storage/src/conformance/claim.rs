use std::future::Future;

use super::{check, seed_case, seed_user, t0, TestResult};
use crate::record::{AssignmentRecord, CaseStatus, Role};
use crate::{GateStorage, StorageError};

pub(super) async fn run_claim_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: GateStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "claim",
            "second_assignment_rejected",
            second_assignment_rejected(factory).await,
        ),
        TestResult::from_result(
            "claim",
            "active_count_tracks_in_progress_only",
            active_count_tracks_in_progress_only(factory).await,
        ),
        TestResult::from_result(
            "claim",
            "status_update_requires_expected_status",
            status_update_requires_expected_status(factory).await,
        ),
        TestResult::from_result(
            "claim",
            "status_update_on_missing_case_not_found",
            status_update_on_missing_case_not_found(factory).await,
        ),
    ]
}

async fn claim<S: GateStorage>(storage: &S, case_id: u64, agent_id: u64) -> Result<(), String> {
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .insert_assignment(
            &mut snap,
            AssignmentRecord {
                case_id,
                agent_id,
                assigned_at: t0(),
            },
        )
        .await
        .map_err(|e| format!("assign: {e}"))?;
    storage
        .update_case_status(
            &mut snap,
            case_id,
            CaseStatus::Open,
            CaseStatus::InProgress,
            t0(),
        )
        .await
        .map_err(|e| format!("update status: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))
}

async fn second_assignment_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: GateStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let a = seed_user(&storage, "a@example.com", Role::Agent).await?;
    let b = seed_user(&storage, "b@example.com", Role::Agent).await?;
    let case = seed_case(&storage, 1).await?;
    claim(&storage, case.id, a.id).await?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let result = storage
        .insert_assignment(
            &mut snap,
            AssignmentRecord {
                case_id: case.id,
                agent_id: b.id,
                assigned_at: t0(),
            },
        )
        .await;
    let _ = storage.abort_snapshot(snap).await;
    match result {
        Err(StorageError::AlreadyAssigned { case_id }) if case_id == case.id => {}
        other => return Err(format!("expected AlreadyAssigned, got {other:?}")),
    }
    let assignment = storage
        .get_assignment(case.id)
        .await
        .map_err(|e| format!("get_assignment: {e}"))?
        .ok_or("assignment missing")?;
    check(assignment.agent_id == a.id, "assignment was overwritten")
}

async fn active_count_tracks_in_progress_only<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: GateStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let agent = seed_user(&storage, "agent@example.com", Role::Agent).await?;
    let first = seed_case(&storage, 1).await?;
    let second = seed_case(&storage, 1).await?;
    claim(&storage, first.id, agent.id).await?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let active = storage
        .count_active_cases_for_agent(&mut snap, agent.id)
        .await
        .map_err(|e| format!("count: {e}"))?;
    check(active == 1, format!("expected 1 active case, got {active}"))?;
    storage
        .update_case_status(
            &mut snap,
            first.id,
            CaseStatus::InProgress,
            CaseStatus::Closed,
            t0(),
        )
        .await
        .map_err(|e| format!("close: {e}"))?;
    let active = storage
        .count_active_cases_for_agent(&mut snap, agent.id)
        .await
        .map_err(|e| format!("count: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;
    check(active == 0, format!("closed case still active ({active})"))?;

    claim(&storage, second.id, agent.id).await
}

async fn status_update_requires_expected_status<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: GateStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let case = seed_case(&storage, 1).await?;
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let result = storage
        .update_case_status(
            &mut snap,
            case.id,
            CaseStatus::InProgress,
            CaseStatus::Closed,
            t0(),
        )
        .await;
    let _ = storage.abort_snapshot(snap).await;
    match result {
        Err(StorageError::ConcurrentConflict { kind, .. }) if kind == "case" => Ok(()),
        other => Err(format!("expected ConcurrentConflict, got {other:?}")),
    }
}

async fn status_update_on_missing_case_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: GateStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let result = storage
        .update_case_status(&mut snap, 77, CaseStatus::Open, CaseStatus::Closed, t0())
        .await;
    let _ = storage.abort_snapshot(snap).await;
    match result {
        Err(StorageError::NotFound { .. }) => Ok(()),
        other => Err(format!("expected NotFound, got {other:?}")),
    }
}
