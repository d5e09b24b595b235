use std::future::Future;

use super::{check, seed_case, seed_user, t0, TestResult};
use crate::record::{AssignmentRecord, CaseStatus, Role};
use crate::{GateStorage, StorageError};

pub(super) async fn run_snapshot_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: GateStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "snapshot",
            "committed_case_visible",
            committed_case_visible(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "aborted_case_invisible",
            aborted_case_invisible(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "dropped_snapshot_rolls_back",
            dropped_snapshot_rolls_back(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "abort_discards_every_write",
            abort_discards_every_write(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "writes_visible_within_snapshot",
            writes_visible_within_snapshot(factory).await,
        ),
    ]
}

async fn committed_case_visible<S, F, Fut>(factory: &F) -> Result<(), String>
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
    let case = storage
        .insert_case(&mut snap, 1, "visible", t0())
        .await
        .map_err(|e| format!("insert: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;
    let read = storage
        .get_case(case.id)
        .await
        .map_err(|e| format!("get_case after commit: {e}"))?;
    check(read.subject == "visible", "subject mismatch")
}

async fn aborted_case_invisible<S, F, Fut>(factory: &F) -> Result<(), String>
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
    storage
        .insert_case(&mut snap, 1, "ghost", t0())
        .await
        .map_err(|e| format!("insert: {e}"))?;
    storage
        .abort_snapshot(snap)
        .await
        .map_err(|e| format!("abort: {e}"))?;
    let cases = storage
        .list_cases(None)
        .await
        .map_err(|e| format!("list_cases: {e}"))?;
    check(cases.is_empty(), "aborted case became visible")
}

async fn dropped_snapshot_rolls_back<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: GateStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    {
        let mut snap = storage
            .begin_snapshot()
            .await
            .map_err(|e| format!("begin: {e}"))?;
        storage
            .insert_case(&mut snap, 1, "dropped", t0())
            .await
            .map_err(|e| format!("insert: {e}"))?;
    }
    let cases = storage
        .list_cases(None)
        .await
        .map_err(|e| format!("list_cases: {e}"))?;
    check(cases.is_empty(), "dropped snapshot leaked a case")?;

    // The store must still accept new work.
    let case = seed_case(&storage, 1).await?;
    check(case.status == CaseStatus::Open, "store unusable after drop")
}

async fn abort_discards_every_write<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: GateStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let agent = seed_user(&storage, "agent@example.com", Role::Agent).await?;
    let case = seed_case(&storage, 1).await?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .insert_assignment(
            &mut snap,
            AssignmentRecord {
                case_id: case.id,
                agent_id: agent.id,
                assigned_at: t0(),
            },
        )
        .await
        .map_err(|e| format!("assign: {e}"))?;
    storage
        .update_case_status(
            &mut snap,
            case.id,
            CaseStatus::Open,
            CaseStatus::InProgress,
            t0(),
        )
        .await
        .map_err(|e| format!("update status: {e}"))?;
    storage
        .adjust_risk_score(&mut snap, agent.id, 50)
        .await
        .map_err(|e| format!("adjust: {e}"))?;
    storage
        .abort_snapshot(snap)
        .await
        .map_err(|e| format!("abort: {e}"))?;

    let read = storage
        .get_case(case.id)
        .await
        .map_err(|e| format!("get_case: {e}"))?;
    check(read.status == CaseStatus::Open, "status change survived abort")?;
    let assignment = storage
        .get_assignment(case.id)
        .await
        .map_err(|e| format!("get_assignment: {e}"))?;
    check(assignment.is_none(), "assignment survived abort")?;
    let user = storage
        .get_user(agent.id)
        .await
        .map_err(|e| format!("get_user: {e}"))?;
    check(user.risk_score == 0, "risk change survived abort")
}

async fn writes_visible_within_snapshot<S, F, Fut>(factory: &F) -> Result<(), String>
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
    storage
        .update_case_status(
            &mut snap,
            case.id,
            CaseStatus::Open,
            CaseStatus::Closed,
            t0(),
        )
        .await
        .map_err(|e| format!("update status: {e}"))?;
    let read = storage
        .get_case_for_update(&mut snap, case.id)
        .await
        .map_err(|e| format!("get_case_for_update: {e}"))?;
    let second = storage
        .update_case_status(
            &mut snap,
            case.id,
            CaseStatus::Open,
            CaseStatus::InProgress,
            t0(),
        )
        .await;
    storage
        .abort_snapshot(snap)
        .await
        .map_err(|e| format!("abort: {e}"))?;
    check(
        read.status == CaseStatus::Closed,
        "own write not visible inside snapshot",
    )?;
    match second {
        Err(StorageError::ConcurrentConflict { .. }) => Ok(()),
        other => Err(format!("stale compare-and-set should conflict, got {other:?}")),
    }
}
