//! Real-concurrency tests: `tokio::spawn` tasks racing against the
//! conditional writes, as opposed to the sequential checks in the other
//! categories.

use std::future::Future;
use std::sync::Arc;

use time::Duration;

use super::{check, seed_case, seed_user, t0, TestResult};
use crate::record::{ActionKind, AssignmentRecord, CaseStatus, Grantee, NewPrivilege, Role};
use crate::{GateStorage, StorageError};

/// Number of concurrent tasks to spawn in each test.
const N: usize = 10;

pub(super) async fn run_concurrent_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: GateStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "concurrent",
            "racing_claims_exactly_one_wins",
            racing_claims_exactly_one_wins(factory).await,
        ),
        TestResult::from_result(
            "concurrent",
            "racing_redemptions_exactly_one_wins",
            racing_redemptions_exactly_one_wins(factory).await,
        ),
        TestResult::from_result(
            "concurrent",
            "claims_on_different_cases_all_succeed",
            claims_on_different_cases_all_succeed(factory).await,
        ),
    ]
}

async fn tally(
    handles: Vec<tokio::task::JoinHandle<Result<bool, StorageError>>>,
) -> Result<(usize, usize), String> {
    let mut winners = 0usize;
    let mut losers = 0usize;
    for handle in handles {
        let won = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e| format!("storage error: {e}"))?;
        if won {
            winners += 1;
        } else {
            losers += 1;
        }
    }
    Ok((winners, losers))
}

/// N distinct agents try to claim the same OPEN case. Each task checks the
/// status under its snapshot and then inserts the assignment; exactly one
/// may commit.
async fn racing_claims_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: GateStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    let case = seed_case(storage.as_ref(), 1).await?;
    let mut agents = Vec::new();
    for i in 0..N {
        let email = format!("agent{i}@example.com");
        agents.push(seed_user(storage.as_ref(), &email, Role::Agent).await?);
    }

    let mut handles = Vec::new();
    for agent in agents {
        let s = storage.clone();
        let case_id = case.id;
        handles.push(tokio::spawn(async move {
            let mut snap = s.begin_snapshot().await?;
            let current = s.get_case_for_update(&mut snap, case_id).await?;
            if current.status != CaseStatus::Open {
                s.abort_snapshot(snap).await?;
                return Ok(false);
            }
            let assigned = s
                .insert_assignment(
                    &mut snap,
                    AssignmentRecord {
                        case_id,
                        agent_id: agent.id,
                        assigned_at: t0(),
                    },
                )
                .await;
            let result = match assigned {
                Ok(()) => {
                    s.update_case_status(
                        &mut snap,
                        case_id,
                        CaseStatus::Open,
                        CaseStatus::InProgress,
                        t0(),
                    )
                    .await
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    s.commit_snapshot(snap).await?;
                    Ok(true)
                }
                Err(StorageError::AlreadyAssigned { .. })
                | Err(StorageError::ConcurrentConflict { .. }) => {
                    s.abort_snapshot(snap).await?;
                    Ok(false)
                }
                Err(e) => {
                    let _ = s.abort_snapshot(snap).await;
                    Err(e)
                }
            }
        }));
    }

    let (winners, losers) = tally(handles).await?;
    check(winners == 1, format!("expected exactly 1 winner, got {winners}"))?;
    check(losers == N - 1, format!("expected {} losers, got {losers}", N - 1))?;

    let read = storage
        .get_case(case.id)
        .await
        .map_err(|e| format!("get_case: {e}"))?;
    check(
        read.status == CaseStatus::InProgress,
        format!("final status {}", read.status),
    )
}

/// N tasks race to redeem the same single-use grant.
async fn racing_redemptions_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: GateStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    let case = seed_case(storage.as_ref(), 1).await?;
    {
        let mut snap = storage
            .begin_snapshot()
            .await
            .map_err(|e| format!("begin: {e}"))?;
        storage
            .insert_privilege(
                &mut snap,
                NewPrivilege {
                    grantee: Grantee::Agent(2),
                    case_id: case.id,
                    action: ActionKind::SendResetLink,
                    token: "race-token".to_string(),
                    granted_at: t0(),
                    expires_at: t0() + Duration::minutes(5),
                },
            )
            .await
            .map_err(|e| format!("insert_privilege: {e}"))?;
        storage
            .commit_snapshot(snap)
            .await
            .map_err(|e| format!("commit: {e}"))?;
    }

    let mut handles = Vec::new();
    for _ in 0..N {
        let s = storage.clone();
        let case_id = case.id;
        handles.push(tokio::spawn(async move {
            let mut snap = s.begin_snapshot().await?;
            let found = s
                .find_redeemable_privilege(
                    &mut snap,
                    Grantee::Agent(2),
                    case_id,
                    ActionKind::SendResetLink,
                    t0() + Duration::minutes(1),
                )
                .await?;
            let Some(privilege) = found else {
                s.abort_snapshot(snap).await?;
                return Ok(false);
            };
            match s.mark_privilege_used(&mut snap, privilege.id).await {
                Ok(()) => {
                    s.commit_snapshot(snap).await?;
                    Ok(true)
                }
                Err(StorageError::ConcurrentConflict { .. }) => {
                    s.abort_snapshot(snap).await?;
                    Ok(false)
                }
                Err(e) => {
                    let _ = s.abort_snapshot(snap).await;
                    Err(e)
                }
            }
        }));
    }

    let (winners, losers) = tally(handles).await?;
    check(winners == 1, format!("expected exactly 1 winner, got {winners}"))?;
    check(losers == N - 1, format!("expected {} losers, got {losers}", N - 1))
}

/// Claims on disjoint cases must not interfere with each other.
async fn claims_on_different_cases_all_succeed<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: GateStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    let mut pairs = Vec::new();
    for i in 0..N {
        let agent =
            seed_user(storage.as_ref(), &format!("solo{i}@example.com"), Role::Agent).await?;
        let case = seed_case(storage.as_ref(), 1).await?;
        pairs.push((agent.id, case.id));
    }

    let mut handles = Vec::new();
    for (agent_id, case_id) in pairs {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let mut snap = s.begin_snapshot().await?;
            s.insert_assignment(
                &mut snap,
                AssignmentRecord {
                    case_id,
                    agent_id,
                    assigned_at: t0(),
                },
            )
            .await?;
            s.update_case_status(
                &mut snap,
                case_id,
                CaseStatus::Open,
                CaseStatus::InProgress,
                t0(),
            )
            .await?;
            s.commit_snapshot(snap).await?;
            Ok::<bool, StorageError>(true)
        }));
    }

    let (winners, _) = tally(handles).await?;
    check(winners == N, format!("expected {N} successful claims, got {winners}"))?;
    let active = storage
        .list_cases(Some(CaseStatus::InProgress))
        .await
        .map_err(|e| format!("list_cases: {e}"))?;
    check(active.len() == N, format!("expected {N} cases in progress"))
}
