use std::future::Future;

use time::Duration;

use super::{check, seed_case, seed_user, t0, TestResult};
use crate::record::{ActionKind, Grantee, NewPrivilege, PrivilegeRecord, Role};
use crate::{GateStorage, StorageError};

pub(super) async fn run_privilege_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: GateStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "privilege",
            "redeemable_matches_grantee_case_and_action",
            redeemable_matches_grantee_case_and_action(factory).await,
        ),
        TestResult::from_result(
            "privilege",
            "expired_privilege_not_redeemable",
            expired_privilege_not_redeemable(factory).await,
        ),
        TestResult::from_result(
            "privilege",
            "used_privilege_not_redeemable",
            used_privilege_not_redeemable(factory).await,
        ),
        TestResult::from_result(
            "privilege",
            "second_mark_used_conflicts",
            second_mark_used_conflicts(factory).await,
        ),
        TestResult::from_result(
            "privilege",
            "owner_token_found_by_token",
            owner_token_found_by_token(factory).await,
        ),
        TestResult::from_result(
            "privilege",
            "most_recent_grant_preferred",
            most_recent_grant_preferred(factory).await,
        ),
        TestResult::from_result(
            "privilege",
            "owner_grant_never_matches_an_agent",
            owner_grant_never_matches_an_agent(factory).await,
        ),
    ]
}

fn grant(grantee: Grantee, case_id: u64, token: &str, ttl: Duration) -> NewPrivilege {
    NewPrivilege {
        grantee,
        case_id,
        action: ActionKind::SendResetLink,
        token: token.to_string(),
        granted_at: t0(),
        expires_at: t0() + ttl,
    }
}

async fn insert<S: GateStorage>(
    storage: &S,
    privilege: NewPrivilege,
) -> Result<PrivilegeRecord, String> {
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let record = storage
        .insert_privilege(&mut snap, privilege)
        .await
        .map_err(|e| format!("insert_privilege: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;
    Ok(record)
}

async fn lookup<S: GateStorage>(
    storage: &S,
    grantee: Grantee,
    case_id: u64,
    action: ActionKind,
    at: time::OffsetDateTime,
) -> Result<Option<PrivilegeRecord>, String> {
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let found = storage
        .find_redeemable_privilege(&mut snap, grantee, case_id, action, at)
        .await
        .map_err(|e| format!("find_redeemable_privilege: {e}"));
    let _ = storage.abort_snapshot(snap).await;
    found
}

async fn redeemable_matches_grantee_case_and_action<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: GateStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let agent = seed_user(&storage, "agent@example.com", Role::Agent).await?;
    let other = seed_user(&storage, "other@example.com", Role::Agent).await?;
    let case = seed_case(&storage, 1).await?;
    insert(
        &storage,
        grant(Grantee::Agent(agent.id), case.id, "tok-a", Duration::minutes(5)),
    )
    .await?;

    let now = t0() + Duration::minutes(1);
    let hit = lookup(&storage, Grantee::Agent(agent.id), case.id, ActionKind::SendResetLink, now)
        .await?;
    check(hit.is_some(), "grant not found for its agent")?;
    let wrong_agent =
        lookup(&storage, Grantee::Agent(other.id), case.id, ActionKind::SendResetLink, now)
            .await?;
    check(wrong_agent.is_none(), "grant visible to another agent")?;
    let wrong_case = lookup(
        &storage,
        Grantee::Agent(agent.id),
        case.id + 1,
        ActionKind::SendResetLink,
        now,
    )
    .await?;
    check(wrong_case.is_none(), "grant visible on another case")?;
    let wrong_action =
        lookup(&storage, Grantee::Agent(agent.id), case.id, ActionKind::ResetPassword, now)
            .await?;
    check(wrong_action.is_none(), "grant visible for another action")
}

async fn expired_privilege_not_redeemable<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: GateStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let case = seed_case(&storage, 1).await?;
    insert(
        &storage,
        grant(Grantee::Agent(2), case.id, "tok-exp", Duration::minutes(5)),
    )
    .await?;
    let at_deadline = lookup(
        &storage,
        Grantee::Agent(2),
        case.id,
        ActionKind::SendResetLink,
        t0() + Duration::minutes(5),
    )
    .await?;
    check(at_deadline.is_none(), "grant redeemable at its expiry instant")
}

async fn used_privilege_not_redeemable<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: GateStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let case = seed_case(&storage, 1).await?;
    let record = insert(
        &storage,
        grant(Grantee::Agent(2), case.id, "tok-used", Duration::minutes(5)),
    )
    .await?;
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .mark_privilege_used(&mut snap, record.id)
        .await
        .map_err(|e| format!("mark used: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let found = lookup(&storage, Grantee::Agent(2), case.id, ActionKind::SendResetLink, t0())
        .await?;
    check(found.is_none(), "used grant still redeemable")?;
    let listed = storage
        .list_privileges_for_case(case.id)
        .await
        .map_err(|e| format!("list_privileges_for_case: {e}"))?;
    check(
        listed.len() == 1 && listed[0].used,
        "used flag not persisted",
    )
}

async fn second_mark_used_conflicts<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: GateStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let case = seed_case(&storage, 1).await?;
    let record = insert(
        &storage,
        grant(Grantee::Agent(2), case.id, "tok-twice", Duration::minutes(5)),
    )
    .await?;
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .mark_privilege_used(&mut snap, record.id)
        .await
        .map_err(|e| format!("first mark: {e}"))?;
    let second = storage.mark_privilege_used(&mut snap, record.id).await;
    let missing = storage.mark_privilege_used(&mut snap, record.id + 100).await;
    let _ = storage.abort_snapshot(snap).await;
    match second {
        Err(StorageError::ConcurrentConflict { .. }) => {}
        other => return Err(format!("expected ConcurrentConflict, got {other:?}")),
    }
    match missing {
        Err(StorageError::NotFound { .. }) => Ok(()),
        other => Err(format!("expected NotFound, got {other:?}")),
    }
}

async fn owner_token_found_by_token<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: GateStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let case = seed_case(&storage, 1).await?;
    let mut owner_grant = grant(Grantee::Owner, case.id, "reset-xyz", Duration::minutes(15));
    owner_grant.action = ActionKind::ResetPassword;
    insert(&storage, owner_grant).await?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let found = storage
        .find_privilege_by_token(&mut snap, "reset-xyz")
        .await
        .map_err(|e| format!("find_privilege_by_token: {e}"))?;
    let absent = storage
        .find_privilege_by_token(&mut snap, "reset-unknown")
        .await
        .map_err(|e| format!("find_privilege_by_token: {e}"))?;
    let _ = storage.abort_snapshot(snap).await;

    let found = found.ok_or("owner token not found")?;
    check(found.grantee == Grantee::Owner, "grantee not preserved")?;
    check(found.action == ActionKind::ResetPassword, "action not preserved")?;
    check(absent.is_none(), "unknown token resolved")
}

async fn most_recent_grant_preferred<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: GateStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let case = seed_case(&storage, 1).await?;
    insert(
        &storage,
        grant(Grantee::Agent(2), case.id, "tok-first", Duration::minutes(5)),
    )
    .await?;
    let second = insert(
        &storage,
        grant(Grantee::Agent(2), case.id, "tok-second", Duration::minutes(5)),
    )
    .await?;
    let found = lookup(&storage, Grantee::Agent(2), case.id, ActionKind::SendResetLink, t0())
        .await?
        .ok_or("no redeemable grant")?;
    check(
        found.id == second.id,
        format!("expected grant {}, got {}", second.id, found.id),
    )
}

async fn owner_grant_never_matches_an_agent<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: GateStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let case = seed_case(&storage, 1).await?;
    let mut owner_grant = grant(Grantee::Owner, case.id, "reset-owner", Duration::minutes(15));
    owner_grant.action = ActionKind::ResetPassword;
    insert(&storage, owner_grant).await?;

    for agent_id in [0, 1, 2] {
        let found = lookup(
            &storage,
            Grantee::Agent(agent_id),
            case.id,
            ActionKind::ResetPassword,
            t0(),
        )
        .await?;
        check(
            found.is_none(),
            format!("owner-bound grant matched agent {agent_id}"),
        )?;
    }
    let owner = lookup(&storage, Grantee::Owner, case.id, ActionKind::ResetPassword, t0())
        .await?
        .ok_or("owner-bound grant not found for the owner")?;
    check(owner.grantee == Grantee::Owner, "grantee not preserved")
}
