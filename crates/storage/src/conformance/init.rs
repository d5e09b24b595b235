use std::future::Future;

use super::{check, seed_case, seed_questions, seed_user, t0, TestResult};
use crate::record::{CaseStatus, NewUser, QuestionCategory, Role};
use crate::{GateStorage, StorageError};

pub(super) async fn run_init_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: GateStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "init",
            "inserted_user_readable",
            inserted_user_readable(factory).await,
        ),
        TestResult::from_result(
            "init",
            "duplicate_email_rejected",
            duplicate_email_rejected(factory).await,
        ),
        TestResult::from_result(
            "init",
            "new_case_starts_open",
            new_case_starts_open(factory).await,
        ),
        TestResult::from_result(
            "init",
            "case_ids_are_distinct",
            case_ids_are_distinct(factory).await,
        ),
        TestResult::from_result(
            "init",
            "missing_rows_report_not_found",
            missing_rows_report_not_found(factory).await,
        ),
        TestResult::from_result(
            "init",
            "questions_listed_by_category",
            questions_listed_by_category(factory).await,
        ),
        TestResult::from_result(
            "init",
            "risk_adjustment_accumulates",
            risk_adjustment_accumulates(factory).await,
        ),
    ]
}

async fn inserted_user_readable<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: GateStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let user = seed_user(&storage, "ana@example.com", Role::Agent).await?;
    let read = storage
        .get_user(user.id)
        .await
        .map_err(|e| format!("get_user: {e}"))?;
    check(read.email == "ana@example.com", "email mismatch")?;
    check(read.role == Role::Agent, format!("role was {}", read.role))?;
    check(read.risk_score == 0, "risk score should start at 0")?;
    check(read.created_at == t0(), "created_at not preserved")
}

async fn duplicate_email_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: GateStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_user(&storage, "dup@example.com", Role::User).await?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let result = storage
        .insert_user(
            &mut snap,
            NewUser {
                email: "dup@example.com".to_string(),
                role: Role::User,
                risk_score: 0,
                credential_digest: String::new(),
                created_at: t0(),
            },
        )
        .await;
    let _ = storage.abort_snapshot(snap).await;
    match result {
        Err(StorageError::Duplicate { .. }) => Ok(()),
        other => Err(format!("expected Duplicate, got {other:?}")),
    }
}

async fn new_case_starts_open<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: GateStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let owner = seed_user(&storage, "owner@example.com", Role::User).await?;
    let case = seed_case(&storage, owner.id).await?;
    let read = storage
        .get_case(case.id)
        .await
        .map_err(|e| format!("get_case: {e}"))?;
    check(read.status == CaseStatus::Open, format!("status {}", read.status))?;
    check(read.owner_id == owner.id, "owner not preserved")?;
    let open = storage
        .list_cases(Some(CaseStatus::Open))
        .await
        .map_err(|e| format!("list_cases: {e}"))?;
    check(open.len() == 1, format!("expected 1 open case, got {}", open.len()))
}

async fn case_ids_are_distinct<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: GateStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let a = seed_case(&storage, 1).await?;
    let b = seed_case(&storage, 1).await?;
    check(a.id != b.id, "two cases share an id")?;
    let all = storage
        .list_cases(None)
        .await
        .map_err(|e| format!("list_cases: {e}"))?;
    let ids: Vec<u64> = all.iter().map(|c| c.id).collect();
    check(ids == vec![a.id, b.id], format!("cases not ordered by id: {ids:?}"))
}

async fn missing_rows_report_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: GateStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    match storage.get_case(404).await {
        Err(StorageError::NotFound { kind, .. }) if kind == "case" => {}
        other => return Err(format!("get_case: expected NotFound, got {other:?}")),
    }
    match storage.get_user(404).await {
        Err(StorageError::NotFound { .. }) => {}
        other => return Err(format!("get_user: expected NotFound, got {other:?}")),
    }
    match storage.get_session("nope").await {
        Err(StorageError::NotFound { .. }) => Ok(()),
        other => Err(format!("get_session: expected NotFound, got {other:?}")),
    }
}

async fn questions_listed_by_category<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: GateStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_questions(&storage).await?;
    seed_questions(&storage).await?;
    for category in QuestionCategory::ALL {
        let list = storage
            .list_questions(category)
            .await
            .map_err(|e| format!("list_questions: {e}"))?;
        check(
            list.len() == 2,
            format!("{category}: expected 2 questions, got {}", list.len()),
        )?;
        check(
            list.iter().all(|q| q.category == category),
            "question listed under the wrong category",
        )?;
    }
    Ok(())
}

async fn risk_adjustment_accumulates<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: GateStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let user = seed_user(&storage, "risky@example.com", Role::User).await?;
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .adjust_risk_score(&mut snap, user.id, 10)
        .await
        .map_err(|e| format!("adjust: {e}"))?;
    let score = storage
        .adjust_risk_score(&mut snap, user.id, 5)
        .await
        .map_err(|e| format!("adjust: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;
    check(score == 15, format!("expected 15, got {score}"))?;
    let read = storage
        .get_user(user.id)
        .await
        .map_err(|e| format!("get_user: {e}"))?;
    check(read.risk_score == 15, "committed risk score not visible")
}
