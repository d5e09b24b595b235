use std::future::Future;

use time::Duration;

use super::{check, seed_case, seed_questions, t0, TestResult};
use crate::record::{SessionRecord, SessionStatus};
use crate::{GateStorage, StorageError};

pub(super) async fn run_session_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: GateStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "session",
            "slots_keep_insertion_order",
            slots_keep_insertion_order(factory).await,
        ),
        TestResult::from_result(
            "session",
            "unknown_question_rejected",
            unknown_question_rejected(factory).await,
        ),
        TestResult::from_result(
            "session",
            "progress_requires_expected_attempts",
            progress_requires_expected_attempts(factory).await,
        ),
        TestResult::from_result(
            "session",
            "terminal_session_rejects_progress",
            terminal_session_rejects_progress(factory).await,
        ),
        TestResult::from_result(
            "session",
            "rate_window_is_exclusive",
            rate_window_is_exclusive(factory).await,
        ),
    ]
}

fn pending(id: &str, case_id: u64, owner_id: u64) -> SessionRecord {
    SessionRecord {
        id: id.to_string(),
        case_id,
        owner_id,
        status: SessionStatus::Pending,
        attempt_count: 0,
        expires_at: t0() + Duration::minutes(15),
        created_at: t0(),
    }
}

async fn open_session<S: GateStorage>(
    storage: &S,
    session: SessionRecord,
    question_ids: &[u64],
) -> Result<(), String> {
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .insert_session(&mut snap, session, question_ids)
        .await
        .map_err(|e| format!("insert_session: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))
}

async fn slots_keep_insertion_order<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: GateStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let case = seed_case(&storage, 1).await?;
    let questions = seed_questions(&storage).await?;
    let reversed: Vec<u64> = questions.iter().rev().map(|q| q.id).collect();
    open_session(&storage, pending("s-order", case.id, 1), &reversed).await?;

    let bound = storage
        .session_questions("s-order")
        .await
        .map_err(|e| format!("session_questions: {e}"))?;
    let ids: Vec<u64> = bound.iter().map(|q| q.id).collect();
    check(ids == reversed, format!("slot order lost: {ids:?}"))?;
    let session = storage
        .get_session("s-order")
        .await
        .map_err(|e| format!("get_session: {e}"))?;
    check(session.status == SessionStatus::Pending, "session not pending")?;
    check(session.attempt_count == 0, "attempts should start at 0")
}

async fn unknown_question_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
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
        .insert_session(&mut snap, pending("s-bad", case.id, 1), &[999])
        .await;
    let _ = storage.abort_snapshot(snap).await;
    match result {
        Err(StorageError::NotFound { kind, .. }) if kind == "question" => Ok(()),
        other => Err(format!("expected question NotFound, got {other:?}")),
    }
}

async fn progress_requires_expected_attempts<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: GateStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let case = seed_case(&storage, 1).await?;
    let ids: Vec<u64> = seed_questions(&storage).await?.iter().map(|q| q.id).collect();
    open_session(&storage, pending("s-cas", case.id, 1), &ids).await?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .update_session_progress(&mut snap, "s-cas", 0, 1, SessionStatus::Pending)
        .await
        .map_err(|e| format!("first increment: {e}"))?;
    let stale = storage
        .update_session_progress(&mut snap, "s-cas", 0, 1, SessionStatus::Pending)
        .await;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;
    match stale {
        Err(StorageError::ConcurrentConflict { .. }) => {}
        other => return Err(format!("stale counter should conflict, got {other:?}")),
    }
    let session = storage
        .get_session("s-cas")
        .await
        .map_err(|e| format!("get_session: {e}"))?;
    check(
        session.attempt_count == 1,
        format!("expected 1 attempt, got {}", session.attempt_count),
    )
}

async fn terminal_session_rejects_progress<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: GateStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let case = seed_case(&storage, 1).await?;
    let ids: Vec<u64> = seed_questions(&storage).await?.iter().map(|q| q.id).collect();
    open_session(&storage, pending("s-done", case.id, 1), &ids).await?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .update_session_progress(&mut snap, "s-done", 0, 0, SessionStatus::Passed)
        .await
        .map_err(|e| format!("pass: {e}"))?;
    let after = storage
        .update_session_progress(&mut snap, "s-done", 0, 1, SessionStatus::Failed)
        .await;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;
    match after {
        Err(StorageError::ConcurrentConflict { .. }) => {}
        other => return Err(format!("passed session accepted progress: {other:?}")),
    }
    let session = storage
        .get_session("s-done")
        .await
        .map_err(|e| format!("get_session: {e}"))?;
    check(session.status == SessionStatus::Passed, "terminal status overwritten")
}

async fn rate_window_is_exclusive<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: GateStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let case = seed_case(&storage, 1).await?;
    let ids: Vec<u64> = seed_questions(&storage).await?.iter().map(|q| q.id).collect();

    let mut old = pending("s-old", case.id, 7);
    old.created_at = t0() - Duration::hours(24);
    open_session(&storage, old, &ids).await?;
    open_session(&storage, pending("s-new", case.id, 7), &ids).await?;
    open_session(&storage, pending("s-other", case.id, 8), &ids).await?;

    let since = t0() - Duration::hours(24);
    let count = storage
        .count_sessions_since(7, since)
        .await
        .map_err(|e| format!("count_sessions_since: {e}"))?;
    check(count == 1, format!("expected 1 session in window, got {count}"))
}
