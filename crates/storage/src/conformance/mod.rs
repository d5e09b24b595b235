//! Conformance test suite for `GateStorage` implementations.
//!
//! Any backend can run this suite to check that it honours the contract the
//! engine relies on. The suite covers:
//!
//! - **Initialization**: user, case and question creation, duplicate detection
//! - **Snapshot isolation**: aborted and dropped snapshots leave no trace
//! - **Claims**: assignment uniqueness, case status compare-and-set
//! - **Sessions**: slot order, attempt counter compare-and-set, rate window
//! - **Privileges**: redeemable lookup, single use, owner-bound tokens
//! - **Audit**: append order and per-case filtering
//! - **Concurrency**: racing claims and redemptions have exactly one winner
//!
//! # Usage
//!
//! ```ignore
//! use jitgate_storage::conformance::run_conformance_suite;
//!
//! #[tokio::test]
//! async fn sqlite_conformance() {
//!     let report = run_conformance_suite(|| async {
//!         SqliteStorage::open_in_memory().unwrap()
//!     }).await;
//!     assert!(report.failed == 0, "{report}");
//! }
//! ```

mod audit;
mod claim;
mod concurrent;
mod init;
mod privilege;
mod session;
mod snapshot;

use std::fmt;
use std::future::Future;

use time::macros::datetime;
use time::OffsetDateTime;

use crate::record::{
    CaseRecord, NewQuestion, NewUser, QuestionCategory, QuestionRecord, Role, UserRecord,
};
use crate::GateStorage;

/// Result of a single conformance test.
#[derive(Debug, Clone)]
pub struct TestResult {
    /// Test category (e.g. "init", "claim", "privilege").
    pub category: String,
    pub name: String,
    pub passed: bool,
    /// Error message if the test failed.
    pub message: Option<String>,
}

impl TestResult {
    fn from_result(category: &str, name: &str, result: Result<(), String>) -> Self {
        let (passed, message) = match result {
            Ok(()) => (true, None),
            Err(msg) => (false, Some(msg)),
        };
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed,
            message,
        }
    }
}

/// Aggregated report from a full conformance suite run.
#[derive(Debug, Clone)]
pub struct ConformanceReport {
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
}

impl fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Conformance: {}/{} passed ({} failed)",
            self.passed, self.total, self.failed
        )?;
        for r in self.results.iter().filter(|r| !r.passed) {
            writeln!(
                f,
                "  FAIL [{}/{}]: {}",
                r.category,
                r.name,
                r.message.as_deref().unwrap_or("(no message)")
            )?;
        }
        Ok(())
    }
}

/// Run the full conformance suite against a storage backend.
///
/// `factory` is called once per test and must return a fresh, empty store.
pub async fn run_conformance_suite<S, F, Fut>(factory: F) -> ConformanceReport
where
    S: GateStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.extend(init::run_init_tests(&factory).await);
    results.extend(snapshot::run_snapshot_tests(&factory).await);
    results.extend(claim::run_claim_tests(&factory).await);
    results.extend(session::run_session_tests(&factory).await);
    results.extend(privilege::run_privilege_tests(&factory).await);
    results.extend(audit::run_audit_tests(&factory).await);
    results.extend(concurrent::run_concurrent_tests(&factory).await);

    let passed = results.iter().filter(|r| r.passed).count();
    let total = results.len();

    ConformanceReport {
        results,
        passed,
        failed: total - passed,
        total,
    }
}

// ── Fixtures ─────────────────────────────────────────────────────────────────

fn t0() -> OffsetDateTime {
    datetime!(2026-03-01 09:00 UTC)
}

fn check(cond: bool, msg: impl Into<String>) -> Result<(), String> {
    if cond {
        Ok(())
    } else {
        Err(msg.into())
    }
}

async fn seed_user<S: GateStorage>(
    storage: &S,
    email: &str,
    role: Role,
) -> Result<UserRecord, String> {
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let user = storage
        .insert_user(
            &mut snap,
            NewUser {
                email: email.to_string(),
                role,
                risk_score: 0,
                credential_digest: "sha256$seed$00".to_string(),
                created_at: t0(),
            },
        )
        .await
        .map_err(|e| format!("insert user {email}: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit user: {e}"))?;
    Ok(user)
}

async fn seed_case<S: GateStorage>(storage: &S, owner_id: u64) -> Result<CaseRecord, String> {
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let case = storage
        .insert_case(&mut snap, owner_id, "locked out of account", t0())
        .await
        .map_err(|e| format!("insert case: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit case: {e}"))?;
    Ok(case)
}

/// One question per category, in `QuestionCategory::ALL` order.
async fn seed_questions<S: GateStorage>(storage: &S) -> Result<Vec<QuestionRecord>, String> {
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let mut out = Vec::new();
    for category in QuestionCategory::ALL {
        let q = storage
            .insert_question(
                &mut snap,
                NewQuestion {
                    category,
                    prompt: format!("{category} prompt"),
                    answer_digest: format!("digest-{category}"),
                },
            )
            .await
            .map_err(|e| format!("insert question: {e}"))?;
        out.push(q);
    }
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit questions: {e}"))?;
    Ok(out)
}
