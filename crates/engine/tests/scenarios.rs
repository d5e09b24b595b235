//! End-to-end walks through a case from claim to redemption.

mod common;

use common::harness;
use jitgate_engine::{ConflictReason, GateError};
use jitgate_storage::{
    ActionKind, AuditAction, AuditResult, CaseStatus, GateStorage, Grantee, SessionStatus,
};

#[tokio::test]
async fn claim_verify_and_redeem() {
    let h = harness().await;

    h.gate.claims.claim(h.agent_a, h.case_id).await.unwrap();
    assert_eq!(
        h.gate.storage().get_case(h.case_id).await.unwrap().status,
        CaseStatus::InProgress
    );
    let err = h.gate.claims.claim(h.agent_b, h.case_id).await.unwrap_err();
    assert!(matches!(err, GateError::Conflict(ConflictReason::AlreadyClaimed)));

    let link = h
        .gate
        .verification
        .start(h.agent_a, h.case_id)
        .await
        .unwrap();
    let session = common::session_id(&link.verification_url);
    assert_eq!(
        h.gate.storage().get_session(&session).await.unwrap().status,
        SessionStatus::Pending
    );

    let questions = h.gate.verification.get_challenge(&session).await.unwrap();
    assert_eq!(questions.len(), 3);
    let outcome = h
        .gate
        .verification
        .submit_answers(&session, &h.correct_answers(&questions))
        .await
        .unwrap();
    assert!(outcome.passed);
    assert_eq!(
        h.gate.storage().get_session(&session).await.unwrap().status,
        SessionStatus::Passed
    );

    let grants = h
        .gate
        .storage()
        .list_privileges_for_case(h.case_id)
        .await
        .unwrap();
    assert_eq!(grants.len(), 1);
    assert_eq!(grants[0].grantee, Grantee::Agent(h.agent_a.id));

    h.gate
        .ledger
        .redeem(h.agent_a, h.case_id, ActionKind::SendResetLink)
        .await
        .unwrap();
    let grant = h
        .gate
        .storage()
        .list_privileges_for_case(h.case_id)
        .await
        .unwrap()
        .into_iter()
        .find(|p| p.id == grants[0].id)
        .unwrap();
    assert!(grant.used);

    let err = h
        .gate
        .ledger
        .redeem(h.agent_a, h.case_id, ActionKind::SendResetLink)
        .await
        .unwrap_err();
    assert!(matches!(err, GateError::AccessDenied));

    let actions: Vec<(AuditAction, AuditResult)> = h
        .gate
        .audit
        .by_case(h.case_id)
        .await
        .unwrap()
        .into_iter()
        .map(|r| (r.action, r.result))
        .collect();
    assert_eq!(
        actions,
        vec![
            (AuditAction::OpenCase, AuditResult::Success),
            (AuditAction::ClaimCase, AuditResult::Success),
            (AuditAction::ClaimCase, AuditResult::Denied),
            (AuditAction::StartVerification, AuditResult::Success),
            (AuditAction::GetChallenge, AuditResult::Success),
            (AuditAction::VerificationSuccess, AuditResult::Passed),
            (AuditAction::SendResetLink, AuditResult::Success),
            (AuditAction::SendResetLink, AuditResult::Denied),
        ]
    );
}

#[tokio::test]
async fn three_strikes_then_locked() {
    let h = harness().await;
    let session = h.claimed_session().await;
    let questions = h.gate.verification.get_challenge(&session).await.unwrap();
    let wrong = h.one_wrong_answer(&questions);

    let first = h
        .gate
        .verification
        .submit_answers(&session, &wrong)
        .await
        .unwrap();
    assert!(!first.passed);
    assert_eq!(first.status, SessionStatus::Pending);
    assert_eq!(first.message, "2 attempts remaining");

    for _ in 0..2 {
        h.gate
            .verification
            .submit_answers(&session, &wrong)
            .await
            .unwrap();
    }
    assert_eq!(
        h.gate.storage().get_session(&session).await.unwrap().status,
        SessionStatus::Failed
    );

    let err = h
        .gate
        .verification
        .submit_answers(&session, &h.correct_answers(&questions))
        .await
        .unwrap_err();
    assert!(matches!(err, GateError::InvalidSession));
}
