mod common;

use std::sync::Arc;

use common::{harness, harness_on, harness_with, OWNER_PASSWORD};
use jitgate_engine::{crypto, Actor, GateConfig, GateError, Redemption};
use jitgate_storage::{
    ActionKind, AuditAction, AuditResult, GateStorage, Grantee, MemoryStorage, SqliteStorage,
};
use time::Duration;

fn reset_token(redemption: &Redemption) -> String {
    match redemption {
        Redemption::ResetLink { reset_url, .. } => reset_url
            .split("token=")
            .nth(1)
            .unwrap()
            .to_string(),
        other => panic!("expected a reset link, got {other:?}"),
    }
}

#[tokio::test]
async fn grant_redeems_exactly_once() {
    let h = harness().await;
    h.passed_session().await;

    let redemption = h
        .gate
        .ledger
        .redeem(h.agent_a, h.case_id, ActionKind::SendResetLink)
        .await
        .unwrap();
    match &redemption {
        Redemption::ResetLink {
            reset_url,
            expires_at,
        } => {
            assert!(reset_url.starts_with("http://localhost:3000/reset-password?token="));
            assert!(*expires_at > common::start_time());
        }
        other => panic!("unexpected payload {other:?}"),
    }

    let err = h
        .gate
        .ledger
        .redeem(h.agent_a, h.case_id, ActionKind::SendResetLink)
        .await
        .unwrap_err();
    assert!(matches!(err, GateError::AccessDenied));

    let denial = h.gate.audit.by_case(h.case_id).await.unwrap().pop().unwrap();
    assert_eq!(denial.action, AuditAction::SendResetLink);
    assert_eq!(denial.result, AuditResult::Denied);
    assert_eq!(denial.context, "no valid privilege: already used");
}

#[tokio::test]
async fn redemption_grants_the_agent_nothing_new() {
    let h = harness().await;
    h.passed_session().await;
    h.gate
        .ledger
        .redeem(h.agent_a, h.case_id, ActionKind::SendResetLink)
        .await
        .unwrap();

    let grants = h
        .gate
        .storage()
        .list_privileges_for_case(h.case_id)
        .await
        .unwrap();
    let agent_grants: Vec<_> = grants
        .iter()
        .filter(|p| p.grantee == Grantee::Agent(h.agent_a.id))
        .collect();
    assert_eq!(agent_grants.len(), 1);
    assert!(agent_grants[0].used);

    // The only other row is the owner's reset token.
    let owner_grants: Vec<_> = grants.iter().filter(|p| p.grantee == Grantee::Owner).collect();
    assert_eq!(owner_grants.len(), 1);
    assert_eq!(owner_grants[0].action, ActionKind::ResetPassword);
    assert!(!owner_grants[0].used);
}

#[tokio::test]
async fn grant_expires_after_five_minutes() {
    let h = harness().await;
    h.passed_session().await;
    h.clock.advance(Duration::minutes(5));

    let err = h
        .gate
        .ledger
        .redeem(h.agent_a, h.case_id, ActionKind::SendResetLink)
        .await
        .unwrap_err();
    assert!(matches!(err, GateError::AccessDenied));
    let denial = h.gate.audit.by_case(h.case_id).await.unwrap().pop().unwrap();
    assert_eq!(denial.context, "no valid privilege: expired");

    let grants = h
        .gate
        .storage()
        .list_privileges_for_case(h.case_id)
        .await
        .unwrap();
    assert!(!grants[0].used);
}

#[tokio::test]
async fn grant_is_bound_to_its_agent_case_and_action() {
    let h = harness().await;
    h.passed_session().await;

    let err = h
        .gate
        .ledger
        .redeem(h.agent_b, h.case_id, ActionKind::SendResetLink)
        .await
        .unwrap_err();
    assert!(matches!(err, GateError::AccessDenied));
    let denial = h.gate.audit.by_case(h.case_id).await.unwrap().pop().unwrap();
    assert_eq!(denial.context, "no valid privilege: granted to another party");

    let err = h
        .gate
        .ledger
        .redeem(h.agent_a, h.case_id, ActionKind::ResetPassword)
        .await
        .unwrap_err();
    assert!(matches!(err, GateError::AccessDenied));
    let denial = h.gate.audit.by_case(h.case_id).await.unwrap().pop().unwrap();
    assert_eq!(denial.context, "no valid privilege: none granted");

    let other_case = h.gate.claims.open_case(h.owner(), "other").await.unwrap();
    let err = h
        .gate
        .ledger
        .redeem(h.agent_a, other_case.id, ActionKind::SendResetLink)
        .await
        .unwrap_err();
    assert!(matches!(err, GateError::AccessDenied));

    // The rightful redemption still works after all of that.
    h.gate
        .ledger
        .redeem(h.agent_a, h.case_id, ActionKind::SendResetLink)
        .await
        .unwrap();
}

#[tokio::test]
async fn owners_and_auditors_cannot_redeem() {
    let h = harness().await;
    h.passed_session().await;
    for actor in [h.owner(), h.auditor] {
        let err = h
            .gate
            .ledger
            .redeem(actor, h.case_id, ActionKind::SendResetLink)
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::AccessDenied));
    }
}

#[tokio::test]
async fn owner_completes_reset_with_the_link_token() {
    let h = harness().await;
    h.passed_session().await;
    let redemption = h
        .gate
        .ledger
        .redeem(h.agent_a, h.case_id, ActionKind::SendResetLink)
        .await
        .unwrap();
    let token = reset_token(&redemption);

    h.gate
        .ledger
        .complete_reset(&token, "a brand new passphrase")
        .await
        .unwrap();
    let owner = h.gate.storage().get_user(h.owner.id).await.unwrap();
    assert!(crypto::verify_password(
        &owner.credential_digest,
        "a brand new passphrase"
    ));
    assert!(!crypto::verify_password(&owner.credential_digest, OWNER_PASSWORD));

    let err = h
        .gate
        .ledger
        .complete_reset(&token, "yet another passphrase")
        .await
        .unwrap_err();
    assert!(matches!(err, GateError::AccessDenied));
    let denial = h.gate.audit.by_case(h.case_id).await.unwrap().pop().unwrap();
    assert_eq!(denial.action, AuditAction::CompleteReset);
    assert_eq!(denial.context, "reset token already used");
    assert_eq!(denial.actor_ref, format!("USER-{}", h.owner.id));
}

#[tokio::test]
async fn reset_rejects_short_passwords_and_unknown_tokens() {
    let h = harness().await;
    h.passed_session().await;
    let redemption = h
        .gate
        .ledger
        .redeem(h.agent_a, h.case_id, ActionKind::SendResetLink)
        .await
        .unwrap();
    let token = reset_token(&redemption);

    let err = h.gate.ledger.complete_reset(&token, "short").await.unwrap_err();
    assert!(matches!(err, GateError::InvalidInput(_)));
    let err = h
        .gate
        .ledger
        .complete_reset("no-such-token", "long enough password")
        .await
        .unwrap_err();
    assert!(matches!(err, GateError::AccessDenied));

    // Neither failure spent the token.
    h.gate
        .ledger
        .complete_reset(&token, "long enough password")
        .await
        .unwrap();
}

#[tokio::test]
async fn agent_token_cannot_complete_a_reset() {
    let h = harness().await;
    h.passed_session().await;
    let agent_token = h
        .gate
        .storage()
        .list_privileges_for_case(h.case_id)
        .await
        .unwrap()[0]
        .token
        .clone();
    let err = h
        .gate
        .ledger
        .complete_reset(&agent_token, "long enough password")
        .await
        .unwrap_err();
    assert!(matches!(err, GateError::AccessDenied));
    let denial = h.gate.audit.by_case(h.case_id).await.unwrap().pop().unwrap();
    assert_eq!(denial.context, "token is not a reset token");
}

#[tokio::test]
async fn reset_token_expires() {
    let h = harness().await;
    h.passed_session().await;
    let redemption = h
        .gate
        .ledger
        .redeem(h.agent_a, h.case_id, ActionKind::SendResetLink)
        .await
        .unwrap();
    let token = reset_token(&redemption);

    h.clock.advance(h.gate.config().reset_token_ttl());
    let err = h
        .gate
        .ledger
        .complete_reset(&token, "long enough password")
        .await
        .unwrap_err();
    assert!(matches!(err, GateError::AccessDenied));
    let denial = h.gate.audit.by_case(h.case_id).await.unwrap().pop().unwrap();
    assert_eq!(denial.context, "reset token expired");
}

#[tokio::test]
async fn direct_reset_rotates_the_owner_credential() {
    let mut config = GateConfig::default();
    config.privilege.grant_action = ActionKind::ResetPassword;
    let h = harness_with(config).await;
    h.passed_session().await;

    let redemption = h
        .gate
        .ledger
        .redeem(h.agent_a, h.case_id, ActionKind::ResetPassword)
        .await
        .unwrap();
    let Redemption::TemporaryPassword { password } = redemption else {
        panic!("expected a temporary password");
    };
    assert!(!password.is_empty());

    let owner = h.gate.storage().get_user(h.owner.id).await.unwrap();
    assert!(crypto::verify_password(&owner.credential_digest, &password));
    assert!(!crypto::verify_password(&owner.credential_digest, OWNER_PASSWORD));

    let success = h.gate.audit.by_case(h.case_id).await.unwrap().pop().unwrap();
    assert_eq!(success.action, AuditAction::ResetPassword);
    assert_eq!(success.result, AuditResult::Success);
    assert!(!success.context.contains(&password));
}

async fn reset_link_token_is_never_an_agent_grant<S: GateStorage>(storage: S) {
    let h = harness_on(storage, GateConfig::default()).await;
    h.passed_session().await;
    h.gate
        .ledger
        .redeem(h.agent_a, h.case_id, ActionKind::SendResetLink)
        .await
        .unwrap();

    for agent in [Actor::agent(0), h.agent_a, h.agent_b] {
        let err = h
            .gate
            .ledger
            .redeem(agent, h.case_id, ActionKind::ResetPassword)
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::AccessDenied), "agent {}", agent.id);
    }
    let owner = h.gate.storage().get_user(h.owner.id).await.unwrap();
    assert!(crypto::verify_password(&owner.credential_digest, OWNER_PASSWORD));

    let unused = h
        .gate
        .storage()
        .list_privileges_for_case(h.case_id)
        .await
        .unwrap()
        .into_iter()
        .any(|p| p.grantee == Grantee::Owner && !p.used);
    assert!(unused);
}

#[tokio::test]
async fn reset_link_token_is_never_an_agent_grant_in_memory() {
    reset_link_token_is_never_an_agent_grant(MemoryStorage::new()).await;
}

#[tokio::test]
async fn reset_link_token_is_never_an_agent_grant_on_sqlite() {
    reset_link_token_is_never_an_agent_grant(SqliteStorage::open_in_memory().unwrap()).await;
}

async fn race_redemptions<S: GateStorage>(storage: S) {
    let h = Arc::new(harness_on(storage, GateConfig::default()).await);
    h.passed_session().await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let h = h.clone();
        handles.push(tokio::spawn(async move {
            h.gate
                .ledger
                .redeem(h.agent_a, h.case_id, ActionKind::SendResetLink)
                .await
        }));
    }
    let mut wins = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => wins += 1,
            Err(GateError::AccessDenied) => {}
            Err(other) => panic!("unexpected redemption error: {other}"),
        }
    }
    assert_eq!(wins, 1);

    let owner_tokens = h
        .gate
        .storage()
        .list_privileges_for_case(h.case_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|p| p.grantee == Grantee::Owner)
        .count();
    assert_eq!(owner_tokens, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_redemptions_have_one_winner_in_memory() {
    race_redemptions(MemoryStorage::new()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_redemptions_have_one_winner_on_sqlite() {
    race_redemptions(SqliteStorage::open_in_memory().unwrap()).await;
}
