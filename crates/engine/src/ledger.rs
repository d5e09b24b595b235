//! Privilege Ledger: time-boxed, single-use grants.
//!
//! A grant is redeemable while `used = false` and `expires_at > now`.
//! Redemption performs the grant's payload and flips `used` inside the
//! same snapshot, so concurrent redemptions of one grant cannot both
//! succeed. Callers only ever see a uniform `AccessDenied`; the audit row
//! records why.

use std::sync::Arc;

use jitgate_storage::{
    ActionKind, AuditAction, AuditResult, CaseId, GateStorage, Grantee, NewPrivilege,
    PrivilegeRecord, Role, StorageError,
};
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

use crate::audit::AuditRecorder;
use crate::clock::Clock;
use crate::config::GateConfig;
use crate::crypto;
use crate::error::GateError;
use crate::Actor;

/// What a successful redemption hands back to the agent.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Redemption {
    /// Link for the owner to set a new password; delivered out of band.
    ResetLink {
        reset_url: String,
        #[serde(with = "time::serde::rfc3339")]
        expires_at: OffsetDateTime,
    },
    /// Credential already rotated; the agent relays this password once.
    TemporaryPassword { password: String },
}

pub struct PrivilegeLedger<S> {
    storage: Arc<S>,
    clock: Arc<dyn Clock>,
    audit: AuditRecorder<S>,
    config: Arc<GateConfig>,
}

impl<S> Clone for PrivilegeLedger<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            clock: self.clock.clone(),
            audit: self.audit.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: GateStorage> PrivilegeLedger<S> {
    pub fn new(
        storage: Arc<S>,
        clock: Arc<dyn Clock>,
        audit: AuditRecorder<S>,
        config: Arc<GateConfig>,
    ) -> Self {
        Self {
            storage,
            clock,
            audit,
            config,
        }
    }

    /// Mint a grant inside the caller's snapshot.
    pub(crate) async fn grant_in(
        &self,
        snapshot: &mut S::Snapshot,
        grantee: Grantee,
        case_id: CaseId,
        action: ActionKind,
        ttl: Duration,
    ) -> Result<PrivilegeRecord, GateError> {
        let now = self.clock.now();
        let record = self
            .storage
            .insert_privilege(
                snapshot,
                NewPrivilege {
                    grantee,
                    case_id,
                    action,
                    token: crypto::generate_token(),
                    granted_at: now,
                    expires_at: now + ttl,
                },
            )
            .await?;
        Ok(record)
    }

    pub async fn redeem(
        &self,
        actor: Actor,
        case_id: CaseId,
        action: ActionKind,
    ) -> Result<Redemption, GateError> {
        if actor.role != Role::Agent {
            return self.refuse(actor, case_id, action, "role may not redeem").await;
        }

        let now = self.clock.now();
        let mut snap = self.storage.begin_snapshot().await?;
        let found = self
            .storage
            .find_redeemable_privilege(&mut snap, Grantee::Agent(actor.id), case_id, action, now)
            .await?;
        let Some(privilege) = found else {
            self.storage.abort_snapshot(snap).await?;
            let cause = self.diagnose(actor, case_id, action, now).await?;
            return self.refuse(actor, case_id, action, cause).await;
        };

        match self.storage.mark_privilege_used(&mut snap, privilege.id).await {
            Ok(()) => {}
            Err(StorageError::ConcurrentConflict { .. }) => {
                self.storage.abort_snapshot(snap).await?;
                return self
                    .refuse(actor, case_id, action, "no valid privilege: already used")
                    .await;
            }
            Err(e) => {
                self.storage.abort_snapshot(snap).await?;
                return Err(e.into());
            }
        }

        let payload = match action {
            ActionKind::SendResetLink => {
                let ttl = self.config.reset_token_ttl();
                let token = self
                    .grant_in(&mut snap, Grantee::Owner, case_id, ActionKind::ResetPassword, ttl)
                    .await?;
                Redemption::ResetLink {
                    reset_url: format!(
                        "{}/reset-password?token={}",
                        self.config.privilege.reset_base_url.trim_end_matches('/'),
                        token.token
                    ),
                    expires_at: token.expires_at,
                }
            }
            ActionKind::ResetPassword => {
                let case = self.storage.get_case_for_update(&mut snap, case_id).await?;
                let password = crypto::temporary_password();
                self.storage
                    .set_credential_digest(
                        &mut snap,
                        case.owner_id,
                        &crypto::hash_password(&password),
                    )
                    .await?;
                Redemption::TemporaryPassword { password }
            }
        };
        self.storage.commit_snapshot(snap).await?;

        info!(case_id, %action, "privilege redeemed");
        self.audit
            .record(
                case_id,
                actor,
                action.into(),
                AuditResult::Success,
                format!("case {case_id}, action {action}"),
            )
            .await?;
        Ok(payload)
    }

    /// Owner side of the two-step reset: spend the owner-bound token and
    /// set the new credential together.
    pub async fn complete_reset(&self, token: &str, new_password: &str) -> Result<(), GateError> {
        let min = self.config.privilege.min_password_len;
        if new_password.chars().count() < min {
            return Err(GateError::InvalidInput(format!(
                "password must be at least {min} characters"
            )));
        }

        let now = self.clock.now();
        let mut snap = self.storage.begin_snapshot().await?;
        let found = self.storage.find_privilege_by_token(&mut snap, token).await?;
        let privilege = match found {
            Some(p)
                if p.grantee == Grantee::Owner
                    && p.action == ActionKind::ResetPassword
                    && p.is_redeemable(now) =>
            {
                p
            }
            Some(p) => {
                self.storage.abort_snapshot(snap).await?;
                let cause = if p.used {
                    "reset token already used"
                } else if !p.is_redeemable(now) {
                    "reset token expired"
                } else {
                    "token is not a reset token"
                };
                let owner = self.storage.get_case(p.case_id).await?.owner_id;
                warn!(case_id = p.case_id, cause, "password reset refused");
                self.audit
                    .record(
                        p.case_id,
                        Actor::user(owner),
                        AuditAction::CompleteReset,
                        AuditResult::Denied,
                        cause,
                    )
                    .await?;
                return Err(GateError::AccessDenied);
            }
            None => {
                self.storage.abort_snapshot(snap).await?;
                warn!("password reset refused: unknown token");
                return Err(GateError::AccessDenied);
            }
        };

        let case = self
            .storage
            .get_case_for_update(&mut snap, privilege.case_id)
            .await?;
        self.storage
            .set_credential_digest(&mut snap, case.owner_id, &crypto::hash_password(new_password))
            .await?;
        match self.storage.mark_privilege_used(&mut snap, privilege.id).await {
            Ok(()) => self.storage.commit_snapshot(snap).await?,
            Err(StorageError::ConcurrentConflict { .. }) => {
                self.storage.abort_snapshot(snap).await?;
                return Err(GateError::AccessDenied);
            }
            Err(e) => {
                self.storage.abort_snapshot(snap).await?;
                return Err(e.into());
            }
        }

        info!(case_id = case.id, "owner credential rotated");
        self.audit
            .record(
                case.id,
                Actor::user(case.owner_id),
                AuditAction::CompleteReset,
                AuditResult::Success,
                "credential updated by owner",
            )
            .await?;
        Ok(())
    }

    /// Why no grant matched, for the audit row only.
    async fn diagnose(
        &self,
        actor: Actor,
        case_id: CaseId,
        action: ActionKind,
        now: OffsetDateTime,
    ) -> Result<&'static str, GateError> {
        let grants = self.storage.list_privileges_for_case(case_id).await?;
        let for_action: Vec<&PrivilegeRecord> =
            grants.iter().filter(|p| p.action == action).collect();
        let mine: Vec<&&PrivilegeRecord> = for_action
            .iter()
            .filter(|p| p.grantee == Grantee::Agent(actor.id))
            .collect();
        let cause = if for_action.is_empty() {
            "no valid privilege: none granted"
        } else if mine.is_empty() {
            "no valid privilege: granted to another party"
        } else if mine.iter().all(|p| p.used) {
            "no valid privilege: already used"
        } else if mine.iter().all(|p| p.used || p.expires_at <= now) {
            "no valid privilege: expired"
        } else {
            "no valid privilege"
        };
        Ok(cause)
    }

    async fn refuse<T>(
        &self,
        actor: Actor,
        case_id: CaseId,
        action: ActionKind,
        cause: &str,
    ) -> Result<T, GateError> {
        warn!(case_id, %action, cause, "redemption refused");
        self.audit
            .record(case_id, actor, action.into(), AuditResult::Denied, cause)
            .await?;
        Err(GateError::AccessDenied)
    }
}
