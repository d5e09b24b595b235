//! Just-in-time privilege and step-up verification engine.
//!
//! Four components share one injected [`GateStorage`]:
//!
//! - [`AuditRecorder`] appends every decision to the immutable log.
//! - [`PrivilegeLedger`] issues and redeems time-boxed single-use grants.
//! - [`VerificationEngine`] runs the owner's identity challenge and mints a
//!   grant for the assigned agent when it passes.
//! - [`ClaimCoordinator`] hands cases to agents one at a time and closes them.
//!
//! [`Gate`] wires the four together over a single store, clock and config.

pub mod audit;
pub mod claim;
pub mod clock;
pub mod config;
pub mod crypto;
mod error;
pub mod ledger;
pub mod verification;

use std::sync::Arc;

use jitgate_storage::{GateStorage, Role, UserId};
use serde::{Deserialize, Serialize};

pub use audit::{AuditRecorder, CaseReport};
pub use claim::ClaimCoordinator;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, GateConfig};
pub use error::{ConflictReason, GateError, PolicyReason};
pub use ledger::{PrivilegeLedger, Redemption};
pub use verification::{ChallengeQuestion, SubmitOutcome, VerificationEngine, VerificationLink};

/// An authenticated caller, as supplied by the identity service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub id: UserId,
    pub role: Role,
}

impl Actor {
    pub fn user(id: UserId) -> Self {
        Self { id, role: Role::User }
    }

    pub fn agent(id: UserId) -> Self {
        Self {
            id,
            role: Role::Agent,
        }
    }

    pub fn auditor(id: UserId) -> Self {
        Self {
            id,
            role: Role::Auditor,
        }
    }
}

/// The assembled engine.
pub struct Gate<S> {
    pub audit: AuditRecorder<S>,
    pub ledger: PrivilegeLedger<S>,
    pub verification: VerificationEngine<S>,
    pub claims: ClaimCoordinator<S>,
    storage: Arc<S>,
    config: Arc<GateConfig>,
}

impl<S: GateStorage> Gate<S> {
    pub fn new(
        storage: Arc<S>,
        config: GateConfig,
        secret_key: impl Into<Vec<u8>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let config = Arc::new(config);
        let audit = AuditRecorder::new(
            storage.clone(),
            clock.clone(),
            crypto::Pseudonymizer::new(secret_key),
            config.audit.write_retries,
        );
        let ledger = PrivilegeLedger::new(
            storage.clone(),
            clock.clone(),
            audit.clone(),
            config.clone(),
        );
        let verification = VerificationEngine::new(
            storage.clone(),
            clock.clone(),
            audit.clone(),
            ledger.clone(),
            config.clone(),
        );
        let claims = ClaimCoordinator::new(storage.clone(), clock, audit.clone());
        Self {
            audit,
            ledger,
            verification,
            claims,
            storage,
            config,
        }
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }
}
