//! Decisions must not be reported when their audit row cannot be written.

mod common;

use common::harness_on;
use jitgate_engine::{GateConfig, GateError};
use jitgate_storage::{CaseStatus, GateStorage, SqliteStorage};

#[tokio::test]
async fn denial_without_audit_row_is_a_system_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gate.db");
    let mut config = GateConfig::default();
    config.audit.write_retries = 2;
    let h = harness_on(SqliteStorage::open(&path).unwrap(), config).await;
    h.gate.claims.claim(h.agent_a, h.case_id).await.unwrap();

    let raw = rusqlite::Connection::open(&path).unwrap();
    raw.execute_batch("DROP TABLE audit_logs").unwrap();
    drop(raw);

    // The losing claimant would normally see a conflict.
    let err = h.gate.claims.claim(h.agent_b, h.case_id).await.unwrap_err();
    assert!(matches!(err, GateError::System(_)), "{err:?}");

    // Successful business outcomes still complete.
    h.gate.claims.close(h.agent_a, h.case_id).await.unwrap();
    assert_eq!(
        h.gate.storage().get_case(h.case_id).await.unwrap().status,
        CaseStatus::Closed
    );
}
