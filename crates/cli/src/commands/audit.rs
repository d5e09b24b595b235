use std::path::PathBuf;
use std::sync::Arc;

use jitgate_engine::{config, Gate, GateConfig, SystemClock};
use jitgate_storage::{AuditRecord, SqliteStorage};

use crate::{CliError, OutputFormat};

pub(crate) async fn cmd_audit(
    db: PathBuf,
    case: Option<u64>,
    reports: bool,
    output: OutputFormat,
) -> Result<(), CliError> {
    if !db.exists() {
        return Err(CliError::Other(format!("no database at {}", db.display())));
    }
    let storage = Arc::new(SqliteStorage::open(&db)?);
    let gate = Gate::new(
        storage,
        GateConfig::default(),
        config::resolve_secret_key(),
        Arc::new(SystemClock),
    );

    if reports {
        let reports = gate.audit.case_reports().await?;
        match output {
            OutputFormat::Text => {
                for r in &reports {
                    println!(
                        "case {:>4}  events {:>3}  denied {:>3}  failed {:>3}  last {} {} at {}",
                        r.case_id,
                        r.events,
                        r.denied,
                        r.failed,
                        r.last_action,
                        r.last_result,
                        r.last_at
                    );
                }
            }
            OutputFormat::Json => println!("{}", to_json(&reports)?),
        }
        return Ok(());
    }

    let rows = match case {
        Some(case_id) => gate.audit.by_case(case_id).await?,
        None => gate.audit.trail().await?,
    };
    match output {
        OutputFormat::Text => {
            for row in &rows {
                print_row(row);
            }
        }
        OutputFormat::Json => println!("{}", to_json(&rows)?),
    }
    Ok(())
}

fn print_row(row: &AuditRecord) {
    println!(
        "{}  case {:>4}  {:<20} {:<8} {:<7} {}  {}",
        row.timestamp,
        row.case_id,
        row.action,
        row.result,
        row.actor_role,
        row.actor_ref,
        row.context
    );
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, CliError> {
    serde_json::to_string_pretty(value).map_err(|e| CliError::Other(e.to_string()))
}
