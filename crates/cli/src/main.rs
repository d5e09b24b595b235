mod commands;
mod serve;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use jitgate_engine::{ConfigError, GateConfig, GateError};
use jitgate_storage::{SqliteStorage, StorageError};
use tracing_subscriber::EnvFilter;

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

/// Just-in-time privilege and step-up verification service.
#[derive(Parser)]
#[command(
    name = "jitgate",
    version,
    about = "Just-in-time privilege and step-up verification service"
)]
struct Cli {
    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    output: OutputFormat,

    /// Log filter when RUST_LOG is unset (e.g. info, debug, jitgate_engine=trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server
    Serve {
        /// Port to listen on (overrides the config file)
        #[arg(long)]
        port: Option<u16>,
        /// SQLite database file
        #[arg(long, default_value = "jitgate.db", conflicts_with = "in_memory")]
        db: PathBuf,
        /// Keep all state in memory; nothing survives a restart
        #[arg(long)]
        in_memory: bool,
        /// TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Insert demo users and the challenge question bank
    Seed {
        /// SQLite database file
        #[arg(long, default_value = "jitgate.db")]
        db: PathBuf,
    },

    /// Print the stored digest for a challenge answer
    HashAnswer {
        /// Plaintext answer; trimmed and lowercased before hashing
        answer: String,
    },

    /// Print the audit log
    Audit {
        /// SQLite database file
        #[arg(long, default_value = "jitgate.db")]
        db: PathBuf,
        /// Only rows for this case
        #[arg(long, conflicts_with = "reports")]
        case: Option<u64>,
        /// One summary line per case instead of raw rows
        #[arg(long)]
        reports: bool,
    },
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let result = match cli.command {
        Commands::Serve {
            port,
            db,
            in_memory,
            config,
        } => run_async(serve_command(port, db, in_memory, config)),
        Commands::Seed { db } => run_async(commands::seed::cmd_seed(db, cli.output)),
        Commands::HashAnswer { answer } => {
            commands::cmd_hash_answer(&answer, cli.output);
            Ok(())
        }
        Commands::Audit { db, case, reports } => {
            run_async(commands::audit::cmd_audit(db, case, reports, cli.output))
        }
    };

    if let Err(e) = result {
        report_error(&e.to_string(), cli.output);
        process::exit(1);
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_async<F>(future: F) -> Result<(), CliError>
where
    F: std::future::Future<Output = Result<(), CliError>>,
{
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(future)
}

async fn serve_command(
    port: Option<u16>,
    db: PathBuf,
    in_memory: bool,
    config_path: Option<PathBuf>,
) -> Result<(), CliError> {
    let mut config = match &config_path {
        Some(path) => GateConfig::load(path)?,
        None => GateConfig::default(),
    };
    config.apply_env_overrides()?;
    if let Some(port) = port {
        config.server.port = port;
    }

    let storage = if in_memory {
        SqliteStorage::open_in_memory()?
    } else {
        SqliteStorage::open(&db)?
    };
    serve::start_server(storage, config).await
}

pub(crate) fn report_error(msg: &str, output: OutputFormat) {
    match output {
        OutputFormat::Text => eprintln!("error: {}", msg),
        OutputFormat::Json => {
            eprintln!("{}", serde_json::json!({ "error": msg }));
        }
    }
}
