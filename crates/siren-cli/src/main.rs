//! Siren CLI - operator interface for reports and the review queue
//!
//! Create and update incident reports, inspect the conflict queue, and
//! settle pending conflicts from the terminal.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use siren_core::db::Database;
use siren_core::models::{FieldMap, Provenance, ResolutionAction};
use siren_core::review::ManualReviewQueue;
use siren_core::{Actor, ActorRole, Platform, ReportId, ReportStore, UpdateOutcome, UpdateRequest};
use thiserror::Error;

#[derive(Parser)]
#[command(name = "siren")]
#[command(about = "Coordinate concurrent edits to disaster incident reports")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Optional path to the local database file
    #[arg(long, value_name = "PATH", global = true)]
    db_path: Option<PathBuf>,

    /// Acting principal id
    #[arg(long, global = true, default_value = "cli-operator")]
    actor: String,

    /// Acting principal role
    #[arg(long, global = true, value_enum, default_value_t = CliRole::Coordinator)]
    role: CliRole,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a report from an initial submission
    Create {
        /// Field values as name=value (value parsed as JSON, else string)
        #[arg(short, long = "field", value_name = "NAME=VALUE", required = true)]
        fields: Vec<String>,
    },
    /// Show a report
    Show {
        /// Report ID
        id: String,
    },
    /// List reports, most recently modified first
    List {
        /// Number of reports to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Propose an update to a report
    Update {
        /// Report ID
        id: String,
        /// Field values as name=value (value parsed as JSON, else string)
        #[arg(short, long = "field", value_name = "NAME=VALUE", required = true)]
        fields: Vec<String>,
        /// Fail fast unless the stored version still matches
        #[arg(long, value_name = "VERSION")]
        expect_version: Option<i64>,
        /// Free-text reason recorded on the audit entry
        #[arg(long)]
        reason: Option<String>,
    },
    /// Conflict queue administration
    #[command(subcommand)]
    Conflicts(ConflictCommands),
}

#[derive(Subcommand)]
enum ConflictCommands {
    /// List pending conflicts
    List {
        /// Limit to one report
        #[arg(long, value_name = "REPORT_ID")]
        report: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Settle a pending conflict
    Resolve {
        /// Conflict ID
        id: i64,
        /// Action to take
        #[arg(long, value_enum)]
        action: CliAction,
        /// Resolver notes
        #[arg(long)]
        notes: Option<String>,
        /// Explicit field values for the custom action
        #[arg(short, long = "field", value_name = "NAME=VALUE")]
        fields: Vec<String>,
    },
    /// Dismiss a pending conflict without touching the report
    Reject {
        /// Conflict ID
        id: i64,
        /// Resolver notes
        #[arg(long)]
        notes: Option<String>,
    },
    /// Expire pending conflicts past their deadline
    Expire,
}

#[derive(Clone, Copy, ValueEnum)]
enum CliRole {
    FieldAgent,
    Coordinator,
    Admin,
}

impl From<CliRole> for ActorRole {
    fn from(role: CliRole) -> Self {
        match role {
            CliRole::FieldAgent => Self::FieldAgent,
            CliRole::Coordinator => Self::Coordinator,
            CliRole::Admin => Self::Admin,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum CliAction {
    AcceptNew,
    KeepOriginal,
    MergeChanges,
    Custom,
}

impl From<CliAction> for ResolutionAction {
    fn from(action: CliAction) -> Self {
        match action {
            CliAction::AcceptNew => Self::AcceptNew,
            CliAction::KeepOriginal => Self::KeepOriginal,
            CliAction::MergeChanges => Self::MergeChanges,
            CliAction::Custom => Self::Custom,
        }
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Core(#[from] siren_core::Error),
    #[error("Invalid field argument '{0}': expected NAME=VALUE")]
    BadField(String),
    #[error("Invalid report id: {0}")]
    BadReportId(String),
    #[error("Could not determine a data directory; pass --db-path")]
    NoDataDir,
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let mut db = open_database(cli.db_path.as_deref())?;
    let actor = Actor::new(cli.actor.clone(), cli.role.into(), Platform::Web);
    let store = ReportStore::default();
    let queue = ManualReviewQueue::default();

    match cli.command {
        Commands::Create { fields } => {
            let fields = parse_fields(&fields)?;
            let report = store.create(&mut db, fields, &actor, cli_provenance())?;
            println!("created report {} (version {})", report.id, report.version);
        }
        Commands::Show { id } => {
            let id = parse_report_id(&id)?;
            let report = store.get(&db, &id)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::List { limit } => {
            use siren_core::db::ReportRepository;
            let repo = siren_core::db::SqliteReportRepository::new(db.connection());
            for report in repo.list(limit)? {
                let title = report
                    .field("title")
                    .and_then(|v| v.as_str())
                    .unwrap_or("(untitled)");
                println!("{}  v{}  {}", report.id, report.version, title);
            }
        }
        Commands::Update {
            id,
            fields,
            expect_version,
            reason,
        } => {
            let request = UpdateRequest {
                report_id: parse_report_id(&id)?,
                fields: parse_fields(&fields)?,
                actor,
                expected_version: expect_version,
                reason,
                provenance: cli_provenance(),
            };
            match store.update(&mut db, &request)? {
                UpdateOutcome::Applied {
                    new_version,
                    applied_fields,
                    resolution,
                } => {
                    let via = resolution
                        .map(|strategy| format!(" (resolved via {strategy})"))
                        .unwrap_or_default();
                    println!(
                        "applied {} field(s), now at version {new_version}{via}",
                        applied_fields.len()
                    );
                }
                UpdateOutcome::Rejected {
                    conflicting_fields,
                    other_actor_id,
                    ..
                } => {
                    println!(
                        "rejected: {other_actor_id} recently changed {}; refetch and resubmit",
                        conflicting_fields.into_iter().collect::<Vec<_>>().join(", ")
                    );
                }
                UpdateOutcome::Deferred {
                    conflict_id,
                    conflicting_fields,
                    severity,
                } => {
                    println!(
                        "deferred to manual review as conflict {conflict_id} ({severity} severity, fields: {})",
                        conflicting_fields.into_iter().collect::<Vec<_>>().join(", ")
                    );
                }
            }
        }
        Commands::Conflicts(command) => run_conflicts(command, &mut db, &queue, &actor)?,
    }

    Ok(())
}

fn run_conflicts(
    command: ConflictCommands,
    db: &mut Database,
    queue: &ManualReviewQueue,
    actor: &Actor,
) -> Result<(), CliError> {
    match command {
        ConflictCommands::List { report, json } => {
            let report_id = report.as_deref().map(parse_report_id).transpose()?;
            let pending = queue.list_pending(db, report_id.as_ref())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&pending)?);
            } else if pending.is_empty() {
                println!("no pending conflicts");
            } else {
                for conflict in pending {
                    println!(
                        "{}  report {}  {}  fields: {}",
                        conflict.id,
                        conflict.report_id,
                        conflict.severity,
                        conflict
                            .conflicting_fields
                            .into_iter()
                            .collect::<Vec<_>>()
                            .join(", ")
                    );
                }
            }
        }
        ConflictCommands::Resolve {
            id,
            action,
            notes,
            fields,
        } => {
            let custom_fields = if fields.is_empty() {
                None
            } else {
                Some(parse_fields(&fields)?)
            };
            let report = queue.resolve(db, id, action.into(), actor, notes, custom_fields)?;
            println!(
                "conflict {id} resolved; report {} now at version {}",
                report.id, report.version
            );
        }
        ConflictCommands::Reject { id, notes } => {
            queue.reject(db, id, actor, notes)?;
            println!("conflict {id} rejected");
        }
        ConflictCommands::Expire => {
            let expired = queue.expire_due(db)?;
            println!("expired {expired} conflict(s)");
        }
    }
    Ok(())
}

fn open_database(db_path: Option<&std::path::Path>) -> Result<Database, CliError> {
    let path = match db_path {
        Some(path) => path.to_path_buf(),
        None => {
            let mut path = dirs::data_dir().ok_or(CliError::NoDataDir)?;
            path.push("siren");
            std::fs::create_dir_all(&path).map_err(siren_core::Error::Io)?;
            path.push("siren.db");
            path
        }
    };
    tracing::debug!(path = %path.display(), "opening database");
    Ok(Database::open(path)?)
}

fn cli_provenance() -> Provenance {
    Provenance {
        origin_addr: None,
        client_info: Some(format!("siren-cli/{}", env!("CARGO_PKG_VERSION"))),
    }
}

fn parse_report_id(raw: &str) -> Result<ReportId, CliError> {
    raw.parse()
        .map_err(|_| CliError::BadReportId(raw.to_string()))
}

/// Parse repeated `name=value` arguments; values that parse as JSON are
/// kept as-is, anything else becomes a string.
fn parse_fields(raw: &[String]) -> Result<FieldMap, CliError> {
    let mut fields = FieldMap::new();
    for item in raw {
        let (name, value) = item
            .split_once('=')
            .ok_or_else(|| CliError::BadField(item.clone()))?;
        if name.is_empty() {
            return Err(CliError::BadField(item.clone()));
        }
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        fields.insert(name.to_string(), value);
    }
    Ok(fields)
}
