//! Embedded brew history command surface.
//!
//! Host applications can drive the store through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_history_with_db`] for a `HistoryCommand` against a DB path.
//! - [`run_history`] for a `HistoryCommand` against an open [`SqliteHistoryStore`].

mod logging;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use cofi_history_core::{
    now_utc, parse_brew_timestamp, BrewHistoryRecord, HistorySchema, RecipeId, RecordId,
};
use cofi_history_store_sqlite::{render_history_schema, SqliteHistoryStore};
use serde_json::{json, Value};

pub use logging::{init_logging, LogFormat, LOG_FILTER_ENV};

const SCHEMA_CONTRACT_VERSION: &str = "history_schema.v1";

#[derive(Debug, Parser)]
#[command(name = "cofi-history")]
#[command(about = "Cofi brew history CLI")]
pub struct Cli {
    #[arg(long, default_value = "./cofi_history.sqlite3")]
    db: PathBuf,

    /// JSON file overriding the default table/column mapping
    #[arg(long)]
    schema: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    History {
        #[command(subcommand)]
        command: Box<HistoryCommand>,
    },
    Schema {
        #[command(subcommand)]
        command: SchemaCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum HistoryCommand {
    /// Record a brew
    Log(LogArgs),
    Show(ShowArgs),
    List(ListArgs),
    Delete(DeleteArgs),
    /// Per-recipe brew counts, most brewed first
    Stats,
}

#[derive(Debug, Args)]
pub struct LogArgs {
    #[arg(long, allow_hyphen_values = true)]
    recipe_id: i64,
    /// RFC3339 UTC or `YYYY-MM-DDTHH:MM:SS`; defaults to now
    #[arg(long)]
    brewed_at: Option<String>,
    #[arg(long, allow_hyphen_values = true)]
    beans_used: f64,
    #[arg(long)]
    notes: Option<String>,
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long, allow_hyphen_values = true)]
    recipe_id: i64,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct DeleteArgs {
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Subcommand)]
pub enum SchemaCommand {
    /// Print the effective mapping and the DDL it produces
    Show,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when the schema mapping cannot be loaded, the store
/// cannot be opened or migrated, or command execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let schema = load_schema(cli.schema.as_deref())?;

    match cli.command {
        Command::History { command } => run_history_with_db(&cli.db, schema, *command),
        Command::Schema { command } => match command {
            SchemaCommand::Show => {
                let payload = schema_payload(&schema)?;
                println!("{}", serde_json::to_string_pretty(&payload)?);
                Ok(())
            }
        },
    }
}

/// Executes a history command against the `SQLite` DB at `db_path`.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_history_with_db(
    db_path: &Path,
    schema: HistorySchema,
    command: HistoryCommand,
) -> Result<()> {
    let mut store = SqliteHistoryStore::open(db_path, schema)?;
    store.migrate()?;
    tracing::debug!(db = %db_path.display(), table = %store.schema().table, "history store ready");
    run_history(command, &mut store)
}

/// Executes a history command against an existing store handle.
///
/// # Errors
/// Returns an error when argument parsing, persistence, or lookup fails,
/// including when a requested record does not exist.
pub fn run_history(command: HistoryCommand, store: &mut SqliteHistoryStore) -> Result<()> {
    let output = execute_history(command, store)?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn execute_history(command: HistoryCommand, store: &mut SqliteHistoryStore) -> Result<Value> {
    match command {
        HistoryCommand::Log(args) => {
            let brew_date = parse_brewed_at(args.brewed_at.as_deref())?;
            let mut record = BrewHistoryRecord::new(
                RecipeId(args.recipe_id),
                brew_date,
                args.beans_used,
                args.notes,
            );
            store.insert(&mut record)?;
            Ok(serde_json::to_value(&record)?)
        }
        HistoryCommand::Show(args) => {
            let id = RecordId(args.id);
            let Some(record) = store.get(id)? else {
                return Err(anyhow!("brew history record {id} not found"));
            };
            Ok(serde_json::to_value(&record)?)
        }
        HistoryCommand::List(args) => {
            let records = store.list_for_recipe(RecipeId(args.recipe_id), args.limit)?;
            Ok(serde_json::to_value(&records)?)
        }
        HistoryCommand::Delete(args) => {
            let id = RecordId(args.id);
            if !store.delete(id)? {
                return Err(anyhow!("brew history record {id} not found"));
            }
            Ok(json!({ "deleted": id }))
        }
        HistoryCommand::Stats => Ok(serde_json::to_value(store.summary()?)?),
    }
}

fn load_schema(path: Option<&Path>) -> Result<HistorySchema> {
    let Some(path) = path else {
        return Ok(HistorySchema::v1());
    };

    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read schema mapping {}", path.display()))?;
    let value: Value = serde_json::from_str(&body)
        .with_context(|| format!("schema mapping must be valid JSON: {}", path.display()))?;
    HistorySchema::from_json(&value).map_err(|err| anyhow!("{}: {err}", path.display()))
}

fn parse_brewed_at(raw: Option<&str>) -> Result<time::OffsetDateTime> {
    match raw {
        Some(value) => {
            parse_brew_timestamp(value).map_err(|err| anyhow!("invalid --brewed-at: {err}"))
        }
        None => Ok(now_utc()),
    }
}

fn schema_payload(schema: &HistorySchema) -> Result<Value> {
    Ok(json!({
        "contract_version": SCHEMA_CONTRACT_VERSION,
        "schema": serde_json::to_value(schema)?,
        "ddl": render_history_schema(schema),
    }))
}
