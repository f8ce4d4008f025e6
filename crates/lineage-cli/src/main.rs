use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use lineage_api::{CreateLineageRequest, LineageApi};
use lineage_core::{Genome, Identity};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "lineage")]
#[command(about = "Evolutionary lineage CLI")]
struct Cli {
    #[arg(long, env = "LINEAGE_DB", default_value = "./lineage.sqlite3")]
    db: PathBuf,

    /// Stable account identifier of the caller.
    #[arg(long, env = "LINEAGE_ACCOUNT")]
    account: Option<String>,

    #[arg(long, env = "LINEAGE_EMAIL", default_value = "")]
    email: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Lineage {
        #[command(subcommand)]
        command: LineageCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum LineageCommand {
    Create(CreateArgs),
    List,
    Show(LineageRef),
    Delete(LineageRef),
    Advance(AdvanceArgs),
    Select(SelectArgs),
}

#[derive(Debug, Args)]
struct LineageRef {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
struct CreateArgs {
    /// Genome as a JSON document.
    #[arg(long)]
    genome: String,
    #[arg(long)]
    seed: Option<i64>,
}

#[derive(Debug, Args)]
struct AdvanceArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    count: Option<String>,
}

#[derive(Debug, Args)]
struct SelectArgs {
    #[arg(long)]
    id: String,
    /// Survivor genome as a JSON document.
    #[arg(long)]
    genome: String,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let api = LineageApi::new(cli.db.clone());
    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Lineage { command } => {
            let identity = Identity { external_id: cli.account, email: cli.email };
            run_lineage(command, &api, &identity)
        }
    }
}

fn run_db(command: DbCommand, api: &LineageApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize migrate result")?)
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            emit_json(
                serde_json::to_value(&report).context("failed to serialize integrity report")?,
            )
        }
    }
}

fn run_lineage(command: LineageCommand, api: &LineageApi, identity: &Identity) -> Result<()> {
    match command {
        LineageCommand::Create(args) => {
            let genome = parse_genome(&args.genome)?;
            let lineage =
                api.create_lineage(identity, CreateLineageRequest { genome, seed: args.seed })?;
            emit_json(serde_json::to_value(&lineage).context("failed to serialize lineage")?)
        }
        LineageCommand::List => {
            let summaries = api.list_lineages(identity)?;
            emit_json(serde_json::json!({ "lineages": summaries }))
        }
        LineageCommand::Show(args) => {
            let lineage = api.get_lineage(identity, &args.id)?;
            emit_json(serde_json::to_value(&lineage).context("failed to serialize lineage")?)
        }
        LineageCommand::Delete(args) => {
            api.delete_lineage(identity, &args.id)?;
            emit_json(serde_json::json!({ "lineage_id": args.id, "deleted": true }))
        }
        LineageCommand::Advance(args) => {
            let candidates = api.advance_generation(identity, &args.id, args.count.as_deref())?;
            emit_json(serde_json::json!({ "lineage_id": args.id, "candidates": candidates }))
        }
        LineageCommand::Select(args) => {
            let survivor = parse_genome(&args.genome)?;
            api.select_survivor(identity, &args.id, survivor)?;
            emit_json(serde_json::json!({ "lineage_id": args.id, "selected": true }))
        }
    }
}

fn parse_genome(raw: &str) -> Result<Genome> {
    let value: Value =
        serde_json::from_str(raw).with_context(|| format!("genome is not valid JSON: {raw}"))?;
    Ok(Genome::new(value))
}
