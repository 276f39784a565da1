use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use taskplan_core::NoteKind;
use taskplan_store_sqlite::{
    backup_date_stamp, create_verified_backup, PlanStore, BACKUP_DIR_NAME,
};
use time::OffsetDateTime;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "tp.v1";
const CONFIG_FILE: &str = "config.yaml";
const PATCHES_DIR_NAME: &str = "schema_patches";

#[derive(Debug, Parser)]
#[command(name = "tp")]
#[command(about = "TaskPlan CLI")]
struct Cli {
    #[arg(long, default_value = "./plan.db")]
    db: PathBuf,

    /// Directory holding versioned schema patch scripts. Defaults to
    /// `schema_patches` next to the database file.
    #[arg(long)]
    patches_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Context {
        #[command(subcommand)]
        command: Box<ContextCommand>,
    },
    Task {
        #[command(subcommand)]
        command: Box<TaskCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup,
    PruneBackups,
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum ContextCommand {
    New(ContextNewArgs),
    List(ContextListArgs),
    Switch(ContextSwitchArgs),
    Note(ContextNoteArgs),
}

#[derive(Debug, Args)]
struct ContextNewArgs {
    name: String,
    #[arg(long)]
    description: Option<String>,
    #[arg(long, default_value_t = false)]
    switch: bool,
}

#[derive(Debug, Args)]
struct ContextListArgs {
    #[arg(long, default_value_t = false)]
    all: bool,
}

#[derive(Debug, Args)]
struct ContextSwitchArgs {
    context: String,
}

#[derive(Debug, Args)]
struct ContextNoteArgs {
    text: String,
    #[arg(long, value_enum, default_value_t = NoteKindArg::Note)]
    kind: NoteKindArg,
    #[arg(long)]
    context: Option<String>,
    #[arg(long)]
    actor: Option<String>,
}

#[derive(Debug, Subcommand)]
enum TaskCommand {
    Add(TaskAddArgs),
    List(TaskListArgs),
    Done(TaskDoneArgs),
    Note(TaskNoteArgs),
}

#[derive(Debug, Args)]
struct TaskAddArgs {
    title: String,
    #[arg(long)]
    context: Option<String>,
    #[arg(long)]
    description: Option<String>,
}

#[derive(Debug, Args)]
struct TaskListArgs {
    #[arg(long)]
    context: Option<String>,
}

#[derive(Debug, Args)]
struct TaskDoneArgs {
    number: i64,
    #[arg(long)]
    context: Option<String>,
}

#[derive(Debug, Args)]
struct TaskNoteArgs {
    number: i64,
    text: String,
    #[arg(long)]
    context: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum NoteKindArg {
    Note,
    Goal,
    Plan,
}

impl From<NoteKindArg> for NoteKind {
    fn from(value: NoteKindArg) -> Self {
        match value {
            NoteKindArg::Note => Self::Note,
            NoteKindArg::Goal => Self::Goal,
            NoteKindArg::Plan => Self::Plan,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
struct WorkflowConfig {
    daily_backup: bool,
    backup_retain_days: u32,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self { daily_backup: true, backup_retain_days: 7 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
struct AppConfig {
    workflow: WorkflowConfig,
}

/// Load `config.yaml` from next to the database. A missing or malformed file
/// falls back to defaults; unknown keys are ignored.
fn load_config(db_path: &Path) -> AppConfig {
    let path = db_path.parent().unwrap_or_else(|| Path::new(".")).join(CONFIG_FILE);
    let Ok(body) = fs::read_to_string(&path) else {
        return AppConfig::default();
    };
    match serde_yaml::from_str(&body) {
        Ok(config) => config,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "ignoring malformed config");
            AppConfig::default()
        }
    }
}

fn default_patches_dir(db_path: &Path) -> PathBuf {
    db_path.parent().unwrap_or_else(|| Path::new(".")).join(PATCHES_DIR_NAME)
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

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let patches_dir =
        cli.patches_dir.clone().unwrap_or_else(|| default_patches_dir(&cli.db));
    let config = load_config(&cli.db);

    match cli.command {
        Command::Db { command } => run_db(*command, &cli.db, &patches_dir, &config),
        Command::Context { command } => {
            maybe_daily_backup(&cli.db, &config);
            let mut store = PlanStore::ensure_schema(&cli.db, &patches_dir)?;
            run_context(*command, &mut store)
        }
        Command::Task { command } => {
            maybe_daily_backup(&cli.db, &config);
            let mut store = PlanStore::ensure_schema(&cli.db, &patches_dir)?;
            run_task(*command, &mut store)
        }
    }
}

fn run_db(
    command: DbCommand,
    db_path: &Path,
    patches_dir: &Path,
    config: &AppConfig,
) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(db_path),
        DbCommand::Migrate(args) => run_db_migrate(&args, db_path, patches_dir),
        DbCommand::Backup => run_db_backup(db_path),
        DbCommand::PruneBackups => run_db_prune_backups(db_path, config),
        DbCommand::IntegrityCheck => run_db_integrity_check(db_path),
    }
}

fn run_db_schema_version(db_path: &Path) -> Result<()> {
    let store = PlanStore::open(db_path)?;
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty(),
        "inferred_from_legacy": status.inferred_from_legacy
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, db_path: &Path, patches_dir: &Path) -> Result<()> {
    let before = {
        let store = PlanStore::open(db_path)?;
        store.schema_status()?
    };

    if args.dry_run {
        emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions,
            "inferred_from_legacy": before.inferred_from_legacy
        }))?;
        return Ok(());
    }

    // A validation or infrastructure abort surfaces here with its reason and
    // a nonzero exit; callers must not retry until the patch content is fixed.
    let store = PlanStore::ensure_schema(db_path, patches_dir)?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_db_backup(db_path: &Path) -> Result<()> {
    let artifact = create_verified_backup(db_path)?;
    emit_json(serde_json::json!({
        "backup_path": artifact.path,
        "sha256": artifact.sha256,
        "status": "ok"
    }))
}

fn run_db_prune_backups(db_path: &Path, config: &AppConfig) -> Result<()> {
    let retain_days = config.workflow.backup_retain_days;
    if retain_days == 0 {
        return emit_json(serde_json::json!({
            "pruned": [],
            "retain_days": 0,
            "disabled": true
        }));
    }

    let Some(file_name) = db_path.file_name().and_then(OsStr::to_str) else {
        return Err(anyhow!("database path has no usable file name"));
    };
    let backup_dir =
        db_path.parent().unwrap_or_else(|| Path::new(".")).join(BACKUP_DIR_NAME);
    let cutoff = SystemTime::now() - Duration::from_secs(u64::from(retain_days) * 86_400);
    let prefix = format!("{file_name}.");

    let mut pruned = Vec::new();
    if backup_dir.exists() {
        for entry in fs::read_dir(&backup_dir)
            .with_context(|| format!("failed to list {}", backup_dir.display()))?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(&prefix) {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            if modified < cutoff {
                fs::remove_file(entry.path())
                    .with_context(|| format!("failed to prune {}", entry.path().display()))?;
                pruned.push(name);
            }
        }
    }
    pruned.sort();

    emit_json(serde_json::json!({
        "pruned": pruned,
        "retain_days": retain_days
    }))
}

fn run_db_integrity_check(db_path: &Path) -> Result<()> {
    let store = PlanStore::open(db_path)?;
    let report = store.integrity_check()?;
    emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
}

/// Take the once-per-day automatic backup before mutating commands. Skipped
/// when disabled, when the database does not exist yet, or when today already
/// has a slot. Failures are logged, not fatal; the explicit `db backup`
/// command is the strict path.
fn maybe_daily_backup(db_path: &Path, config: &AppConfig) {
    if !config.workflow.daily_backup || !db_path.exists() {
        return;
    }
    if has_backup_for_today(db_path) {
        return;
    }
    match create_verified_backup(db_path) {
        Ok(artifact) => {
            info!(path = %artifact.path.display(), "daily backup created");
        }
        Err(err) => {
            warn!(error = %err, "daily backup failed");
        }
    }
}

fn has_backup_for_today(db_path: &Path) -> bool {
    let Some(file_name) = db_path.file_name().and_then(OsStr::to_str) else {
        return false;
    };
    let backup_dir =
        db_path.parent().unwrap_or_else(|| Path::new(".")).join(BACKUP_DIR_NAME);
    let prefix = format!("{file_name}.{}", backup_date_stamp(OffsetDateTime::now_utc()));

    let Ok(entries) = fs::read_dir(backup_dir) else {
        return false;
    };
    entries
        .flatten()
        .any(|entry| entry.file_name().to_string_lossy().starts_with(&prefix))
}

fn resolve_context_ref(store: &PlanStore, requested: Option<&str>) -> Result<String> {
    if let Some(context) = requested {
        return Ok(context.to_string());
    }
    let active = store.active_context()?.ok_or_else(|| {
        anyhow!("no active context; pass --context or run `tp context switch`")
    })?;
    Ok(active.id.to_string())
}

fn run_context(command: ContextCommand, store: &mut PlanStore) -> Result<()> {
    match command {
        ContextCommand::New(args) => {
            let context =
                store.create_context(&args.name, args.description.as_deref(), args.switch)?;
            emit_json(serde_json::to_value(&context).context("failed to serialize context")?)
        }
        ContextCommand::List(args) => {
            let contexts = store.list_contexts(args.all)?;
            let active = store.active_context()?;
            emit_json(serde_json::json!({
                "contexts": contexts,
                "active_context_id": active.map(|context| context.id)
            }))
        }
        ContextCommand::Switch(args) => {
            let context = store.switch_context(&args.context)?;
            emit_json(serde_json::json!({ "switched_to": context }))
        }
        ContextCommand::Note(args) => {
            let context_ref = resolve_context_ref(store, args.context.as_deref())?;
            let note = store.add_context_note(
                &context_ref,
                args.kind.into(),
                &args.text,
                args.actor.as_deref(),
            )?;
            emit_json(serde_json::to_value(&note).context("failed to serialize note")?)
        }
    }
}

fn run_task(command: TaskCommand, store: &mut PlanStore) -> Result<()> {
    match command {
        TaskCommand::Add(args) => {
            let context_ref = resolve_context_ref(store, args.context.as_deref())?;
            let task =
                store.create_task(&context_ref, &args.title, args.description.as_deref())?;
            emit_json(serde_json::to_value(&task).context("failed to serialize task")?)
        }
        TaskCommand::List(args) => {
            let context_ref = resolve_context_ref(store, args.context.as_deref())?;
            let tasks = store.list_tasks(&context_ref)?;
            emit_json(serde_json::json!({ "tasks": tasks }))
        }
        TaskCommand::Done(args) => {
            let context_ref = resolve_context_ref(store, args.context.as_deref())?;
            let task = store.complete_task(&context_ref, args.number)?;
            emit_json(serde_json::to_value(&task).context("failed to serialize task")?)
        }
        TaskCommand::Note(args) => {
            let context_ref = resolve_context_ref(store, args.context.as_deref())?;
            let note = store.add_task_note(&context_ref, args.number, &args.text)?;
            emit_json(serde_json::to_value(&note).context("failed to serialize note")?)
        }
    }
}
