use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::Connection;
use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_tp<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_tp"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute tp binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_tp(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "tp command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn as_bool(value: &Value, key: &str) -> bool {
    value
        .get(key)
        .and_then(Value::as_bool)
        .unwrap_or_else(|| panic!("missing bool field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn shipped_patches_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../schema_patches")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to locate schema_patches: {err}"))
}

/// Version-1 database shape, predating task numbers and note kinds.
fn make_legacy_db(db_path: &Path) {
    let conn = Connection::open(db_path)
        .unwrap_or_else(|err| panic!("failed to create legacy db: {err}"));
    conn.execute_batch(
        r"
        CREATE TABLE contexts (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          name TEXT NOT NULL UNIQUE,
          status TEXT NOT NULL DEFAULT 'active',
          description_md TEXT,
          created_at TEXT NOT NULL,
          updated_at TEXT NOT NULL
        );
        CREATE TABLE tasks (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          context_id INTEGER NOT NULL,
          title TEXT NOT NULL,
          description_md TEXT,
          status TEXT NOT NULL DEFAULT 'planned',
          created_at TEXT NOT NULL,
          updated_at TEXT NOT NULL,
          completed_at TEXT,
          FOREIGN KEY (context_id) REFERENCES contexts(id)
        );
        CREATE TABLE context_notes (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          context_id INTEGER NOT NULL,
          note_md TEXT NOT NULL,
          created_at TEXT NOT NULL,
          actor TEXT,
          FOREIGN KEY (context_id) REFERENCES contexts(id)
        );
        CREATE TABLE task_notes (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          task_id INTEGER NOT NULL,
          note_md TEXT NOT NULL,
          created_at TEXT NOT NULL,
          FOREIGN KEY (task_id) REFERENCES tasks(id)
        );
        CREATE TABLE global_state (
          id INTEGER PRIMARY KEY CHECK (id = 1),
          active_context_id INTEGER,
          updated_at TEXT NOT NULL
        );
        CREATE TABLE schema_version (
          id INTEGER PRIMARY KEY CHECK (id = 1),
          version INTEGER NOT NULL,
          updated_at TEXT NOT NULL
        );

        INSERT INTO contexts (name, status, created_at, updated_at) VALUES
          ('ticket-1', 'active', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z'),
          ('ticket-2', 'active', '2026-01-02T00:00:00Z', '2026-01-02T00:00:00Z'),
          ('ticket-3', 'active', '2026-01-03T00:00:00Z', '2026-01-03T00:00:00Z');
        INSERT INTO tasks (context_id, title, status, created_at, updated_at) VALUES
          (1, 'Step A', 'planned', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z'),
          (1, 'Step B', 'planned', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z'),
          (2, 'Step C', 'complete', '2026-01-02T00:00:00Z', '2026-01-02T00:00:00Z');
        INSERT INTO global_state (id, active_context_id, updated_at)
          VALUES (1, 1, '2026-01-01T00:00:00Z');
        INSERT INTO schema_version (id, version, updated_at)
          VALUES (1, 1, '2026-01-01T00:00:00Z');
        ",
    )
    .unwrap_or_else(|err| panic!("failed to seed legacy db: {err}"));
}

fn count_rows(db_path: &Path, table: &str) -> i64 {
    let conn = Connection::open(db_path)
        .unwrap_or_else(|err| panic!("failed to open db for counting: {err}"));
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        .unwrap_or_else(|err| panic!("failed to count {table}: {err}"))
}

#[test]
fn fresh_database_supports_context_and_task_workflow() {
    let sandbox = unique_temp_dir("taskplan-cli-fresh");
    let db = sandbox.join("plan.db");
    let db_arg = path_str(&db);

    let context =
        run_json(["--db", db_arg, "context", "new", "alpha", "--switch"]);
    assert_eq!(as_str(&context, "name"), "alpha");
    assert_eq!(as_str(&context, "status"), "active");
    assert_eq!(as_str(&context, "contract_version"), "tp.v1");

    let first = run_json(["--db", db_arg, "task", "add", "write failing test"]);
    assert_eq!(as_i64(&first, "task_number"), 1);
    let second = run_json([
        "--db",
        db_arg,
        "task",
        "add",
        "make it pass",
        "--description",
        "small steps",
    ]);
    assert_eq!(as_i64(&second, "task_number"), 2);

    let done = run_json(["--db", db_arg, "task", "done", "1"]);
    assert_eq!(as_str(&done, "status"), "complete");

    let listing = run_json(["--db", db_arg, "task", "list"]);
    let tasks = listing
        .get("tasks")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing tasks array: {listing}"));
    assert_eq!(tasks.len(), 2);

    let status = run_json(["--db", db_arg, "db", "schema-version"]);
    assert_eq!(as_i64(&status, "current_version"), 3);
    assert!(as_bool(&status, "up_to_date"));
}

#[test]
fn legacy_database_migrates_with_shipped_patches() {
    let sandbox = unique_temp_dir("taskplan-cli-legacy");
    let db = sandbox.join("plan.db");
    make_legacy_db(&db);
    let db_arg = path_str(&db);
    let patches = shipped_patches_dir();

    let dry = run_json([
        "--db",
        db_arg,
        "--patches-dir",
        path_str(&patches),
        "db",
        "migrate",
        "--dry-run",
    ]);
    assert!(as_bool(&dry, "dry_run"));
    assert_eq!(as_i64(&dry, "current_version"), 1);
    assert_eq!(dry.get("would_apply_versions"), Some(&serde_json::json!([2, 3])));

    let migrated = run_json([
        "--db",
        db_arg,
        "--patches-dir",
        path_str(&patches),
        "db",
        "migrate",
    ]);
    assert_eq!(as_i64(&migrated, "before_version"), 1);
    assert_eq!(as_i64(&migrated, "after_version"), 3);
    assert!(as_bool(&migrated, "up_to_date"));

    // Data survived and the pipeline left a verified backup behind.
    assert_eq!(count_rows(&db, "contexts"), 3);
    assert_eq!(count_rows(&db, "tasks"), 3);
    let backups = fs::read_dir(sandbox.join(".backups"))
        .unwrap_or_else(|err| panic!("missing .backups dir: {err}"))
        .count();
    assert!(backups >= 1);

    // The migrated database serves the normal workflow.
    let listing =
        run_json(["--db", db_arg, "task", "list", "--context", "ticket-1"]);
    let tasks = listing
        .get("tasks")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing tasks array: {listing}"));
    assert_eq!(tasks.len(), 2);
}

#[test]
fn destructive_migration_aborts_and_preserves_live_data() {
    let sandbox = unique_temp_dir("taskplan-cli-destructive");
    let db = sandbox.join("plan.db");
    make_legacy_db(&db);
    let db_arg = path_str(&db);

    let patches = sandbox.join("bad_patches");
    fs::create_dir_all(&patches)
        .unwrap_or_else(|err| panic!("failed to create patches dir: {err}"));
    fs::write(
        patches.join("patch-2.sql"),
        "CREATE TABLE contexts_new (
           id INTEGER PRIMARY KEY AUTOINCREMENT,
           name TEXT NOT NULL,
           status TEXT NOT NULL DEFAULT 'active',
           description_md TEXT,
           created_at TEXT NOT NULL,
           updated_at TEXT NOT NULL
         );
         DROP TABLE contexts;
         ALTER TABLE contexts_new RENAME TO contexts;",
    )
    .unwrap_or_else(|err| panic!("failed to write destructive patch: {err}"));

    let output = run_tp([
        "--db",
        db_arg,
        "--patches-dir",
        path_str(&patches),
        "db",
        "migrate",
    ]);
    assert!(!output.status.success(), "destructive migration must fail");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("NOT touched"), "stderr should state the live db is safe: {stderr}");
    assert!(stderr.contains("contexts"), "stderr should name the table: {stderr}");

    // The live database kept every row and its recorded version.
    assert_eq!(count_rows(&db, "contexts"), 3);
    assert_eq!(count_rows(&db, "tasks"), 3);
    let conn = Connection::open(&db)
        .unwrap_or_else(|err| panic!("failed to reopen db: {err}"));
    let version: i64 = conn
        .query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| row.get(0))
        .unwrap_or_else(|err| panic!("failed to read schema version: {err}"));
    assert_eq!(version, 1);
}

#[test]
fn db_backup_emits_verified_artifact() {
    let sandbox = unique_temp_dir("taskplan-cli-backup");
    let db = sandbox.join("plan.db");
    let db_arg = path_str(&db);

    run_json(["--db", db_arg, "context", "new", "alpha"]);

    let backup = run_json(["--db", db_arg, "db", "backup"]);
    assert_eq!(as_str(&backup, "status"), "ok");
    let digest = as_str(&backup, "sha256");
    assert_eq!(digest.len(), 64);
    assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));

    let backup_path = PathBuf::from(as_str(&backup, "backup_path"));
    assert!(backup_path.exists());
    assert!(backup_path.starts_with(sandbox.join(".backups")));
}
