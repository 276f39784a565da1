use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use taskplan_core::{
    validate_row_counts, BackupArtifact, BackupError, Context as PlanContext, ContextNote,
    ContextStatus, MigrationOutcome, MigrationPhase, NoteKind, RowCountSnapshot, Task, TaskNote,
    TaskStatus,
};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use ulid::Ulid;

pub const LATEST_SCHEMA_VERSION: i64 = 3;

/// Backup directory created next to the live database file.
pub const BACKUP_DIR_NAME: &str = ".backups";

const CREATE_SCHEMA_VERSION_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_version (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  version INTEGER NOT NULL,
  updated_at TEXT NOT NULL
);
";

// Full current-version schema, applied directly to fresh databases. Legacy
// databases reach the same shape through schema_patches/.
const BASE_SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS contexts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE,
  status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active','completed')),
  description_md TEXT,
  archived_at TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  context_id INTEGER NOT NULL,
  task_number INTEGER,
  title TEXT NOT NULL,
  description_md TEXT,
  status TEXT NOT NULL DEFAULT 'planned' CHECK (status IN ('planned','in_progress','complete')),
  is_deleted INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  completed_at TEXT,
  FOREIGN KEY (context_id) REFERENCES contexts(id)
);

CREATE TABLE IF NOT EXISTS context_notes (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  context_id INTEGER NOT NULL,
  note_md TEXT NOT NULL,
  kind TEXT NOT NULL DEFAULT 'note',
  created_at TEXT NOT NULL,
  actor TEXT,
  FOREIGN KEY (context_id) REFERENCES contexts(id)
);

CREATE TABLE IF NOT EXISTS task_notes (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  task_id INTEGER NOT NULL,
  note_md TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (task_id) REFERENCES tasks(id)
);

CREATE TABLE IF NOT EXISTS global_state (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  active_context_id INTEGER,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (active_context_id) REFERENCES contexts(id)
);

CREATE INDEX IF NOT EXISTS idx_tasks_context ON tasks(context_id, is_deleted);
CREATE INDEX IF NOT EXISTS idx_context_notes_context ON context_notes(context_id);
CREATE INDEX IF NOT EXISTS idx_task_notes_task ON task_notes(task_id);
";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("sql error in patch {version}: {source}")]
    Sql {
        version: i64,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to read patch file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to list patches in {}: {source}", dir.display())]
    Discover {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub struct PlanStore {
    conn: Connection,
    db_path: PathBuf,
}

impl PlanStore {
    /// Open the database and configure required runtime pragmas. Does not
    /// create or migrate the schema; see [`PlanStore::ensure_schema`].
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot
    /// be applied.
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open sqlite database at {}", db_path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn, db_path: db_path.to_path_buf() })
    }

    /// Open the database and bring its schema to the latest version.
    ///
    /// Fresh files get the full current schema directly. Files behind the
    /// latest version go through the full safety pipeline ([`safe_migrate`]);
    /// the connection is closed for the duration of the pipeline so that no
    /// handle spans the trial run. Any outcome other than success or
    /// up-to-date is fatal to the open.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened, the schema cannot
    /// be bootstrapped, or the migration pipeline aborts.
    pub fn ensure_schema(db_path: &Path, patches_dir: &Path) -> Result<Self> {
        let store = Self::open(db_path)?;
        let status = store.bootstrap_schema()?;
        if status.current_version >= LATEST_SCHEMA_VERSION {
            return Ok(store);
        }

        drop(store);

        match safe_migrate(db_path, status.current_version, LATEST_SCHEMA_VERSION, patches_dir) {
            MigrationOutcome::Success { backup_path } => {
                info!(backup = %backup_path.display(), "schema migrated to latest version");
            }
            MigrationOutcome::UpToDate => {}
            MigrationOutcome::AbortedValidation { reason, .. }
            | MigrationOutcome::AbortedInfrastructure { reason } => {
                bail!("schema migration aborted: {reason}");
            }
        }

        Self::open(db_path)
    }

    /// Report current and target schema versions plus pending patch versions.
    /// Read-only apart from creating the `schema_version` table itself.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_VERSION_SQL)
            .context("failed to apply schema_version table")?;
        let (current_version, inferred_from_legacy) =
            detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    fn bootstrap_schema(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_VERSION_SQL)
            .context("failed to apply schema_version table")?;

        if !table_exists(&self.conn, "contexts")? {
            // Fresh database: latest schema directly, no patch replay.
            self.conn.execute_batch(BASE_SCHEMA_SQL).context("failed to apply base schema")?;
            set_schema_version(&self.conn, LATEST_SCHEMA_VERSION)?;
            return Ok(SchemaStatus {
                current_version: LATEST_SCHEMA_VERSION,
                target_version: LATEST_SCHEMA_VERSION,
                pending_versions: Vec::new(),
                inferred_from_legacy: false,
            });
        }

        let (current_version, inferred_from_legacy) =
            detect_effective_schema_version(&self.conn)?;
        if inferred_from_legacy {
            set_schema_version(&self.conn, current_version)?;
        }

        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Run quick-check and foreign-key-check health probes plus schema status.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    // ── Context surface ─────────────────────────────────────────────

    /// Create a context. With `switch` set the new context also becomes the
    /// active one.
    ///
    /// # Errors
    /// Returns an error when the name collides or the write fails.
    pub fn create_context(
        &mut self,
        name: &str,
        description_md: Option<&str>,
        switch: bool,
    ) -> Result<PlanContext> {
        let now = OffsetDateTime::now_utc();
        let stamp = rfc3339(now)?;
        let tx = self.conn.transaction().context("failed to start transaction")?;

        tx.execute(
            "INSERT INTO contexts (name, status, description_md, created_at, updated_at)
             VALUES (?1, 'active', ?2, ?3, ?3)",
            params![name, description_md, stamp],
        )
        .with_context(|| format!("failed to create context '{name}'"))?;
        let id = tx.last_insert_rowid();

        if switch {
            tx.execute(
                "INSERT OR REPLACE INTO global_state (id, active_context_id, updated_at)
                 VALUES (1, ?1, ?2)",
                params![id, stamp],
            )
            .context("failed to set active context")?;
        }

        tx.commit().context("failed to commit context creation")?;

        Ok(PlanContext {
            id,
            name: name.to_string(),
            status: ContextStatus::Active,
            description_md: description_md.map(str::to_string),
            archived_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Resolve a context by numeric id or by name.
    ///
    /// # Errors
    /// Returns an error when no context matches.
    pub fn resolve_context(&self, context_ref: &str) -> Result<PlanContext> {
        let found = if let Ok(id) = context_ref.parse::<i64>() {
            self.context_by("id = ?1", params![id])?
        } else {
            self.context_by("name = ?1", params![context_ref])?
        };
        found.ok_or_else(|| anyhow!("context not found: {context_ref}"))
    }

    /// # Errors
    /// Returns an error when the listing query fails.
    pub fn list_contexts(&self, include_completed: bool) -> Result<Vec<PlanContext>> {
        let sql = if include_completed {
            "SELECT id, name, status, description_md, archived_at, created_at, updated_at
             FROM contexts ORDER BY id"
        } else {
            "SELECT id, name, status, description_md, archived_at, created_at, updated_at
             FROM contexts WHERE status = 'active' ORDER BY id"
        };
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map([], read_context_row)?;

        let mut contexts = Vec::new();
        for row in rows {
            contexts.push(context_from_row(row?)?);
        }
        Ok(contexts)
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn active_context(&self) -> Result<Option<PlanContext>> {
        let id: Option<i64> = self
            .conn
            .query_row("SELECT active_context_id FROM global_state WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()
            .context("failed to read active context")?
            .flatten();

        match id {
            Some(id) => self.context_by("id = ?1", params![id]),
            None => Ok(None),
        }
    }

    /// Make the referenced context the active one.
    ///
    /// # Errors
    /// Returns an error when the context does not exist or the write fails.
    pub fn switch_context(&mut self, context_ref: &str) -> Result<PlanContext> {
        let context = self.resolve_context(context_ref)?;
        let stamp = rfc3339(OffsetDateTime::now_utc())?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO global_state (id, active_context_id, updated_at)
                 VALUES (1, ?1, ?2)",
                params![context.id, stamp],
            )
            .context("failed to switch active context")?;
        Ok(context)
    }

    fn context_by(
        &self,
        predicate: &str,
        args: impl rusqlite::Params,
    ) -> Result<Option<PlanContext>> {
        let sql = format!(
            "SELECT id, name, status, description_md, archived_at, created_at, updated_at
             FROM contexts WHERE {predicate}"
        );
        let row = self
            .conn
            .query_row(&sql, args, read_context_row)
            .optional()
            .context("failed to look up context")?;
        row.map(context_from_row).transpose()
    }

    // ── Task surface ────────────────────────────────────────────────

    /// Create a task in the referenced context, assigning the next
    /// per-context task number.
    ///
    /// # Errors
    /// Returns an error when the context does not exist or the write fails.
    pub fn create_task(
        &mut self,
        context_ref: &str,
        title: &str,
        description_md: Option<&str>,
    ) -> Result<Task> {
        let context = self.resolve_context(context_ref)?;
        let now = OffsetDateTime::now_utc();
        let stamp = rfc3339(now)?;

        let tx = self.conn.transaction().context("failed to start transaction")?;
        // Deleted tasks keep their numbers so numbering never reuses one.
        let task_number: i64 = tx.query_row(
            "SELECT COALESCE(MAX(task_number), 0) + 1 FROM tasks WHERE context_id = ?1",
            params![context.id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO tasks (context_id, task_number, title, description_md, status,
                                is_deleted, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'planned', 0, ?5, ?5)",
            params![context.id, task_number, title, description_md, stamp],
        )
        .with_context(|| format!("failed to create task '{title}'"))?;
        let id = tx.last_insert_rowid();
        tx.commit().context("failed to commit task creation")?;

        Ok(Task {
            id,
            context_id: context.id,
            task_number,
            title: title.to_string(),
            description_md: description_md.map(str::to_string),
            status: TaskStatus::Planned,
            created_at: now,
            updated_at: now,
            completed_at: None,
        })
    }

    /// List non-deleted tasks of a context in task-number order.
    ///
    /// # Errors
    /// Returns an error when the context does not exist or the query fails.
    pub fn list_tasks(&self, context_ref: &str) -> Result<Vec<Task>> {
        let context = self.resolve_context(context_ref)?;
        let mut stmt = self.conn.prepare(
            "SELECT id, context_id, task_number, title, description_md, status,
                    created_at, updated_at, completed_at
             FROM tasks WHERE context_id = ?1 AND is_deleted = 0
             ORDER BY task_number",
        )?;
        let rows = stmt.query_map(params![context.id], read_task_row)?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(task_from_row(row?)?);
        }
        Ok(tasks)
    }

    /// Mark a task complete by its per-context number.
    ///
    /// # Errors
    /// Returns an error when the task does not exist or the write fails.
    pub fn complete_task(&mut self, context_ref: &str, task_number: i64) -> Result<Task> {
        let context = self.resolve_context(context_ref)?;
        let stamp = rfc3339(OffsetDateTime::now_utc())?;
        let updated = self
            .conn
            .execute(
                "UPDATE tasks SET status = 'complete', completed_at = ?1, updated_at = ?1
                 WHERE context_id = ?2 AND task_number = ?3 AND is_deleted = 0",
                params![stamp, context.id, task_number],
            )
            .context("failed to complete task")?;
        if updated == 0 {
            bail!("task {task_number} not found in context '{}'", context.name);
        }
        self.task_by_number(context.id, task_number)?
            .ok_or_else(|| anyhow!("task {task_number} vanished after update"))
    }

    /// Soft-delete a task by its per-context number. The task keeps its row
    /// (and number) but disappears from listings.
    ///
    /// # Errors
    /// Returns an error when the task does not exist or the write fails.
    pub fn delete_task(&mut self, context_ref: &str, task_number: i64) -> Result<()> {
        let context = self.resolve_context(context_ref)?;
        let stamp = rfc3339(OffsetDateTime::now_utc())?;
        let updated = self
            .conn
            .execute(
                "UPDATE tasks SET is_deleted = 1, updated_at = ?1
                 WHERE context_id = ?2 AND task_number = ?3 AND is_deleted = 0",
                params![stamp, context.id, task_number],
            )
            .context("failed to delete task")?;
        if updated == 0 {
            bail!("task {task_number} not found in context '{}'", context.name);
        }
        Ok(())
    }

    fn task_by_number(&self, context_id: i64, task_number: i64) -> Result<Option<Task>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, context_id, task_number, title, description_md, status,
                        created_at, updated_at, completed_at
                 FROM tasks WHERE context_id = ?1 AND task_number = ?2 AND is_deleted = 0",
                params![context_id, task_number],
                read_task_row,
            )
            .optional()
            .context("failed to look up task")?;
        row.map(task_from_row).transpose()
    }

    // ── Notes ───────────────────────────────────────────────────────

    /// # Errors
    /// Returns an error when the context does not exist or the write fails.
    pub fn add_context_note(
        &mut self,
        context_ref: &str,
        kind: NoteKind,
        note_md: &str,
        actor: Option<&str>,
    ) -> Result<ContextNote> {
        let context = self.resolve_context(context_ref)?;
        let now = OffsetDateTime::now_utc();
        let stamp = rfc3339(now)?;
        self.conn
            .execute(
                "INSERT INTO context_notes (context_id, note_md, kind, created_at, actor)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![context.id, note_md, kind.as_str(), stamp, actor],
            )
            .context("failed to add context note")?;

        Ok(ContextNote {
            id: self.conn.last_insert_rowid(),
            context_id: context.id,
            kind,
            note_md: note_md.to_string(),
            created_at: now,
            actor: actor.map(str::to_string),
        })
    }

    /// # Errors
    /// Returns an error when the context does not exist or the query fails.
    pub fn list_context_notes(
        &self,
        context_ref: &str,
        kind: Option<NoteKind>,
    ) -> Result<Vec<ContextNote>> {
        let context = self.resolve_context(context_ref)?;
        let mut stmt = self.conn.prepare(
            "SELECT id, context_id, kind, note_md, created_at, actor
             FROM context_notes
             WHERE context_id = ?1 AND (?2 IS NULL OR kind = ?2)
             ORDER BY id",
        )?;
        let rows = stmt.query_map(
            params![context.id, kind.map(NoteKind::as_str)],
            |row| {
                Ok(ContextNoteRow {
                    id: row.get(0)?,
                    context_id: row.get(1)?,
                    kind: row.get(2)?,
                    note_md: row.get(3)?,
                    created_at: row.get(4)?,
                    actor: row.get(5)?,
                })
            },
        )?;

        let mut notes = Vec::new();
        for row in rows {
            notes.push(context_note_from_row(row?)?);
        }
        Ok(notes)
    }

    /// # Errors
    /// Returns an error when the task does not exist or the write fails.
    pub fn add_task_note(
        &mut self,
        context_ref: &str,
        task_number: i64,
        note_md: &str,
    ) -> Result<TaskNote> {
        let context = self.resolve_context(context_ref)?;
        let task = self
            .task_by_number(context.id, task_number)?
            .ok_or_else(|| anyhow!("task {task_number} not found in context '{}'", context.name))?;
        let now = OffsetDateTime::now_utc();
        let stamp = rfc3339(now)?;
        self.conn
            .execute(
                "INSERT INTO task_notes (task_id, note_md, created_at) VALUES (?1, ?2, ?3)",
                params![task.id, note_md, stamp],
            )
            .context("failed to add task note")?;

        Ok(TaskNote {
            id: self.conn.last_insert_rowid(),
            task_id: task.id,
            note_md: note_md.to_string(),
            created_at: now,
        })
    }

    /// # Errors
    /// Returns an error when the task does not exist or the query fails.
    pub fn list_task_notes(&self, context_ref: &str, task_number: i64) -> Result<Vec<TaskNote>> {
        let context = self.resolve_context(context_ref)?;
        let task = self
            .task_by_number(context.id, task_number)?
            .ok_or_else(|| anyhow!("task {task_number} not found in context '{}'", context.name))?;
        let mut stmt = self.conn.prepare(
            "SELECT id, task_id, note_md, created_at FROM task_notes
             WHERE task_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![task.id], |row| {
            Ok(TaskNoteRow {
                id: row.get(0)?,
                task_id: row.get(1)?,
                note_md: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;

        let mut notes = Vec::new();
        for row in rows {
            notes.push(task_note_from_row(row?)?);
        }
        Ok(notes)
    }
}

// ── Checksum utility ────────────────────────────────────────────────

/// Hex SHA-256 digest of a file, streamed in 64 KiB chunks.
///
/// # Errors
/// Returns an error when the file cannot be opened or read (including a
/// missing path).
pub fn sha256_file(path: &Path) -> Result<String> {
    sha256_hex(path).with_context(|| format!("failed to hash {}", path.display()))
}

fn sha256_hex(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0_u8; 65536];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

// ── Row-count snapshot ──────────────────────────────────────────────

/// Count the rows of every user table. System tables (`sqlite_` prefix) are
/// excluded; an empty database yields an empty snapshot.
///
/// # Errors
/// Returns an error when table enumeration or a count query fails.
pub fn table_row_counts(conn: &Connection) -> Result<RowCountSnapshot> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
    )?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("failed to enumerate user tables")?;

    let mut snapshot = RowCountSnapshot::new();
    for name in names {
        let count: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM \"{name}\""), [], |row| row.get(0))
            .with_context(|| format!("failed to count rows in {name}"))?;
        snapshot.insert(name, count);
    }
    Ok(snapshot)
}

// ── Verified backup ─────────────────────────────────────────────────

/// Copy the database into the next free dated slot under `.backups/` and
/// return the artifact only after proving the copy byte-identical to the
/// source.
///
/// The live file is digested before the copy so the copy has a fixed
/// fingerprint to match; a mismatch (disk error, concurrent writer,
/// filesystem quirk) deletes the copy before the error surfaces — an
/// unverified backup never survives on disk.
///
/// # Errors
/// [`BackupError::MissingDatabase`] when the source is absent,
/// [`BackupError::ExhaustedSlots`] when all 26 slots for the date are taken,
/// [`BackupError::ChecksumMismatch`] when the copy does not match.
pub fn create_verified_backup(db_path: &Path) -> Result<BackupArtifact, BackupError> {
    if !db_path.exists() {
        return Err(BackupError::MissingDatabase(db_path.to_path_buf()));
    }

    let file_name = db_path.file_name().and_then(OsStr::to_str).ok_or_else(|| {
        BackupError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "database path has no usable file name",
        ))
    })?;

    let backup_dir = db_path.parent().unwrap_or_else(|| Path::new(".")).join(BACKUP_DIR_NAME);
    fs::create_dir_all(&backup_dir)?;

    let base = format!("{file_name}.{}", backup_date_stamp(OffsetDateTime::now_utc()));
    let mut slot = None;
    for letter in 'a'..='z' {
        let candidate = backup_dir.join(format!("{base}{letter}"));
        if !candidate.exists() {
            slot = Some(candidate);
            break;
        }
    }
    let Some(backup_path) = slot else {
        return Err(BackupError::ExhaustedSlots { base });
    };

    // Fingerprint the live file before copying; the copy must match it.
    let live = sha256_hex(db_path)?;
    fs::copy(db_path, &backup_path)?;
    let backup = sha256_hex(&backup_path)?;

    if backup != live {
        if let Err(err) = fs::remove_file(&backup_path) {
            warn!(
                path = %backup_path.display(),
                error = %err,
                "failed to delete unverified backup"
            );
        }
        return Err(BackupError::ChecksumMismatch { live, backup });
    }

    debug!(path = %backup_path.display(), sha256 = %backup, "backup verified");
    Ok(BackupArtifact { path: backup_path, sha256: backup })
}

/// `YYMMDD` stamp used in backup slot names.
#[must_use]
pub fn backup_date_stamp(now: OffsetDateTime) -> String {
    format!("{:02}{:02}{:02}", now.year().rem_euclid(100), u8::from(now.month()), now.day())
}

// ── Patch applier ───────────────────────────────────────────────────

/// Apply every eligible schema patch from `patches_dir` in ascending version
/// order and return the final version reached.
///
/// A patch is eligible when `current_version < version <= target_version`.
/// Files not named `patch-<N>.sql` are ignored. Reaching less than
/// `target_version` because no eligible patch exists is not an error. Each
/// patch executes as one transactional batch together with its
/// `schema_version` record; foreign-key enforcement is relaxed around the
/// batch (table rebuilds transiently violate referential integrity) and
/// restored afterwards on success and failure alike.
///
/// # Errors
/// [`PatchError::Sql`] carries the underlying SQL error unmodified;
/// [`PatchError::Read`]/[`PatchError::Discover`] report filesystem problems.
pub fn apply_patches(
    conn: &mut Connection,
    current_version: i64,
    target_version: i64,
    patches_dir: &Path,
) -> Result<i64, PatchError> {
    let mut version_reached = current_version;

    for (version, path) in discover_patches(patches_dir)? {
        if version <= version_reached || version > target_version {
            continue;
        }
        let script = fs::read_to_string(&path)
            .map_err(|source| PatchError::Read { path: path.clone(), source })?;
        apply_one_patch(conn, version, &script)?;
        version_reached = version;
        debug!(version, patch = %path.display(), "applied schema patch");
    }

    Ok(version_reached)
}

fn discover_patches(patches_dir: &Path) -> Result<Vec<(i64, PathBuf)>, PatchError> {
    let discover =
        |source| PatchError::Discover { dir: patches_dir.to_path_buf(), source };
    let entries = fs::read_dir(patches_dir).map_err(discover)?;

    let mut patches = Vec::new();
    for entry in entries {
        let path = entry.map_err(discover)?.path();
        let Some(name) = path.file_name().and_then(OsStr::to_str) else {
            continue;
        };
        if let Some(version) = parse_patch_version(name) {
            patches.push((version, path));
        }
    }
    patches.sort_by_key(|(version, _)| *version);
    Ok(patches)
}

fn parse_patch_version(file_name: &str) -> Option<i64> {
    let digits = file_name.strip_prefix("patch-")?.strip_suffix(".sql")?;
    if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn apply_one_patch(conn: &mut Connection, version: i64, script: &str) -> Result<(), PatchError> {
    let sql = |source| PatchError::Sql { version, source };

    // The pragma cannot change inside a transaction, so it brackets the
    // transactional batch; restored on both exit paths.
    conn.pragma_update(None, "foreign_keys", false).map_err(sql)?;
    let result = run_patch_script(conn, version, script);
    let restore = conn.pragma_update(None, "foreign_keys", true).map_err(sql);
    result.and(restore)
}

fn run_patch_script(conn: &mut Connection, version: i64, script: &str) -> Result<(), PatchError> {
    let sql = |source| PatchError::Sql { version, source };

    let tx = conn.transaction().map_err(sql)?;
    tx.execute_batch(script).map_err(sql)?;
    // The version record commits or rolls back together with the script.
    tx.execute(
        "INSERT OR REPLACE INTO schema_version (id, version, updated_at)
         VALUES (1, ?1, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))",
        params![version],
    )
    .map_err(sql)?;
    tx.commit().map_err(sql)
}

// ── Migration orchestrator ──────────────────────────────────────────

/// Run the full migration safety pipeline against `db_path`.
///
/// Protocol: verified backup → live row-count baseline → trial run of the
/// identical patch sequence on a disposable copy → validate the trial →
/// only then patch the live database → validate again. The live database is
/// mutated at most once, and never before the trial has passed; the baseline
/// is captured strictly after the backup is verified and strictly before any
/// patch executes, so both validations compare against the same untouched
/// state.
///
/// Every failure mode is an outcome value, never a panic or error return:
/// preconditions and backup problems abort as infrastructure; a trial
/// failure aborts as validation with the live database guaranteed untouched;
/// a live-phase failure aborts as validation with the backup named as the
/// manual recovery path (no automatic rollback is attempted).
#[must_use]
pub fn safe_migrate(
    db_path: &Path,
    current_version: i64,
    target_version: i64,
    patches_dir: &Path,
) -> MigrationOutcome {
    if current_version >= target_version {
        return MigrationOutcome::UpToDate;
    }
    if !db_path.exists() {
        return MigrationOutcome::AbortedInfrastructure {
            reason: format!("database does not exist: {}", db_path.display()),
        };
    }
    if !patches_dir.exists() {
        return MigrationOutcome::AbortedInfrastructure {
            reason: format!("patches directory does not exist: {}", patches_dir.display()),
        };
    }

    // Nothing has been mutated yet; backup problems are infrastructure.
    let backup = match create_verified_backup(db_path) {
        Ok(artifact) => artifact,
        Err(err) => {
            return MigrationOutcome::AbortedInfrastructure {
                reason: format!("backup failed: {err}"),
            };
        }
    };
    info!(backup = %backup.path.display(), "verified backup created");

    // The shared baseline for both validations.
    let before = match snapshot_counts(db_path) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            return MigrationOutcome::AbortedInfrastructure {
                reason: format!("failed to snapshot live row counts: {err:#}"),
            };
        }
    };

    let scratch = match ScratchCopy::create(db_path) {
        Ok(scratch) => scratch,
        Err(err) => {
            return MigrationOutcome::AbortedInfrastructure {
                reason: format!("failed to create scratch copy: {err}"),
            };
        }
    };

    let trial_counts =
        match trial_migrate(scratch.path(), current_version, target_version, patches_dir) {
            Ok(counts) => counts,
            Err(TrialFailure::Patch(err @ PatchError::Sql { .. })) => {
                return MigrationOutcome::AbortedValidation {
                    phase: MigrationPhase::Trial,
                    reason: format!(
                        "trial migration failed, SQL error on the copy: {err}; \
                         live database NOT touched; backup at {}",
                        backup.path.display()
                    ),
                    errors: Vec::new(),
                    backup_path: backup.path,
                };
            }
            Err(TrialFailure::Patch(err)) => {
                return MigrationOutcome::AbortedInfrastructure { reason: err.to_string() };
            }
            Err(TrialFailure::Infra(err)) => {
                return MigrationOutcome::AbortedInfrastructure { reason: format!("{err:#}") };
            }
        };
    drop(scratch);

    let errors = validate_row_counts(&before, &trial_counts);
    if !errors.is_empty() {
        return MigrationOutcome::AbortedValidation {
            phase: MigrationPhase::Trial,
            reason: format!(
                "trial migration failed, data loss detected on copy: {}; \
                 live database NOT touched; backup at {}",
                join_errors(&errors),
                backup.path.display()
            ),
            errors,
            backup_path: backup.path,
        };
    }
    info!("trial migration passed on scratch copy");

    // Only now touch the live database.
    let live_counts = match live_migrate(db_path, current_version, target_version, patches_dir) {
        Ok(counts) => counts,
        Err(err) => {
            return MigrationOutcome::AbortedValidation {
                phase: MigrationPhase::Live,
                reason: format!(
                    "live migration failed: {err:#}; live database may be partially \
                     migrated; restore from backup at {}",
                    backup.path.display()
                ),
                errors: Vec::new(),
                backup_path: backup.path,
            };
        }
    };

    let errors = validate_row_counts(&before, &live_counts);
    if !errors.is_empty() {
        return MigrationOutcome::AbortedValidation {
            phase: MigrationPhase::Live,
            reason: format!(
                "live migration failed validation, data loss detected: {}; \
                 restore from backup at {}",
                join_errors(&errors),
                backup.path.display()
            ),
            errors,
            backup_path: backup.path,
        };
    }

    info!(backup = %backup.path.display(), "migration complete");
    MigrationOutcome::Success { backup_path: backup.path }
}

enum TrialFailure {
    Patch(PatchError),
    Infra(anyhow::Error),
}

fn trial_migrate(
    scratch_path: &Path,
    current_version: i64,
    target_version: i64,
    patches_dir: &Path,
) -> Result<RowCountSnapshot, TrialFailure> {
    let mut conn = Connection::open(scratch_path)
        .map_err(|err| TrialFailure::Infra(anyhow!("failed to open scratch copy: {err}")))?;
    apply_patches(&mut conn, current_version, target_version, patches_dir)
        .map_err(TrialFailure::Patch)?;
    table_row_counts(&conn).map_err(TrialFailure::Infra)
}

fn live_migrate(
    db_path: &Path,
    current_version: i64,
    target_version: i64,
    patches_dir: &Path,
) -> Result<RowCountSnapshot> {
    let mut conn = Connection::open(db_path)
        .with_context(|| format!("failed to open live database {}", db_path.display()))?;
    apply_patches(&mut conn, current_version, target_version, patches_dir)
        .context("patch application failed on the live database")?;
    table_row_counts(&conn)
}

fn snapshot_counts(db_path: &Path) -> Result<RowCountSnapshot> {
    let conn = Connection::open(db_path)
        .with_context(|| format!("failed to open {} for row counts", db_path.display()))?;
    table_row_counts(&conn)
}

fn join_errors(errors: &[taskplan_core::ValidationError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

/// Disposable copy of the live database for the trial run. The file is
/// deleted on every exit path, including panics, via `Drop`.
struct ScratchCopy {
    path: PathBuf,
}

impl ScratchCopy {
    fn create(db_path: &Path) -> std::io::Result<Self> {
        let path = std::env::temp_dir().join(format!("taskplan-trial-{}.db", Ulid::new()));
        fs::copy(db_path, &path)?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchCopy {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to remove scratch copy");
        }
    }
}

// ── Schema helpers ──────────────────────────────────────────────────

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn get_schema_version(conn: &Connection) -> Result<Option<i64>> {
    conn.query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| row.get(0))
        .optional()
        .context("failed to read recorded schema version")
}

fn set_schema_version(conn: &Connection, version: i64) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_version (id, version, updated_at)
         VALUES (1, ?1, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))",
        params![version],
    )
    .with_context(|| format!("failed to record schema version {version}"))?;
    Ok(())
}

/// Recorded version when present, else a version inferred from table shape.
/// Databases predating version tracking are recognized by which columns the
/// later patches added.
fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    if let Some(version) = get_schema_version(conn)? {
        return Ok((version, false));
    }

    if !table_exists(conn, "contexts")? {
        return Ok((0, false));
    }
    if table_has_column(conn, "contexts", "archived_at")? {
        return Ok((3, true));
    }
    if table_has_column(conn, "tasks", "task_number")? {
        return Ok((2, true));
    }
    Ok((1, true))
}

// ── Row readers ─────────────────────────────────────────────────────

struct ContextRow {
    id: i64,
    name: String,
    status: String,
    description_md: Option<String>,
    archived_at: Option<String>,
    created_at: String,
    updated_at: String,
}

fn read_context_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContextRow> {
    Ok(ContextRow {
        id: row.get(0)?,
        name: row.get(1)?,
        status: row.get(2)?,
        description_md: row.get(3)?,
        archived_at: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn context_from_row(raw: ContextRow) -> Result<PlanContext> {
    Ok(PlanContext {
        id: raw.id,
        status: ContextStatus::parse(&raw.status)
            .ok_or_else(|| anyhow!("unknown context status: {}", raw.status))?,
        description_md: raw.description_md,
        archived_at: raw.archived_at.as_deref().map(parse_rfc3339).transpose()?,
        created_at: parse_rfc3339(&raw.created_at)?,
        updated_at: parse_rfc3339(&raw.updated_at)?,
        name: raw.name,
    })
}

struct TaskRow {
    id: i64,
    context_id: i64,
    task_number: i64,
    title: String,
    description_md: Option<String>,
    status: String,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

fn read_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok(TaskRow {
        id: row.get(0)?,
        context_id: row.get(1)?,
        task_number: row.get(2)?,
        title: row.get(3)?,
        description_md: row.get(4)?,
        status: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
        completed_at: row.get(8)?,
    })
}

fn task_from_row(raw: TaskRow) -> Result<Task> {
    Ok(Task {
        id: raw.id,
        context_id: raw.context_id,
        task_number: raw.task_number,
        status: TaskStatus::parse(&raw.status)
            .ok_or_else(|| anyhow!("unknown task status: {}", raw.status))?,
        description_md: raw.description_md,
        created_at: parse_rfc3339(&raw.created_at)?,
        updated_at: parse_rfc3339(&raw.updated_at)?,
        completed_at: raw.completed_at.as_deref().map(parse_rfc3339).transpose()?,
        title: raw.title,
    })
}

struct ContextNoteRow {
    id: i64,
    context_id: i64,
    kind: String,
    note_md: String,
    created_at: String,
    actor: Option<String>,
}

fn context_note_from_row(raw: ContextNoteRow) -> Result<ContextNote> {
    Ok(ContextNote {
        id: raw.id,
        context_id: raw.context_id,
        kind: NoteKind::parse(&raw.kind)
            .ok_or_else(|| anyhow!("unknown note kind: {}", raw.kind))?,
        note_md: raw.note_md,
        created_at: parse_rfc3339(&raw.created_at)?,
        actor: raw.actor,
    })
}

struct TaskNoteRow {
    id: i64,
    task_id: i64,
    note_md: String,
    created_at: String,
}

fn task_note_from_row(raw: TaskNoteRow) -> Result<TaskNote> {
    Ok(TaskNote {
        id: raw.id,
        task_id: raw.task_id,
        note_md: raw.note_md,
        created_at: parse_rfc3339(&raw.created_at)?,
    })
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
