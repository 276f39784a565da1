use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Suffix marking temporary migration working tables. Patches that rebuild a
/// table create `<name>_new`, copy rows across, drop the original, and rename.
/// Such tables are expected to appear and disappear mid-migration and are
/// excluded from data-loss checks.
pub const SCRATCH_TABLE_SUFFIX: &str = "_new";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContextStatus {
    Active,
    Completed,
}

impl ContextStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Planned,
    InProgress,
    Complete,
}

impl TaskStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "planned" => Some(Self::Planned),
            "in_progress" => Some(Self::InProgress),
            "complete" => Some(Self::Complete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NoteKind {
    Note,
    Goal,
    Plan,
}

impl NoteKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Note => "note",
            Self::Goal => "goal",
            Self::Plan => "plan",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "note" => Some(Self::Note),
            "goal" => Some(Self::Goal),
            "plan" => Some(Self::Plan),
            _ => None,
        }
    }
}

/// A tracked working context (a unit of work, e.g. one ticket or branch).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Context {
    pub id: i64,
    pub name: String,
    pub status: ContextStatus,
    pub description_md: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub archived_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// A step inside a context. `task_number` is the stable per-context ordinal
/// users refer to; `id` is the storage key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: i64,
    pub context_id: i64,
    pub task_number: i64,
    pub title: String,
    pub description_md: Option<String>,
    pub status: TaskStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContextNote {
    pub id: i64,
    pub context_id: i64,
    pub kind: NoteKind,
    pub note_md: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub actor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskNote {
    pub id: i64,
    pub task_id: i64,
    pub note_md: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Per-table row counts captured at one point in time. Immutable once built;
/// the migration pipeline captures one before patching and one after, then
/// compares the two.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RowCountSnapshot {
    counts: BTreeMap<String, i64>,
}

impl RowCountSnapshot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, table: impl Into<String>, count: i64) {
        self.counts.insert(table.into(), count);
    }

    #[must_use]
    pub fn get(&self, table: &str) -> Option<i64> {
        self.counts.get(table).copied()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.counts.iter().map(|(table, count)| (table.as_str(), *count))
    }
}

impl FromIterator<(String, i64)> for RowCountSnapshot {
    fn from_iter<I: IntoIterator<Item = (String, i64)>>(iter: I) -> Self {
        Self { counts: iter.into_iter().collect() }
    }
}

/// One data-loss finding from comparing two row-count snapshots.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("table '{table}' missing after migration (had {prior_count} rows)")]
    TableMissing { table: String, prior_count: i64 },
    #[error("table '{table}' lost rows: {prior_count} -> {new_count}")]
    RowsLost { table: String, prior_count: i64, new_count: i64 },
}

impl ValidationError {
    #[must_use]
    pub fn table(&self) -> &str {
        match self {
            Self::TableMissing { table, .. } | Self::RowsLost { table, .. } => table,
        }
    }
}

/// Compare row counts before and after a migration.
///
/// Tables that only exist in `after` (created by a patch) are never flagged;
/// growth is always acceptable. Tables ending in [`SCRATCH_TABLE_SUFFIX`] are
/// skipped entirely. An empty result means the migration destroyed no data.
#[must_use]
pub fn validate_row_counts(
    before: &RowCountSnapshot,
    after: &RowCountSnapshot,
) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    for (table, prior_count) in before.iter() {
        if table.ends_with(SCRATCH_TABLE_SUFFIX) {
            continue;
        }
        match after.get(table) {
            None => errors.push(ValidationError::TableMissing {
                table: table.to_string(),
                prior_count,
            }),
            Some(new_count) if new_count < prior_count => {
                errors.push(ValidationError::RowsLost {
                    table: table.to_string(),
                    prior_count,
                    new_count,
                });
            }
            Some(_) => {}
        }
    }

    errors
}

/// A backup file whose byte-for-byte identity to the live source was
/// confirmed by digest comparison before it was handed out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupArtifact {
    pub path: PathBuf,
    pub sha256: String,
}

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("database file does not exist: {}", .0.display())]
    MissingDatabase(PathBuf),
    #[error("exhausted backup slots for {base}[a-z]")]
    ExhaustedSlots { base: String },
    #[error("backup checksum mismatch: live={live} backup={backup}")]
    ChecksumMismatch { live: String, backup: String },
    #[error("backup io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which copy of the database a validation abort refers to. `Trial` aborts
/// leave the live database untouched; a `Live` abort means the live database
/// was already mutated and the backup is the recovery path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    Trial,
    Live,
}

impl Display for MigrationPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trial => write!(f, "trial"),
            Self::Live => write!(f, "live"),
        }
    }
}

/// Terminal result of one orchestrated migration attempt.
///
/// Returned by value rather than raised: callers must behave differently for
/// each kind (retry a validation abort only after fixing the patch content,
/// fix the environment for an infrastructure abort, do nothing for
/// `UpToDate`), so the distinction is part of the signature.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MigrationOutcome {
    Success {
        backup_path: PathBuf,
    },
    /// Current version is already at or past the target. A no-op signal,
    /// not a failure.
    UpToDate,
    AbortedValidation {
        phase: MigrationPhase,
        reason: String,
        errors: Vec<ValidationError>,
        backup_path: PathBuf,
    },
    AbortedInfrastructure {
        reason: String,
    },
}

impl MigrationOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// True when the database may carry effects from this attempt. Only a
    /// live-phase abort (or success) mutates the live file.
    #[must_use]
    pub fn live_touched(&self) -> bool {
        matches!(
            self,
            Self::Success { .. } | Self::AbortedValidation { phase: MigrationPhase::Live, .. }
        )
    }

    #[must_use]
    pub fn backup_path(&self) -> Option<&Path> {
        match self {
            Self::Success { backup_path } | Self::AbortedValidation { backup_path, .. } => {
                Some(backup_path)
            }
            Self::UpToDate | Self::AbortedInfrastructure { .. } => None,
        }
    }

    /// Abort reason, if this outcome is an abort.
    #[must_use]
    pub fn abort_reason(&self) -> Option<&str> {
        match self {
            Self::AbortedValidation { reason, .. } | Self::AbortedInfrastructure { reason } => {
                Some(reason)
            }
            Self::Success { .. } | Self::UpToDate => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(entries: &[(&str, i64)]) -> RowCountSnapshot {
        entries.iter().map(|(table, count)| ((*table).to_string(), *count)).collect()
    }

    #[test]
    fn validator_accepts_equal_and_grown_counts() {
        let before = snapshot(&[("contexts", 3), ("tasks", 3), ("users", 1)]);
        let after = snapshot(&[("contexts", 3), ("tasks", 5), ("users", 1), ("brand_new", 7)]);
        assert_eq!(validate_row_counts(&before, &after), vec![]);
    }

    #[test]
    fn validator_catches_shrinkage() {
        let before = snapshot(&[("t", 5)]);
        let after = snapshot(&[("t", 2)]);
        let errors = validate_row_counts(&before, &after);
        assert_eq!(
            errors,
            vec![ValidationError::RowsLost {
                table: "t".to_string(),
                prior_count: 5,
                new_count: 2
            }]
        );
        assert_eq!(errors[0].table(), "t");
    }

    #[test]
    fn validator_catches_disappearance() {
        let before = snapshot(&[("t", 5)]);
        let after = snapshot(&[]);
        let errors = validate_row_counts(&before, &after);
        assert_eq!(
            errors,
            vec![ValidationError::TableMissing { table: "t".to_string(), prior_count: 5 }]
        );
    }

    #[test]
    fn validator_skips_scratch_tables() {
        let before = snapshot(&[("contexts_new", 9), ("contexts", 3)]);
        let after = snapshot(&[("contexts", 3)]);
        assert_eq!(validate_row_counts(&before, &after), vec![]);
    }

    #[test]
    fn validation_error_messages_name_the_table() {
        let missing =
            ValidationError::TableMissing { table: "contexts".to_string(), prior_count: 3 };
        assert_eq!(missing.to_string(), "table 'contexts' missing after migration (had 3 rows)");

        let lost = ValidationError::RowsLost {
            table: "tasks".to_string(),
            prior_count: 3,
            new_count: 1,
        };
        assert_eq!(lost.to_string(), "table 'tasks' lost rows: 3 -> 1");
    }

    #[test]
    fn outcome_reports_live_touched_only_after_live_phase() {
        let trial = MigrationOutcome::AbortedValidation {
            phase: MigrationPhase::Trial,
            reason: "data loss on copy".to_string(),
            errors: vec![],
            backup_path: PathBuf::from("/tmp/plan.db.260807a"),
        };
        assert!(!trial.live_touched());
        assert!(trial.backup_path().is_some());

        let live = MigrationOutcome::AbortedValidation {
            phase: MigrationPhase::Live,
            reason: "data loss on live".to_string(),
            errors: vec![],
            backup_path: PathBuf::from("/tmp/plan.db.260807a"),
        };
        assert!(live.live_touched());

        let infra =
            MigrationOutcome::AbortedInfrastructure { reason: "missing patches dir".to_string() };
        assert!(!infra.live_touched());
        assert!(infra.backup_path().is_none());
        assert_eq!(infra.abort_reason(), Some("missing patches dir"));

        assert!(!MigrationOutcome::UpToDate.is_success());
        assert!(
            MigrationOutcome::Success { backup_path: PathBuf::from("/tmp/b") }.is_success()
        );
    }

    #[test]
    fn status_round_trips() {
        for status in [TaskStatus::Planned, TaskStatus::InProgress, TaskStatus::Complete] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        for status in [ContextStatus::Active, ContextStatus::Completed] {
            assert_eq!(ContextStatus::parse(status.as_str()), Some(status));
        }
        for kind in [NoteKind::Note, NoteKind::Goal, NoteKind::Plan] {
            assert_eq!(NoteKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(TaskStatus::parse("cancelled"), None);
    }

    mod properties {
        use proptest::prelude::*;

        use super::super::{validate_row_counts, RowCountSnapshot, ValidationError};

        fn table_name() -> impl Strategy<Value = String> {
            "[a-z][a-z0-9_]{0,12}"
        }

        proptest! {
            // Growth and new tables must never be flagged.
            #[test]
            fn no_false_positives_when_counts_do_not_shrink(
                entries in prop::collection::btree_map(table_name(), 0_i64..1000, 0..8),
                growth in prop::collection::vec(0_i64..100, 8),
            ) {
                let before: RowCountSnapshot =
                    entries.iter().map(|(t, c)| (t.clone(), *c)).collect();
                let after: RowCountSnapshot = entries
                    .iter()
                    .zip(growth.iter())
                    .map(|((t, c), extra)| (t.clone(), c + extra))
                    .collect();
                prop_assert_eq!(validate_row_counts(&before, &after), vec![]);
            }

            // Dropping rows from any non-scratch table is always reported.
            #[test]
            fn shrinkage_is_always_reported(
                table in table_name(),
                prior in 1_i64..1000,
                lost in 1_i64..1000,
            ) {
                prop_assume!(lost <= prior);
                prop_assume!(!table.ends_with(super::super::SCRATCH_TABLE_SUFFIX));
                let before: RowCountSnapshot =
                    [(table.clone(), prior)].into_iter().collect();
                let after: RowCountSnapshot =
                    [(table.clone(), prior - lost)].into_iter().collect();
                let errors = validate_row_counts(&before, &after);
                prop_assert_eq!(
                    errors,
                    vec![ValidationError::RowsLost {
                        table,
                        prior_count: prior,
                        new_count: prior - lost,
                    }]
                );
            }
        }
    }
}
