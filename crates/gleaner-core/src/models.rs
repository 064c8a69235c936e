//! Domain models for sources, runs and harvest records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::AppError;

/// A configured endpoint the harvester pulls from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestSource {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub title: String,
    pub owner_org: Option<String>,
    /// Raw JSON source configuration, parsed into a `SourceConfig` per run.
    pub config: Option<String>,
}

/// Registration data for a source; the store assigns the id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewHarvestSource {
    pub name: String,
    pub url: String,
    pub title: String,
    pub owner_org: Option<String>,
    pub config: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Gathered,
    Finished,
    Errored,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Gathered => "gathered",
            RunStatus::Finished => "finished",
            RunStatus::Errored => "errored",
        }
    }
}

impl FromStr for RunStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "gathered" => Ok(RunStatus::Gathered),
            "finished" => Ok(RunStatus::Finished),
            "errored" => Ok(RunStatus::Errored),
            other => Err(AppError::Generic(format!("unknown run status: {}", other))),
        }
    }
}

/// One gather-stage execution against one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestRun {
    pub id: Uuid,
    pub source_id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Status tag assigned to a record at gather time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    New,
    Change,
    Delete,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::New => "new",
            RecordStatus::Change => "change",
            RecordStatus::Delete => "delete",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(RecordStatus::New),
            "change" => Ok(RecordStatus::Change),
            "delete" => Ok(RecordStatus::Delete),
            other => Err(AppError::Generic(format!("unknown record status: {}", other))),
        }
    }
}

/// Where a record is in the import state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportState {
    New,
    Fetched,
    Transformed,
    Committed,
    Failed,
    Skipped,
}

impl ImportState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportState::New => "new",
            ImportState::Fetched => "fetched",
            ImportState::Transformed => "transformed",
            ImportState::Committed => "committed",
            ImportState::Failed => "failed",
            ImportState::Skipped => "skipped",
        }
    }

    /// Terminal states are never picked up again as pending work.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ImportState::Committed | ImportState::Failed | ImportState::Skipped
        )
    }
}

impl FromStr for ImportState {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(ImportState::New),
            "fetched" => Ok(ImportState::Fetched),
            "transformed" => Ok(ImportState::Transformed),
            "committed" => Ok(ImportState::Committed),
            "failed" => Ok(ImportState::Failed),
            "skipped" => Ok(ImportState::Skipped),
            other => Err(AppError::Generic(format!("unknown import state: {}", other))),
        }
    }
}

/// One identifier's state as of one run.
///
/// Content is immutable once written; only `current`, `target_id` and
/// `import_state` change after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestRecord {
    pub id: Uuid,
    pub guid: String,
    pub run_id: Uuid,
    pub source_id: Uuid,
    pub content: Option<String>,
    pub content_hash: Option<String>,
    pub status: RecordStatus,
    pub current: bool,
    pub target_id: Option<String>,
    pub import_state: ImportState,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for a harvest record.
#[derive(Debug, Clone, PartialEq)]
pub struct NewHarvestRecord {
    pub guid: String,
    pub run_id: Uuid,
    pub source_id: Uuid,
    pub content: Option<String>,
    pub content_hash: Option<String>,
    pub status: RecordStatus,
    pub target_id: Option<String>,
}

impl NewHarvestRecord {
    /// Builds a new/change record carrying serialized content.
    pub fn with_content(
        run: &HarvestRun,
        guid: &str,
        content: String,
        status: RecordStatus,
        target_id: Option<String>,
    ) -> Self {
        let content_hash = compute_content_hash(&content);
        Self {
            guid: guid.to_string(),
            run_id: run.id,
            source_id: run.source_id,
            content: Some(content),
            content_hash: Some(content_hash),
            status,
            target_id,
        }
    }

    /// Builds a content-less delete record.
    pub fn deletion(run: &HarvestRun, guid: &str, target_id: Option<String>) -> Self {
        Self {
            guid: guid.to_string(),
            run_id: run.id,
            source_id: run.source_id,
            content: None,
            content_hash: None,
            status: RecordStatus::Delete,
            target_id,
        }
    }
}

/// Projection of a current record used for identifier reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnownRecord {
    pub target_id: Option<String>,
    pub content_hash: Option<String>,
}

/// One (identifier, serialized record) pair produced by a record format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRecord {
    pub guid: String,
    pub content: String,
}

/// Raw content returned by a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedContent {
    pub content: String,
    pub content_type: Option<String>,
}

impl FetchedContent {
    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty()
    }
}

/// Harvest phase a record error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordPhase {
    Gather,
    Fetch,
    Import,
}

impl RecordPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordPhase::Gather => "gather",
            RecordPhase::Fetch => "fetch",
            RecordPhase::Import => "import",
        }
    }
}

impl FromStr for RecordPhase {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gather" => Ok(RecordPhase::Gather),
            "fetch" => Ok(RecordPhase::Fetch),
            "import" => Ok(RecordPhase::Import),
            other => Err(AppError::Generic(format!("unknown record phase: {}", other))),
        }
    }
}

impl fmt::Display for RecordPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A category in the catalog that datasets can be assigned to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
}

impl Group {
    /// Matches on the exact name or case-insensitively on the display name.
    pub fn matches(&self, value: &str) -> bool {
        value == self.name
            || (!self.display_name.is_empty()
                && value.to_lowercase() == self.display_name.to_lowercase())
    }
}

/// Identity under which catalog actions are performed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogContext {
    pub user: String,
    pub ignore_auth: bool,
}

/// Persisted error, as returned when querying the error sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HarvestErrorEntry {
    pub run_id: Uuid,
    pub record_id: Option<Uuid>,
    pub guid: Option<String>,
    pub phase: Option<RecordPhase>,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Aggregate counters shown by the `stats` command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseStats {
    pub total_sources: i64,
    pub total_runs: i64,
    pub total_records: i64,
    pub current_records: i64,
    pub total_errors: i64,
    pub last_run: Option<DateTime<Utc>>,
}

/// Hex-encoded SHA-256 of a record's serialized content.
pub fn compute_content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
