//! Identifier reconciliation and harvest statistics.
//!
//! Pure business logic: classifying identifiers against the previous run,
//! and counting what gather and import did. No I/O happens here.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::models::{KnownRecord, RecordStatus};

/// Classification of the identifiers seen in a run against the identifiers
/// recorded as current for the source.
///
/// The three sets partition `known ∪ observed` without overlap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentifierDiff {
    pub to_create: BTreeSet<String>,
    pub to_update: BTreeSet<String>,
    pub to_delete: BTreeSet<String>,
}

impl IdentifierDiff {
    pub fn len(&self) -> usize {
        self.to_create.len() + self.to_update.len() + self.to_delete.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Computes create/update/delete sets.
///
/// # Examples
///
/// ```
/// use std::collections::{HashMap, HashSet};
/// use gleaner_core::{reconcile_identifiers, KnownRecord};
///
/// let known: HashMap<String, KnownRecord> = ["A", "B"]
///     .into_iter()
///     .map(|g| (g.to_string(), KnownRecord::default()))
///     .collect();
/// let observed: HashSet<String> = ["B", "C"].into_iter().map(String::from).collect();
///
/// let diff = reconcile_identifiers(&known, &observed);
/// assert!(diff.to_create.contains("C"));
/// assert!(diff.to_update.contains("B"));
/// assert!(diff.to_delete.contains("A"));
/// ```
pub fn reconcile_identifiers(
    known: &HashMap<String, KnownRecord>,
    observed: &HashSet<String>,
) -> IdentifierDiff {
    let mut diff = IdentifierDiff::default();

    for guid in observed {
        if known.contains_key(guid) {
            diff.to_update.insert(guid.clone());
        } else {
            diff.to_create.insert(guid.clone());
        }
    }

    for guid in known.keys() {
        if !observed.contains(guid) {
            diff.to_delete.insert(guid.clone());
        }
    }

    diff
}

/// Status for a single observed identifier.
pub fn classify_identifier(guid: &str, known: &HashMap<String, KnownRecord>) -> RecordStatus {
    if known.contains_key(guid) {
        RecordStatus::Change
    } else {
        RecordStatus::New
    }
}

/// Whether a changed record's content differs from the current record's.
///
/// Returns false when either hash is unknown (legacy records are treated as
/// changed).
pub fn content_unchanged(known: Option<&KnownRecord>, new_hash: &str) -> bool {
    matches!(
        known.and_then(|k| k.content_hash.as_deref()),
        Some(hash) if hash == new_hash
    )
}

// =============================================================================
// Gather statistics
// =============================================================================

/// Counters for one gather stage.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GatherStats {
    pub pages: usize,
    pub new: usize,
    pub changed: usize,
    /// Subset of `changed` whose content hash matches the previous record.
    pub unchanged_content: usize,
    pub deleted: usize,
}

impl GatherStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, status: RecordStatus) {
        match status {
            RecordStatus::New => self.new += 1,
            RecordStatus::Change => self.changed += 1,
            RecordStatus::Delete => self.deleted += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.new + self.changed + self.deleted
    }
}

// =============================================================================
// Import statistics
// =============================================================================

/// Outcome of importing a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportOutcome {
    Created,
    Updated,
    Deleted,
    /// Record intentionally not imported (e.g. a remote harvest source).
    Skipped,
    Failed,
}

/// Counters for one import stage.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportStats {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ImportStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, outcome: ImportOutcome) {
        match outcome {
            ImportOutcome::Created => self.created += 1,
            ImportOutcome::Updated => self.updated += 1,
            ImportOutcome::Deleted => self.deleted += 1,
            ImportOutcome::Skipped => self.skipped += 1,
            ImportOutcome::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.created + self.updated + self.deleted + self.skipped + self.failed
    }

    pub fn successful(&self) -> usize {
        self.created + self.updated + self.deleted + self.skipped
    }
}

// =============================================================================
// Batch Harvest Types
// =============================================================================

/// Result of harvesting a single source.
#[derive(Debug, Clone)]
pub struct SourceHarvestResult {
    pub source_name: String,
    pub source_url: String,
    pub gather: GatherStats,
    pub import: ImportStats,
    /// Error message if the run errored, None if it completed.
    pub error: Option<String>,
}

impl SourceHarvestResult {
    pub fn success(name: String, url: String, gather: GatherStats, import: ImportStats) -> Self {
        Self {
            source_name: name,
            source_url: url,
            gather,
            import,
            error: None,
        }
    }

    /// A failed run keeps whatever it gathered before failing.
    pub fn failure(name: String, url: String, gather: GatherStats, error: String) -> Self {
        Self {
            source_name: name,
            source_url: url,
            gather,
            import: ImportStats::default(),
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Aggregated results from harvesting multiple sources.
#[derive(Debug, Clone, Default)]
pub struct BatchHarvestSummary {
    pub results: Vec<SourceHarvestResult>,
}

impl BatchHarvestSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, result: SourceHarvestResult) {
        self.results.push(result);
    }

    pub fn successful_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| !r.is_success()).count()
    }

    /// Total records imported across all sources.
    pub fn total_records(&self) -> usize {
        self.results.iter().map(|r| r.import.total()).sum()
    }

    pub fn total_sources(&self) -> usize {
        self.results.len()
    }
}
