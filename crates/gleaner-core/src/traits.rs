//! Collaborator interfaces the harvest pipeline is generic over.
//!
//! - [`ContentSource`] - fetches raw page content (e.g. the reqwest fetcher)
//! - [`RecordFormat`] - turns content into identifiers and field dictionaries
//! - [`HarvestRecordStore`] - persists sources, runs and harvest records
//! - [`ErrorSink`] - durable gather/record error reporting
//! - [`CatalogStore`] - the downstream catalog actions
//! - [`PackageDictHook`] - last-chance override of the resolved dictionary

use std::collections::HashMap;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{AppError, FetchError};
use crate::models::{
    CatalogContext, FetchedContent, Group, HarvestRecord, HarvestRun, HarvestSource, ImportState,
    KnownRecord, NewHarvestRecord, NewHarvestSource, ParsedRecord, RecordPhase, RunStatus,
};
use crate::package::PackageDict;

/// Retrieves the content behind a locator, one page at a time.
///
/// Implementations must not retry; the caller owns retry policy.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// `page` is 1-based; pages above 1 are requested with a page parameter.
    async fn fetch(
        &self,
        locator: &str,
        page: u32,
        content_type: Option<&str>,
    ) -> Result<FetchedContent, FetchError>;
}

/// Sequence of parsed records. Items may fail individually when the format
/// discovers malformed input part-way through.
pub type RecordIter<'a> = Box<dyn Iterator<Item = Result<ParsedRecord, AppError>> + Send + 'a>;

/// Format-specific parsing of source content.
pub trait RecordFormat: Send + Sync {
    /// Splits fetched content into (identifier, serialized record) pairs.
    ///
    /// Fails with [`AppError::ParseError`] on malformed input.
    fn parse<'a>(
        &self,
        content: &'a str,
        content_type: Option<&str>,
    ) -> Result<RecordIter<'a>, AppError>;

    /// Converts one serialized record into a target field dictionary.
    fn to_package_dict(&self, content: &str) -> Result<PackageDict, AppError>;
}

/// Persistence contract for sources, runs and harvest records.
///
/// At most one record per (source, identifier) may be current. Methods that
/// flip the flag (`insert_delete_record`, `mark_current`) must do so inside
/// a single transaction; concurrent writers for the same identifier are not
/// made safe by this trait.
#[async_trait]
pub trait HarvestRecordStore: Send + Sync {
    /// Registers a source by name, updating url/title/config if it exists.
    async fn register_source(&self, source: &NewHarvestSource) -> Result<HarvestSource, AppError>;

    async fn create_run(&self, source_id: Uuid) -> Result<HarvestRun, AppError>;

    async fn finish_run(&self, run_id: Uuid, status: RunStatus) -> Result<(), AppError>;

    /// Identifier → current record projection for the source.
    async fn current_records(
        &self,
        source_id: Uuid,
    ) -> Result<HashMap<String, KnownRecord>, AppError>;

    /// Inserts a new or changed record. It is not current until imported.
    async fn insert_record(&self, record: NewHarvestRecord) -> Result<HarvestRecord, AppError>;

    /// Inserts a delete record and clears the current flag of every earlier
    /// record for the same identifier, atomically.
    async fn insert_delete_record(
        &self,
        record: NewHarvestRecord,
    ) -> Result<HarvestRecord, AppError>;

    async fn find_current(
        &self,
        source_id: Uuid,
        guid: &str,
    ) -> Result<Option<HarvestRecord>, AppError>;

    async fn clear_current(&self, record_id: Uuid) -> Result<(), AppError>;

    /// Makes the record current and stores its target id, clearing any other
    /// current record for the same identifier in the same transaction.
    async fn mark_current(&self, record_id: Uuid, target_id: &str) -> Result<(), AppError>;

    /// Records of the run whose import state is not terminal, in insertion order.
    async fn pending_records(&self, run_id: Uuid) -> Result<Vec<HarvestRecord>, AppError>;

    async fn set_import_state(&self, record_id: Uuid, state: ImportState) -> Result<(), AppError>;
}

/// Durable, queryable error reporting.
#[async_trait]
pub trait ErrorSink: Send + Sync {
    async fn report_gather_error(&self, run: &HarvestRun, message: &str) -> Result<(), AppError>;

    async fn report_record_error(
        &self,
        record: &HarvestRecord,
        message: &str,
        phase: RecordPhase,
    ) -> Result<(), AppError>;
}

/// Downstream catalog actions. Every write runs under a caller-supplied
/// identity.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Creates the target and returns its id.
    async fn create_target(
        &self,
        ctx: &CatalogContext,
        fields: &PackageDict,
    ) -> Result<String, AppError>;

    async fn update_target(
        &self,
        ctx: &CatalogContext,
        id: &str,
        fields: &PackageDict,
    ) -> Result<String, AppError>;

    async fn delete_target(&self, ctx: &CatalogContext, id: &str) -> Result<(), AppError>;

    /// Returns `None` when the target does not exist.
    async fn get_target(
        &self,
        ctx: &CatalogContext,
        id: &str,
    ) -> Result<Option<PackageDict>, AppError>;

    async fn groups_available(&self, ctx: &CatalogContext) -> Result<Vec<Group>, AppError>;

    async fn group_exists(&self, ctx: &CatalogContext, name: &str) -> Result<bool, AppError>;

    /// Whether a target with this name already exists.
    async fn name_exists(&self, ctx: &CatalogContext, name: &str) -> Result<bool, AppError>;

    /// Resolves the identity used for harvester writes.
    async fn site_context(&self) -> Result<CatalogContext, AppError>;
}

/// Hook invoked with the fully resolved dictionary just before commit.
pub trait PackageDictHook: Send + Sync {
    fn modify_package_dict(
        &self,
        package: PackageDict,
        content: &str,
        record: &HarvestRecord,
    ) -> PackageDict;
}

/// Hook that leaves the dictionary untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHook;

impl PackageDictHook for NoopHook {
    fn modify_package_dict(
        &self,
        package: PackageDict,
        _content: &str,
        _record: &HarvestRecord,
    ) -> PackageDict {
        package
    }
}
