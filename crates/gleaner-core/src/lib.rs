//! Gleaner Core - Domain types, reconciliation logic and the harvest pipeline.
//!
//! A harvest run has three stages:
//! - **gather** ([`PageSequencer`]): pages through the source, classifies
//!   identifiers against the previous run and records pending work,
//! - **fetch** ([`HarvestService::fetch_stage`]): pass-through, content is
//!   stored at gather time,
//! - **import** ([`ImportReconciler`]): resolves each record into a catalog
//!   create, update or delete.
//!
//! I/O happens behind the traits in [`traits`]; concrete implementations
//! live in `gleaner-client` (HTTP, catalog) and `gleaner-db` (PostgreSQL).

pub mod config;
pub mod error;
pub mod gather;
pub mod harvest;
pub mod import;
pub mod models;
pub mod naming;
pub mod package;
pub mod sync;
pub mod traits;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{
    default_config_path, load_sources_config, DbConfig, FetchConfig, RunConfig, SourceConfig,
    SourceEntry, SourcesConfig, SyncConfig,
};
pub use error::{AppError, FetchError, FieldErrors};
pub use gather::{GatherOutcome, GatherState, PageSequencer};
pub use harvest::{validate_config, HarvestService};
pub use import::{
    apply_default_extras, apply_default_tags, infer_group, normalize_notes, promote_create_fields,
    resolve_update_conflicts, strip_resource_fields, ImportReconciler, TemplateVars,
};
pub use models::{
    compute_content_hash, CatalogContext, DatabaseStats, FetchedContent, Group, HarvestErrorEntry,
    HarvestRecord, HarvestRun, HarvestSource, ImportState, KnownRecord, NewHarvestRecord,
    NewHarvestSource, ParsedRecord, RecordPhase, RecordStatus, RunStatus,
};
pub use package::{Extra, Extras, PackageDict};
pub use sync::{
    classify_identifier, content_unchanged, reconcile_identifiers, BatchHarvestSummary,
    GatherStats, IdentifierDiff, ImportOutcome, ImportStats, SourceHarvestResult,
};
pub use traits::{
    CatalogStore, ContentSource, ErrorSink, HarvestRecordStore, NoopHook, PackageDictHook,
    RecordFormat, RecordIter,
};
