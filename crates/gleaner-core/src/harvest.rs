//! Harvest service: gather, fetch and import for one or many sources.
//!
//! # Architecture
//!
//! [`HarvestService`] is generic over three collaborators:
//! - [`ContentSource`] - fetches source pages
//! - [`HarvestRecordStore`] + [`ErrorSink`] - persistence and error reporting
//! - [`CatalogStore`] - the downstream catalog
//!
//! The record format and the package-dict hook are trait objects picked at
//! construction time.
//!
//! # Run lifecycle
//!
//! `running → gathered → finished`, or `running → errored` when the source
//! configuration is invalid or the gather stage fails. An errored run is
//! never imported.

use futures::stream::{self, StreamExt};

use crate::config::{RunConfig, SourceConfig, SourceEntry, SyncConfig};
use crate::error::AppError;
use crate::gather::PageSequencer;
use crate::import::ImportReconciler;
use crate::models::{HarvestRecord, ImportState, RunStatus};
use crate::sync::{BatchHarvestSummary, GatherStats, ImportStats, SourceHarvestResult};
use crate::traits::{
    CatalogStore, ContentSource, ErrorSink, HarvestRecordStore, NoopHook, PackageDictHook,
    RecordFormat,
};

/// Parses a raw source configuration and checks that every default group
/// exists in the catalog.
///
/// Returns the parsed configuration; an empty string is the default one.
pub async fn validate_config<C>(raw: &str, catalog: &C) -> Result<SourceConfig, AppError>
where
    C: CatalogStore + ?Sized,
{
    let config = SourceConfig::parse(raw)?;
    if config.default_groups.is_empty() {
        return Ok(config);
    }

    let ctx = catalog.site_context().await?;
    for group in &config.default_groups {
        if !catalog.group_exists(&ctx, group).await? {
            return Err(AppError::ConfigError(format!(
                "Default group {} does not exist",
                group
            )));
        }
    }
    Ok(config)
}

/// Service for harvesting sources into a catalog.
///
/// # Example
///
/// ```ignore
/// use gleaner_core::HarvestService;
///
/// let service = HarvestService::new(fetcher, repo, catalog, DcatJsonFormat);
/// let result = service.run_source(&entry, false).await?;
/// println!("{} created, {} updated", result.import.created, result.import.updated);
/// ```
pub struct HarvestService<T, S, C>
where
    T: ContentSource,
    S: HarvestRecordStore + ErrorSink,
    C: CatalogStore,
{
    fetcher: T,
    store: S,
    catalog: C,
    format: Box<dyn RecordFormat>,
    hook: Box<dyn PackageDictHook>,
    config: SyncConfig,
}

impl<T, S, C> HarvestService<T, S, C>
where
    T: ContentSource,
    S: HarvestRecordStore + ErrorSink,
    C: CatalogStore,
{
    pub fn new(fetcher: T, store: S, catalog: C, format: impl RecordFormat + 'static) -> Self {
        Self {
            fetcher,
            store,
            catalog,
            format: Box::new(format),
            hook: Box::new(NoopHook),
            config: SyncConfig::default(),
        }
    }

    pub fn with_hook(mut self, hook: impl PackageDictHook + 'static) -> Self {
        self.hook = Box::new(hook);
        self
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    /// Validates a raw source configuration against this service's catalog.
    pub async fn validate_config(&self, raw: &str) -> Result<SourceConfig, AppError> {
        validate_config(raw, &self.catalog).await
    }

    /// Runs gather, fetch and import for a single source.
    ///
    /// Configuration and gather failures are reported to the error sink and
    /// returned as a failed [`SourceHarvestResult`]. `Err` means the store
    /// itself failed.
    pub async fn run_source(
        &self,
        entry: &SourceEntry,
        force_import: bool,
    ) -> Result<SourceHarvestResult, AppError> {
        let source = self.store.register_source(&entry.to_new_source()?).await?;
        let run = self.store.create_run(source.id).await?;
        tracing::info!(source = %source.name, run = %run.id, url = %source.url, "Starting harvest run");

        let validated = self
            .validate_config(source.config.as_deref().unwrap_or_default())
            .await;
        let settings = match validated {
            Ok(settings) => settings,
            Err(e) => {
                let message = e.to_string();
                self.store.report_gather_error(&run, &message).await?;
                self.store.finish_run(run.id, RunStatus::Errored).await?;
                return Ok(SourceHarvestResult::failure(
                    source.name,
                    source.url,
                    GatherStats::default(),
                    message,
                ));
            }
        };

        let run_config = RunConfig::new(source, run, settings).with_force_import(force_import);
        let name = run_config.source.name.clone();
        let url = run_config.source.url.clone();

        let gathered = PageSequencer::new(&self.fetcher, &self.store, self.format.as_ref())
            .gather(&run_config)
            .await;
        let outcome = match gathered {
            Ok(outcome) => outcome,
            Err(e) => {
                self.store
                    .finish_run(run_config.run.id, RunStatus::Errored)
                    .await?;
                return Err(e);
            }
        };

        if !outcome.is_done() {
            self.store
                .finish_run(run_config.run.id, RunStatus::Errored)
                .await?;
            let error = outcome.error.unwrap_or_else(|| "gather failed".to_string());
            return Ok(SourceHarvestResult::failure(name, url, outcome.stats, error));
        }
        self.store
            .finish_run(run_config.run.id, RunStatus::Gathered)
            .await?;

        let pending = self.fetch_stage(&run_config).await?;

        let reconciler = ImportReconciler::new(&self.store, &self.catalog, self.format.as_ref())
            .with_hook(self.hook.as_ref());
        let mut import = ImportStats::new();
        for record in &pending {
            import.record(reconciler.import(record, &run_config).await);
        }

        self.store
            .finish_run(run_config.run.id, RunStatus::Finished)
            .await?;
        tracing::info!(
            source = %name,
            run = %run_config.run.id,
            created = import.created,
            updated = import.updated,
            deleted = import.deleted,
            skipped = import.skipped,
            failed = import.failed,
            "Harvest run finished"
        );

        Ok(SourceHarvestResult::success(name, url, outcome.stats, import))
    }

    /// Fetch stage. Content is already stored by the gather stage, so this
    /// only moves fresh records to `fetched` and returns the pending work.
    pub async fn fetch_stage(&self, run: &RunConfig) -> Result<Vec<HarvestRecord>, AppError> {
        let mut pending = self.store.pending_records(run.run.id).await?;
        for record in pending.iter_mut() {
            if record.import_state == ImportState::New {
                self.store
                    .set_import_state(record.id, ImportState::Fetched)
                    .await?;
                record.import_state = ImportState::Fetched;
            }
        }
        tracing::debug!(run = %run.run.id, pending = pending.len(), "Fetch stage complete");
        Ok(pending)
    }

    /// Harvests several sources, up to `SyncConfig::concurrency` at a time.
    ///
    /// A failing source never stops the batch; its error is recorded in the
    /// summary.
    pub async fn batch_harvest(
        &self,
        entries: &[&SourceEntry],
        force_import: bool,
    ) -> BatchHarvestSummary {
        let concurrency = self.config.concurrency.max(1);

        let results: Vec<SourceHarvestResult> = stream::iter(entries.iter().copied())
            .map(|entry| async move {
                match self.run_source(entry, force_import).await {
                    Ok(result) => result,
                    Err(e) => {
                        tracing::error!(source = %entry.name, error = %e, "Harvest failed");
                        SourceHarvestResult::failure(
                            entry.name.clone(),
                            entry.url.clone(),
                            GatherStats::default(),
                            e.to_string(),
                        )
                    }
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut summary = BatchHarvestSummary::new();
        for result in results {
            summary.add(result);
        }
        tracing::info!(
            sources = summary.total_sources(),
            successful = summary.successful_count(),
            failed = summary.failed_count(),
            "Batch harvest complete"
        );
        summary
    }
}
