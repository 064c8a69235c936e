//! Import stage: turns pending harvest records into catalog writes.
//!
//! Per record the reconciler walks `new → transformed → committed`, or ends
//! in `failed`/`skipped`. Failures are reported to the error sink and never
//! abort the run; records committed earlier in the same run stay committed.
//!
//! Field resolution is a chain of pure transforms over [`PackageDict`]:
//! default tags, default extras, group inference, resource cleanup, notes
//! normalization, then conflict resolution against the existing target
//! (update) or schema promotion (create).

use std::collections::BTreeMap;

use serde_json::Value;
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::config::RunConfig;
use crate::error::AppError;
use crate::models::{CatalogContext, Group, HarvestRecord, ImportState, RecordPhase, RecordStatus};
use crate::naming::{munge_title_to_name, unique_name, MIN_NAME_LENGTH};
use crate::package::PackageDict;
use crate::sync::ImportOutcome;
use crate::traits::{
    CatalogStore, ErrorSink, HarvestRecordStore, NoopHook, PackageDictHook, RecordFormat,
};

/// Extras promoted to top-level fields on update when the existing target
/// does not already define them.
pub const CUSTOM_FIELDS: &[&str] = &[
    "private",
    "searchable",
    "publisher_uri",
    "contact_email",
    "contact_name",
    "contact_uri",
    "frequency",
    "publisher_email",
    "spatial",
    "temporal",
    "theme",
    "version_notes",
    "license_id",
];

/// Scalar fields of the catalog's default create schema.
pub const CREATE_SCHEMA_FIELDS: &[&str] = &[
    "id",
    "name",
    "title",
    "author",
    "author_email",
    "maintainer",
    "maintainer_email",
    "license_id",
    "notes",
    "url",
    "version",
    "state",
    "type",
    "owner_org",
    "private",
];

/// Resource keys that only make sense on the remote catalog.
const STRIPPED_RESOURCE_FIELDS: &[&str] = &["url_type", "revision_id"];

// =============================================================================
// Pure transforms
// =============================================================================

/// Values substituted into `{placeholder}` templates in default extras.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars(BTreeMap<&'static str, String>);

impl TemplateVars {
    pub fn for_record(run: &RunConfig, record: &HarvestRecord, dataset_id: &str) -> Self {
        let source = &run.source;
        let mut vars = BTreeMap::new();
        vars.insert("harvest_source_id", source.id.to_string());
        vars.insert(
            "harvest_source_url",
            source.url.trim_end_matches('/').to_string(),
        );
        vars.insert("harvest_source_title", source.title.clone());
        vars.insert("harvest_job_id", run.run.id.to_string());
        vars.insert("harvest_object_id", record.id.to_string());
        vars.insert("dataset_id", dataset_id.to_string());
        Self(vars)
    }

    /// Replaces every known placeholder. Unknown ones are left as written.
    pub fn render(&self, template: &str) -> String {
        self.0.iter().fold(template.to_string(), |acc, (key, value)| {
            acc.replace(&format!("{{{}}}", key), value)
        })
    }
}

/// Appends configured default tags that the record does not carry yet.
pub fn apply_default_tags(package: &mut PackageDict, defaults: &[String]) {
    for tag in defaults {
        package.add_tag(tag);
    }
}

/// Applies configured default extras.
///
/// An extra already present on the record is kept unless `override_extras`
/// is set. String values go through template substitution; other JSON
/// values are stored in their JSON text form.
pub fn apply_default_extras(
    package: &mut PackageDict,
    defaults: &BTreeMap<String, Value>,
    override_extras: bool,
    vars: &TemplateVars,
) {
    for (key, value) in defaults {
        if package.extras.contains(key) && !override_extras {
            continue;
        }
        let value = match value {
            Value::String(s) => vars.render(s),
            other => other.to_string(),
        };
        package.extras.set(key.as_str(), value);
    }
}

/// Assigns a single catalog group.
///
/// A `theme` (extra first, then top-level field) decides alone when present.
/// Otherwise the first tag that matches a group wins, and the group name is
/// written back as the `theme` extra. Returns the assigned group.
pub fn infer_group(package: &mut PackageDict, groups: &[Group]) -> Option<String> {
    let theme = package
        .extras
        .get("theme")
        .map(str::to_string)
        .or_else(|| match package.field("theme") {
            Some(Value::String(s)) => Some(s),
            _ => None,
        });

    if let Some(theme) = theme {
        let group = groups.iter().find(|g| g.matches(&theme))?;
        package.groups = vec![group.name.clone()];
        return Some(group.name.clone());
    }

    let group = package
        .tags
        .iter()
        .find_map(|tag| groups.iter().find(|g| g.matches(tag)))?;
    package.groups = vec![group.name.clone()];
    package.extras.set("theme", group.name.as_str());
    Some(group.name.clone())
}

/// Drops per-resource keys that reference objects of the remote catalog.
pub fn strip_resource_fields(package: &mut PackageDict) {
    for resource in package.resources.iter_mut() {
        for key in STRIPPED_RESOURCE_FIELDS {
            resource.remove(*key);
        }
    }
}

/// Renders HTML notes as Markdown-compatible plain text.
pub fn normalize_notes(package: &mut PackageDict) {
    if let Some(notes) = package.notes.as_deref() {
        package.notes = Some(html2md::parse_html(notes).trim().to_string());
    }
}

/// Reconciles extras against the target being updated.
///
/// - key is a top-level field of `existing`: the existing value wins, or
///   the fetched one with `override_extras`; the extra becomes a field.
/// - key is an extra of `existing`: the existing value wins unless
///   `override_extras`.
/// - key is in [`CUSTOM_FIELDS`]: promoted to a top-level field.
/// - anything else stays an extra.
pub fn resolve_update_conflicts(
    package: &mut PackageDict,
    existing: &PackageDict,
    override_extras: bool,
) {
    for key in package.extras.keys() {
        let fetched = match package.extras.get(&key) {
            Some(value) => value.to_string(),
            None => continue,
        };

        if let Some(current) = existing.field(&key) {
            let value = if override_extras {
                Value::String(fetched)
            } else {
                current
            };
            if package.set_field(&key, value) {
                package.extras.remove(&key);
            }
        } else if let Some(current) = existing.extras.get(&key) {
            if !override_extras {
                package.extras.set(key.as_str(), current);
            }
        } else if CUSTOM_FIELDS.contains(&key.as_str())
            && package.set_field(&key, Value::String(fetched))
        {
            package.extras.remove(&key);
        }
    }
}

/// Moves extras named like create-schema fields to top-level fields.
pub fn promote_create_fields(package: &mut PackageDict) {
    for key in package.extras.keys() {
        if !CREATE_SCHEMA_FIELDS.contains(&key.as_str()) {
            continue;
        }
        if let Some(value) = package.extras.get(&key).map(str::to_string) {
            if package.set_field(&key, Value::String(value)) {
                package.extras.remove(&key);
            }
        }
    }
}

// =============================================================================
// ImportReconciler
// =============================================================================

/// Imports pending records of one run into the catalog.
///
/// The catalog identity is resolved on first use and cached for the
/// lifetime of the reconciler.
pub struct ImportReconciler<'a, S, C>
where
    S: HarvestRecordStore + ErrorSink,
    C: CatalogStore,
{
    store: &'a S,
    catalog: &'a C,
    format: &'a dyn RecordFormat,
    hook: &'a dyn PackageDictHook,
    context: OnceCell<CatalogContext>,
}

impl<'a, S, C> ImportReconciler<'a, S, C>
where
    S: HarvestRecordStore + ErrorSink,
    C: CatalogStore,
{
    pub fn new(store: &'a S, catalog: &'a C, format: &'a dyn RecordFormat) -> Self {
        Self {
            store,
            catalog,
            format,
            hook: &NoopHook,
            context: OnceCell::new(),
        }
    }

    pub fn with_hook(mut self, hook: &'a dyn PackageDictHook) -> Self {
        self.hook = hook;
        self
    }

    /// Imports one record. Never fails: errors are reported to the sink and
    /// the record ends in [`ImportState::Failed`].
    pub async fn import(&self, record: &HarvestRecord, run: &RunConfig) -> ImportOutcome {
        let outcome = match self.try_import(record, run).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let message = match &e {
                    AppError::ValidationError(errors) => {
                        format!("Invalid package with GUID {}: {}", record.guid, errors)
                    }
                    other => other.to_string(),
                };
                tracing::warn!(
                    guid = %record.guid,
                    record = %record.id,
                    error = %message,
                    "Import failed"
                );
                if let Err(sink_err) = self
                    .store
                    .report_record_error(record, &message, RecordPhase::Import)
                    .await
                {
                    tracing::error!(record = %record.id, error = %sink_err, "Failed to report record error");
                }
                ImportOutcome::Failed
            }
        };

        let state = match outcome {
            ImportOutcome::Failed => ImportState::Failed,
            ImportOutcome::Skipped => ImportState::Skipped,
            _ => ImportState::Committed,
        };
        if let Err(e) = self.store.set_import_state(record.id, state).await {
            tracing::error!(record = %record.id, error = %e, "Failed to store import state");
        }
        outcome
    }

    async fn site_context(&self) -> Result<&CatalogContext, AppError> {
        self.context
            .get_or_try_init(|| self.catalog.site_context())
            .await
    }

    async fn try_import(
        &self,
        record: &HarvestRecord,
        run: &RunConfig,
    ) -> Result<ImportOutcome, AppError> {
        let ctx = self.site_context().await?;

        if record.status == RecordStatus::Delete {
            let target_id = record.target_id.as_deref().ok_or_else(|| {
                AppError::TargetNotFound(format!("no target recorded for {}", record.guid))
            })?;
            self.catalog.delete_target(ctx, target_id).await?;
            tracing::info!(guid = %record.guid, target = target_id, "Deleted target");
            return Ok(ImportOutcome::Deleted);
        }

        let content = record
            .content
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .ok_or(AppError::EmptyContent(record.id))?;

        let previous = self
            .store
            .find_current(record.source_id, &record.guid)
            .await?
            .filter(|p| p.id != record.id);
        // The previous record stays current until `mark_current` flips both
        // flags in one transaction; a failed import leaves it untouched.

        let target_id = record
            .target_id
            .clone()
            .or_else(|| previous.as_ref().and_then(|p| p.target_id.clone()));
        let update_target = match (record.status, target_id) {
            (RecordStatus::Change, Some(id)) => Some(id),
            (_, Some(id)) if run.force_import => Some(id),
            _ => None,
        };

        let mut package = self.format.to_package_dict(content)?;
        if package.package_type.as_deref() == Some("harvest") {
            tracing::warn!(guid = %record.guid, "Remote dataset is a harvest source, ignoring");
            return Ok(ImportOutcome::Skipped);
        }

        let dataset_id = Uuid::new_v4().to_string();
        package.id = Some(dataset_id.clone());

        let existing = match &update_target {
            Some(id) => Some(
                self.catalog
                    .get_target(ctx, id)
                    .await?
                    .ok_or_else(|| AppError::TargetNotFound(id.clone()))?,
            ),
            None => None,
        };

        if package.name.as_deref().map_or(true, str::is_empty) {
            package.name = Some(self.package_name(ctx, &package, existing.as_ref(), record).await?);
        }

        let settings = &run.settings;
        apply_default_tags(&mut package, &settings.default_tags);
        apply_default_extras(
            &mut package,
            &settings.default_extras,
            settings.override_extras,
            &TemplateVars::for_record(run, record, &dataset_id),
        );
        let groups = self.catalog.groups_available(ctx).await?;
        infer_group(&mut package, &groups);
        strip_resource_fields(&mut package);
        normalize_notes(&mut package);
        self.store
            .set_import_state(record.id, ImportState::Transformed)
            .await?;

        match &existing {
            Some(existing) => {
                resolve_update_conflicts(&mut package, existing, settings.override_extras)
            }
            None => promote_create_fields(&mut package),
        }

        let mut package = self.hook.modify_package_dict(package, content, record);
        if package.owner_org.is_none() {
            package.owner_org = run.source.owner_org.clone();
        }

        let (committed_id, outcome) = match update_target {
            Some(id) => {
                package.id = Some(id.clone());
                let committed = self.catalog.update_target(ctx, &id, &package).await?;
                tracing::info!(guid = %record.guid, target = %committed, "Updated target");
                (committed, ImportOutcome::Updated)
            }
            None => {
                let committed = self.catalog.create_target(ctx, &package).await?;
                tracing::info!(guid = %record.guid, target = %committed, "Created target");
                (committed, ImportOutcome::Created)
            }
        };

        self.store.mark_current(record.id, &committed_id).await?;
        Ok(outcome)
    }

    /// Keeps the existing name while the title is unchanged, otherwise
    /// synthesises a fresh one from the title, falling back to the GUID.
    async fn package_name(
        &self,
        ctx: &CatalogContext,
        package: &PackageDict,
        existing: Option<&PackageDict>,
        record: &HarvestRecord,
    ) -> Result<String, AppError> {
        if let Some(existing) = existing {
            if existing.title == package.title {
                if let Some(name) = &existing.name {
                    return Ok(name.clone());
                }
            }
        }

        let seed = if munge_title_to_name(&package.title).len() >= MIN_NAME_LENGTH {
            package.title.as_str()
        } else {
            record.guid.as_str()
        };
        unique_name(self.catalog, ctx, seed).await
    }
}
