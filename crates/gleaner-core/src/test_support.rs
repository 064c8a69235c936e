//! In-memory fakes of the collaborator traits for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::config::{RunConfig, SourceConfig};
use crate::error::{AppError, FetchError};
use crate::models::{
    CatalogContext, FetchedContent, Group, HarvestRecord, HarvestRun, HarvestSource, ImportState,
    KnownRecord, NewHarvestRecord, NewHarvestSource, ParsedRecord, RecordPhase, RecordStatus,
    RunStatus,
};
use crate::package::PackageDict;
use crate::traits::{
    CatalogStore, ContentSource, ErrorSink, HarvestRecordStore, RecordFormat, RecordIter,
};

// =============================================================================
// Record store
// =============================================================================

#[derive(Default)]
struct StoreState {
    sources: Vec<HarvestSource>,
    runs: Vec<HarvestRun>,
    records: Vec<HarvestRecord>,
    gather_errors: Vec<String>,
    record_errors: Vec<(Uuid, RecordPhase, String)>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a committed, current record as if a previous run imported it.
    pub fn seed_current(&self, source_id: Uuid, guid: &str, target_id: &str) -> HarvestRecord {
        let record = HarvestRecord {
            id: Uuid::new_v4(),
            guid: guid.to_string(),
            run_id: Uuid::nil(),
            source_id,
            content: Some("{}".to_string()),
            content_hash: None,
            status: RecordStatus::New,
            current: true,
            target_id: Some(target_id.to_string()),
            import_state: ImportState::Committed,
            created_at: Utc::now(),
        };
        self.state.lock().unwrap().records.push(record.clone());
        record
    }

    pub fn records_for_run(&self, run_id: Uuid) -> Vec<HarvestRecord> {
        self.state
            .lock()
            .unwrap()
            .records
            .iter()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect()
    }

    pub fn guids_for_run(&self, run_id: Uuid) -> Vec<String> {
        self.records_for_run(run_id)
            .into_iter()
            .map(|r| r.guid)
            .collect()
    }

    pub fn record(&self, id: Uuid) -> HarvestRecord {
        self.state
            .lock()
            .unwrap()
            .records
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .unwrap()
    }

    pub fn current_for(&self, source_id: Uuid, guid: &str) -> Option<HarvestRecord> {
        let state = self.state.lock().unwrap();
        let current: Vec<&HarvestRecord> = state
            .records
            .iter()
            .filter(|r| r.source_id == source_id && r.guid == guid && r.current)
            .collect();
        assert!(current.len() <= 1, "more than one current record for {}", guid);
        current.first().map(|r| (*r).clone())
    }

    /// Asserts the at-most-one-current invariant for every identifier.
    pub fn assert_single_current(&self) {
        let state = self.state.lock().unwrap();
        let mut seen: HashMap<(Uuid, String), usize> = HashMap::new();
        for record in state.records.iter().filter(|r| r.current) {
            *seen
                .entry((record.source_id, record.guid.clone()))
                .or_default() += 1;
        }
        for ((_, guid), count) in seen {
            assert_eq!(count, 1, "identifier {} has {} current records", guid, count);
        }
    }

    pub fn gather_errors(&self) -> Vec<String> {
        self.state.lock().unwrap().gather_errors.clone()
    }

    pub fn record_errors(&self) -> Vec<(Uuid, RecordPhase, String)> {
        self.state.lock().unwrap().record_errors.clone()
    }

    pub fn run_status(&self, run_id: Uuid) -> RunStatus {
        self.state
            .lock()
            .unwrap()
            .runs
            .iter()
            .find(|r| r.id == run_id)
            .map(|r| r.status)
            .unwrap()
    }

    pub fn run_statuses(&self) -> Vec<RunStatus> {
        self.state.lock().unwrap().runs.iter().map(|r| r.status).collect()
    }

    fn insert(state: &mut StoreState, record: NewHarvestRecord) -> HarvestRecord {
        let record = HarvestRecord {
            id: Uuid::new_v4(),
            guid: record.guid,
            run_id: record.run_id,
            source_id: record.source_id,
            content: record.content,
            content_hash: record.content_hash,
            status: record.status,
            current: false,
            target_id: record.target_id,
            import_state: ImportState::New,
            created_at: Utc::now(),
        };
        state.records.push(record.clone());
        record
    }
}

#[async_trait]
impl HarvestRecordStore for MemoryStore {
    async fn register_source(&self, source: &NewHarvestSource) -> Result<HarvestSource, AppError> {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.sources.iter_mut().find(|s| s.name == source.name) {
            existing.url = source.url.clone();
            existing.title = source.title.clone();
            existing.owner_org = source.owner_org.clone();
            existing.config = source.config.clone();
            return Ok(existing.clone());
        }
        let created = HarvestSource {
            id: Uuid::new_v4(),
            name: source.name.clone(),
            url: source.url.clone(),
            title: source.title.clone(),
            owner_org: source.owner_org.clone(),
            config: source.config.clone(),
        };
        state.sources.push(created.clone());
        Ok(created)
    }

    async fn create_run(&self, source_id: Uuid) -> Result<HarvestRun, AppError> {
        let run = HarvestRun {
            id: Uuid::new_v4(),
            source_id,
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
        };
        self.state.lock().unwrap().runs.push(run.clone());
        Ok(run)
    }

    async fn finish_run(&self, run_id: Uuid, status: RunStatus) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        if let Some(run) = state.runs.iter_mut().find(|r| r.id == run_id) {
            run.status = status;
            run.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn current_records(
        &self,
        source_id: Uuid,
    ) -> Result<HashMap<String, KnownRecord>, AppError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .records
            .iter()
            .filter(|r| r.source_id == source_id && r.current)
            .map(|r| {
                (
                    r.guid.clone(),
                    KnownRecord {
                        target_id: r.target_id.clone(),
                        content_hash: r.content_hash.clone(),
                    },
                )
            })
            .collect())
    }

    async fn insert_record(&self, record: NewHarvestRecord) -> Result<HarvestRecord, AppError> {
        let mut state = self.state.lock().unwrap();
        Ok(Self::insert(&mut state, record))
    }

    async fn insert_delete_record(
        &self,
        record: NewHarvestRecord,
    ) -> Result<HarvestRecord, AppError> {
        let mut state = self.state.lock().unwrap();
        for existing in state
            .records
            .iter_mut()
            .filter(|r| r.source_id == record.source_id && r.guid == record.guid)
        {
            existing.current = false;
        }
        Ok(Self::insert(&mut state, record))
    }

    async fn find_current(
        &self,
        source_id: Uuid,
        guid: &str,
    ) -> Result<Option<HarvestRecord>, AppError> {
        Ok(self.current_for(source_id, guid))
    }

    async fn clear_current(&self, record_id: Uuid) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.records.iter_mut().find(|r| r.id == record_id) {
            record.current = false;
        }
        Ok(())
    }

    async fn mark_current(&self, record_id: Uuid, target_id: &str) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        let (source_id, guid) = state
            .records
            .iter()
            .find(|r| r.id == record_id)
            .map(|r| (r.source_id, r.guid.clone()))
            .ok_or_else(|| AppError::Generic(format!("no record {}", record_id)))?;
        for record in state.records.iter_mut() {
            if record.source_id == source_id && record.guid == guid {
                record.current = record.id == record_id;
                if record.id == record_id {
                    record.target_id = Some(target_id.to_string());
                }
            }
        }
        Ok(())
    }

    async fn pending_records(&self, run_id: Uuid) -> Result<Vec<HarvestRecord>, AppError> {
        Ok(self
            .records_for_run(run_id)
            .into_iter()
            .filter(|r| !r.import_state.is_terminal())
            .collect())
    }

    async fn set_import_state(&self, record_id: Uuid, state: ImportState) -> Result<(), AppError> {
        let mut guard = self.state.lock().unwrap();
        if let Some(record) = guard.records.iter_mut().find(|r| r.id == record_id) {
            record.import_state = state;
        }
        Ok(())
    }
}

#[async_trait]
impl ErrorSink for MemoryStore {
    async fn report_gather_error(&self, _run: &HarvestRun, message: &str) -> Result<(), AppError> {
        self.state
            .lock()
            .unwrap()
            .gather_errors
            .push(message.to_string());
        Ok(())
    }

    async fn report_record_error(
        &self,
        record: &HarvestRecord,
        message: &str,
        phase: RecordPhase,
    ) -> Result<(), AppError> {
        self.state
            .lock()
            .unwrap()
            .record_errors
            .push((record.id, phase, message.to_string()));
        Ok(())
    }
}

/// Registers a source in the store and opens a run for it.
pub async fn run_config(store: &MemoryStore) -> RunConfig {
    run_config_with(store, SourceConfig::default()).await
}

pub async fn run_config_with(store: &MemoryStore, settings: SourceConfig) -> RunConfig {
    let source = store
        .register_source(&NewHarvestSource {
            name: "test-source".to_string(),
            url: "https://example.org/catalog.json/".to_string(),
            title: "Test Source".to_string(),
            owner_org: Some("source-org".to_string()),
            config: None,
        })
        .await
        .unwrap();
    let run = store.create_run(source.id).await.unwrap();
    RunConfig::new(source, run, settings)
}

// =============================================================================
// Content source
// =============================================================================

/// Returns scripted responses, one per fetch; 404 once exhausted.
pub struct ScriptedSource {
    responses: Mutex<VecDeque<Result<String, FetchError>>>,
    calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(responses: Vec<Result<String, FetchError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentSource for ScriptedSource {
    async fn fetch(
        &self,
        locator: &str,
        page: u32,
        _content_type: Option<&str>,
    ) -> Result<FetchedContent, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.responses.lock().unwrap().pop_front();
        match next {
            Some(Ok(content)) => Ok(FetchedContent {
                content,
                content_type: Some("application/json".to_string()),
            }),
            Some(Err(e)) => Err(e),
            None => Err(FetchError::NotFound {
                url: format!("{}?page={}", locator, page),
            }),
        }
    }
}

// =============================================================================
// Record format
// =============================================================================

/// JSON array of objects; the identifier is the `id` key and each object
/// deserializes directly into a `PackageDict` (minus its `id`).
pub struct JsonArrayFormat;

impl RecordFormat for JsonArrayFormat {
    fn parse<'a>(
        &self,
        content: &'a str,
        _content_type: Option<&str>,
    ) -> Result<RecordIter<'a>, AppError> {
        let items: Vec<Value> =
            serde_json::from_str(content).map_err(|e| AppError::ParseError(e.to_string()))?;
        Ok(Box::new(items.into_iter().map(|item| {
            let guid = item
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| AppError::ParseError("record without id".to_string()))?
                .to_string();
            Ok(ParsedRecord {
                guid,
                content: item.to_string(),
            })
        })))
    }

    fn to_package_dict(&self, content: &str) -> Result<PackageDict, AppError> {
        let mut value: Value = serde_json::from_str(content)?;
        if let Some(obj) = value.as_object_mut() {
            obj.remove("id");
        }
        Ok(serde_json::from_value(value)?)
    }
}

// =============================================================================
// Catalog
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum CatalogCall {
    Create(PackageDict),
    Update(String, PackageDict),
    Delete(String),
}

#[derive(Default)]
pub struct MemoryCatalog {
    pub packages: Mutex<HashMap<String, PackageDict>>,
    pub groups: Vec<Group>,
    pub calls: Mutex<Vec<CatalogCall>>,
    pub fail_writes: AtomicBool,
    pub no_identity: bool,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_groups(groups: &[(&str, &str)]) -> Self {
        Self {
            groups: groups
                .iter()
                .map(|(name, display)| Group {
                    name: name.to_string(),
                    display_name: display.to_string(),
                })
                .collect(),
            ..Self::default()
        }
    }

    /// Makes every later create/update fail with a catalog error.
    pub fn refuse_writes(&self, refuse: bool) {
        self.fail_writes.store(refuse, Ordering::SeqCst);
    }

    pub fn insert(&self, id: &str, package: PackageDict) {
        self.packages
            .lock()
            .unwrap()
            .insert(id.to_string(), package);
    }

    pub fn package(&self, id: &str) -> Option<PackageDict> {
        self.packages.lock().unwrap().get(id).cloned()
    }

    pub fn calls(&self) -> Vec<CatalogCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn creates(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, CatalogCall::Create(_)))
            .count()
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn create_target(
        &self,
        _ctx: &CatalogContext,
        fields: &PackageDict,
    ) -> Result<String, AppError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AppError::CatalogError("write refused".to_string()));
        }
        self.calls
            .lock()
            .unwrap()
            .push(CatalogCall::Create(fields.clone()));
        let id = fields
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        self.insert(&id, fields.clone());
        Ok(id)
    }

    async fn update_target(
        &self,
        _ctx: &CatalogContext,
        id: &str,
        fields: &PackageDict,
    ) -> Result<String, AppError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AppError::CatalogError("write refused".to_string()));
        }
        self.calls
            .lock()
            .unwrap()
            .push(CatalogCall::Update(id.to_string(), fields.clone()));
        self.insert(id, fields.clone());
        Ok(id.to_string())
    }

    async fn delete_target(&self, _ctx: &CatalogContext, id: &str) -> Result<(), AppError> {
        self.calls
            .lock()
            .unwrap()
            .push(CatalogCall::Delete(id.to_string()));
        self.packages
            .lock()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| AppError::TargetNotFound(id.to_string()))
    }

    async fn get_target(
        &self,
        _ctx: &CatalogContext,
        id: &str,
    ) -> Result<Option<PackageDict>, AppError> {
        Ok(self.package(id))
    }

    async fn groups_available(&self, _ctx: &CatalogContext) -> Result<Vec<Group>, AppError> {
        Ok(self.groups.clone())
    }

    async fn group_exists(&self, _ctx: &CatalogContext, name: &str) -> Result<bool, AppError> {
        Ok(self.groups.iter().any(|g| g.name == name))
    }

    async fn name_exists(&self, _ctx: &CatalogContext, name: &str) -> Result<bool, AppError> {
        Ok(self
            .packages
            .lock()
            .unwrap()
            .values()
            .any(|p| p.name.as_deref() == Some(name)))
    }

    async fn site_context(&self) -> Result<CatalogContext, AppError> {
        if self.no_identity {
            return Err(AppError::IdentityUnavailable("no site user".to_string()));
        }
        Ok(CatalogContext {
            user: "harvest".to_string(),
            ignore_auth: true,
        })
    }
}
