//! Gather stage: paginated fetch of the source and identifier reconciliation.
//!
//! The sequencer requests page 1, 2, ... until one of the termination
//! conditions holds:
//! - a 404 on a page after the first (end of pagination),
//! - an empty response body,
//! - a page that parses to no identifiers,
//! - a page whose identifier set equals the previous page's (servers that
//!   ignore the page parameter keep returning page 1).
//!
//! Identifiers are only deduplicated against the immediately preceding
//! page, not the whole run.

use std::collections::HashSet;

use uuid::Uuid;

use crate::config::RunConfig;
use crate::error::{AppError, FetchError};
use crate::models::{NewHarvestRecord, RecordStatus};
use crate::sync::{classify_identifier, content_unchanged, reconcile_identifiers, GatherStats};
use crate::traits::{ContentSource, ErrorSink, HarvestRecordStore, RecordFormat};

/// Final state of a gather stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatherState {
    Done,
    Errored,
}

/// What a gather stage produced.
#[derive(Debug, Clone)]
pub struct GatherOutcome {
    pub state: GatherState,
    /// Records created by this run, in creation order.
    pub record_ids: Vec<Uuid>,
    pub stats: GatherStats,
    /// Message reported to the error sink when `state` is `Errored`.
    pub error: Option<String>,
}

impl GatherOutcome {
    fn new() -> Self {
        Self {
            state: GatherState::Done,
            record_ids: Vec::new(),
            stats: GatherStats::new(),
            error: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == GatherState::Done
    }
}

/// Drives page fetches for one run and records what it finds.
pub struct PageSequencer<'a, T, S>
where
    T: ContentSource,
    S: HarvestRecordStore + ErrorSink,
{
    source: &'a T,
    store: &'a S,
    format: &'a dyn RecordFormat,
}

impl<'a, T, S> PageSequencer<'a, T, S>
where
    T: ContentSource,
    S: HarvestRecordStore + ErrorSink,
{
    pub fn new(source: &'a T, store: &'a S, format: &'a dyn RecordFormat) -> Self {
        Self {
            source,
            store,
            format,
        }
    }

    /// Runs the gather stage.
    ///
    /// Transport and parse failures end in [`GatherState::Errored`] after
    /// being reported to the error sink; records persisted before the failure
    /// are kept and no deletions are computed. An `Err` is returned only when
    /// the store itself fails.
    pub async fn gather(&self, run: &RunConfig) -> Result<GatherOutcome, AppError> {
        let url = run.source.url.as_str();
        let known = self.store.current_records(run.source.id).await?;
        tracing::debug!(
            source = %run.source.name,
            run = %run.run.id,
            known = known.len(),
            "Starting gather"
        );

        let mut outcome = GatherOutcome::new();
        let mut observed: HashSet<String> = HashSet::new();
        let mut previous_page: HashSet<String> = HashSet::new();
        let mut page: u32 = 1;

        loop {
            let fetched = match self.source.fetch(url, page, None).await {
                Ok(fetched) => fetched,
                Err(FetchError::NotFound { .. }) if page > 1 => {
                    tracing::debug!(url, page, "404 after first page, no more pages");
                    break;
                }
                Err(e) => {
                    return self.errored(run, outcome, e.to_string()).await;
                }
            };
            outcome.stats.pages += 1;

            if fetched.is_empty() {
                tracing::debug!(url, page, "Empty response, stopping");
                if page == 1 {
                    // Nothing came back at all: do not treat every known
                    // identifier as deleted.
                    return Ok(outcome);
                }
                break;
            }

            let records = match self
                .format
                .parse(&fetched.content, fetched.content_type.as_deref())
            {
                Ok(records) => records,
                Err(e) => return self.errored(run, outcome, parse_message(&e)).await,
            };

            let mut batch: HashSet<String> = HashSet::new();
            for item in records {
                let parsed = match item {
                    Ok(parsed) => parsed,
                    Err(e) => return self.errored(run, outcome, parse_message(&e)).await,
                };
                tracing::debug!(guid = %parsed.guid, "Got identifier");

                if !batch.insert(parsed.guid.clone()) || previous_page.contains(&parsed.guid) {
                    continue;
                }

                let status = classify_identifier(&parsed.guid, &known);
                let known_record = known.get(&parsed.guid);
                let target_id = known_record.and_then(|k| k.target_id.clone());
                let new_record = NewHarvestRecord::with_content(
                    &run.run,
                    &parsed.guid,
                    parsed.content,
                    status,
                    target_id,
                );

                if status == RecordStatus::Change {
                    if let Some(hash) = new_record.content_hash.as_deref() {
                        if content_unchanged(known_record, hash) {
                            outcome.stats.unchanged_content += 1;
                        }
                    }
                }

                let record = self.store.insert_record(new_record).await?;
                outcome.stats.record(status);
                outcome.record_ids.push(record.id);
            }

            if batch.is_empty() {
                tracing::debug!(url, page, "Empty document, no more records");
                break;
            }

            observed.extend(batch.iter().cloned());

            if batch == previous_page {
                tracing::debug!(url, page, "Same content, no more pages");
                break;
            }

            previous_page = batch;
            page += 1;
        }

        let diff = reconcile_identifiers(&known, &observed);
        for guid in &diff.to_delete {
            let target_id = known.get(guid).and_then(|k| k.target_id.clone());
            let record = self
                .store
                .insert_delete_record(NewHarvestRecord::deletion(&run.run, guid, target_id))
                .await?;
            outcome.stats.record(RecordStatus::Delete);
            outcome.record_ids.push(record.id);
        }

        tracing::info!(
            source = %run.source.name,
            run = %run.run.id,
            pages = outcome.stats.pages,
            new = outcome.stats.new,
            changed = outcome.stats.changed,
            unchanged_content = outcome.stats.unchanged_content,
            deleted = outcome.stats.deleted,
            "Gather complete"
        );
        Ok(outcome)
    }

    async fn errored(
        &self,
        run: &RunConfig,
        mut outcome: GatherOutcome,
        message: String,
    ) -> Result<GatherOutcome, AppError> {
        tracing::warn!(
            source = %run.source.name,
            run = %run.run.id,
            error = %message,
            "Gather failed"
        );
        self.store.report_gather_error(&run.run, &message).await?;
        outcome.state = GatherState::Errored;
        outcome.error = Some(message);
        Ok(outcome)
    }
}

fn parse_message(err: &AppError) -> String {
    match err {
        AppError::ParseError(_) => err.to_string(),
        other => format!("Error parsing file: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ImportState;
    use crate::test_support::{run_config, JsonArrayFormat, MemoryStore, ScriptedSource};

    fn page(guids: &[&str]) -> String {
        let items: Vec<serde_json::Value> = guids
            .iter()
            .map(|g| serde_json::json!({"id": g, "title": format!("Dataset {}", g)}))
            .collect();
        serde_json::Value::Array(items).to_string()
    }

    #[tokio::test]
    async fn test_stops_when_page_repeats() {
        let source = ScriptedSource::new(vec![
            Ok(page(&["a", "b"])),
            Ok(page(&["c", "d"])),
            Ok(page(&["d", "c"])),
            Ok(page(&["never"])),
        ]);
        let store = MemoryStore::new();
        let config = run_config(&store).await;

        let outcome = PageSequencer::new(&source, &store, &JsonArrayFormat)
            .gather(&config)
            .await
            .unwrap();

        assert!(outcome.is_done());
        assert_eq!(source.calls(), 3);
        assert_eq!(outcome.stats.pages, 3);
        assert_eq!(outcome.stats.new, 4);
        let mut guids = store.guids_for_run(config.run.id);
        guids.sort();
        assert_eq!(guids, vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_404_on_first_page_is_errored() {
        let source = ScriptedSource::new(vec![Err(FetchError::NotFound {
            url: "https://example.org/catalog.json".to_string(),
        })]);
        let store = MemoryStore::new();
        let config = run_config(&store).await;

        let outcome = PageSequencer::new(&source, &store, &JsonArrayFormat)
            .gather(&config)
            .await
            .unwrap();

        assert_eq!(outcome.state, GatherState::Errored);
        assert!(outcome.error.unwrap().contains("404"));
        assert_eq!(store.gather_errors().len(), 1);
    }

    #[tokio::test]
    async fn test_404_after_first_page_is_done() {
        let source = ScriptedSource::new(vec![
            Ok(page(&["a", "b"])),
            Err(FetchError::NotFound {
                url: "https://example.org/catalog.json?page=2".to_string(),
            }),
        ]);
        let store = MemoryStore::new();
        let config = run_config(&store).await;

        let outcome = PageSequencer::new(&source, &store, &JsonArrayFormat)
            .gather(&config)
            .await
            .unwrap();

        assert!(outcome.is_done());
        assert_eq!(outcome.record_ids.len(), 2);
        assert!(store.gather_errors().is_empty());
    }

    #[tokio::test]
    async fn test_transport_error_is_reported() {
        let source = ScriptedSource::new(vec![
            Ok(page(&["a"])),
            Err(FetchError::Http {
                url: "https://example.org/catalog.json?page=2".to_string(),
                status: 500,
                reason: "Internal Server Error".to_string(),
            }),
        ]);
        let store = MemoryStore::new();
        let config = run_config(&store).await;

        let outcome = PageSequencer::new(&source, &store, &JsonArrayFormat)
            .gather(&config)
            .await
            .unwrap();

        assert_eq!(outcome.state, GatherState::Errored);
        // Records from page 1 are kept.
        assert_eq!(store.guids_for_run(config.run.id), vec!["a"]);
        let errors = store.gather_errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("500 Internal Server Error"));
    }

    #[tokio::test]
    async fn test_empty_document_terminates() {
        let source = ScriptedSource::new(vec![Ok(page(&["a"])), Ok(page(&[]))]);
        let store = MemoryStore::new();
        let config = run_config(&store).await;

        let outcome = PageSequencer::new(&source, &store, &JsonArrayFormat)
            .gather(&config)
            .await
            .unwrap();

        assert!(outcome.is_done());
        assert_eq!(source.calls(), 2);
        assert_eq!(outcome.stats.new, 1);
    }

    #[tokio::test]
    async fn test_empty_first_response_keeps_known_records() {
        let store = MemoryStore::new();
        let config = run_config(&store).await;
        store.seed_current(config.source.id, "A", "pkgA");

        let source = ScriptedSource::new(vec![Ok(String::new())]);
        let outcome = PageSequencer::new(&source, &store, &JsonArrayFormat)
            .gather(&config)
            .await
            .unwrap();

        assert!(outcome.is_done());
        assert!(outcome.record_ids.is_empty());
        assert_eq!(outcome.stats.deleted, 0);
    }

    #[tokio::test]
    async fn test_parse_error_is_errored() {
        let source = ScriptedSource::new(vec![Ok("{not json".to_string())]);
        let store = MemoryStore::new();
        let config = run_config(&store).await;

        let outcome = PageSequencer::new(&source, &store, &JsonArrayFormat)
            .gather(&config)
            .await
            .unwrap();

        assert_eq!(outcome.state, GatherState::Errored);
        assert!(store.gather_errors()[0].starts_with("Error parsing file"));
    }

    #[tokio::test]
    async fn test_classifies_against_known_identifiers() {
        let store = MemoryStore::new();
        let config = run_config(&store).await;
        store.seed_current(config.source.id, "A", "pkgA");
        store.seed_current(config.source.id, "B", "pkgB");

        let source = ScriptedSource::new(vec![Ok(page(&["B", "C"])), Ok(page(&["B", "C"]))]);
        let outcome = PageSequencer::new(&source, &store, &JsonArrayFormat)
            .gather(&config)
            .await
            .unwrap();

        assert!(outcome.is_done());
        let records = store.records_for_run(config.run.id);
        let by_guid = |g: &str| records.iter().find(|r| r.guid == g).cloned().unwrap();

        assert_eq!(by_guid("C").status, RecordStatus::New);
        assert_eq!(by_guid("B").status, RecordStatus::Change);
        assert_eq!(by_guid("B").target_id.as_deref(), Some("pkgB"));

        let deleted = by_guid("A");
        assert_eq!(deleted.status, RecordStatus::Delete);
        assert!(deleted.content.is_none());
        assert_eq!(deleted.target_id.as_deref(), Some("pkgA"));
        assert_eq!(deleted.import_state, ImportState::New);

        // The previous current record for A was superseded.
        assert!(store.current_for(config.source.id, "A").is_none());
        assert!(store.current_for(config.source.id, "B").is_some());
    }

    #[tokio::test]
    async fn test_duplicates_within_a_page_are_recorded_once() {
        let source = ScriptedSource::new(vec![Ok(page(&["a", "a", "b"])), Ok(page(&[]))]);
        let store = MemoryStore::new();
        let config = run_config(&store).await;

        let outcome = PageSequencer::new(&source, &store, &JsonArrayFormat)
            .gather(&config)
            .await
            .unwrap();

        assert_eq!(outcome.stats.new, 2);
    }

    #[tokio::test]
    async fn test_overlap_with_non_adjacent_page_is_not_deduplicated() {
        let source = ScriptedSource::new(vec![
            Ok(page(&["a"])),
            Ok(page(&["b"])),
            Ok(page(&["a"])),
            Ok(page(&[])),
        ]);
        let store = MemoryStore::new();
        let config = run_config(&store).await;

        let outcome = PageSequencer::new(&source, &store, &JsonArrayFormat)
            .gather(&config)
            .await
            .unwrap();

        assert_eq!(outcome.stats.new, 3);
        let mut guids = store.guids_for_run(config.run.id);
        guids.sort();
        assert_eq!(guids, vec!["a", "a", "b"]);
    }
}
