//! Harvest record store for PostgreSQL.
//!
//! The "one current record per (source, identifier)" rule is enforced twice:
//! by the transactional flag flips below and by the partial unique index in
//! `schema.sql`.
//!
//! # Testing
//!
//! Unit tests cover row conversion only. The SQL paths need a live
//! PostgreSQL instance and are exercised through the CLI.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gleaner_core::error::AppError;
use gleaner_core::models::{
    DatabaseStats, HarvestErrorEntry, HarvestRecord, HarvestRun, HarvestSource, ImportState,
    KnownRecord, NewHarvestRecord, NewHarvestSource, RecordPhase, RunStatus,
};
use gleaner_core::traits::{ErrorSink, HarvestRecordStore};
use sqlx::{PgPool, Pool, Postgres, Transaction};
use uuid::Uuid;

/// Column list for record SELECTs. Must remain a const literal since
/// format!() bypasses sqlx compile-time validation.
const RECORD_COLUMNS: &str = "id, guid, run_id, source_id, content, content_hash, status, current, target_id, import_state, created_at";

const SOURCE_COLUMNS: &str = "id, name, url, title, owner_org, config";

const RUN_COLUMNS: &str = "id, source_id, status, started_at, finished_at";

/// DDL applied by [`HarvestRepository::ensure_schema`].
pub const SCHEMA: &str = include_str!("../schema.sql");

/// Repository for harvest sources, runs, records and errors.
///
/// # Examples
///
/// ```no_run
/// use sqlx::postgres::PgPoolOptions;
/// use gleaner_db::HarvestRepository;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = PgPoolOptions::new()
///     .max_connections(5)
///     .connect("postgresql://localhost/gleaner")
///     .await?;
///
/// let repo = HarvestRepository::new(pool);
/// repo.ensure_schema().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct HarvestRepository {
    pool: Pool<Postgres>,
}

impl HarvestRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates tables and indexes if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), AppError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, AppError> {
        self.pool.begin().await.map_err(AppError::DatabaseError)
    }

    async fn insert_in(
        tx: &mut Transaction<'static, Postgres>,
        record: &NewHarvestRecord,
    ) -> Result<RecordRow, AppError> {
        let query = format!(
            r#"
            INSERT INTO harvest_records (
                id, guid, run_id, source_id, content, content_hash, status, target_id, import_state
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {}
            "#,
            RECORD_COLUMNS
        );
        sqlx::query_as::<_, RecordRow>(&query)
            .bind(Uuid::new_v4())
            .bind(&record.guid)
            .bind(record.run_id)
            .bind(record.source_id)
            .bind(&record.content)
            .bind(&record.content_hash)
            .bind(record.status.as_str())
            .bind(&record.target_id)
            .bind(ImportState::New.as_str())
            .fetch_one(&mut **tx)
            .await
            .map_err(AppError::DatabaseError)
    }

    /// Lists persisted errors, newest first, optionally for a single run.
    pub async fn list_errors(
        &self,
        run_id: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<HarvestErrorEntry>, AppError> {
        let rows: Vec<ErrorRow> = sqlx::query_as(
            r#"
            SELECT run_id, record_id, guid, phase, message, created_at FROM (
                SELECT g.run_id, NULL::uuid AS record_id, NULL::text AS guid,
                       NULL::text AS phase, g.message, g.created_at
                FROM harvest_gather_errors g
                UNION ALL
                SELECT e.run_id, e.record_id, r.guid, e.phase, e.message, e.created_at
                FROM harvest_record_errors e
                JOIN harvest_records r ON r.id = e.record_id
            ) errors
            WHERE $1::uuid IS NULL OR run_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(run_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        rows.into_iter().map(HarvestErrorEntry::try_from).collect()
    }

    /// Most recent run of a source, if it has ever run.
    pub async fn latest_run(&self, source_id: Uuid) -> Result<Option<HarvestRun>, AppError> {
        let query = format!(
            "SELECT {} FROM harvest_runs WHERE source_id = $1 ORDER BY started_at DESC LIMIT 1",
            RUN_COLUMNS
        );
        let row = sqlx::query_as::<_, RunRow>(&query)
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;

        row.map(HarvestRun::try_from).transpose()
    }

    /// Returns aggregated database statistics.
    pub async fn get_stats(&self) -> Result<DatabaseStats, AppError> {
        let row: StatsRow = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM harvest_sources) as sources,
                (SELECT COUNT(*) FROM harvest_runs) as runs,
                (SELECT COUNT(*) FROM harvest_records) as records,
                (SELECT COUNT(*) FROM harvest_records WHERE current) as current_records,
                (SELECT COUNT(*) FROM harvest_gather_errors)
                    + (SELECT COUNT(*) FROM harvest_record_errors) as errors,
                (SELECT MAX(started_at) FROM harvest_runs) as last_run
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(DatabaseStats {
            total_sources: row.sources.unwrap_or(0),
            total_runs: row.runs.unwrap_or(0),
            total_records: row.records.unwrap_or(0),
            current_records: row.current_records.unwrap_or(0),
            total_errors: row.errors.unwrap_or(0),
            last_run: row.last_run,
        })
    }
}

#[async_trait]
impl HarvestRecordStore for HarvestRepository {
    async fn register_source(&self, source: &NewHarvestSource) -> Result<HarvestSource, AppError> {
        let query = format!(
            r#"
            INSERT INTO harvest_sources (id, name, url, title, owner_org, config)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (name)
            DO UPDATE SET
                url = EXCLUDED.url,
                title = EXCLUDED.title,
                owner_org = EXCLUDED.owner_org,
                config = EXCLUDED.config,
                updated_at = NOW()
            RETURNING {}
            "#,
            SOURCE_COLUMNS
        );
        let row = sqlx::query_as::<_, SourceRow>(&query)
            .bind(Uuid::new_v4())
            .bind(&source.name)
            .bind(&source.url)
            .bind(&source.title)
            .bind(&source.owner_org)
            .bind(&source.config)
            .fetch_one(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;

        Ok(row.into())
    }

    async fn create_run(&self, source_id: Uuid) -> Result<HarvestRun, AppError> {
        let query = format!(
            "INSERT INTO harvest_runs (id, source_id, status) VALUES ($1, $2, $3) RETURNING {}",
            RUN_COLUMNS
        );
        let row = sqlx::query_as::<_, RunRow>(&query)
            .bind(Uuid::new_v4())
            .bind(source_id)
            .bind(RunStatus::Running.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;

        HarvestRun::try_from(row)
    }

    async fn finish_run(&self, run_id: Uuid, status: RunStatus) -> Result<(), AppError> {
        let finished_at = matches!(status, RunStatus::Finished | RunStatus::Errored)
            .then(Utc::now);

        sqlx::query(
            r#"
            UPDATE harvest_runs
            SET status = $2, finished_at = $3
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(finished_at)
        .execute(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(())
    }

    async fn current_records(
        &self,
        source_id: Uuid,
    ) -> Result<HashMap<String, KnownRecord>, AppError> {
        let rows: Vec<KnownRow> = sqlx::query_as(
            r#"
            SELECT guid, target_id, content_hash
            FROM harvest_records
            WHERE source_id = $1 AND current
            "#,
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.guid,
                    KnownRecord {
                        target_id: row.target_id,
                        content_hash: row.content_hash,
                    },
                )
            })
            .collect())
    }

    async fn insert_record(&self, record: NewHarvestRecord) -> Result<HarvestRecord, AppError> {
        let mut tx = self.begin().await?;
        let row = Self::insert_in(&mut tx, &record).await?;
        tx.commit().await.map_err(AppError::DatabaseError)?;

        HarvestRecord::try_from(row)
    }

    async fn insert_delete_record(
        &self,
        record: NewHarvestRecord,
    ) -> Result<HarvestRecord, AppError> {
        let mut tx = self.begin().await?;

        sqlx::query(
            r#"
            UPDATE harvest_records
            SET current = FALSE
            WHERE source_id = $1 AND guid = $2 AND current
            "#,
        )
        .bind(record.source_id)
        .bind(&record.guid)
        .execute(&mut *tx)
        .await
        .map_err(AppError::DatabaseError)?;

        let row = Self::insert_in(&mut tx, &record).await?;
        tx.commit().await.map_err(AppError::DatabaseError)?;

        HarvestRecord::try_from(row)
    }

    async fn find_current(
        &self,
        source_id: Uuid,
        guid: &str,
    ) -> Result<Option<HarvestRecord>, AppError> {
        let query = format!(
            "SELECT {} FROM harvest_records WHERE source_id = $1 AND guid = $2 AND current",
            RECORD_COLUMNS
        );
        let row = sqlx::query_as::<_, RecordRow>(&query)
            .bind(source_id)
            .bind(guid)
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;

        row.map(HarvestRecord::try_from).transpose()
    }

    async fn clear_current(&self, record_id: Uuid) -> Result<(), AppError> {
        sqlx::query("UPDATE harvest_records SET current = FALSE WHERE id = $1")
            .bind(record_id)
            .execute(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;
        Ok(())
    }

    async fn mark_current(&self, record_id: Uuid, target_id: &str) -> Result<(), AppError> {
        let mut tx = self.begin().await?;

        // Clear first so the partial unique index never sees two current rows.
        sqlx::query(
            r#"
            UPDATE harvest_records
            SET current = FALSE
            WHERE current
              AND id <> $1
              AND (source_id, guid) = (SELECT source_id, guid FROM harvest_records WHERE id = $1)
            "#,
        )
        .bind(record_id)
        .execute(&mut *tx)
        .await
        .map_err(AppError::DatabaseError)?;

        let result = sqlx::query(
            r#"
            UPDATE harvest_records
            SET current = TRUE, target_id = $2
            WHERE id = $1
            "#,
        )
        .bind(record_id)
        .bind(target_id)
        .execute(&mut *tx)
        .await
        .map_err(AppError::DatabaseError)?;

        if result.rows_affected() == 0 {
            return Err(AppError::Generic(format!(
                "harvest record {} does not exist",
                record_id
            )));
        }

        tx.commit().await.map_err(AppError::DatabaseError)?;
        Ok(())
    }

    async fn pending_records(&self, run_id: Uuid) -> Result<Vec<HarvestRecord>, AppError> {
        let query = format!(
            r#"
            SELECT {} FROM harvest_records
            WHERE run_id = $1 AND import_state NOT IN ('committed', 'failed', 'skipped')
            ORDER BY seq
            "#,
            RECORD_COLUMNS
        );
        let rows = sqlx::query_as::<_, RecordRow>(&query)
            .bind(run_id)
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;

        rows.into_iter().map(HarvestRecord::try_from).collect()
    }

    async fn set_import_state(&self, record_id: Uuid, state: ImportState) -> Result<(), AppError> {
        sqlx::query("UPDATE harvest_records SET import_state = $2 WHERE id = $1")
            .bind(record_id)
            .bind(state.as_str())
            .execute(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;
        Ok(())
    }
}

#[async_trait]
impl ErrorSink for HarvestRepository {
    async fn report_gather_error(&self, run: &HarvestRun, message: &str) -> Result<(), AppError> {
        tracing::warn!(run_id = %run.id, message, "Gather error");
        sqlx::query("INSERT INTO harvest_gather_errors (run_id, message) VALUES ($1, $2)")
            .bind(run.id)
            .bind(message)
            .execute(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;
        Ok(())
    }

    async fn report_record_error(
        &self,
        record: &HarvestRecord,
        message: &str,
        phase: RecordPhase,
    ) -> Result<(), AppError> {
        tracing::warn!(
            record_id = %record.id,
            guid = %record.guid,
            phase = %phase,
            message,
            "Record error"
        );
        sqlx::query(
            r#"
            INSERT INTO harvest_record_errors (record_id, run_id, phase, message)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(record.id)
        .bind(record.run_id)
        .bind(phase.as_str())
        .bind(message)
        .execute(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;
        Ok(())
    }
}

/// Helper struct for deserializing source rows
#[derive(sqlx::FromRow)]
struct SourceRow {
    id: Uuid,
    name: String,
    url: String,
    title: String,
    owner_org: Option<String>,
    config: Option<String>,
}

impl From<SourceRow> for HarvestSource {
    fn from(row: SourceRow) -> Self {
        HarvestSource {
            id: row.id,
            name: row.name,
            url: row.url,
            title: row.title,
            owner_org: row.owner_org,
            config: row.config,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    source_id: Uuid,
    status: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<RunRow> for HarvestRun {
    type Error = AppError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        Ok(HarvestRun {
            id: row.id,
            source_id: row.source_id,
            status: row.status.parse()?,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

/// Helper struct for deserializing record rows; status columns are text.
#[derive(sqlx::FromRow)]
struct RecordRow {
    id: Uuid,
    guid: String,
    run_id: Uuid,
    source_id: Uuid,
    content: Option<String>,
    content_hash: Option<String>,
    status: String,
    current: bool,
    target_id: Option<String>,
    import_state: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<RecordRow> for HarvestRecord {
    type Error = AppError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        Ok(HarvestRecord {
            id: row.id,
            guid: row.guid,
            run_id: row.run_id,
            source_id: row.source_id,
            content: row.content,
            content_hash: row.content_hash,
            status: row.status.parse()?,
            current: row.current,
            target_id: row.target_id,
            import_state: row.import_state.parse()?,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct KnownRow {
    guid: String,
    target_id: Option<String>,
    content_hash: Option<String>,
}

#[derive(sqlx::FromRow)]
struct ErrorRow {
    run_id: Uuid,
    record_id: Option<Uuid>,
    guid: Option<String>,
    phase: Option<String>,
    message: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<ErrorRow> for HarvestErrorEntry {
    type Error = AppError;

    fn try_from(row: ErrorRow) -> Result<Self, Self::Error> {
        Ok(HarvestErrorEntry {
            run_id: row.run_id,
            record_id: row.record_id,
            guid: row.guid,
            phase: row.phase.as_deref().map(str::parse).transpose()?,
            message: row.message,
            created_at: row.created_at,
        })
    }
}

/// Helper struct for deserializing stats query results
#[derive(sqlx::FromRow)]
struct StatsRow {
    sources: Option<i64>,
    runs: Option<i64>,
    records: Option<i64>,
    current_records: Option<i64>,
    errors: Option<i64>,
    last_run: Option<DateTime<Utc>>,
}
