//! Transactional SQL storage backend over sqlx.
//!
//! Two tables: `batches` and `batch_jobs`. Counter recomputes and the
//! terminal read-check-write both run inside a single transaction per
//! message. SQLite is the default driver (the `sql.connection` string decides
//! the database file); the schema keeps to portable SQL plus `json_extract`.

use crate::definition::{
    format_timestamp, parse_timestamp, BatchDefinition, BatchOptions, BatchStatus, BatchType,
    JobFailure, JobPayload, JobRecord, JobStatus, JsonMap,
};
use crate::error::{BatchQueueError, Result};
use crate::storage::{BatchFilter, BatchUpdate, JobFilter, Storage};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

const CREATE_BATCHES: &str = r#"
CREATE TABLE IF NOT EXISTS batches (
    id TEXT PRIMARY KEY,
    batch_type TEXT NOT NULL,
    status TEXT NOT NULL,
    total_jobs INTEGER NOT NULL DEFAULT 0,
    completed_jobs INTEGER NOT NULL DEFAULT 0,
    failed_jobs INTEGER NOT NULL DEFAULT 0,
    context TEXT NOT NULL,
    options TEXT NOT NULL,
    queue_name TEXT,
    queue_config TEXT,
    created TEXT NOT NULL,
    modified TEXT NOT NULL,
    completed_at TEXT
)
"#;

const CREATE_BATCH_JOBS: &str = r#"
CREATE TABLE IF NOT EXISTS batch_jobs (
    id TEXT PRIMARY KEY,
    batch_id TEXT NOT NULL REFERENCES batches(id) ON DELETE CASCADE,
    job_id TEXT,
    position INTEGER NOT NULL,
    status TEXT NOT NULL,
    payload TEXT NOT NULL,
    result TEXT,
    error TEXT,
    completed_at TEXT
)
"#;

const CREATE_INDEXES: [&str; 3] = [
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_batch_jobs_batch_job ON batch_jobs(batch_id, job_id)",
    "CREATE INDEX IF NOT EXISTS idx_batch_jobs_batch_position ON batch_jobs(batch_id, position)",
    "CREATE INDEX IF NOT EXISTS idx_batches_status ON batches(status)",
];

/// SQL storage backend
#[derive(Debug, Clone)]
pub struct SqlStorage {
    pool: SqlitePool,
}

impl SqlStorage {
    /// Connect using a sqlx connection string and initialize the schema
    pub async fn connect(connection: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(connection)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.initialize().await?;
        Ok(storage)
    }

    /// In-memory database for tests; the single connection owns the data
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.initialize().await?;
        Ok(storage)
    }

    /// Wrap an existing pool; the caller is responsible for `initialize`
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(CREATE_BATCHES).execute(&self.pool).await?;
        sqlx::query(CREATE_BATCH_JOBS).execute(&self.pool).await?;
        for statement in CREATE_INDEXES {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// The underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn load_jobs(&self, batch_id: Uuid, filter: &JobFilter) -> Result<Vec<JobRecord>> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT id, batch_id, job_id, position, status, payload, result, error, completed_at \
             FROM batch_jobs WHERE batch_id = ",
        );
        builder.push_bind(batch_id.to_string());
        if let Some(status) = filter.status {
            builder.push(" AND status = ");
            builder.push_bind(status.as_str());
        }
        builder.push(" ORDER BY position ASC");

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(hydrate_job).collect()
    }
}

fn hydrate_job(row: &SqliteRow) -> Result<JobRecord> {
    let id: String = row.try_get("id")?;
    let batch_id: String = row.try_get("batch_id")?;
    let payload: String = row.try_get("payload")?;
    let status: String = row.try_get("status")?;
    let result: Option<String> = row.try_get("result")?;
    let error: Option<String> = row.try_get("error")?;
    let completed_at: Option<String> = row.try_get("completed_at")?;

    Ok(JobRecord {
        id: parse_uuid(&id)?,
        batch_id: parse_uuid(&batch_id)?,
        job_id: row.try_get("job_id")?,
        position: row.try_get::<i64, _>("position")? as u32,
        status: JobStatus::parse(&status)?,
        payload: serde_json::from_str::<JobPayload>(&payload)?,
        result: result
            .map(|raw| serde_json::from_str::<Value>(&raw))
            .transpose()?,
        error: error
            .map(|raw| serde_json::from_str::<JobFailure>(&raw))
            .transpose()?,
        completed_at: completed_at.map(|raw| parse_timestamp(&raw)).transpose()?,
    })
}

fn hydrate_batch(row: &SqliteRow) -> Result<BatchDefinition> {
    let id: String = row.try_get("id")?;
    let batch_type: String = row.try_get("batch_type")?;
    let status: String = row.try_get("status")?;
    let context: String = row.try_get("context")?;
    let options: String = row.try_get("options")?;
    let created: String = row.try_get("created")?;
    let modified: String = row.try_get("modified")?;
    let completed_at: Option<String> = row.try_get("completed_at")?;

    Ok(BatchDefinition {
        id: parse_uuid(&id)?,
        batch_type: BatchType::parse(&batch_type)?,
        status: BatchStatus::parse(&status)?,
        total_jobs: row.try_get::<i64, _>("total_jobs")? as u32,
        completed_jobs: row.try_get::<i64, _>("completed_jobs")? as u32,
        failed_jobs: row.try_get::<i64, _>("failed_jobs")? as u32,
        context: serde_json::from_str::<JsonMap>(&context)?,
        options: serde_json::from_str::<BatchOptions>(&options)?,
        queue_name: row.try_get("queue_name")?,
        queue_config: row.try_get("queue_config")?,
        created: parse_timestamp(&created)?,
        modified: parse_timestamp(&modified)?,
        completed_at: completed_at.map(|raw| parse_timestamp(&raw)).transpose()?,
        jobs: Vec::new(),
    })
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| BatchQueueError::storage(format!("bad uuid {raw:?}: {e}")))
}

fn push_filter(builder: &mut QueryBuilder<Sqlite>, filter: &BatchFilter) {
    builder.push(" WHERE 1 = 1");
    if let Some(status) = filter.status {
        builder.push(" AND status = ");
        builder.push_bind(status.as_str());
    }
    if let Some(batch_type) = filter.batch_type {
        builder.push(" AND batch_type = ");
        builder.push_bind(batch_type.as_str());
    }
    if let Some(name) = &filter.name {
        builder.push(" AND json_extract(options, '$.name') = ");
        builder.push_bind(name.clone());
    }
    if let Some(has_compensation) = filter.has_compensation {
        if has_compensation {
            builder.push(
                " AND EXISTS (SELECT 1 FROM batch_jobs j WHERE j.batch_id = batches.id \
                 AND json_extract(j.payload, '$.compensation') IS NOT NULL)",
            );
        } else {
            builder.push(
                " AND NOT EXISTS (SELECT 1 FROM batch_jobs j WHERE j.batch_id = batches.id \
                 AND json_extract(j.payload, '$.compensation') IS NOT NULL)",
            );
        }
    }
}

async fn insert_job<'e, E>(executor: E, job: &JobRecord) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO batch_jobs \
         (id, batch_id, job_id, position, status, payload, result, error, completed_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(job.id.to_string())
    .bind(job.batch_id.to_string())
    .bind(job.job_id.clone())
    .bind(job.position as i64)
    .bind(job.status.as_str())
    .bind(serde_json::to_string(&job.payload)?)
    .bind(
        job.result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?,
    )
    .bind(
        job.error
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?,
    )
    .bind(job.completed_at.map(format_timestamp))
    .execute(executor)
    .await?;
    Ok(())
}

#[async_trait]
impl Storage for SqlStorage {
    async fn create_batch(&self, batch: &BatchDefinition) -> Result<Uuid> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO batches \
             (id, batch_type, status, total_jobs, completed_jobs, failed_jobs, context, \
              options, queue_name, queue_config, created, modified, completed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(batch.id.to_string())
        .bind(batch.batch_type.as_str())
        .bind(batch.status.as_str())
        .bind(batch.total_jobs as i64)
        .bind(batch.completed_jobs as i64)
        .bind(batch.failed_jobs as i64)
        .bind(serde_json::to_string(&batch.context)?)
        .bind(serde_json::to_string(&batch.options)?)
        .bind(batch.queue_name.clone())
        .bind(batch.queue_config.clone())
        .bind(format_timestamp(batch.created))
        .bind(format_timestamp(batch.modified))
        .bind(batch.completed_at.map(format_timestamp))
        .execute(&mut *tx)
        .await?;

        for job in &batch.jobs {
            insert_job(&mut *tx, job).await?;
        }

        tx.commit().await?;
        tracing::debug!(batch_id = %batch.id, jobs = batch.jobs.len(), "Batch persisted");
        Ok(batch.id)
    }

    async fn update_batch(&self, batch_id: Uuid, update: BatchUpdate) -> Result<()> {
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE batches SET modified = ");
        builder.push_bind(format_timestamp(crate::definition::now_second()));
        if let Some(status) = update.status {
            builder.push(", status = ");
            builder.push_bind(status.as_str());
        }
        if let Some(context) = &update.context {
            builder.push(", context = ");
            builder.push_bind(serde_json::to_string(context)?);
        }
        if let Some(total_jobs) = update.total_jobs {
            builder.push(", total_jobs = ");
            builder.push_bind(total_jobs as i64);
        }
        if let Some(queue_config) = &update.queue_config {
            builder.push(", queue_config = ");
            builder.push_bind(queue_config.clone());
        }
        if let Some(completed_at) = update.completed_at {
            builder.push(", completed_at = ");
            builder.push_bind(format_timestamp(completed_at));
        }
        builder.push(" WHERE id = ");
        builder.push_bind(batch_id.to_string());

        let result = builder.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(BatchQueueError::BatchNotFound {
                batch_id: batch_id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<BatchDefinition>> {
        let row = sqlx::query(
            "SELECT id, batch_type, status, total_jobs, completed_jobs, failed_jobs, context, \
             options, queue_name, queue_config, created, modified, completed_at \
             FROM batches WHERE id = ?",
        )
        .bind(batch_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut batch = hydrate_batch(&row)?;
        batch.jobs = self.load_jobs(batch_id, &JobFilter::default()).await?;
        Ok(Some(batch))
    }

    async fn add_jobs_to_batch(&self, batch_id: Uuid, jobs: &[JobRecord]) -> Result<u32> {
        let mut tx = self.pool.begin().await?;

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM batches WHERE id = ?")
                .bind(batch_id.to_string())
                .fetch_optional(&mut *tx)
                .await?;

        let status = status.ok_or_else(|| BatchQueueError::BatchNotFound {
            batch_id: batch_id.to_string(),
        })?;
        if BatchStatus::parse(&status)?.is_terminal() {
            return Err(BatchQueueError::BatchClosed {
                batch_id: batch_id.to_string(),
            });
        }

        for job in jobs {
            insert_job(&mut *tx, job).await?;
        }

        sqlx::query(
            "UPDATE batches SET \
             total_jobs = (SELECT COUNT(*) FROM batch_jobs WHERE batch_id = ?), \
             modified = ? WHERE id = ?",
        )
        .bind(batch_id.to_string())
        .bind(format_timestamp(crate::definition::now_second()))
        .bind(batch_id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::debug!(batch_id = %batch_id, added = jobs.len(), "Jobs appended");
        Ok(jobs.len() as u32)
    }

    async fn get_job_by_position(
        &self,
        batch_id: Uuid,
        position: u32,
    ) -> Result<Option<JobRecord>> {
        let row = sqlx::query(
            "SELECT id, batch_id, job_id, position, status, payload, result, error, completed_at \
             FROM batch_jobs WHERE batch_id = ? AND position = ?",
        )
        .bind(batch_id.to_string())
        .bind(position as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(hydrate_job).transpose()
    }

    async fn get_job_by_id(&self, batch_id: Uuid, job_id: &str) -> Result<Option<JobRecord>> {
        let row = sqlx::query(
            "SELECT id, batch_id, job_id, position, status, payload, result, error, completed_at \
             FROM batch_jobs WHERE batch_id = ? AND job_id = ?",
        )
        .bind(batch_id.to_string())
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(hydrate_job).transpose()
    }

    async fn update_job_id(&self, batch_id: Uuid, position: u32, job_id: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE batch_jobs SET job_id = ? WHERE batch_id = ? AND position = ?",
        )
        .bind(job_id)
        .bind(batch_id.to_string())
        .bind(position as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BatchQueueError::storage(format!(
                "no job at position {position} in batch {batch_id}"
            )));
        }
        Ok(())
    }

    async fn update_job_status(
        &self,
        batch_id: Uuid,
        job_id: &str,
        status: JobStatus,
        result: Option<Value>,
        error: Option<JobFailure>,
    ) -> Result<()> {
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE batch_jobs SET status = ");
        builder.push_bind(status.as_str());
        if let Some(result) = &result {
            builder.push(", result = ");
            builder.push_bind(serde_json::to_string(result)?);
        }
        if let Some(error) = &error {
            builder.push(", error = ");
            builder.push_bind(serde_json::to_string(error)?);
        }
        if status.is_terminal() {
            builder.push(", completed_at = ");
            builder.push_bind(format_timestamp(crate::definition::now_second()));
        }
        builder.push(" WHERE batch_id = ");
        builder.push_bind(batch_id.to_string());
        builder.push(" AND job_id = ");
        builder.push_bind(job_id.to_string());

        let outcome = builder.build().execute(&self.pool).await?;
        if outcome.rows_affected() == 0 {
            return Err(BatchQueueError::storage(format!(
                "no job {job_id:?} in batch {batch_id}"
            )));
        }
        Ok(())
    }

    async fn increment_completed_jobs(&self, batch_id: Uuid) -> Result<u32> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE batches SET \
             completed_jobs = (SELECT COUNT(*) FROM batch_jobs \
                               WHERE batch_id = ? AND status = 'completed'), \
             modified = ? WHERE id = ?",
        )
        .bind(batch_id.to_string())
        .bind(format_timestamp(crate::definition::now_second()))
        .bind(batch_id.to_string())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BatchQueueError::BatchNotFound {
                batch_id: batch_id.to_string(),
            });
        }

        let count: i64 = sqlx::query_scalar("SELECT completed_jobs FROM batches WHERE id = ?")
            .bind(batch_id.to_string())
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(count as u32)
    }

    async fn increment_failed_jobs(&self, batch_id: Uuid) -> Result<u32> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE batches SET \
             failed_jobs = (SELECT COUNT(*) FROM batch_jobs \
                            WHERE batch_id = ? AND status = 'failed'), \
             modified = ? WHERE id = ?",
        )
        .bind(batch_id.to_string())
        .bind(format_timestamp(crate::definition::now_second()))
        .bind(batch_id.to_string())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BatchQueueError::BatchNotFound {
                batch_id: batch_id.to_string(),
            });
        }

        let count: i64 = sqlx::query_scalar("SELECT failed_jobs FROM batches WHERE id = ?")
            .bind(batch_id.to_string())
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(count as u32)
    }

    async fn get_batch_results(&self, batch_id: Uuid) -> Result<HashMap<String, Value>> {
        let rows = sqlx::query(
            "SELECT job_id, result FROM batch_jobs \
             WHERE batch_id = ? AND job_id IS NOT NULL AND result IS NOT NULL \
             ORDER BY position ASC",
        )
        .bind(batch_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut results = HashMap::new();
        for row in rows {
            let job_id: String = row.try_get("job_id")?;
            let raw: String = row.try_get("result")?;
            results.insert(job_id, serde_json::from_str::<Value>(&raw)?);
        }
        Ok(results)
    }

    async fn get_all_jobs(&self, batch_id: Uuid, filter: &JobFilter) -> Result<Vec<JobRecord>> {
        self.load_jobs(batch_id, filter).await
    }

    async fn get_batches(
        &self,
        filter: &BatchFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<BatchDefinition>> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT id, batch_type, status, total_jobs, completed_jobs, failed_jobs, context, \
             options, queue_name, queue_config, created, modified, completed_at FROM batches",
        );
        push_filter(&mut builder, filter);
        builder.push(" ORDER BY created DESC, id DESC LIMIT ");
        builder.push_bind(limit as i64);
        builder.push(" OFFSET ");
        builder.push_bind(offset as i64);

        let rows = builder.build().fetch_all(&self.pool).await?;
        let mut batches = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut batch = hydrate_batch(row)?;
            batch.jobs = self.load_jobs(batch.id, &JobFilter::default()).await?;
            batches.push(batch);
        }
        Ok(batches)
    }

    async fn count_batches(&self, filter: &BatchFilter) -> Result<u64> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM batches");
        push_filter(&mut builder, filter);

        let count: i64 = builder.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count as u64)
    }

    async fn delete_batch(&self, batch_id: Uuid) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM batch_jobs WHERE batch_id = ?")
            .bind(batch_id.to_string())
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM batches WHERE id = ?")
            .bind(batch_id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn cleanup_old_batches(&self, older_than_days: i64) -> Result<u64> {
        let cutoff = format_timestamp(
            crate::definition::now_second() - chrono::Duration::days(older_than_days),
        );
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM batch_jobs WHERE batch_id IN \
             (SELECT id FROM batches WHERE status IN ('completed', 'failed') \
              AND completed_at IS NOT NULL AND completed_at < ?)",
        )
        .bind(cutoff.clone())
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            "DELETE FROM batches WHERE status IN ('completed', 'failed') \
             AND completed_at IS NOT NULL AND completed_at < ?",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        let removed = result.rows_affected();
        if removed > 0 {
            tracing::info!(removed, older_than_days, "Old batches cleaned up");
        }
        Ok(removed)
    }

    async fn health_check(&self) -> bool {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }
}
