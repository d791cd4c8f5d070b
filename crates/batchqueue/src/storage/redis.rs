//! Redis storage backend: one hash per batch plus jobs/results/failed hashes.
//!
//! Key namespace is `<prefix><batch_id>` with `:jobs`, `:results` and
//! `:failed` companions and a `<prefix>batches` index set. Status flips and
//! counter recounts run inside Lua scripts so a single worker's commit is
//! atomic; every write renews the configured TTL and each counter commit
//! publishes a progress event on `<prefix>events`.

use crate::config::{BatchQueueConfig, RedisConfig};
use crate::definition::{
    format_timestamp, BatchDefinition, BatchOptions, BatchStatus, BatchType, JobFailure,
    JobRecord, JobStatus, JsonMap,
};
use crate::error::{BatchQueueError, Result};
use crate::storage::{BatchFilter, BatchUpdate, JobFilter, Storage};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

const STATUS_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return -2
end
local entries = redis.call('HGETALL', KEYS[2])
local field = nil
local row = nil
for i = 1, #entries, 2 do
  local decoded = cjson.decode(entries[i + 1])
  if decoded['job_id'] == ARGV[1] then
    field = entries[i]
    row = decoded
    break
  end
end
if field == nil then
  return -1
end
row['status'] = ARGV[2]
if ARGV[3] ~= '' then
  row['result'] = cjson.decode(ARGV[3])
  redis.call('HSET', KEYS[3], ARGV[1], ARGV[3])
end
if ARGV[4] ~= '' then
  row['error'] = cjson.decode(ARGV[4])
  redis.call('HSET', KEYS[4], ARGV[1], ARGV[4])
end
if ARGV[5] ~= '' then
  row['completed_at'] = ARGV[5]
end
redis.call('HSET', KEYS[2], field, cjson.encode(row))
local completed = 0
local failed = 0
local all = redis.call('HGETALL', KEYS[2])
for i = 1, #all, 2 do
  local decoded = cjson.decode(all[i + 1])
  if decoded['status'] == 'completed' then
    completed = completed + 1
  elseif decoded['status'] == 'failed' then
    failed = failed + 1
  end
end
redis.call('HSET', KEYS[1], 'completed_jobs', completed, 'failed_jobs', failed, 'modified', ARGV[6])
local total = tonumber(redis.call('HGET', KEYS[1], 'total_jobs') or '0')
local status = redis.call('HGET', KEYS[1], 'status')
local terminal = status == 'completed' or status == 'failed'
local sticky = ARGV[7] == '1'
if ARGV[2] == 'failed' then
  if not (sticky and terminal) then
    redis.call('HSET', KEYS[1], 'status', 'failed', 'completed_at', ARGV[6])
  end
elseif completed >= total and total > 0 and failed == 0 then
  if not (sticky and terminal) then
    redis.call('HSET', KEYS[1], 'status', 'completed', 'completed_at', ARGV[6])
  end
end
local event = cjson.encode({
  batch_id = ARGV[9],
  status = redis.call('HGET', KEYS[1], 'status'),
  completed_jobs = completed,
  failed_jobs = failed,
  total_jobs = total
})
redis.call('PUBLISH', ARGV[8], event)
for i = 1, #KEYS do
  redis.call('EXPIRE', KEYS[i], ARGV[10])
end
return completed
"#;

const RECOUNT_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return -2
end
local completed = 0
local failed = 0
local all = redis.call('HGETALL', KEYS[2])
for i = 1, #all, 2 do
  local decoded = cjson.decode(all[i + 1])
  if decoded['status'] == 'completed' then
    completed = completed + 1
  elseif decoded['status'] == 'failed' then
    failed = failed + 1
  end
end
redis.call('HSET', KEYS[1], 'completed_jobs', completed, 'failed_jobs', failed, 'modified', ARGV[1])
redis.call('EXPIRE', KEYS[1], ARGV[3])
redis.call('EXPIRE', KEYS[2], ARGV[3])
if ARGV[2] == 'completed' then
  return completed
end
return failed
"#;

const ADD_JOBS_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return -2
end
local status = redis.call('HGET', KEYS[1], 'status')
if status == 'completed' or status == 'failed' then
  return -1
end
for i = 3, #ARGV, 2 do
  redis.call('HSET', KEYS[2], ARGV[i], ARGV[i + 1])
end
local total = redis.call('HLEN', KEYS[2])
redis.call('HSET', KEYS[1], 'total_jobs', total, 'modified', ARGV[1])
redis.call('EXPIRE', KEYS[1], ARGV[2])
redis.call('EXPIRE', KEYS[2], ARGV[2])
return total
"#;

/// Redis storage backend
pub struct RedisStorage {
    conn: ConnectionManager,
    prefix: String,
    ttl: u64,
    sticky_terminal: bool,
    status_script: Script,
    recount_script: Script,
    add_jobs_script: Script,
}

impl RedisStorage {
    /// Connect using the redis section of the configuration
    pub async fn connect(config: &BatchQueueConfig) -> Result<Self> {
        Self::connect_with(&config.redis, config.defaults.sticky_terminal).await
    }

    /// Connect using explicit redis settings
    pub async fn connect_with(redis: &RedisConfig, sticky_terminal: bool) -> Result<Self> {
        let client = redis::Client::open(redis.url())?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::with_connection(
            conn,
            &redis.prefix,
            redis.ttl,
            sticky_terminal,
        ))
    }

    /// Wrap an existing connection manager
    pub fn with_connection(
        conn: ConnectionManager,
        prefix: &str,
        ttl: u64,
        sticky_terminal: bool,
    ) -> Self {
        Self {
            conn,
            prefix: prefix.to_string(),
            ttl,
            sticky_terminal,
            status_script: Script::new(STATUS_SCRIPT),
            recount_script: Script::new(RECOUNT_SCRIPT),
            add_jobs_script: Script::new(ADD_JOBS_SCRIPT),
        }
    }

    fn meta_key(&self, batch_id: Uuid) -> String {
        format!("{}{}", self.prefix, batch_id)
    }

    fn jobs_key(&self, batch_id: Uuid) -> String {
        format!("{}{}:jobs", self.prefix, batch_id)
    }

    fn results_key(&self, batch_id: Uuid) -> String {
        format!("{}{}:results", self.prefix, batch_id)
    }

    fn failed_key(&self, batch_id: Uuid) -> String {
        format!("{}{}:failed", self.prefix, batch_id)
    }

    fn index_key(&self) -> String {
        format!("{}batches", self.prefix)
    }

    fn events_channel(&self) -> String {
        format!("{}events", self.prefix)
    }

    async fn load_jobs(&self, batch_id: Uuid) -> Result<Vec<JobRecord>> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> = conn.hgetall(self.jobs_key(batch_id)).await?;

        let mut jobs = Vec::with_capacity(raw.len());
        for encoded in raw.values() {
            let map: JsonMap = serde_json::from_str(encoded)?;
            jobs.push(JobRecord::from_map(&map)?);
        }
        jobs.sort_by_key(|job| job.position);
        Ok(jobs)
    }

    async fn renew_ttl(&self, batch_id: Uuid) -> Result<()> {
        let mut conn = self.conn.clone();
        let ttl = self.ttl as i64;
        redis::pipe()
            .expire(self.meta_key(batch_id), ttl)
            .ignore()
            .expire(self.jobs_key(batch_id), ttl)
            .ignore()
            .expire(self.results_key(batch_id), ttl)
            .ignore()
            .expire(self.failed_key(batch_id), ttl)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

fn meta_fields(batch: &BatchDefinition) -> Vec<(String, String)> {
    let mut fields = vec![
        ("id".to_string(), batch.id.to_string()),
        ("type".to_string(), batch.batch_type.as_str().to_string()),
        ("status".to_string(), batch.status.as_str().to_string()),
        ("total_jobs".to_string(), batch.total_jobs.to_string()),
        (
            "completed_jobs".to_string(),
            batch.completed_jobs.to_string(),
        ),
        ("failed_jobs".to_string(), batch.failed_jobs.to_string()),
        (
            "context".to_string(),
            Value::Object(batch.context.clone()).to_string(),
        ),
        (
            "options".to_string(),
            serde_json::to_value(&batch.options)
                .unwrap_or(Value::Null)
                .to_string(),
        ),
        ("created".to_string(), batch.created.timestamp().to_string()),
        (
            "modified".to_string(),
            batch.modified.timestamp().to_string(),
        ),
    ];
    if let Some(queue_name) = &batch.queue_name {
        fields.push(("queue_name".to_string(), queue_name.clone()));
    }
    if let Some(queue_config) = &batch.queue_config {
        fields.push(("queue_config".to_string(), queue_config.clone()));
    }
    if let Some(completed_at) = batch.completed_at {
        fields.push(("completed_at".to_string(), completed_at.timestamp().to_string()));
    }
    fields
}

fn parse_unix(raw: &str) -> Result<DateTime<Utc>> {
    let seconds: i64 = raw
        .parse()
        .map_err(|_| BatchQueueError::storage(format!("bad unix timestamp {raw:?}")))?;
    Utc.timestamp_opt(seconds, 0)
        .single()
        .ok_or_else(|| BatchQueueError::storage(format!("unix timestamp out of range: {raw}")))
}

fn meta_to_batch(map: &HashMap<String, String>) -> Result<BatchDefinition> {
    let get = |key: &str| -> Result<&String> {
        map.get(key)
            .ok_or_else(|| BatchQueueError::storage(format!("batch hash missing {key}")))
    };
    let counter = |key: &str| -> Result<u32> {
        get(key)?
            .parse::<u32>()
            .map_err(|_| BatchQueueError::storage(format!("bad counter {key}")))
    };

    let id = Uuid::parse_str(get("id")?)
        .map_err(|e| BatchQueueError::storage(format!("bad batch id: {e}")))?;
    let context: JsonMap = serde_json::from_str(get("context")?)?;
    let options: BatchOptions = serde_json::from_str(get("options")?)?;

    Ok(BatchDefinition {
        id,
        batch_type: BatchType::parse(get("type")?)?,
        status: BatchStatus::parse(get("status")?)?,
        total_jobs: counter("total_jobs")?,
        completed_jobs: counter("completed_jobs")?,
        failed_jobs: counter("failed_jobs")?,
        context,
        options,
        queue_name: map.get("queue_name").cloned(),
        queue_config: map.get("queue_config").cloned(),
        created: parse_unix(get("created")?)?,
        modified: parse_unix(get("modified")?)?,
        completed_at: map
            .get("completed_at")
            .map(|raw| parse_unix(raw))
            .transpose()?,
        jobs: Vec::new(),
    })
}

#[async_trait]
impl Storage for RedisStorage {
    async fn create_batch(&self, batch: &BatchDefinition) -> Result<Uuid> {
        let mut conn = self.conn.clone();
        let ttl = self.ttl as i64;

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset_multiple(self.meta_key(batch.id), &meta_fields(batch))
            .ignore();
        for job in &batch.jobs {
            pipe.hset(
                self.jobs_key(batch.id),
                job.id.to_string(),
                Value::Object(job.to_map()).to_string(),
            )
            .ignore();
        }
        pipe.sadd(self.index_key(), batch.id.to_string()).ignore();
        pipe.expire(self.meta_key(batch.id), ttl).ignore();
        pipe.expire(self.jobs_key(batch.id), ttl).ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;

        tracing::debug!(batch_id = %batch.id, jobs = batch.jobs.len(), "Batch persisted");
        Ok(batch.id)
    }

    async fn update_batch(&self, batch_id: Uuid, update: BatchUpdate) -> Result<()> {
        let mut conn = self.conn.clone();
        let meta_key = self.meta_key(batch_id);

        let exists: bool = conn.exists(&meta_key).await?;
        if !exists {
            return Err(BatchQueueError::BatchNotFound {
                batch_id: batch_id.to_string(),
            });
        }

        let mut fields = vec![(
            "modified".to_string(),
            crate::definition::now_second().timestamp().to_string(),
        )];
        if let Some(status) = update.status {
            fields.push(("status".to_string(), status.as_str().to_string()));
        }
        if let Some(context) = &update.context {
            fields.push(("context".to_string(), Value::Object(context.clone()).to_string()));
        }
        if let Some(total_jobs) = update.total_jobs {
            fields.push(("total_jobs".to_string(), total_jobs.to_string()));
        }
        if let Some(queue_config) = &update.queue_config {
            fields.push(("queue_config".to_string(), queue_config.clone()));
        }
        if let Some(completed_at) = update.completed_at {
            fields.push(("completed_at".to_string(), completed_at.timestamp().to_string()));
        }

        conn.hset_multiple::<_, _, _, ()>(&meta_key, &fields).await?;
        self.renew_ttl(batch_id).await
    }

    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<BatchDefinition>> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> = conn.hgetall(self.meta_key(batch_id)).await?;
        if raw.is_empty() {
            return Ok(None);
        }

        let mut batch = meta_to_batch(&raw)?;
        batch.jobs = self.load_jobs(batch_id).await?;
        Ok(Some(batch))
    }

    async fn add_jobs_to_batch(&self, batch_id: Uuid, jobs: &[JobRecord]) -> Result<u32> {
        let mut conn = self.conn.clone();

        let mut invocation = self.add_jobs_script.key(self.meta_key(batch_id));
        invocation
            .key(self.jobs_key(batch_id))
            .arg(crate::definition::now_second().timestamp().to_string())
            .arg(self.ttl);
        for job in jobs {
            invocation
                .arg(job.id.to_string())
                .arg(Value::Object(job.to_map()).to_string());
        }

        let outcome: i64 = invocation.invoke_async(&mut conn).await?;
        match outcome {
            -2 => Err(BatchQueueError::BatchNotFound {
                batch_id: batch_id.to_string(),
            }),
            -1 => Err(BatchQueueError::BatchClosed {
                batch_id: batch_id.to_string(),
            }),
            _ => {
                tracing::debug!(batch_id = %batch_id, added = jobs.len(), "Jobs appended");
                Ok(jobs.len() as u32)
            }
        }
    }

    async fn get_job_by_position(
        &self,
        batch_id: Uuid,
        position: u32,
    ) -> Result<Option<JobRecord>> {
        let jobs = self.load_jobs(batch_id).await?;
        Ok(jobs.into_iter().find(|job| job.position == position))
    }

    async fn get_job_by_id(&self, batch_id: Uuid, job_id: &str) -> Result<Option<JobRecord>> {
        let jobs = self.load_jobs(batch_id).await?;
        Ok(jobs
            .into_iter()
            .find(|job| job.job_id.as_deref() == Some(job_id)))
    }

    async fn update_job_id(&self, batch_id: Uuid, position: u32, job_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let job = self
            .get_job_by_position(batch_id, position)
            .await?
            .ok_or_else(|| {
                BatchQueueError::storage(format!(
                    "no job at position {position} in batch {batch_id}"
                ))
            })?;

        let mut updated = job.clone();
        updated.job_id = Some(job_id.to_string());
        conn.hset::<_, _, _, ()>(
            self.jobs_key(batch_id),
            job.id.to_string(),
            Value::Object(updated.to_map()).to_string(),
        )
        .await?;
        self.renew_ttl(batch_id).await
    }

    async fn update_job_status(
        &self,
        batch_id: Uuid,
        job_id: &str,
        status: JobStatus,
        result: Option<Value>,
        error: Option<JobFailure>,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let now = crate::definition::now_second();

        let result_json = result.map(|value| value.to_string()).unwrap_or_default();
        let error_json = error
            .map(|failure| serde_json::to_string(&failure))
            .transpose()?
            .unwrap_or_default();
        let completed_at = if status.is_terminal() {
            format_timestamp(now)
        } else {
            String::new()
        };

        let mut invocation = self.status_script.key(self.meta_key(batch_id));
        invocation
            .key(self.jobs_key(batch_id))
            .key(self.results_key(batch_id))
            .key(self.failed_key(batch_id))
            .arg(job_id)
            .arg(status.as_str())
            .arg(result_json)
            .arg(error_json)
            .arg(completed_at)
            .arg(now.timestamp().to_string())
            .arg(if self.sticky_terminal { "1" } else { "0" })
            .arg(self.events_channel())
            .arg(batch_id.to_string())
            .arg(self.ttl);

        let outcome: i64 = invocation.invoke_async(&mut conn).await?;
        match outcome {
            -2 => Err(BatchQueueError::BatchNotFound {
                batch_id: batch_id.to_string(),
            }),
            -1 => Err(BatchQueueError::storage(format!(
                "no job {job_id:?} in batch {batch_id}"
            ))),
            _ => Ok(()),
        }
    }

    async fn increment_completed_jobs(&self, batch_id: Uuid) -> Result<u32> {
        let mut conn = self.conn.clone();
        let mut invocation = self.recount_script.key(self.meta_key(batch_id));
        invocation
            .key(self.jobs_key(batch_id))
            .arg(crate::definition::now_second().timestamp().to_string())
            .arg("completed")
            .arg(self.ttl);

        let outcome: i64 = invocation.invoke_async(&mut conn).await?;
        if outcome == -2 {
            return Err(BatchQueueError::BatchNotFound {
                batch_id: batch_id.to_string(),
            });
        }
        Ok(outcome as u32)
    }

    async fn increment_failed_jobs(&self, batch_id: Uuid) -> Result<u32> {
        let mut conn = self.conn.clone();
        let mut invocation = self.recount_script.key(self.meta_key(batch_id));
        invocation
            .key(self.jobs_key(batch_id))
            .arg(crate::definition::now_second().timestamp().to_string())
            .arg("failed")
            .arg(self.ttl);

        let outcome: i64 = invocation.invoke_async(&mut conn).await?;
        if outcome == -2 {
            return Err(BatchQueueError::BatchNotFound {
                batch_id: batch_id.to_string(),
            });
        }
        Ok(outcome as u32)
    }

    async fn get_batch_results(&self, batch_id: Uuid) -> Result<HashMap<String, Value>> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> = conn.hgetall(self.results_key(batch_id)).await?;

        let mut results = HashMap::with_capacity(raw.len());
        for (job_id, encoded) in raw {
            results.insert(job_id, serde_json::from_str::<Value>(&encoded)?);
        }
        Ok(results)
    }

    async fn get_all_jobs(&self, batch_id: Uuid, filter: &JobFilter) -> Result<Vec<JobRecord>> {
        let jobs = self.load_jobs(batch_id).await?;
        Ok(jobs
            .into_iter()
            .filter(|job| filter.status.map_or(true, |status| job.status == status))
            .collect())
    }

    async fn get_batches(
        &self,
        filter: &BatchFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<BatchDefinition>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(self.index_key()).await?;

        let mut batches = Vec::new();
        for raw_id in ids {
            let Ok(batch_id) = Uuid::parse_str(&raw_id) else {
                continue;
            };
            // Keys may have expired out from under the index.
            if let Some(batch) = self.get_batch(batch_id).await? {
                if filter.matches(&batch) {
                    batches.push(batch);
                }
            }
        }

        batches.sort_by(|a, b| b.created.cmp(&a.created).then(b.id.cmp(&a.id)));
        Ok(batches
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn count_batches(&self, filter: &BatchFilter) -> Result<u64> {
        let batches = self.get_batches(filter, u32::MAX, 0).await?;
        Ok(batches.len() as u64)
    }

    async fn delete_batch(&self, batch_id: Uuid) -> Result<bool> {
        let mut conn = self.conn.clone();
        let existed: bool = conn.exists(self.meta_key(batch_id)).await?;

        redis::pipe()
            .atomic()
            .del(self.meta_key(batch_id))
            .ignore()
            .del(self.jobs_key(batch_id))
            .ignore()
            .del(self.results_key(batch_id))
            .ignore()
            .del(self.failed_key(batch_id))
            .ignore()
            .srem(self.index_key(), batch_id.to_string())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        Ok(existed)
    }

    async fn cleanup_old_batches(&self, older_than_days: i64) -> Result<u64> {
        let mut conn = self.conn.clone();
        let cutoff = crate::definition::now_second() - chrono::Duration::days(older_than_days);
        let ids: Vec<String> = conn.smembers(self.index_key()).await?;

        let mut removed = 0u64;
        for raw_id in ids {
            let Ok(batch_id) = Uuid::parse_str(&raw_id) else {
                conn.srem::<_, _, ()>(self.index_key(), &raw_id).await?;
                continue;
            };
            match self.get_batch(batch_id).await? {
                None => {
                    // Expired keys leave stale index entries behind.
                    conn.srem::<_, _, ()>(self.index_key(), &raw_id).await?;
                }
                Some(batch) => {
                    let expired = batch.status.is_terminal()
                        && batch.completed_at.map_or(false, |ts| ts < cutoff);
                    if expired && self.delete_batch(batch_id).await? {
                        removed += 1;
                    }
                }
            }
        }

        if removed > 0 {
            tracing::info!(removed, older_than_days, "Old batches cleaned up");
        }
        Ok(removed)
    }

    async fn health_check(&self) -> bool {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .is_ok()
    }
}
