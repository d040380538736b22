use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::mysql::{MySqlArguments, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{MySql, Row};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{MySqlConfig, QueueConfig};
use crate::error::QueueError;
use crate::job::{default_priority, JobFailure, JobRow, JobStatus, NewJob};
use crate::store::{
    BatchId, ClaimedBatch, ClaimedJob, EnqueueOutcome, EnqueueSummary, JobStore,
};

/// MySQL-backed implementation of the job store.
///
/// All coordination between worker processes happens through the table:
/// claims tag rows with a unique batch id in a single conditional UPDATE,
/// and the unique index on `unique_key` enforces deduplication.
pub struct MySqlJobStore {
    pool: MySqlPool,
    table: String,
    extra_fields: Vec<String>,
    insert_sql: String,
}

impl MySqlJobStore {
    /// Open a pool and build a store for the configured table.
    pub async fn connect(mysql: &MySqlConfig, queue: &QueueConfig) -> Result<Self, QueueError> {
        queue.validate()?;
        let pool = MySqlPoolOptions::new()
            .max_connections(mysql.max_connections)
            .min_connections(mysql.min_connections)
            .acquire_timeout(Duration::from_secs(mysql.acquire_timeout_seconds))
            .connect(&mysql.url)
            .await?;
        Self::from_pool(pool, queue).await
    }

    /// Build a store over an existing pool. Validates the queue config and,
    /// when extra fields are declared, that each names a real column.
    pub async fn from_pool(pool: MySqlPool, queue: &QueueConfig) -> Result<Self, QueueError> {
        queue.validate()?;
        let store = Self {
            pool,
            table: queue.db_table.clone(),
            extra_fields: queue.extra_fields.clone(),
            insert_sql: build_insert_sql(&queue.db_table, &queue.extra_fields),
        };
        store.validate_extra_fields().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    /// Create the backing table and its indices if missing. Operator and
    /// test tooling; the engine never calls this on its own.
    pub async fn create_table(&self) -> Result<(), QueueError> {
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id BIGINT UNSIGNED NOT NULL AUTO_INCREMENT,
                batch_id BIGINT UNSIGNED NULL,
                job_type VARCHAR(200) NOT NULL,
                created_ts DATETIME(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3),
                started_ts DATETIME(3) NULL,
                body TEXT,
                status VARCHAR(100) NOT NULL DEFAULT 'waiting',
                result MEDIUMTEXT NULL,
                recovered TINYINT(1) NOT NULL DEFAULT 0,
                running_time SMALLINT UNSIGNED NULL,
                unique_key INT UNSIGNED NULL,
                priority BIGINT NULL,
                PRIMARY KEY (id),
                UNIQUE KEY uniq_unique_key (unique_key),
                KEY idx_claim (job_type, batch_id, status, priority),
                KEY idx_read_back (batch_id, priority),
                KEY idx_stuck (started_ts, job_type, status)
            ) ENGINE=InnoDB
            "#,
            table = self.table
        );
        sqlx::query(&ddl).execute(&self.pool).await?;
        Ok(())
    }

    async fn validate_extra_fields(&self) -> Result<(), QueueError> {
        if self.extra_fields.is_empty() {
            return Ok(());
        }

        let rows = sqlx::query(
            r#"
            SELECT COLUMN_NAME AS column_name
            FROM information_schema.COLUMNS
            WHERE TABLE_SCHEMA = DATABASE()
              AND TABLE_NAME = ?
            "#,
        )
        .bind(&self.table)
        .fetch_all(&self.pool)
        .await?;

        let columns: Vec<String> = rows
            .iter()
            .map(|row| row.try_get::<String, _>("column_name"))
            .collect::<Result<_, _>>()?;

        for field in &self.extra_fields {
            if !columns.iter().any(|c| c.eq_ignore_ascii_case(field)) {
                return Err(QueueError::UnknownExtraField {
                    field: field.clone(),
                    table: self.table.clone(),
                });
            }
        }
        Ok(())
    }

    async fn insert_row<'e, E>(
        &self,
        executor: E,
        job_type: &str,
        job: &NewJob,
    ) -> Result<u64, QueueError>
    where
        E: sqlx::Executor<'e, Database = MySql>,
    {
        let body_text = serde_json::to_string(&job.body)?;
        let priority = job.priority.unwrap_or_else(default_priority);
        let created_ts = job.start_time.unwrap_or_else(Utc::now);

        let mut query = sqlx::query(&self.insert_sql)
            .bind(job_type.to_string())
            .bind(body_text)
            .bind(priority)
            .bind(JobStatus::Waiting.as_str())
            .bind(created_ts)
            .bind(job.unique_key);
        for field in &self.extra_fields {
            query = bind_body_field(query, job.body.get(field));
        }

        let result = query.execute(executor).await?;
        Ok(result.last_insert_id())
    }
}

#[async_trait]
impl JobStore for MySqlJobStore {
    async fn enqueue(&self, job_type: &str, job: NewJob) -> Result<EnqueueOutcome, QueueError> {
        match self.insert_row(&self.pool, job_type, &job).await {
            Ok(id) => Ok(EnqueueOutcome::Inserted { id }),
            Err(QueueError::Database(sqlx::Error::Database(db)))
                if db.is_unique_violation() =>
            {
                debug!(job_type, unique_key = ?job.unique_key, "enqueue deduplicated");
                Ok(EnqueueOutcome::Deduplicated)
            }
            Err(e) => Err(e),
        }
    }

    async fn enqueue_many(
        &self,
        job_type: &str,
        jobs: Vec<NewJob>,
    ) -> Result<EnqueueSummary, QueueError> {
        if jobs.is_empty() {
            return Ok(EnqueueSummary::default());
        }

        let mut tx = self.pool.begin().await?;
        let mut summary = EnqueueSummary::default();

        for job in &jobs {
            match self.insert_row(&mut *tx, job_type, job).await {
                Ok(_) => summary.inserted += 1,
                Err(QueueError::Database(sqlx::Error::Database(db)))
                    if db.is_unique_violation() =>
                {
                    summary.deduplicated += 1;
                }
                Err(e) => {
                    drop(tx.rollback().await);
                    return Err(e);
                }
            }
        }

        tx.commit().await?;
        Ok(summary)
    }

    async fn claim(&self, job_type: &str, limit: usize) -> Result<ClaimedBatch, QueueError> {
        let batch_id = BatchId::allocate();
        if limit == 0 {
            return Ok(ClaimedBatch::empty(batch_id));
        }

        // Phase one: tag. The predicate requires batch_id IS NULL, so the
        // first writer wins and two workers can never claim the same row.
        let tag_sql = format!(
            r#"
            UPDATE {table}
            SET batch_id = ?,
                started_ts = NOW(3),
                status = 'processing'
            WHERE job_type = ?
              AND status = 'waiting'
              AND batch_id IS NULL
              AND created_ts <= NOW(3)
            ORDER BY priority ASC, id ASC
            LIMIT ?
            "#,
            table = self.table
        );
        let tagged = sqlx::query(&tag_sql)
            .bind(batch_id.0)
            .bind(job_type)
            .bind(limit as u64)
            .execute(&self.pool)
            .await?;

        if tagged.rows_affected() == 0 {
            return Ok(ClaimedBatch::empty(batch_id));
        }

        // Phase two: read back by the tag.
        let read_sql = format!(
            r#"
            SELECT id, batch_id, job_type, body, priority, created_ts, started_ts, recovered
            FROM {table}
            WHERE batch_id = ?
              AND status = 'processing'
            ORDER BY priority ASC, id ASC
            "#,
            table = self.table
        );
        let rows = sqlx::query(&read_sql)
            .bind(batch_id.0)
            .fetch_all(&self.pool)
            .await?;

        if (rows.len() as u64) < tagged.rows_affected() {
            // A concurrent sweep resurrected part of the batch between the
            // two phases; those rows will be re-claimed later.
            debug!(
                %batch_id,
                tagged = tagged.rows_affected(),
                read = rows.len(),
                "claim read back fewer rows than were tagged"
            );
        }

        let jobs = rows
            .into_iter()
            .map(|row| claimed_job_from_row(&row))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(%batch_id, job_type, count = jobs.len(), "claimed batch");
        Ok(ClaimedBatch { batch_id, jobs })
    }

    async fn finalize_success(&self, id: u64, result: &Value) -> Result<(), QueueError> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = 'success',
                result = ?,
                running_time = LEAST(TIMESTAMPDIFF(SECOND, started_ts, NOW(3)), 65535)
            WHERE id = ?
              AND status = 'processing'
            "#,
            table = self.table
        );
        let res = sqlx::query(&sql)
            .bind(serde_json::to_string(result)?)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if res.rows_affected() == 0 {
            debug!(id, "finalize_success matched no processing row");
        }
        Ok(())
    }

    async fn finalize_error(&self, id: u64, failure: &JobFailure) -> Result<(), QueueError> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = 'error',
                result = ?,
                running_time = LEAST(TIMESTAMPDIFF(SECOND, started_ts, NOW(3)), 65535)
            WHERE id = ?
              AND status = 'processing'
            "#,
            table = self.table
        );
        let res = sqlx::query(&sql)
            .bind(serde_json::to_string(&failure.encode())?)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if res.rows_affected() == 0 {
            debug!(id, "finalize_error matched no processing row");
        }
        Ok(())
    }

    async fn requeue(&self, id: u64, delay: Duration) -> Result<(), QueueError> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = 'waiting',
                batch_id = NULL,
                created_ts = NOW(3) + INTERVAL ? MICROSECOND
            WHERE id = ?
              AND status = 'processing'
            "#,
            table = self.table
        );
        let micros = i64::try_from(delay.as_micros()).unwrap_or(i64::MAX);
        let res = sqlx::query(&sql)
            .bind(micros)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if res.rows_affected() == 0 {
            debug!(id, "requeue matched no processing row");
        }
        Ok(())
    }

    async fn scan_stuck(
        &self,
        job_type: &str,
        threshold: Duration,
    ) -> Result<Vec<u64>, QueueError> {
        let sql = format!(
            r#"
            SELECT id
            FROM {table}
            WHERE job_type = ?
              AND status = 'processing'
              AND started_ts < NOW(3) - INTERVAL ? MICROSECOND
            "#,
            table = self.table
        );
        let micros = i64::try_from(threshold.as_micros()).unwrap_or(i64::MAX);
        let rows = sqlx::query(&sql)
            .bind(job_type)
            .bind(micros)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| row.try_get::<u64, _>("id").map_err(QueueError::from))
            .collect()
    }

    async fn recover_stuck(
        &self,
        job_type: &str,
        threshold: Duration,
    ) -> Result<u64, QueueError> {
        let micros = i64::try_from(threshold.as_micros()).unwrap_or(i64::MAX);

        let resurrect_sql = format!(
            r#"
            UPDATE {table}
            SET status = 'waiting',
                batch_id = NULL,
                recovered = 1
            WHERE job_type = ?
              AND status = 'processing'
              AND started_ts < NOW(3) - INTERVAL ? MICROSECOND
            "#,
            table = self.table
        );
        let moved = sqlx::query(&resurrect_sql)
            .bind(job_type)
            .bind(micros)
            .execute(&self.pool)
            .await?
            .rows_affected();

        // A claim that died between tagging and flipping status leaves a
        // waiting row with a stale batch_id; untag it so it can be claimed.
        let untag_sql = format!(
            r#"
            UPDATE {table}
            SET batch_id = NULL
            WHERE job_type = ?
              AND status = 'waiting'
              AND batch_id IS NOT NULL
              AND started_ts < NOW(3) - INTERVAL ? MICROSECOND
            "#,
            table = self.table
        );
        let untagged = sqlx::query(&untag_sql)
            .bind(job_type)
            .bind(micros)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if moved > 0 || untagged > 0 {
            warn!(job_type, moved, untagged, "recovered stuck jobs");
        }
        Ok(moved)
    }

    async fn fetch_job(&self, id: u64) -> Result<Option<JobRow>, QueueError> {
        let sql = format!(
            r#"
            SELECT id, batch_id, job_type, created_ts, started_ts, body, status,
                   result, recovered, running_time, unique_key, priority
            FROM {table}
            WHERE id = ?
            "#,
            table = self.table
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| job_row_from_row(&row)).transpose()
    }

    fn pool_capacity(&self) -> Option<u32> {
        Some(self.pool.options().get_max_connections())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

fn build_insert_sql(table: &str, extra_fields: &[String]) -> String {
    let mut columns = vec![
        "job_type".to_string(),
        "body".to_string(),
        "priority".to_string(),
        "status".to_string(),
        "created_ts".to_string(),
        "unique_key".to_string(),
    ];
    columns.extend(extra_fields.iter().cloned());
    let placeholders = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT INTO {table} ({}) VALUES ({placeholders})",
        columns.join(", ")
    )
}

/// Bind a top-level body value into its projected column. The projection is
/// duplication for query convenience; absent keys project NULL.
fn bind_body_field<'q>(
    query: sqlx::query::Query<'q, MySql, MySqlArguments>,
    value: Option<&Value>,
) -> sqlx::query::Query<'q, MySql, MySqlArguments> {
    match value {
        None | Some(Value::Null) => query.bind(None::<String>),
        Some(Value::Bool(b)) => query.bind(*b),
        Some(Value::String(s)) => query.bind(s.clone()),
        Some(Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else if let Some(u) = n.as_u64() {
                query.bind(u)
            } else {
                query.bind(n.as_f64())
            }
        }
        Some(other) => query.bind(other.to_string()),
    }
}

fn claimed_job_from_row(row: &MySqlRow) -> Result<ClaimedJob, QueueError> {
    let body_text: String = row.try_get("body")?;
    let body = serde_json::from_str(&body_text).unwrap_or(Value::String(body_text));

    Ok(ClaimedJob {
        id: row.try_get("id")?,
        batch_id: row.try_get("batch_id")?,
        job_type: row.try_get("job_type")?,
        body,
        priority: row.try_get("priority")?,
        created_ts: row.try_get::<DateTime<Utc>, _>("created_ts")?,
        started_ts: row.try_get::<DateTime<Utc>, _>("started_ts")?,
        recovered: row.try_get("recovered")?,
    })
}

fn job_row_from_row(row: &MySqlRow) -> Result<JobRow, QueueError> {
    let status_text: String = row.try_get("status")?;
    let status = JobStatus::parse(&status_text).ok_or_else(|| {
        QueueError::Backend(format!("unexpected status '{status_text}' in table"))
    })?;

    Ok(JobRow {
        id: row.try_get("id")?,
        batch_id: row.try_get("batch_id")?,
        job_type: row.try_get("job_type")?,
        created_ts: row.try_get::<DateTime<Utc>, _>("created_ts")?,
        started_ts: row.try_get::<Option<DateTime<Utc>>, _>("started_ts")?,
        body: row.try_get("body")?,
        status,
        result: row.try_get("result")?,
        recovered: row.try_get("recovered")?,
        running_time: row.try_get("running_time")?,
        unique_key: row.try_get("unique_key")?,
        priority: row.try_get("priority")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_sql_covers_extra_fields() {
        let sql = build_insert_sql("oxen_queue", &["tenant".to_string(), "region".to_string()]);
        assert_eq!(
            sql,
            "INSERT INTO oxen_queue (job_type, body, priority, status, created_ts, \
             unique_key, tenant, region) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
        );
    }
}
