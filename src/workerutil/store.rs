use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use derive_builder::Builder;
use getset::Getters;
use indoc::formatdoc;
use searchjobs_basestore::Store;
use searchjobs_job::{ExecutionLogEntry, Record};
use sqlx::types::Json;
use sqlx::{query_as, query_scalar, PgPool};
use tracing::{debug, trace};

use crate::errors::{Result, SearchJobsError};

pub const DEFAULT_RESET_FAILURE_MESSAGE: &str =
    "job processor died while handling this message too many times";

/// Binds a queue table to the generic dequeue/heartbeat/reset queries.
#[derive(Builder, Getters, Clone, Debug)]
#[getset(get = "pub")]
#[builder(pattern = "owned")]
pub struct WorkerStoreOptions {
    /// Used in logs to tell stores apart
    #[builder(setter(into))]
    name: String,
    /// Schema qualified, already escaped table name
    #[builder(setter(into))]
    table_name: String,
    /// Columns selected when a record is returned
    #[builder(setter(into))]
    column_expressions: String,
    /// A `processing` row whose heartbeat is older than this is considered stalled
    #[builder(default = "Duration::from_secs(60)")]
    stalled_max_age: Duration,
    /// Stall resets allowed before the row is failed
    #[builder(default = "3")]
    max_num_resets: i32,
    /// Handler errors allowed before the row is failed instead of errored
    #[builder(default = "1")]
    max_num_retries: i32,
    /// When set, errored rows become eligible again once they finished this long ago
    #[builder(default, setter(strip_option))]
    retry_after: Option<Duration>,
    #[builder(default = "DEFAULT_RESET_FAILURE_MESSAGE.to_string()", setter(into))]
    reset_failure_message: String,
}

impl WorkerStoreOptions {
    pub fn builder() -> WorkerStoreOptionsBuilder {
        WorkerStoreOptionsBuilder::default()
    }
}

/// Outcome of [`WorkerStore::reset_stalled`], keyed by record id with the age of
/// the last heartbeat at the time of the reset.
#[derive(Debug, Default)]
pub struct ResetStalledOutcome {
    pub reset: HashMap<i64, Duration>,
    pub failed: HashMap<i64, Duration>,
}

/// Generic queue operations over one table whose rows decode into `R`.
pub struct WorkerStore<R> {
    store: Store,
    options: Arc<WorkerStoreOptions>,
    _record: PhantomData<fn() -> R>,
}

impl<R> Clone for WorkerStore<R> {
    fn clone(&self) -> Self {
        WorkerStore {
            store: self.store.clone(),
            options: self.options.clone(),
            _record: PhantomData,
        }
    }
}

impl<R: Record> WorkerStore<R> {
    pub fn new(pool: PgPool, options: WorkerStoreOptions) -> Self {
        WorkerStore::with_store(Store::new(pool), options)
    }

    pub fn with_store(store: Store, options: WorkerStoreOptions) -> Self {
        WorkerStore {
            store,
            options: Arc::new(options),
            _record: PhantomData,
        }
    }

    pub fn options(&self) -> &WorkerStoreOptions {
        &self.options
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    /// Claims the next eligible record for `worker_hostname`.
    ///
    /// The row is locked with `skip locked` and marked `processing` inside a short
    /// transaction of its own, which is committed before the record is returned.
    #[tracing::instrument(skip_all, err, fields(otel.kind="client", db.system="postgresql", store = %self.options.name))]
    pub async fn dequeue(&self, worker_hostname: &str) -> Result<Option<R>> {
        if self.store.in_transaction() {
            return Err(SearchJobsError::DequeueInTransaction(
                self.options.name.clone(),
            ));
        }

        let table = &self.options.table_name;
        let columns = &self.options.column_expressions;
        let retry_clause = match self.options.retry_after {
            Some(_) => formatdoc!(
                r#"
                    or (
                        state = 'errored'
                        and finished_at < now() - make_interval(secs => $2::float8)
                        and num_failures < $3::int
                    )
                "#
            ),
            None => String::new(),
        };

        let sql = formatdoc!(
            r#"
                with candidate as (
                    select id
                        from {table}
                        where (
                            state = 'queued'
                            and (process_after is null or process_after <= now())
                        ) {retry_clause}
                        order by process_after asc nulls first, queued_at asc, id asc
                        limit 1
                        for update
                        skip locked
                )
                update {table}
                    set
                        state = 'processing',
                        started_at = now(),
                        last_heartbeat_at = now(),
                        finished_at = null,
                        failure_message = null,
                        execution_logs = null,
                        worker_hostname = $1::text
                    where id = (select id from candidate)
                    returning {columns}
            "#
        );

        let mut q = query_as::<_, R>(&sql).bind(worker_hostname);
        if let Some(retry_after) = self.options.retry_after {
            q = q
                .bind(retry_after.as_secs_f64())
                .bind(self.options.max_num_retries);
        }

        let tx = self.store.transact().await?;
        let result: Result<Option<R>> = tx.query_optional(q).await.map_err(Into::into);
        let record = tx.done(result).await?;

        match &record {
            Some(record) => debug!(
                store = %self.options.name,
                job_id = record.record_id(),
                worker_hostname,
                "Dequeued record"
            ),
            None => trace!(store = %self.options.name, "No record to dequeue"),
        }

        Ok(record)
    }

    /// Counts queued rows, and processing rows when `include_processing` is set.
    #[tracing::instrument(skip_all, err, fields(otel.kind="client", db.system="postgresql"))]
    pub async fn queued_count(&self, include_processing: bool) -> Result<i64> {
        let table = &self.options.table_name;
        let states = if include_processing {
            "'queued', 'processing'"
        } else {
            "'queued'"
        };
        let sql = format!("select count(*) from {table} where state in ({states})");

        let count = self
            .store
            .query_scalar(query_scalar::<_, i64>(&sql))
            .await?
            .unwrap_or_default();

        Ok(count)
    }

    /// Refreshes the heartbeat of every row in `ids` still processing for this worker.
    ///
    /// Returns the ids that were refreshed; anything missing was canceled, reset or
    /// finished by someone else.
    #[tracing::instrument(skip_all, err, fields(otel.kind="client", db.system="postgresql"))]
    pub async fn heartbeat(&self, ids: &[i64], worker_hostname: &str) -> Result<Vec<i64>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let table = &self.options.table_name;
        let sql = formatdoc!(
            r#"
                update {table}
                    set last_heartbeat_at = now()
                    where id = any($1::bigint[])
                        and state = 'processing'
                        and worker_hostname = $2::text
                    returning id
            "#
        );

        let known_ids = self
            .store
            .query_scalars(
                query_scalar::<_, i64>(&sql)
                    .bind(ids)
                    .bind(worker_hostname),
            )
            .await?;

        Ok(known_ids)
    }

    /// Puts a processing row back in the queue, eligible again from `process_after`.
    #[tracing::instrument(skip_all, err, fields(otel.kind="client", db.system="postgresql"))]
    pub async fn requeue(
        &self,
        id: i64,
        worker_hostname: &str,
        process_after: DateTime<Utc>,
    ) -> Result<bool> {
        let table = &self.options.table_name;
        let sql = formatdoc!(
            r#"
                update {table}
                    set state = 'queued', process_after = $3::timestamptz, started_at = null
                    where id = $1::bigint and state = 'processing' and worker_hostname = $2::text
            "#
        );

        let updated = self
            .store
            .exec(
                sqlx::query(&sql)
                    .bind(id)
                    .bind(worker_hostname)
                    .bind(process_after),
            )
            .await?;

        Ok(updated > 0)
    }

    /// Appends an execution log entry and returns its 1-based entry id.
    #[tracing::instrument(skip_all, err, fields(otel.kind="client", db.system="postgresql"))]
    pub async fn add_execution_log_entry(
        &self,
        id: i64,
        worker_hostname: &str,
        entry: &ExecutionLogEntry,
    ) -> Result<Option<i32>> {
        let table = &self.options.table_name;
        let sql = formatdoc!(
            r#"
                update {table}
                    set execution_logs = coalesce(execution_logs, '[]'::jsonb) || jsonb_build_array($3::jsonb)
                    where id = $1::bigint and state = 'processing' and worker_hostname = $2::text
                    returning jsonb_array_length(execution_logs)
            "#
        );

        let entry_id = self
            .store
            .query_scalar(
                query_scalar::<_, i32>(&sql)
                    .bind(id)
                    .bind(worker_hostname)
                    .bind(Json(entry)),
            )
            .await?;

        Ok(entry_id)
    }

    /// Replaces the entry previously returned by [`Self::add_execution_log_entry`].
    #[tracing::instrument(skip_all, err, fields(otel.kind="client", db.system="postgresql"))]
    pub async fn update_execution_log_entry(
        &self,
        id: i64,
        worker_hostname: &str,
        entry_id: i32,
        entry: &ExecutionLogEntry,
    ) -> Result<bool> {
        let table = &self.options.table_name;
        let sql = formatdoc!(
            r#"
                update {table}
                    set execution_logs = jsonb_set(execution_logs, array[($3::int - 1)::text], $4::jsonb)
                    where id = $1::bigint
                        and state = 'processing'
                        and worker_hostname = $2::text
                        and $3::int between 1 and jsonb_array_length(coalesce(execution_logs, '[]'::jsonb))
            "#
        );

        let updated = self
            .store
            .exec(
                sqlx::query(&sql)
                    .bind(id)
                    .bind(worker_hostname)
                    .bind(entry_id)
                    .bind(Json(entry)),
            )
            .await?;

        Ok(updated > 0)
    }

    #[tracing::instrument(skip_all, err, fields(otel.kind="client", db.system="postgresql"))]
    pub async fn mark_complete(&self, id: i64, worker_hostname: &str) -> Result<bool> {
        let table = &self.options.table_name;
        let sql = formatdoc!(
            r#"
                update {table}
                    set state = 'completed', finished_at = now()
                    where id = $1::bigint and state = 'processing' and worker_hostname = $2::text
            "#
        );

        let updated = self
            .store
            .exec(sqlx::query(&sql).bind(id).bind(worker_hostname))
            .await?;

        Ok(updated > 0)
    }

    /// Records a handler failure. The row is failed once the retry budget is spent.
    #[tracing::instrument(skip_all, err, fields(otel.kind="client", db.system="postgresql"))]
    pub async fn mark_errored(
        &self,
        id: i64,
        worker_hostname: &str,
        failure_message: &str,
    ) -> Result<bool> {
        let table = &self.options.table_name;
        let sql = formatdoc!(
            r#"
                update {table}
                    set
                        state = case when num_failures + 1 >= $4::int then 'failed' else 'errored' end,
                        finished_at = now(),
                        failure_message = $3::text,
                        num_failures = num_failures + 1
                    where id = $1::bigint and state = 'processing' and worker_hostname = $2::text
            "#
        );

        let updated = self
            .store
            .exec(
                sqlx::query(&sql)
                    .bind(id)
                    .bind(worker_hostname)
                    .bind(failure_message)
                    .bind(self.options.max_num_retries),
            )
            .await?;

        Ok(updated > 0)
    }

    #[tracing::instrument(skip_all, err, fields(otel.kind="client", db.system="postgresql"))]
    pub async fn mark_failed(
        &self,
        id: i64,
        worker_hostname: &str,
        failure_message: &str,
    ) -> Result<bool> {
        let table = &self.options.table_name;
        let sql = formatdoc!(
            r#"
                update {table}
                    set
                        state = 'failed',
                        finished_at = now(),
                        failure_message = $3::text,
                        num_failures = num_failures + 1
                    where id = $1::bigint and state = 'processing' and worker_hostname = $2::text
            "#
        );

        let updated = self
            .store
            .exec(
                sqlx::query(&sql)
                    .bind(id)
                    .bind(worker_hostname)
                    .bind(failure_message),
            )
            .await?;

        Ok(updated > 0)
    }

    /// Moves stalled processing rows back to queued, or to failed once they have
    /// been reset `max_num_resets` times.
    #[tracing::instrument(skip_all, err, fields(otel.kind="client", db.system="postgresql", store = %self.options.name))]
    pub async fn reset_stalled(&self) -> Result<ResetStalledOutcome> {
        let table = &self.options.table_name;
        let stalled_max_age = self.options.stalled_max_age.as_secs_f64();

        let reset_sql = formatdoc!(
            r#"
                with stalled as (
                    select
                        id,
                        extract(epoch from now() - coalesce(last_heartbeat_at, started_at))::float8 as age
                        from {table}
                        where state = 'processing'
                            and now() - coalesce(last_heartbeat_at, started_at) > make_interval(secs => $1::float8)
                            and num_resets < $2::int
                        for update
                        skip locked
                )
                update {table} as jobs
                    set
                        state = 'queued',
                        started_at = null,
                        last_heartbeat_at = null,
                        num_resets = jobs.num_resets + 1
                    from stalled
                    where jobs.id = stalled.id
                    returning stalled.id, stalled.age
            "#
        );

        let failed_sql = formatdoc!(
            r#"
                with stalled as (
                    select
                        id,
                        extract(epoch from now() - coalesce(last_heartbeat_at, started_at))::float8 as age
                        from {table}
                        where state = 'processing'
                            and now() - coalesce(last_heartbeat_at, started_at) > make_interval(secs => $1::float8)
                            and num_resets >= $2::int
                        for update
                        skip locked
                )
                update {table} as jobs
                    set
                        state = 'failed',
                        finished_at = now(),
                        failure_message = $3::text
                    from stalled
                    where jobs.id = stalled.id
                    returning stalled.id, stalled.age
            "#
        );

        let reset = self
            .store
            .query_all(
                query_as::<_, (i64, f64)>(&reset_sql)
                    .bind(stalled_max_age)
                    .bind(self.options.max_num_resets),
            )
            .await?;

        let failed = self
            .store
            .query_all(
                query_as::<_, (i64, f64)>(&failed_sql)
                    .bind(stalled_max_age)
                    .bind(self.options.max_num_resets)
                    .bind(&self.options.reset_failure_message),
            )
            .await?;

        Ok(ResetStalledOutcome {
            reset: into_age_map(reset),
            failed: into_age_map(failed),
        })
    }
}

fn into_age_map(rows: Vec<(i64, f64)>) -> HashMap<i64, Duration> {
    rows.into_iter()
        .map(|(id, age)| (id, Duration::from_secs_f64(age.max(0.0))))
        .collect()
}
