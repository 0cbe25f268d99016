use chrono::{DateTime, Utc};
use getset::Getters;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

use crate::{JobState, Record};

/// One step of work recorded against a job while it was processed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ExecutionLogEntry {
    pub key: String,
    pub command: Vec<String>,
    pub start_time: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub out: String,
    pub duration_ms: Option<i64>,
}

/// Columns shared by every queue table.
#[derive(FromRow, Getters, Debug, Clone, PartialEq, Eq)]
#[getset(get = "pub")]
pub struct JobFields {
    id: i64,
    state: JobState,
    /// Why the last attempt errored or failed
    failure_message: Option<String>,
    queued_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    /// The row is not eligible for dequeue before this instant
    process_after: Option<DateTime<Utc>>,
    /// Times the row was put back to queued after its worker stopped heartbeating
    num_resets: i32,
    /// Times a handler returned an error for this row
    num_failures: i32,
    last_heartbeat_at: Option<DateTime<Utc>>,
    execution_logs: Option<Json<Vec<ExecutionLogEntry>>>,
    worker_hostname: String,
    /// Set when a user canceled the job or one of its ancestors
    cancel: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl JobFields {
    pub fn execution_log_entries(&self) -> &[ExecutionLogEntry] {
        self.execution_logs
            .as_ref()
            .map(|logs| logs.0.as_slice())
            .unwrap_or_default()
    }
}

/// Column list selected for [`JobFields`], usable in `returning` clauses.
pub const JOB_FIELDS_COLUMNS: &str = "id, state, failure_message, queued_at, started_at, \
    finished_at, process_after, num_resets, num_failures, last_heartbeat_at, execution_logs, \
    worker_hostname, cancel, created_at, updated_at";

/// Root of the exhaustive search pipeline, created on behalf of a user.
#[derive(FromRow, Getters, Debug, Clone, PartialEq, Eq)]
#[getset(get = "pub")]
pub struct SearchJob {
    #[sqlx(flatten)]
    job: JobFields,
    /// The user on whose behalf every stage searches
    initiator_id: i32,
    query: String,
}

impl SearchJob {
    pub const COLUMNS: &'static str = "id, state, failure_message, queued_at, started_at, \
        finished_at, process_after, num_resets, num_failures, last_heartbeat_at, execution_logs, \
        worker_hostname, cancel, created_at, updated_at, initiator_id, query";
}

impl Record for SearchJob {
    fn record_id(&self) -> i64 {
        self.job.id
    }
}

/// One repository touched by a search job, with its unresolved revision specifier.
#[derive(FromRow, Getters, Debug, Clone, PartialEq, Eq)]
#[getset(get = "pub")]
pub struct RepoJob {
    #[sqlx(flatten)]
    job: JobFields,
    search_job_id: i64,
    repo_id: i32,
    ref_spec: String,
}

impl RepoJob {
    pub const COLUMNS: &'static str = "id, state, failure_message, queued_at, started_at, \
        finished_at, process_after, num_resets, num_failures, last_heartbeat_at, execution_logs, \
        worker_hostname, cancel, created_at, updated_at, search_job_id, repo_id, ref_spec";
}

impl Record for RepoJob {
    fn record_id(&self) -> i64 {
        self.job.id
    }
}

/// A single resolved revision of a repository job.
#[derive(FromRow, Getters, Debug, Clone, PartialEq, Eq)]
#[getset(get = "pub")]
pub struct RepoRevisionJob {
    #[sqlx(flatten)]
    job: JobFields,
    search_repo_job_id: i64,
    revision: String,
}

impl RepoRevisionJob {
    pub const COLUMNS: &'static str = "id, state, failure_message, queued_at, started_at, \
        finished_at, process_after, num_resets, num_failures, last_heartbeat_at, execution_logs, \
        worker_hostname, cancel, created_at, updated_at, search_repo_job_id, revision";
}

impl Record for RepoRevisionJob {
    fn record_id(&self) -> i64 {
        self.job.id
    }
}
