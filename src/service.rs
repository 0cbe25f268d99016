use searchjobs_job::SearchJob;
use tracing::info;

use crate::csv::CsvWriter;
use crate::errors::{Result, SearchJobsError};
use crate::handlers::result_key_prefix;
use crate::store::{AggregateStats, ExhaustiveSearchStore, ListSearchJobsArgs, SearchJobLogRow};
use crate::uploadstore::{delete_prefix, UploadStore};

/// Page size used when rendering execution logs.
const LOGS_PAGE_SIZE: i64 = 500;

pub const SEARCH_JOB_LOGS_HEADER: [&str; 6] = [
    "repository",
    "revision",
    "started_at",
    "finished_at",
    "status",
    "failure_message",
];

/// Entry point for code managing search jobs on behalf of users.
#[derive(Clone, Debug)]
pub struct SearchJobService<U: UploadStore> {
    store: ExhaustiveSearchStore,
    uploads: U,
}

impl<U: UploadStore> SearchJobService<U> {
    pub fn new(store: ExhaustiveSearchStore, uploads: U) -> Self {
        SearchJobService { store, uploads }
    }

    pub fn store(&self) -> &ExhaustiveSearchStore {
        &self.store
    }

    pub async fn create_search_job(&self, initiator_id: i32, query: &str) -> Result<SearchJob> {
        self.store.create_search_job(initiator_id, query).await
    }

    pub async fn get_search_job(&self, id: i64) -> Result<SearchJob> {
        self.store
            .get_search_job(id)
            .await?
            .ok_or(SearchJobsError::SearchJobNotFound(id))
    }

    pub async fn list_search_jobs(&self, args: &ListSearchJobsArgs) -> Result<Vec<SearchJob>> {
        self.store.list_search_jobs(args).await
    }

    /// Returns how many rows were canceled, 0 when nothing was left to cancel.
    pub async fn cancel_search_job(&self, id: i64) -> Result<i64> {
        self.store.cancel_search_job(id).await
    }

    /// Cancels what is still running, deletes every uploaded result object and then
    /// the rows of the search job and its descendants.
    ///
    /// A revision job canceled here keeps running until its worker's next heartbeat.
    /// Objects it uploads before that are removed by the second pass below or by the
    /// handler itself once it sees the cancellation.
    pub async fn delete_search_job(&self, id: i64) -> Result<()> {
        // Make sure the job exists before touching the upload store.
        self.get_search_job(id).await?;

        self.store.cancel_search_job(id).await?;
        let prefix = result_key_prefix(id);
        let mut deleted_objects = delete_prefix(&self.uploads, &prefix).await?;
        self.store.delete_search_job(id).await?;
        deleted_objects += delete_prefix(&self.uploads, &prefix).await?;

        info!(search_job_id = id, deleted_objects, "Deleted search job");
        Ok(())
    }

    pub async fn get_aggregate_repo_rev_state(&self, id: i64) -> Result<AggregateStats> {
        self.store.get_aggregate_repo_rev_state(id).await
    }

    /// Writes the flattened execution log of the search job and all descendants as
    /// CSV, fetching it page by page. Returns the number of rows written.
    pub async fn write_search_job_logs<W: CsvWriter>(&self, id: i64, writer: &mut W) -> Result<usize> {
        self.get_search_job(id).await?;

        writer.write_header(&SEARCH_JOB_LOGS_HEADER).await?;

        let mut written = 0;
        loop {
            let rows = self
                .store
                .list_search_job_logs(id, LOGS_PAGE_SIZE, written as i64)
                .await?;
            let page_len = rows.len();

            for row in &rows {
                let values = log_row_values(row);
                let values: Vec<&str> = values.iter().map(String::as_str).collect();
                writer.write_row(&values).await?;
            }

            written += page_len;
            if (page_len as i64) < LOGS_PAGE_SIZE {
                break;
            }
        }

        Ok(written)
    }
}

fn log_row_values(row: &SearchJobLogRow) -> [String; 6] {
    [
        row.repo_id.map(|id| id.to_string()).unwrap_or_default(),
        row.revision.clone().unwrap_or_default(),
        row.started_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        row.finished_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        row.state.to_string(),
        row.failure_message.clone().unwrap_or_default(),
    ]
}
