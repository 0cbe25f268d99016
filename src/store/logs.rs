use chrono::{DateTime, Utc};
use indoc::formatdoc;
use searchjobs_job::JobState;
use sqlx::{query_as, FromRow};

use super::ExhaustiveSearchStore;
use crate::errors::Result;

/// One row of the flattened execution log of a search job.
///
/// The search job row has neither repository nor revision, repo job rows carry
/// their unresolved revision specifier.
#[derive(FromRow, Debug, Clone, PartialEq, Eq)]
pub struct SearchJobLogRow {
    pub repo_id: Option<i32>,
    pub revision: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: JobState,
    pub failure_message: Option<String>,
}

impl ExhaustiveSearchStore {
    /// Lists the rows of the search job and all descendants, search job first, then
    /// repo jobs, then revision jobs, each by id.
    #[tracing::instrument(skip_all, err, fields(otel.kind="client", db.system="postgresql"))]
    pub async fn list_search_job_logs(
        &self,
        search_job_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SearchJobLogRow>> {
        let search_jobs = self.search_jobs_table();
        let repo_jobs = self.repo_jobs_table();
        let repo_revision_jobs = self.repo_revision_jobs_table();
        let sql = formatdoc!(
            r#"
                select repo_id, revision, started_at, finished_at, state, failure_message
                from (
                    select
                        0 as stage, id, null::int as repo_id, null::text as revision,
                        started_at, finished_at, state, failure_message
                        from {search_jobs}
                        where id = $1::bigint
                    union all
                    select
                        1 as stage, id, repo_id, ref_spec as revision,
                        started_at, finished_at, state, failure_message
                        from {repo_jobs}
                        where search_job_id = $1::bigint
                    union all
                    select
                        2 as stage, rrj.id, rj.repo_id, rrj.revision,
                        rrj.started_at, rrj.finished_at, rrj.state, rrj.failure_message
                        from {repo_revision_jobs} as rrj
                        join {repo_jobs} as rj on rj.id = rrj.search_repo_job_id
                        where rj.search_job_id = $1::bigint
                ) as logs
                order by stage asc, id asc
                limit $2::bigint
                offset $3::bigint
            "#
        );

        Ok(self
            .store()
            .query_all(
                query_as::<_, SearchJobLogRow>(&sql)
                    .bind(search_job_id)
                    .bind(limit)
                    .bind(offset),
            )
            .await?)
    }
}
