use indoc::formatdoc;
use searchjobs_job::RepoRevisionJob;
use sqlx::{query_as, query_scalar, FromRow};

use super::ExhaustiveSearchStore;
use crate::errors::{Result, SearchJobsError};
use crate::search::RepositoryRevision;

/// SQLSTATE raised when a foreign key target does not exist.
const FOREIGN_KEY_VIOLATION: &str = "23503";

/// Everything the terminal stage needs from the ancestors of a revision job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRevisionJobAncestry {
    pub search_job_id: i64,
    pub query: String,
    pub initiator_id: i32,
    pub repo_revision: RepositoryRevision,
}

#[derive(FromRow)]
struct AncestryRow {
    search_job_id: i64,
    query: String,
    initiator_id: i32,
    repo_id: i32,
    ref_spec: String,
    revision: String,
}

impl From<AncestryRow> for RepoRevisionJobAncestry {
    fn from(row: AncestryRow) -> Self {
        RepoRevisionJobAncestry {
            search_job_id: row.search_job_id,
            query: row.query,
            initiator_id: row.initiator_id,
            repo_revision: RepositoryRevision {
                repo_id: row.repo_id,
                ref_spec: row.ref_spec,
                revision: row.revision,
            },
        }
    }
}

impl ExhaustiveSearchStore {
    /// Fails with [`SearchJobsError::MissingParentJob`] when `repo_job_id` does not
    /// exist, which aborts any enclosing transaction.
    #[tracing::instrument(skip_all, err, fields(otel.kind="client", db.system="postgresql"))]
    pub async fn create_repo_revision_job(&self, repo_job_id: i64, revision: &str) -> Result<i64> {
        let table = self.repo_revision_jobs_table();
        let sql = formatdoc!(
            r#"
                insert into {table} (search_repo_job_id, revision)
                    values ($1::bigint, $2::text)
                    returning id
            "#
        );

        let result = self
            .store()
            .query_scalar(query_scalar::<_, i64>(&sql).bind(repo_job_id).bind(revision))
            .await;

        match result {
            Ok(Some(id)) => Ok(id),
            Ok(None) => Err(sqlx::Error::RowNotFound.into()),
            Err(e) if e.sql_state().as_deref() == Some(FOREIGN_KEY_VIOLATION) => {
                Err(SearchJobsError::MissingParentJob {
                    repo_job_id,
                    revision: revision.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resolves the search job, query, actor and revision of a revision job in a
    /// single round trip.
    #[tracing::instrument(skip_all, err, fields(otel.kind="client", db.system="postgresql"))]
    pub async fn get_repo_revision_job_ancestry(
        &self,
        repo_revision_job_id: i64,
    ) -> Result<RepoRevisionJobAncestry> {
        let search_jobs = self.search_jobs_table();
        let repo_jobs = self.repo_jobs_table();
        let repo_revision_jobs = self.repo_revision_jobs_table();
        let sql = formatdoc!(
            r#"
                select
                    sj.id as search_job_id,
                    sj.query,
                    sj.initiator_id,
                    rj.repo_id,
                    rj.ref_spec,
                    rrj.revision
                from {repo_revision_jobs} as rrj
                join {repo_jobs} as rj on rj.id = rrj.search_repo_job_id
                join {search_jobs} as sj on sj.id = rj.search_job_id
                where rrj.id = $1::bigint
            "#
        );

        self.store()
            .query_optional(query_as::<_, AncestryRow>(&sql).bind(repo_revision_job_id))
            .await?
            .map(RepoRevisionJobAncestry::from)
            .ok_or(SearchJobsError::RepoRevisionJobNotFound(repo_revision_job_id))
    }

    #[tracing::instrument(skip_all, err, fields(otel.kind="client", db.system="postgresql"))]
    pub async fn list_repo_revision_jobs(&self, search_job_id: i64) -> Result<Vec<RepoRevisionJob>> {
        let repo_jobs = self.repo_jobs_table();
        let repo_revision_jobs = self.repo_revision_jobs_table();
        let columns = RepoRevisionJob::COLUMNS
            .split(", ")
            .map(|column| format!("rrj.{}", column.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = formatdoc!(
            r#"
                select {columns}
                    from {repo_revision_jobs} as rrj
                    join {repo_jobs} as rj on rj.id = rrj.search_repo_job_id
                    where rj.search_job_id = $1::bigint
                    order by rrj.id asc
            "#
        );

        Ok(self
            .store()
            .query_all(query_as::<_, RepoRevisionJob>(&sql).bind(search_job_id))
            .await?)
    }
}
