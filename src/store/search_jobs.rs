use indoc::formatdoc;
use searchjobs_job::{JobState, SearchJob};
use sqlx::{query, query_as, query_scalar};
use tracing::info;

use super::ExhaustiveSearchStore;
use crate::errors::Result;

/// Keyset pagination over search jobs, ordered by id.
#[derive(Debug, Clone)]
pub struct ListSearchJobsArgs {
    /// Only jobs with an id greater than this one
    pub after: Option<i64>,
    pub first: i64,
    /// Only jobs in one of these states; every state when empty
    pub states: Vec<JobState>,
    pub initiator_id: Option<i32>,
}

impl Default for ListSearchJobsArgs {
    fn default() -> Self {
        ListSearchJobsArgs {
            after: None,
            first: 50,
            states: Vec::new(),
            initiator_id: None,
        }
    }
}

impl ExhaustiveSearchStore {
    #[tracing::instrument(skip_all, err, fields(otel.kind="client", db.system="postgresql"))]
    pub async fn create_search_job(&self, initiator_id: i32, query_text: &str) -> Result<SearchJob> {
        let table = self.search_jobs_table();
        let columns = SearchJob::COLUMNS;
        let sql = formatdoc!(
            r#"
                insert into {table} (initiator_id, query)
                    values ($1::int, $2::text)
                    returning {columns}
            "#
        );

        let job = self
            .store()
            .query_one(query_as::<_, SearchJob>(&sql).bind(initiator_id).bind(query_text))
            .await?;
        info!(search_job_id = job.job().id(), initiator_id, "Created search job");

        Ok(job)
    }

    #[tracing::instrument(skip_all, err, fields(otel.kind="client", db.system="postgresql"))]
    pub async fn get_search_job(&self, id: i64) -> Result<Option<SearchJob>> {
        let table = self.search_jobs_table();
        let columns = SearchJob::COLUMNS;
        let sql = format!("select {columns} from {table} where id = $1::bigint");

        Ok(self
            .store()
            .query_optional(query_as::<_, SearchJob>(&sql).bind(id))
            .await?)
    }

    #[tracing::instrument(skip_all, err, fields(otel.kind="client", db.system="postgresql"))]
    pub async fn list_search_jobs(&self, args: &ListSearchJobsArgs) -> Result<Vec<SearchJob>> {
        let table = self.search_jobs_table();
        let columns = SearchJob::COLUMNS;
        let sql = formatdoc!(
            r#"
                select {columns}
                    from {table}
                    where ($1::bigint is null or id > $1::bigint)
                        and (cardinality($2::text[]) = 0 or state = any($2::text[]))
                        and ($3::int is null or initiator_id = $3::int)
                    order by id asc
                    limit $4::bigint
            "#
        );

        let states: Vec<String> = args.states.iter().map(|s| s.to_string()).collect();

        Ok(self
            .store()
            .query_all(
                query_as::<_, SearchJob>(&sql)
                    .bind(args.after)
                    .bind(states)
                    .bind(args.initiator_id)
                    .bind(args.first.max(0)),
            )
            .await?)
    }

    /// Cancels the search job and every descendant still queued or processing,
    /// whatever the state of the search job itself. Returns the number of rows
    /// canceled.
    #[tracing::instrument(skip_all, err, fields(otel.kind="client", db.system="postgresql"))]
    pub async fn cancel_search_job(&self, id: i64) -> Result<i64> {
        let tx = self.transact().await?;
        let result = tx.cancel_search_job_tree(id).await;
        let canceled = tx.done(result).await?;
        info!(search_job_id = id, canceled, "Canceled search job");

        Ok(canceled)
    }

    async fn cancel_search_job_tree(&self, id: i64) -> Result<i64> {
        let search_jobs = self.search_jobs_table();
        let repo_jobs = self.repo_jobs_table();
        let repo_revision_jobs = self.repo_revision_jobs_table();

        // Parents first, each in its own statement: fan-out transactions holding
        // one of these rows commit before the update below takes its snapshot.
        let lock_search_job = format!("select id from {search_jobs} where id = $1::bigint for update");
        self.store().exec(query(&lock_search_job).bind(id)).await?;
        let lock_repo_jobs = formatdoc!(
            r#"
                select id
                    from {repo_jobs}
                    where search_job_id = $1::bigint
                    order by id asc
                    for update
            "#
        );
        self.store().exec(query(&lock_repo_jobs).bind(id)).await?;

        let sql = formatdoc!(
            r#"
                with canceled_search_job as (
                    update {search_jobs}
                        set state = 'canceled', cancel = true, finished_at = now()
                        where id = $1::bigint and state in ('queued', 'processing')
                        returning id
                ), canceled_repo_jobs as (
                    update {repo_jobs}
                        set state = 'canceled', cancel = true, finished_at = now()
                        where search_job_id = $1::bigint and state in ('queued', 'processing')
                        returning id
                ), canceled_repo_revision_jobs as (
                    update {repo_revision_jobs}
                        set state = 'canceled', cancel = true, finished_at = now()
                        where search_repo_job_id in (
                            select id from {repo_jobs} where search_job_id = $1::bigint
                        )
                        and state in ('queued', 'processing')
                        returning id
                )
                select
                    (select count(*) from canceled_search_job)
                    + (select count(*) from canceled_repo_jobs)
                    + (select count(*) from canceled_repo_revision_jobs)
            "#
        );

        Ok(self
            .store()
            .query_scalar(query_scalar::<_, i64>(&sql).bind(id))
            .await?
            .unwrap_or_default())
    }

    /// Deletes the search job; descendants go with it through the foreign keys.
    #[tracing::instrument(skip_all, err, fields(otel.kind="client", db.system="postgresql"))]
    pub async fn delete_search_job(&self, id: i64) -> Result<bool> {
        let table = self.search_jobs_table();
        let sql = format!("delete from {table} where id = $1::bigint");

        let deleted = self.store().exec(query(&sql).bind(id)).await?;

        Ok(deleted > 0)
    }
}
