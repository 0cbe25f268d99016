use indoc::formatdoc;
use searchjobs_job::RepoJob;
use sqlx::{query_as, query_scalar};

use super::ExhaustiveSearchStore;
use crate::errors::Result;

impl ExhaustiveSearchStore {
    #[tracing::instrument(skip_all, err, fields(otel.kind="client", db.system="postgresql"))]
    pub async fn create_repo_job(
        &self,
        search_job_id: i64,
        repo_id: i32,
        ref_spec: &str,
    ) -> Result<i64> {
        let table = self.repo_jobs_table();
        let sql = formatdoc!(
            r#"
                insert into {table} (search_job_id, repo_id, ref_spec)
                    values ($1::bigint, $2::int, $3::text)
                    returning id
            "#
        );

        let id = self
            .store()
            .query_scalar(
                query_scalar::<_, i64>(&sql)
                    .bind(search_job_id)
                    .bind(repo_id)
                    .bind(ref_spec),
            )
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;

        Ok(id)
    }

    #[tracing::instrument(skip_all, err, fields(otel.kind="client", db.system="postgresql"))]
    pub async fn list_repo_jobs(&self, search_job_id: i64) -> Result<Vec<RepoJob>> {
        let table = self.repo_jobs_table();
        let columns = RepoJob::COLUMNS;
        let sql = formatdoc!(
            r#"
                select {columns}
                    from {table}
                    where search_job_id = $1::bigint
                    order by id asc
            "#
        );

        Ok(self
            .store()
            .query_all(query_as::<_, RepoJob>(&sql).bind(search_job_id))
            .await?)
    }
}
