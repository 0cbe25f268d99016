use std::sync::Arc;

use searchjobs_job::RepoJob;
use tracing::info;

use crate::errors::{Result, SearchJobsError};
use crate::search::{RepositoryRevSpecs, RepositoryRevision, SearchContext, SearchQuery, Searcher};
use crate::store::ExhaustiveSearchStore;
use crate::workerutil::{Handler, HandlerContext};

/// Resolves the revision specifier of a repo job into one revision job per revision.
pub struct RepoJobHandler<S: Searcher> {
    store: ExhaustiveSearchStore,
    searcher: Arc<S>,
}

impl<S: Searcher> RepoJobHandler<S> {
    pub fn new(store: ExhaustiveSearchStore, searcher: Arc<S>) -> Self {
        RepoJobHandler { store, searcher }
    }
}

impl<S: Searcher> Handler<RepoJob> for RepoJobHandler<S> {
    async fn handle(&self, ctx: HandlerContext, record: &RepoJob) -> Result<()> {
        let repo_job_id = *record.job().id();
        let search_job_id = *record.search_job_id();
        let worker_hostname = ctx.worker_hostname().clone();

        // The query and actor only live on the search job.
        let search_job = self
            .store
            .get_search_job(search_job_id)
            .await?
            .ok_or(SearchJobsError::SearchJobNotFound(search_job_id))?;
        let ctx =
            SearchContext::new(ctx.cancellation().clone()).with_actor(*search_job.initiator_id());

        let query = self.searcher.new_search(&ctx, search_job.query()).await?;
        let rev_specs = RepositoryRevSpecs {
            repo_id: *record.repo_id(),
            ref_spec: record.ref_spec().clone(),
        };
        let revisions = query.resolve_repository_rev_spec(&ctx, &rev_specs).await?;
        ctx.check_canceled()?;

        let tx = self.store.transact().await?;
        let result =
            create_repo_revision_jobs(
                &tx,
                repo_job_id,
                &worker_hostname,
                *search_job.initiator_id(),
                &revisions,
            )
            .await;
        let created = tx.done(result).await?;

        info!(
            search_job_id,
            repo_job_id,
            repo_revision_jobs = created,
            "Created repo revision jobs"
        );
        Ok(())
    }
}

async fn create_repo_revision_jobs(
    tx: &ExhaustiveSearchStore,
    repo_job_id: i64,
    worker_hostname: &str,
    initiator_id: i32,
    revisions: &[RepositoryRevision],
) -> Result<usize> {
    tx.lock_held_job(&tx.repo_jobs_table(), repo_job_id, worker_hostname)
        .await?;
    let actor = tx.set_actor(initiator_id).await?;

    let mut result: Result<usize> = Ok(0);
    for revision in revisions {
        if let Err(e) = tx
            .create_repo_revision_job(repo_job_id, &revision.revision)
            .await
        {
            result = Err(e);
            break;
        }
        result = result.map(|created| created + 1);
    }

    SearchJobsError::combine(result, actor.restore().await)
}
