use std::sync::Arc;

use futures::TryStreamExt;
use searchjobs_job::SearchJob;
use tracing::info;

use crate::errors::{Result, SearchJobsError};
use crate::search::{RepositoryRevSpecs, SearchContext, SearchQuery, Searcher};
use crate::store::ExhaustiveSearchStore;
use crate::workerutil::{Handler, HandlerContext};

/// Fans a search job out into one repo job per repository the query touches.
pub struct SearchJobHandler<S: Searcher> {
    store: ExhaustiveSearchStore,
    searcher: Arc<S>,
}

impl<S: Searcher> SearchJobHandler<S> {
    pub fn new(store: ExhaustiveSearchStore, searcher: Arc<S>) -> Self {
        SearchJobHandler { store, searcher }
    }
}

impl<S: Searcher> Handler<SearchJob> for SearchJobHandler<S> {
    async fn handle(&self, ctx: HandlerContext, record: &SearchJob) -> Result<()> {
        let search_job_id = *record.job().id();
        let worker_hostname = ctx.worker_hostname().clone();
        let ctx = SearchContext::new(ctx.cancellation().clone()).with_actor(*record.initiator_id());

        let query = self.searcher.new_search(&ctx, record.query()).await?;
        let rev_specs: Vec<RepositoryRevSpecs> =
            query.repository_rev_specs(&ctx).try_collect().await?;
        ctx.check_canceled()?;

        let tx = self.store.transact().await?;
        let result = create_repo_jobs(&tx, record, &worker_hostname, &rev_specs).await;
        let created = tx.done(result).await?;

        info!(search_job_id, repo_jobs = created, "Created repo jobs");
        Ok(())
    }
}

async fn create_repo_jobs(
    tx: &ExhaustiveSearchStore,
    record: &SearchJob,
    worker_hostname: &str,
    rev_specs: &[RepositoryRevSpecs],
) -> Result<usize> {
    tx.lock_held_job(&tx.search_jobs_table(), *record.job().id(), worker_hostname)
        .await?;
    let actor = tx.set_actor(*record.initiator_id()).await?;

    let mut result: Result<usize> = Ok(0);
    for rev_specs in rev_specs {
        if let Err(e) = tx
            .create_repo_job(*record.job().id(), rev_specs.repo_id, &rev_specs.ref_spec)
            .await
        {
            result = Err(e);
            break;
        }
        result = result.map(|created| created + 1);
    }

    SearchJobsError::combine(result, actor.restore().await)
}
