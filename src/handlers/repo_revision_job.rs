use std::sync::Arc;

use searchjobs_job::RepoRevisionJob;
use tracing::{info, warn};

use super::{delete_result_objects, result_key};
use crate::csv::BlobstoreCsvWriter;
use crate::errors::{Result, SearchJobsError};
use crate::search::{SearchContext, SearchQuery, Searcher, SearcherError};
use crate::store::ExhaustiveSearchStore;
use crate::uploadstore::UploadStore;
use crate::workerutil::{Handler, HandlerContext};

/// Runs the search over one revision and writes the results to the upload store.
pub struct RepoRevisionJobHandler<S: Searcher, U: UploadStore> {
    store: ExhaustiveSearchStore,
    searcher: Arc<S>,
    uploads: U,
    max_blob_size_bytes: usize,
}

impl<S: Searcher, U: UploadStore> RepoRevisionJobHandler<S, U> {
    pub fn new(
        store: ExhaustiveSearchStore,
        searcher: Arc<S>,
        uploads: U,
        max_blob_size_bytes: usize,
    ) -> Self {
        RepoRevisionJobHandler {
            store,
            searcher,
            uploads,
            max_blob_size_bytes,
        }
    }
}

impl<S: Searcher, U: UploadStore> Handler<RepoRevisionJob> for RepoRevisionJobHandler<S, U> {
    async fn handle(&self, ctx: HandlerContext, record: &RepoRevisionJob) -> Result<()> {
        let repo_revision_job_id = *record.job().id();
        let cancellation = ctx.cancellation().clone();
        let ancestry = self
            .store
            .get_repo_revision_job_ancestry(repo_revision_job_id)
            .await?;
        let ctx = SearchContext::new(ctx.cancellation().clone()).with_actor(ancestry.initiator_id);

        let query = self.searcher.new_search(&ctx, &ancestry.query).await?;

        let key = result_key(ancestry.search_job_id, repo_revision_job_id);
        // Objects of an earlier attempt would otherwise outlive a shorter result.
        let stale = delete_result_objects(&self.uploads, &key).await?;
        if stale > 0 {
            info!(repo_revision_job_id, key, stale, "Deleted result objects of a previous attempt");
        }

        let mut writer =
            BlobstoreCsvWriter::new(self.uploads.clone(), key.clone(), self.max_blob_size_bytes);
        let result: Result<()> = query
            .search(&ctx, &ancestry.repo_revision, &mut writer)
            .await
            .map_err(Into::into);
        SearchJobsError::combine(result, writer.close().await)?;

        // The row was canceled or deleted while searching, nobody will read these.
        if cancellation.is_cancelled() {
            let deleted = delete_result_objects(&self.uploads, &key).await?;
            warn!(repo_revision_job_id, key, deleted, "Discarded results of a canceled search");
            return Err(SearcherError::Canceled.into());
        }

        info!(
            search_job_id = ancestry.search_job_id,
            repo_revision_job_id,
            repo_revision = %ancestry.repo_revision,
            key,
            objects = writer.objects_uploaded(),
            "Searched repo revision"
        );
        Ok(())
    }
}
