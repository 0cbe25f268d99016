//! Handlers of the three pipeline stages.
//!
//! Every stage acts as the user who created the search job and creates its own
//! search from the query text rather than receiving one from the parent stage.

use crate::uploadstore::{delete_prefix, UploadError, UploadStore};

mod repo_job;
mod repo_revision_job;
mod search_job;

pub use repo_job::RepoJobHandler;
pub use repo_revision_job::RepoRevisionJobHandler;
pub use search_job::SearchJobHandler;

/// Prefix shared by every result object of a search job.
pub fn result_key_prefix(search_job_id: i64) -> String {
    format!("{search_job_id}-")
}

/// Key of the first result object of a revision job. Later chunks append `-{n}`.
pub fn result_key(search_job_id: i64, repo_revision_job_id: i64) -> String {
    format!("{search_job_id}-{repo_revision_job_id}")
}

/// Deletes the result objects of one revision job, the first one and its chunks,
/// without touching revision jobs whose id merely shares the same digits.
pub async fn delete_result_objects<U: UploadStore>(
    uploads: &U,
    key: &str,
) -> Result<usize, UploadError> {
    let existed = uploads.list(key).await?.iter().any(|k| k == key);
    uploads.delete(key).await?;
    let chunks = delete_prefix(uploads, &format!("{key}-")).await?;
    Ok(usize::from(existed) + chunks)
}
