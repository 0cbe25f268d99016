use searchjobs_migrations::MigrateError;
use thiserror::Error;

use crate::csv::CsvError;
use crate::search::SearcherError;
use crate::uploadstore::UploadError;

/// Errors raised by the exhaustive search stores, handlers and service.
#[derive(Error, Debug)]
pub enum SearchJobsError {
    /// An error occurred while executing an SQL query
    #[error("Error occured while query: {0}")]
    SqlError(#[from] sqlx::Error),

    /// An error raised by the transactional store layer
    #[error(transparent)]
    StoreError(#[from] searchjobs_basestore::Error),

    /// Applying the schema migrations failed
    #[error("Error occured while migrating: {0}")]
    MigrateError(#[from] MigrateError),

    /// The searcher failed to create, resolve or run a search
    #[error(transparent)]
    SearcherError(#[from] SearcherError),

    #[error(transparent)]
    UploadError(#[from] UploadError),

    #[error(transparent)]
    CsvError(#[from] CsvError),

    /// `dequeue` must claim its row in a transaction of its own
    #[error("Store '{0}' cannot dequeue inside an open transaction")]
    DequeueInTransaction(String),

    /// The parent repo job of a revision job was not committed yet, or was deleted
    #[error("Cannot create revision job for revision '{revision}': repo job {repo_job_id} does not exist")]
    MissingParentJob { repo_job_id: i64, revision: String },

    #[error("Search job {0} not found")]
    SearchJobNotFound(i64),

    #[error("Repo revision job {0} not found")]
    RepoRevisionJobNotFound(i64),

    /// The runtime options are incomplete or inconsistent
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    /// A handler's record was canceled, reset or claimed by another worker while
    /// the handler was running
    #[error("Job {id} of {table} is no longer processing on this worker")]
    JobNotHeld { table: String, id: i64 },

    /// Cleanup failed after the primary operation had already failed
    #[error("{primary} (additionally, cleanup failed: {cleanup})")]
    Combined {
        primary: String,
        #[source]
        cleanup: Box<SearchJobsError>,
    },
}

impl SearchJobsError {
    /// Returns the SQLSTATE code of the underlying database error, if any.
    pub fn sql_state(&self) -> Option<String> {
        match self {
            SearchJobsError::SqlError(sqlx::Error::Database(e)) => e.code().map(|c| c.into_owned()),
            SearchJobsError::StoreError(e) => e.sql_state(),
            _ => None,
        }
    }

    /// Combines the outcome of a primary operation with the outcome of its cleanup.
    pub fn combine<T>(
        primary: Result<T>,
        cleanup: core::result::Result<(), impl Into<SearchJobsError>>,
    ) -> Result<T> {
        match (primary, cleanup) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(cleanup)) => Err(cleanup.into()),
            (Err(primary), Ok(())) => Err(primary),
            (Err(primary), Err(cleanup)) => Err(SearchJobsError::Combined {
                primary: primary.to_string(),
                cleanup: Box::new(cleanup.into()),
            }),
        }
    }
}

/// A Result type alias for SearchJobsError.
pub type Result<T> = core::result::Result<T, SearchJobsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_keeps_both_errors() {
        let primary: Result<()> = Err(SearchJobsError::SearchJobNotFound(1));
        let cleanup: core::result::Result<(), SearchJobsError> =
            Err(SearchJobsError::RepoRevisionJobNotFound(2));

        let err = SearchJobsError::combine(primary, cleanup).unwrap_err();
        let rendered = err.to_string();
        assert!(rendered.contains("Search job 1 not found"));
        assert!(rendered.contains("Repo revision job 2 not found"));
    }

    #[test]
    fn combine_surfaces_cleanup_error_after_success() {
        let cleanup: core::result::Result<(), SearchJobsError> =
            Err(SearchJobsError::SearchJobNotFound(3));
        let err = SearchJobsError::combine(Ok(42), cleanup).unwrap_err();
        assert!(matches!(err, SearchJobsError::SearchJobNotFound(3)));
    }

    #[test]
    fn combine_passes_through_success() {
        let cleanup: core::result::Result<(), SearchJobsError> = Ok(());
        assert_eq!(SearchJobsError::combine(Ok(7), cleanup).unwrap(), 7);
    }
}
