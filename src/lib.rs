//! PostgreSQL backed orchestration of exhaustive searches.
//!
//! A search job fans out into one repo job per repository, each repo job into one
//! revision job per resolved revision, and every revision job writes its matches
//! as CSV objects to an upload store. Each stage is a queue table processed by a
//! generic [`workerutil::Worker`].

pub mod builder;
pub mod csv;
pub mod errors;
pub mod handlers;
pub mod search;
pub mod service;
pub mod store;
pub mod uploadstore;
mod utils;
pub mod workerutil;

pub use builder::{ExhaustiveSearchOptions, ExhaustiveSearchRuntime};
pub use csv::{BlobstoreCsvWriter, CsvError, CsvWriter};
pub use errors::{Result, SearchJobsError};
pub use search::{
    RepositoryRevSpecs, RepositoryRevision, SearchContext, SearchQuery, Searcher, SearcherError,
};
pub use service::SearchJobService;
pub use store::{AggregateStats, ExhaustiveSearchStore, ListSearchJobsArgs};
pub use uploadstore::{MemoryUploadStore, UploadError, UploadStore};

pub use searchjobs_basestore::{ShareableStore, Store};
pub use searchjobs_job::{JobState, RepoJob, RepoRevisionJob, SearchJob};
pub use searchjobs_shutdown_signal::ShutdownHandle;
pub use utils::escape_identifier;
