//! Row types of the exhaustive search queue tables.
//!
//! Every queue table shares the columns of [`JobFields`]; each stage adds its own
//! payload columns on top.

use sqlx::postgres::PgRow;
use sqlx::FromRow;

mod jobs;
mod state;

pub use jobs::{
    ExecutionLogEntry, JobFields, RepoJob, RepoRevisionJob, SearchJob, JOB_FIELDS_COLUMNS,
};
pub use state::{JobState, UnknownJobState};

/// A row that can be claimed from a queue table.
pub trait Record: for<'r> FromRow<'r, PgRow> + Send + Sync + Unpin + 'static {
    fn record_id(&self) -> i64;
}
