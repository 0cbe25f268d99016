//! Persistence of the exhaustive search pipeline tables.

use std::sync::Arc;

use indoc::formatdoc;
use searchjobs_basestore::{LocalSetting, ShareableStore, Store, TransactableHandle};
use sqlx::{query_scalar, PgPool};

use crate::errors::{Result, SearchJobsError};

mod aggregate;
mod logs;
mod repo_jobs;
mod repo_revision_jobs;
mod search_jobs;

pub use aggregate::{aggregate_state, AggregateStats};
pub use logs::SearchJobLogRow;
pub use repo_revision_jobs::RepoRevisionJobAncestry;
pub use search_jobs::ListSearchJobsArgs;

pub const SEARCH_JOBS_TABLE: &str = "exhaustive_search_jobs";
pub const REPO_JOBS_TABLE: &str = "exhaustive_search_repo_jobs";
pub const REPO_REVISION_JOBS_TABLE: &str = "exhaustive_search_repo_revision_jobs";

/// Session parameter naming the user a transaction writes on behalf of.
pub const ACTOR_SETTING: &str = "searchjobs.actor_uid";

/// Store over the three exhaustive search tables.
///
/// Stores built with [`ExhaustiveSearchStore::with`] or returned by
/// [`ExhaustiveSearchStore::transact`] issue their statements through the same
/// transaction as the store they were derived from.
#[derive(Clone, Debug)]
pub struct ExhaustiveSearchStore {
    store: Store,
    escaped_schema: Arc<str>,
}

impl ShareableStore for ExhaustiveSearchStore {
    fn handle(&self) -> &TransactableHandle {
        self.store.handle()
    }
}

impl ExhaustiveSearchStore {
    pub fn new(pool: PgPool, escaped_schema: &str) -> Self {
        ExhaustiveSearchStore {
            store: Store::new(pool),
            escaped_schema: escaped_schema.into(),
        }
    }

    /// Returns a store bound to the handle of `other`.
    pub fn with(&self, other: &impl ShareableStore) -> Self {
        ExhaustiveSearchStore {
            store: self.store.with(other),
            escaped_schema: self.escaped_schema.clone(),
        }
    }

    pub fn escaped_schema(&self) -> &str {
        &self.escaped_schema
    }

    pub fn in_transaction(&self) -> bool {
        self.store.in_transaction()
    }

    pub async fn transact(&self) -> Result<ExhaustiveSearchStore> {
        Ok(ExhaustiveSearchStore {
            store: self.store.transact().await?,
            escaped_schema: self.escaped_schema.clone(),
        })
    }

    pub async fn done<T>(self, result: Result<T>) -> Result<T> {
        self.store.done(result).await
    }

    /// Annotates the current transaction with the acting user.
    pub async fn set_actor(&self, user_id: i32) -> Result<LocalSetting> {
        Ok(self
            .store
            .set_local(ACTOR_SETTING, &user_id.to_string())
            .await?)
    }

    /// Locks the row of a job held by `worker_hostname` until the end of the
    /// current transaction.
    ///
    /// Fails with [`SearchJobsError::JobNotHeld`] once the row was canceled, reset
    /// or claimed by another worker. A concurrent cancel waits for the lock, so
    /// children inserted after this call are either rolled back or seen by it.
    #[tracing::instrument(skip_all, err, fields(otel.kind="client", db.system="postgresql"))]
    pub async fn lock_held_job(&self, table: &str, id: i64, worker_hostname: &str) -> Result<()> {
        let sql = formatdoc!(
            r#"
                select id
                    from {table}
                    where id = $1::bigint
                        and state = 'processing'
                        and worker_hostname = $2::text
                    for update
            "#
        );

        self.store()
            .query_scalar(query_scalar::<_, i64>(&sql).bind(id).bind(worker_hostname))
            .await?
            .map(|_| ())
            .ok_or_else(|| SearchJobsError::JobNotHeld {
                table: table.to_string(),
                id,
            })
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    pub fn search_jobs_table(&self) -> String {
        format!("{}.{SEARCH_JOBS_TABLE}", self.escaped_schema)
    }

    pub fn repo_jobs_table(&self) -> String {
        format!("{}.{REPO_JOBS_TABLE}", self.escaped_schema)
    }

    pub fn repo_revision_jobs_table(&self) -> String {
        format!("{}.{REPO_REVISION_JOBS_TABLE}", self.escaped_schema)
    }
}
