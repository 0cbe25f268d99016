use std::fmt::Display;

use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::{Query, QueryAs, QueryScalar};
use sqlx::{query, query_scalar, FromRow, PgPool, Postgres};
use tracing::debug;

use crate::errors::{Error, Result};
use crate::handle::TransactableHandle;

/// SQLSTATE raised when a statement runs in a transaction that already failed.
const IN_FAILED_SQL_TRANSACTION: &str = "25P02";

/// Implemented by every store that can hand its database handle to another store,
/// so that several domain stores can take part in the same transaction.
pub trait ShareableStore {
    fn handle(&self) -> &TransactableHandle;
}

/// Thin query execution layer bound to a [`TransactableHandle`].
#[derive(Clone, Debug)]
pub struct Store {
    handle: TransactableHandle,
}

impl ShareableStore for Store {
    fn handle(&self) -> &TransactableHandle {
        &self.handle
    }
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Store::with_handle(TransactableHandle::new(pool))
    }

    pub fn with_handle(handle: TransactableHandle) -> Self {
        Store { handle }
    }

    /// Returns a store that issues its statements through the handle of `other`.
    pub fn with(&self, other: &impl ShareableStore) -> Self {
        Store {
            handle: other.handle().clone(),
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.handle.in_transaction()
    }

    pub async fn transact(&self) -> Result<Store> {
        Ok(Store {
            handle: self.handle.transact().await?,
        })
    }

    /// Commits or rolls back depending on `result`. See [`TransactableHandle::done`].
    pub async fn done<T, E>(self, result: core::result::Result<T, E>) -> core::result::Result<T, E>
    where
        E: From<Error> + Display,
    {
        self.handle.done(result).await
    }

    /// Executes a statement and returns the number of affected rows.
    pub async fn exec<'q>(&self, query: Query<'q, Postgres, PgArguments>) -> Result<u64> {
        Ok(self.handle.execute(query).await?.rows_affected())
    }

    pub async fn query_all<'q, O>(&self, query: QueryAs<'q, Postgres, O, PgArguments>) -> Result<Vec<O>>
    where
        O: for<'r> FromRow<'r, PgRow> + Send + Unpin,
    {
        self.handle.fetch_all(query).await
    }

    pub async fn query_optional<'q, O>(
        &self,
        query: QueryAs<'q, Postgres, O, PgArguments>,
    ) -> Result<Option<O>>
    where
        O: for<'r> FromRow<'r, PgRow> + Send + Unpin,
    {
        self.handle.fetch_optional(query).await
    }

    pub async fn query_one<'q, O>(&self, query: QueryAs<'q, Postgres, O, PgArguments>) -> Result<O>
    where
        O: for<'r> FromRow<'r, PgRow> + Send + Unpin,
    {
        self.handle
            .fetch_optional(query)
            .await?
            .ok_or(Error::SqlError(sqlx::Error::RowNotFound))
    }

    pub async fn query_scalar<'q, O>(
        &self,
        query: QueryScalar<'q, Postgres, O, PgArguments>,
    ) -> Result<Option<O>>
    where
        O: Send + Unpin,
        (O,): for<'r> FromRow<'r, PgRow> + Send + Unpin,
    {
        self.handle.fetch_scalar_optional(query).await
    }

    pub async fn query_scalars<'q, O>(
        &self,
        query: QueryScalar<'q, Postgres, O, PgArguments>,
    ) -> Result<Vec<O>>
    where
        O: Send + Unpin,
        (O,): for<'r> FromRow<'r, PgRow> + Send + Unpin,
    {
        self.handle.fetch_scalar_all(query).await
    }

    /// Sets a transaction scoped session parameter.
    ///
    /// The returned [`LocalSetting`] puts the previous value back when restored.
    pub async fn set_local(&self, key: &str, value: &str) -> Result<LocalSetting> {
        if !self.in_transaction() {
            return Err(Error::SetLocalOutsideTransaction(key.to_string()));
        }

        let previous = self
            .query_scalar(query_scalar::<_, Option<String>>("select current_setting($1, true)").bind(key))
            .await?
            .flatten();

        self.exec(query("select set_config($1, $2, true)").bind(key).bind(value))
            .await?;
        debug!(key, "Set local session parameter");

        Ok(LocalSetting {
            handle: self.handle.clone(),
            key: key.to_string(),
            previous,
        })
    }
}

/// A session parameter set by [`Store::set_local`].
#[derive(Debug)]
#[must_use = "restore the previous value once the annotated work is done"]
pub struct LocalSetting {
    handle: TransactableHandle,
    key: String,
    previous: Option<String>,
}

impl LocalSetting {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Puts the previous value back.
    ///
    /// Succeeds when the transaction has already been finalized or aborted, since the
    /// setting does not outlive it in either case.
    pub async fn restore(self) -> Result<()> {
        let previous = self.previous.unwrap_or_default();
        let result = self
            .handle
            .execute(
                query("select set_config($1, $2, true)")
                    .bind(&self.key)
                    .bind(previous),
            )
            .await;

        match result {
            Ok(_) | Err(Error::TransactionFinalized) => Ok(()),
            Err(e) if e.sql_state().as_deref() == Some(IN_FAILED_SQL_TRANSACTION) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
