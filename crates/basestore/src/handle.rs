use std::fmt::{self, Debug, Display};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::RngCore;
use sqlx::postgres::{PgArguments, PgQueryResult, PgRow};
use sqlx::query::{Query, QueryAs, QueryScalar};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::errors::{Error, Result};

type PgTransaction = Transaction<'static, Postgres>;

/// A database handle that is either the pool itself, an open transaction, or a
/// savepoint nested inside an open transaction.
///
/// Cloning a handle shares the underlying transaction. Every statement issued
/// through a transactional handle is serialized on the connection; a caller that
/// finds the connection busy is reported as a concurrency violation and then waits
/// its turn.
#[derive(Clone)]
pub struct TransactableHandle {
    kind: HandleKind,
}

#[derive(Clone)]
enum HandleKind {
    Pool(PgPool),
    Transaction(Arc<SharedTransaction>),
    Savepoint {
        shared: Arc<SharedTransaction>,
        savepoint_id: String,
    },
}

struct SharedTransaction {
    tx: Mutex<Option<PgTransaction>>,
    concurrent_uses: AtomicU64,
}

impl SharedTransaction {
    fn new(tx: PgTransaction) -> Self {
        SharedTransaction {
            tx: Mutex::new(Some(tx)),
            concurrent_uses: AtomicU64::new(0),
        }
    }

    async fn lock(&self) -> MutexGuard<'_, Option<PgTransaction>> {
        if let Ok(guard) = self.tx.try_lock() {
            return guard;
        }

        let concurrent_uses = self.concurrent_uses.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            concurrent_uses,
            "Detected concurrent use of a single transaction, serializing access"
        );
        self.tx.lock().await
    }
}

impl TransactableHandle {
    /// Creates a handle that is not inside a transaction.
    pub fn new(pool: PgPool) -> Self {
        TransactableHandle {
            kind: HandleKind::Pool(pool),
        }
    }

    /// Returns true if statements issued through this handle run inside a transaction.
    pub fn in_transaction(&self) -> bool {
        !matches!(self.kind, HandleKind::Pool(_))
    }

    /// Number of times a caller found the transaction busy and had to wait.
    pub fn concurrency_violations(&self) -> u64 {
        match &self.kind {
            HandleKind::Pool(_) => 0,
            HandleKind::Transaction(shared) | HandleKind::Savepoint { shared, .. } => {
                shared.concurrent_uses.load(Ordering::Relaxed)
            }
        }
    }

    /// Begins a transaction, or a savepoint when this handle is already inside one.
    pub async fn transact(&self) -> Result<TransactableHandle> {
        match &self.kind {
            HandleKind::Pool(pool) => {
                let tx = pool.begin().await?;
                debug!("Began transaction");
                Ok(TransactableHandle {
                    kind: HandleKind::Transaction(Arc::new(SharedTransaction::new(tx))),
                })
            }
            HandleKind::Transaction(shared) | HandleKind::Savepoint { shared, .. } => {
                let savepoint_id = new_savepoint_id();
                let sql = format!("savepoint {savepoint_id}");
                self.execute(sqlx::query(&sql).persistent(false)).await?;
                debug!(savepoint_id, "Created savepoint");
                Ok(TransactableHandle {
                    kind: HandleKind::Savepoint {
                        shared: shared.clone(),
                        savepoint_id,
                    },
                })
            }
        }
    }

    /// Finalizes the transaction or savepoint opened by [`Self::transact`].
    ///
    /// An `Ok` result commits (or releases the savepoint), an `Err` result rolls back
    /// (or rolls back to the savepoint). When finalizing fails too, both errors are
    /// reported together.
    pub async fn done<T, E>(self, result: core::result::Result<T, E>) -> core::result::Result<T, E>
    where
        E: From<Error> + Display,
    {
        let commit = result.is_ok();
        match (result, self.finalize(commit).await) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(finalize)) => Err(E::from(finalize)),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(finalize)) => Err(E::from(Error::Combined {
                primary: err.to_string(),
                finalize: Box::new(finalize),
            })),
        }
    }

    async fn finalize(self, commit: bool) -> Result<()> {
        match self.kind {
            HandleKind::Pool(_) => Err(Error::NotInTransaction),
            HandleKind::Transaction(shared) => {
                let mut guard = shared.lock().await;
                let tx = guard.take().ok_or(Error::TransactionFinalized)?;
                if commit {
                    tx.commit().await?;
                    debug!("Committed transaction");
                } else {
                    tx.rollback().await?;
                    debug!("Rolled back transaction");
                }
                Ok(())
            }
            HandleKind::Savepoint {
                shared,
                savepoint_id,
            } => {
                let sql = if commit {
                    format!("release savepoint {savepoint_id}")
                } else {
                    format!("rollback to savepoint {savepoint_id}")
                };
                let mut guard = shared.lock().await;
                let tx = guard.as_mut().ok_or(Error::TransactionFinalized)?;
                sqlx::query(&sql).persistent(false).execute(&mut **tx).await?;
                debug!(savepoint_id, commit, "Finalized savepoint");
                Ok(())
            }
        }
    }

    pub async fn execute<'q>(
        &self,
        query: Query<'q, Postgres, PgArguments>,
    ) -> Result<PgQueryResult> {
        match &self.kind {
            HandleKind::Pool(pool) => Ok(query.execute(pool).await?),
            HandleKind::Transaction(shared) | HandleKind::Savepoint { shared, .. } => {
                let mut guard = shared.lock().await;
                let tx = guard.as_mut().ok_or(Error::TransactionFinalized)?;
                Ok(query.execute(&mut **tx).await?)
            }
        }
    }

    pub async fn fetch_all<'q, O>(
        &self,
        query: QueryAs<'q, Postgres, O, PgArguments>,
    ) -> Result<Vec<O>>
    where
        O: for<'r> FromRow<'r, PgRow> + Send + Unpin,
    {
        match &self.kind {
            HandleKind::Pool(pool) => Ok(query.fetch_all(pool).await?),
            HandleKind::Transaction(shared) | HandleKind::Savepoint { shared, .. } => {
                let mut guard = shared.lock().await;
                let tx = guard.as_mut().ok_or(Error::TransactionFinalized)?;
                Ok(query.fetch_all(&mut **tx).await?)
            }
        }
    }

    pub async fn fetch_optional<'q, O>(
        &self,
        query: QueryAs<'q, Postgres, O, PgArguments>,
    ) -> Result<Option<O>>
    where
        O: for<'r> FromRow<'r, PgRow> + Send + Unpin,
    {
        match &self.kind {
            HandleKind::Pool(pool) => Ok(query.fetch_optional(pool).await?),
            HandleKind::Transaction(shared) | HandleKind::Savepoint { shared, .. } => {
                let mut guard = shared.lock().await;
                let tx = guard.as_mut().ok_or(Error::TransactionFinalized)?;
                Ok(query.fetch_optional(&mut **tx).await?)
            }
        }
    }

    pub async fn fetch_scalar_optional<'q, O>(
        &self,
        query: QueryScalar<'q, Postgres, O, PgArguments>,
    ) -> Result<Option<O>>
    where
        O: Send + Unpin,
        (O,): for<'r> FromRow<'r, PgRow> + Send + Unpin,
    {
        match &self.kind {
            HandleKind::Pool(pool) => Ok(query.fetch_optional(pool).await?),
            HandleKind::Transaction(shared) | HandleKind::Savepoint { shared, .. } => {
                let mut guard = shared.lock().await;
                let tx = guard.as_mut().ok_or(Error::TransactionFinalized)?;
                Ok(query.fetch_optional(&mut **tx).await?)
            }
        }
    }

    pub async fn fetch_scalar_all<'q, O>(
        &self,
        query: QueryScalar<'q, Postgres, O, PgArguments>,
    ) -> Result<Vec<O>>
    where
        O: Send + Unpin,
        (O,): for<'r> FromRow<'r, PgRow> + Send + Unpin,
    {
        match &self.kind {
            HandleKind::Pool(pool) => Ok(query.fetch_all(pool).await?),
            HandleKind::Transaction(shared) | HandleKind::Savepoint { shared, .. } => {
                let mut guard = shared.lock().await;
                let tx = guard.as_mut().ok_or(Error::TransactionFinalized)?;
                Ok(query.fetch_all(&mut **tx).await?)
            }
        }
    }
}

impl Debug for TransactableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            HandleKind::Pool(_) => f.write_str("TransactableHandle::Pool"),
            HandleKind::Transaction(_) => f.write_str("TransactableHandle::Transaction"),
            HandleKind::Savepoint { savepoint_id, .. } => f
                .debug_struct("TransactableHandle::Savepoint")
                .field("savepoint_id", savepoint_id)
                .finish(),
        }
    }
}

/// Savepoint names must never collide between handles nested from concurrent tasks,
/// so they are drawn from random bytes rather than a counter.
fn new_savepoint_id() -> String {
    let mut random_bytes = [0u8; 12];
    rand::rng().fill_bytes(&mut random_bytes);
    format!("sp_{}", hex::encode(random_bytes))
}
