use thiserror::Error;

/// Errors raised by [`crate::TransactableHandle`] and [`crate::Store`].
#[derive(Error, Debug)]
pub enum Error {
    /// An error occurred while executing an SQL query
    #[error("Error occured while query: {0}")]
    SqlError(#[from] sqlx::Error),

    /// `done` was called on a handle that never entered a transaction
    #[error("Not in a transaction")]
    NotInTransaction,

    /// The handle refers to a transaction that was already committed or rolled back
    #[error("Transaction has already been committed or rolled back")]
    TransactionFinalized,

    /// `set_local` was called outside of a transaction
    #[error("set_local can only be used inside a transaction (key '{0}')")]
    SetLocalOutsideTransaction(String),

    /// Both the unit of work and the commit/rollback that followed it failed
    #[error("{primary} (additionally, finalizing the transaction failed: {finalize})")]
    Combined {
        /// Rendered error of the unit of work
        primary: String,
        /// Error raised while committing, releasing or rolling back
        #[source]
        finalize: Box<Error>,
    },
}

impl Error {
    /// Returns the SQLSTATE code of the underlying database error, if any.
    pub fn sql_state(&self) -> Option<String> {
        match self {
            Error::SqlError(sqlx::Error::Database(e)) => e.code().map(|c| c.into_owned()),
            _ => None,
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;
