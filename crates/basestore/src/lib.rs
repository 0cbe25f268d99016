//! Database handles that compose transactions across store boundaries.
//!
//! A [`Store`] wraps a [`TransactableHandle`]. Calling [`Store::transact`] on a store
//! outside a transaction begins one; calling it again on the returned store opens a
//! savepoint instead, so code that wants "a transaction" works the same whether or not
//! its caller already started one.

mod errors;
mod handle;
mod store;

pub use errors::{Error, Result};
pub use handle::TransactableHandle;
pub use store::{LocalSetting, ShareableStore, Store};
