//! Generic database backed work queue.
//!
//! A [`WorkerStore`] binds one queue table to the dequeue, heartbeat and reset
//! queries, a [`Worker`] claims records from it and hands them to a [`Handler`],
//! and a [`Resetter`] recovers rows whose worker stopped heartbeating.

use std::future::Future;
use std::sync::Arc;

use getset::Getters;
use searchjobs_job::Record;
use tokio_util::sync::CancellationToken;

use crate::errors::Result;

mod resetter;
mod store;
mod streams;
mod worker;

pub use resetter::{Resetter, ResetterOptions};
pub use store::{
    ResetStalledOutcome, WorkerStore, WorkerStoreOptions, WorkerStoreOptionsBuilder,
    WorkerStoreOptionsBuilderError, DEFAULT_RESET_FAILURE_MESSAGE,
};
pub use streams::StreamSource;
pub use worker::{Worker, WorkerOptions};
pub(crate) use worker::random_worker_hostname;

/// Context handed to a [`Handler`] for one record.
#[derive(Getters, Clone, Debug)]
#[getset(get = "pub")]
pub struct HandlerContext {
    /// Canceled when the worker shuts down or the record is canceled elsewhere
    cancellation: CancellationToken,
    worker_hostname: Arc<str>,
    job_id: i64,
}

impl HandlerContext {
    pub fn new(cancellation: CancellationToken, worker_hostname: Arc<str>, job_id: i64) -> Self {
        HandlerContext {
            cancellation,
            worker_hostname,
            job_id,
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Processes records claimed by a [`Worker`].
///
/// Returning `Ok` marks the record completed, returning `Err` marks it errored
/// (or failed once its retry budget is spent) with the error text.
pub trait Handler<R: Record>: Send + Sync + 'static {
    fn handle(&self, ctx: HandlerContext, record: &R) -> impl Future<Output = Result<()>> + Send;
}
