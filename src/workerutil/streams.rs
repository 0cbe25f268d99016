use std::time::Duration;

use futures::{stream, Stream};
use searchjobs_job::Record;
use searchjobs_shutdown_signal::ShutdownSignal;
use sqlx::postgres::{PgListener, PgNotification};
use sqlx::PgPool;
use tracing::{error, warn};

use super::store::WorkerStore;
use crate::errors::Result;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StreamSource {
    Polling,
    PgListener,
    RunOnce,
}

struct RecordSignalStreamData {
    interval: tokio::time::Interval,
    pg_listener: Option<PgListener>,
    shutdown_signal: ShutdownSignal,
    concurrency: usize,
    pending_yields: usize,
    pending_source: StreamSource,
}

async fn recv_notification(
    pg_listener: &mut Option<PgListener>,
) -> core::result::Result<PgNotification, sqlx::Error> {
    match pg_listener {
        Some(pg_listener) => pg_listener.recv().await,
        None => futures::future::pending().await,
    }
}

/// Returns a stream that yields `concurrency` signals on every poll interval tick
/// and on every postgres `NOTIFY` received on `channel`.
///
/// The stream ends when the shutdown signal resolves.
pub async fn record_signal_stream(
    pg_pool: &PgPool,
    poll_interval: Duration,
    channel: Option<&str>,
    shutdown_signal: ShutdownSignal,
    concurrency: usize,
) -> Result<impl Stream<Item = StreamSource>> {
    let interval = tokio::time::interval(poll_interval);

    let pg_listener = match channel {
        Some(channel) => {
            let mut pg_listener = PgListener::connect_with(pg_pool).await?;
            pg_listener.listen(channel).await?;
            Some(pg_listener)
        }
        None => None,
    };

    let stream_data = RecordSignalStreamData {
        interval,
        pg_listener,
        shutdown_signal,
        concurrency: concurrency.max(1),
        pending_yields: 0,
        pending_source: StreamSource::Polling,
    };

    let stream = stream::unfold(stream_data, |mut f| async {
        if f.pending_yields > 0 {
            f.pending_yields -= 1;
            let source = f.pending_source;
            return Some((source, f));
        }

        tokio::select! {
            _ = (f.interval).tick() => {
                f.pending_yields = f.concurrency - 1;
                f.pending_source = StreamSource::Polling;
                Some((StreamSource::Polling, f))
            },
            notification = recv_notification(&mut f.pg_listener) => {
                if let Err(e) = notification {
                    warn!(error = %e, "Failed to receive notification, relying on polling");
                }
                f.pending_yields = f.concurrency - 1;
                f.pending_source = StreamSource::PgListener;
                Some((StreamSource::PgListener, f))
            },
            _ = &mut f.shutdown_signal => None,
        }
    });

    Ok(stream)
}

/// Returns a stream that yields every record currently available in `store`.
///
/// It stops when the shutdown signal resolves or when there is no record left.
pub fn record_stream<R: Record>(
    store: WorkerStore<R>,
    worker_hostname: String,
    shutdown_signal: ShutdownSignal,
) -> impl Stream<Item = R> {
    stream::unfold((), move |()| {
        let store = store.clone();
        let worker_hostname = worker_hostname.clone();
        let shutdown_fut = shutdown_signal.clone();

        async move {
            let record_fut = async {
                match store.dequeue(&worker_hostname).await {
                    Ok(Some(record)) => Some((record, ())),
                    Ok(None) => None,
                    Err(e) => {
                        error!(error = %e, store = store.name(), "Could not dequeue record");
                        None
                    }
                }
            };

            tokio::select! {
                res = record_fut => res,
                _ = shutdown_fut => None,
            }
        }
    })
}
