use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{StreamExt, TryStreamExt};
use rand::RngCore;
use searchjobs_job::Record;
use searchjobs_shutdown_signal::ShutdownSignal;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::store::WorkerStore;
use super::streams::{record_signal_stream, record_stream, StreamSource};
use super::{Handler, HandlerContext};
use crate::errors::{Result, SearchJobsError};

/// Configuration of a [`Worker`]. Every unset option falls back to its documented default.
#[derive(Default, Clone, Debug)]
pub struct WorkerOptions {
    /// Used in logs. Defaults to the store name.
    name: Option<String>,
    /// Records processed concurrently. Defaults to the number of logical CPUs.
    num_handlers: Option<usize>,
    /// Poll interval. Defaults to 1 second.
    interval: Option<Duration>,
    /// Interval between heartbeats for held records. Defaults to 5 seconds.
    heartbeat_interval: Option<Duration>,
    /// Identity stamped on claimed rows. Defaults to `searchjobs_worker_<random hex>`.
    worker_hostname: Option<String>,
    /// Channel to `LISTEN` on for insert notifications. Polling only when unset.
    listen_channel: Option<String>,
    /// Time handlers get to return after their context was canceled on shutdown.
    /// Defaults to 5 seconds.
    shutdown_grace_period: Option<Duration>,
}

impl WorkerOptions {
    pub fn name(mut self, value: &str) -> Self {
        self.name = Some(value.into());
        self
    }

    /// # Panics
    /// Panics if the value is 0.
    pub fn num_handlers(mut self, value: usize) -> Self {
        assert!(value > 0, "num_handlers must be greater than 0");
        self.num_handlers = Some(value);
        self
    }

    /// # Panics
    /// Panics if the value is zero.
    pub fn interval(mut self, value: Duration) -> Self {
        assert!(!value.is_zero(), "interval must be greater than 0");
        self.interval = Some(value);
        self
    }

    /// # Panics
    /// Panics if the value is zero.
    pub fn heartbeat_interval(mut self, value: Duration) -> Self {
        assert!(!value.is_zero(), "heartbeat_interval must be greater than 0");
        self.heartbeat_interval = Some(value);
        self
    }

    pub fn worker_hostname(mut self, value: &str) -> Self {
        self.worker_hostname = Some(value.into());
        self
    }

    pub fn listen_channel(mut self, value: &str) -> Self {
        self.listen_channel = Some(value.into());
        self
    }

    pub fn shutdown_grace_period(mut self, value: Duration) -> Self {
        self.shutdown_grace_period = Some(value);
        self
    }
}

/// Random identity used when no worker hostname is configured.
pub(crate) fn random_worker_hostname() -> String {
    let mut random_bytes = [0u8; 9];
    rand::rng().fill_bytes(&mut random_bytes);
    format!("searchjobs_worker_{}", hex::encode(random_bytes))
}

/// Claims records from a [`WorkerStore`] and runs them through a [`Handler`].
pub struct Worker<R: Record, H: Handler<R>> {
    name: String,
    num_handlers: usize,
    interval: Duration,
    heartbeat_interval: Duration,
    worker_hostname: Arc<str>,
    listen_channel: Option<String>,
    shutdown_grace_period: Duration,
    pg_pool: PgPool,
    store: WorkerStore<R>,
    handler: Arc<H>,
    shutdown_signal: ShutdownSignal,
    /// Records currently held by this worker, with the token canceling their context
    running: Mutex<HashMap<i64, CancellationToken>>,
}

/// Why a handler invocation did not succeed.
#[derive(Error, Debug)]
enum RunRecordError {
    #[error("{0}")]
    Handler(#[from] SearchJobsError),
    #[error("Handler panicked: {0}")]
    Panic(#[from] tokio::task::JoinError),
    #[error("Handler did not return within the shutdown grace period")]
    Aborted,
}

impl<R: Record, H: Handler<R>> Worker<R, H> {
    pub fn new(
        pg_pool: PgPool,
        store: WorkerStore<R>,
        handler: H,
        options: WorkerOptions,
        shutdown_signal: ShutdownSignal,
    ) -> Self {
        let heartbeat_interval = options
            .heartbeat_interval
            .unwrap_or(Duration::from_secs(5));
        let stalled_max_age = *store.options().stalled_max_age();
        if stalled_max_age < heartbeat_interval * 3 {
            warn!(
                store = store.name(),
                stalled_max_age = ?stalled_max_age,
                heartbeat_interval = ?heartbeat_interval,
                "Stall threshold is shorter than three heartbeat intervals, healthy records may be reset"
            );
        }

        Worker {
            name: options
                .name
                .unwrap_or_else(|| store.name().to_string()),
            num_handlers: options.num_handlers.unwrap_or_else(num_cpus::get),
            interval: options.interval.unwrap_or(Duration::from_secs(1)),
            heartbeat_interval,
            worker_hostname: options
                .worker_hostname
                .unwrap_or_else(random_worker_hostname)
                .into(),
            listen_channel: options.listen_channel,
            shutdown_grace_period: options
                .shutdown_grace_period
                .unwrap_or(Duration::from_secs(5)),
            pg_pool,
            store,
            handler: Arc::new(handler),
            shutdown_signal,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker_hostname(&self) -> &str {
        &self.worker_hostname
    }

    pub fn store(&self) -> &WorkerStore<R> {
        &self.store
    }

    /// Ids of the records this worker currently holds.
    pub async fn running_ids(&self) -> Vec<i64> {
        self.running.lock().await.keys().copied().collect()
    }

    /// Runs until the shutdown signal resolves.
    ///
    /// Every poll tick or insert notification wakes up to `num_handlers` loops, each
    /// draining the queue until it is empty. Held records are heartbeated meanwhile.
    pub async fn run(&self) -> Result<()> {
        info!(
            worker = %self.name,
            worker_hostname = %self.worker_hostname,
            num_handlers = self.num_handlers,
            "Worker started"
        );

        let signals = record_signal_stream(
            &self.pg_pool,
            self.interval,
            self.listen_channel.as_deref(),
            self.shutdown_signal.clone(),
            self.num_handlers,
        )
        .await?;

        let runner = signals
            .map(Ok::<_, SearchJobsError>)
            .try_for_each_concurrent(self.num_handlers, |source| async move {
                self.drain(source).await;
                Ok(())
            });

        tokio::select! {
            res = runner => res?,
            _ = self.heartbeat_loop() => {},
        }

        info!(worker = %self.name, "Worker stopped");
        Ok(())
    }

    /// Processes every record currently available, then returns.
    pub async fn run_once(&self) -> Result<()> {
        let records = record_stream(
            self.store.clone(),
            self.worker_hostname.to_string(),
            self.shutdown_signal.clone(),
        );

        let processing = records.for_each_concurrent(self.num_handlers, |record| async move {
            self.process_record(record, StreamSource::RunOnce).await;
        });

        tokio::select! {
            _ = processing => {},
            _ = self.heartbeat_loop() => {},
        }

        Ok(())
    }

    async fn drain(&self, source: StreamSource) {
        loop {
            if self.shutdown_signal.peek().is_some() {
                return;
            }

            match self.store.dequeue(&self.worker_hostname).await {
                Ok(Some(record)) => self.process_record(record, source).await,
                Ok(None) => {
                    trace!(worker = %self.name, source = ?source, "Queue drained");
                    return;
                }
                Err(e) => {
                    error!(worker = %self.name, error = %e, "Could not dequeue record");
                    return;
                }
            }
        }
    }

    async fn heartbeat_loop(&self) {
        let mut interval = tokio::time::interval(self.heartbeat_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            interval.tick().await;
            if let Err(e) = self.heartbeat().await {
                error!(worker = %self.name, error = %e, "Failed to heartbeat held records");
            }
        }
    }

    /// Refreshes the heartbeat of every held record and cancels the context of the
    /// ones the store no longer knows about.
    pub async fn heartbeat(&self) -> Result<()> {
        let ids = self.running_ids().await;
        if ids.is_empty() {
            return Ok(());
        }

        let known_ids: HashSet<i64> = self
            .store
            .heartbeat(&ids, &self.worker_hostname)
            .await?
            .into_iter()
            .collect();

        let running = self.running.lock().await;
        for id in ids.into_iter().filter(|id| !known_ids.contains(id)) {
            if let Some(token) = running.get(&id) {
                warn!(worker = %self.name, job_id = id, "Record is no longer held by this worker, canceling its context");
                token.cancel();
            }
        }

        Ok(())
    }

    async fn process_record(&self, record: R, source: StreamSource) {
        let job_id = record.record_id();
        let token = CancellationToken::new();
        self.running.lock().await.insert(job_id, token.clone());
        debug!(worker = %self.name, job_id, source = ?source, "Processing record");

        let (result, interrupted) = self.run_handler(record, token).await;

        self.running.lock().await.remove(&job_id);

        if let Err(e) = self.release(job_id, result, interrupted).await {
            error!(worker = %self.name, job_id, error = %e, "Failed to release record");
        }
    }

    /// Runs the handler on its own task so that a panic is reported as an error.
    /// Returns whether the handler was interrupted by shutdown.
    async fn run_handler(
        &self,
        record: R,
        token: CancellationToken,
    ) -> (core::result::Result<(), RunRecordError>, bool) {
        let ctx = HandlerContext::new(
            token.clone(),
            self.worker_hostname.clone(),
            record.record_id(),
        );
        let handler = self.handler.clone();
        let mut task = tokio::spawn(async move { handler.handle(ctx, &record).await });

        tokio::select! {
            res = &mut task => (flatten(res), false),
            _ = self.shutdown_signal.clone() => {
                token.cancel();
                match tokio::time::timeout(self.shutdown_grace_period, &mut task).await {
                    Ok(res) => (flatten(res), true),
                    Err(_) => {
                        task.abort();
                        (Err(RunRecordError::Aborted), true)
                    }
                }
            }
        }
    }

    async fn release(
        &self,
        job_id: i64,
        result: core::result::Result<(), RunRecordError>,
        interrupted: bool,
    ) -> Result<()> {
        match result {
            Ok(()) => {
                if self.store.mark_complete(job_id, &self.worker_hostname).await? {
                    info!(worker = %self.name, job_id, "Completed record");
                } else {
                    debug!(worker = %self.name, job_id, "Completed record is no longer held by this worker");
                }
            }
            Err(e) if interrupted => {
                warn!(worker = %self.name, job_id, error = %e, "Record interrupted by shutdown, requeueing");
                self.store
                    .requeue(job_id, &self.worker_hostname, Utc::now())
                    .await?;
            }
            Err(e) => {
                let message = e.to_string();
                if self
                    .store
                    .mark_errored(job_id, &self.worker_hostname, &message)
                    .await?
                {
                    warn!(worker = %self.name, job_id, error = %message, "Record errored");
                } else {
                    debug!(worker = %self.name, job_id, error = %message, "Errored record is no longer held by this worker");
                }
            }
        }

        Ok(())
    }
}

fn flatten(
    res: core::result::Result<Result<()>, tokio::task::JoinError>,
) -> core::result::Result<(), RunRecordError> {
    match res {
        Err(e) => Err(RunRecordError::Panic(e)),
        Ok(Err(e)) => Err(RunRecordError::Handler(e)),
        Ok(Ok(())) => Ok(()),
    }
}
