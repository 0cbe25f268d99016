use std::time::Duration;

use searchjobs_job::Record;
use searchjobs_shutdown_signal::ShutdownSignal;
use tracing::{debug, error, info, warn};

use super::store::{ResetStalledOutcome, WorkerStore};
use crate::errors::Result;

#[derive(Default, Clone, Debug)]
pub struct ResetterOptions {
    /// Used in logs. Defaults to the store name.
    name: Option<String>,
    /// Interval between scans. Defaults to 30 seconds.
    interval: Option<Duration>,
}

impl ResetterOptions {
    pub fn name(mut self, value: &str) -> Self {
        self.name = Some(value.into());
        self
    }

    /// # Panics
    /// Panics if the value is zero.
    pub fn interval(mut self, value: Duration) -> Self {
        assert!(!value.is_zero(), "resetter interval must be greater than 0");
        self.interval = Some(value);
        self
    }
}

/// Periodically returns stalled records to the queue.
pub struct Resetter<R: Record> {
    name: String,
    interval: Duration,
    store: WorkerStore<R>,
    shutdown_signal: ShutdownSignal,
}

impl<R: Record> Resetter<R> {
    pub fn new(store: WorkerStore<R>, options: ResetterOptions, shutdown_signal: ShutdownSignal) -> Self {
        Resetter {
            name: options
                .name
                .unwrap_or_else(|| format!("{}_resetter", store.name())),
            interval: options.interval.unwrap_or(Duration::from_secs(30)),
            store,
            shutdown_signal,
        }
    }

    /// Runs until the shutdown signal resolves. Scan failures are logged and retried
    /// on the next tick.
    pub async fn run(&self) -> Result<()> {
        info!(resetter = %self.name, interval = ?self.interval, "Resetter started");
        let mut interval = tokio::time::interval(self.interval);
        let mut shutdown_signal = self.shutdown_signal.clone();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.reset_once().await {
                        error!(resetter = %self.name, error = %e, "Failed to reset stalled records");
                    }
                },
                _ = &mut shutdown_signal => break,
            }
        }

        info!(resetter = %self.name, "Resetter stopped");
        Ok(())
    }

    pub async fn reset_once(&self) -> Result<ResetStalledOutcome> {
        let outcome = self.store.reset_stalled().await?;

        for (job_id, age) in &outcome.reset {
            warn!(resetter = %self.name, job_id, heartbeat_age = ?age, "Reset stalled record");
        }
        for (job_id, age) in &outcome.failed {
            warn!(resetter = %self.name, job_id, heartbeat_age = ?age, "Failed stalled record after too many resets");
        }
        debug!(
            resetter = %self.name,
            reset = outcome.reset.len(),
            failed = outcome.failed.len(),
            "Scanned for stalled records"
        );

        Ok(outcome)
    }
}
