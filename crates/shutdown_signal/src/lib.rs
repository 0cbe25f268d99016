use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use cfg_if::cfg_if;
use futures::future::{pending, Shared};
use futures::FutureExt;
use tokio::select;
use tokio::sync::Notify;
use tracing::{error, info};

cfg_if! {
    if #[cfg(windows)] {
        use tokio::signal::windows::*;

        async fn raw_shutdown_signal() {
            let listeners = (ctrl_c(), ctrl_close(), ctrl_shutdown(), ctrl_logoff());
            let (Ok(mut ctrl_c), Ok(mut ctrl_close), Ok(mut ctrl_shutdown), Ok(mut ctrl_logoff)) = listeners else {
                error!("Failed to attach windows console shutdown signals");
                return pending().await;
            };
            select! {
                _ = ctrl_c.recv() => (),
                _ = ctrl_close.recv() => (),
                _ = ctrl_shutdown.recv() => (),
                _ = ctrl_logoff.recv() => (),
            }
        }
    } else if #[cfg(unix)] {
        use tokio::signal::unix::*;

        async fn unix_shutdown_signal(signal_kind: SignalKind) {
            match signal(signal_kind) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!(error = %e, signal = ?signal_kind, "Failed to listen to unix shutdown signal");
                    pending::<()>().await;
                }
            }
        }

        async fn raw_shutdown_signal() {
            select! {
                _ = unix_shutdown_signal(SignalKind::interrupt()) => (),
                _ = unix_shutdown_signal(SignalKind::terminate()) => (),
                _ = unix_shutdown_signal(SignalKind::hangup()) => (),
            };
        }
    } else {
        compile_error!("Your OS does not support shutdown signal ! Are you targeting wasm ?");
    }
}

pub type ShutdownSignal = Shared<Pin<Box<dyn Future<Output = ()> + Send>>>;

/// Resolves once the process receives a termination signal.
pub fn shutdown_signal() -> ShutdownSignal {
    async {
        raw_shutdown_signal().await;
        info!("Shutdown signal detected. Attempting graceful shutdown...");
    }
    .boxed()
    .shared()
}

/// Requests a shutdown from inside the process.
///
/// Every [`ShutdownSignal`] obtained from [`ShutdownHandle::signal`] resolves after
/// [`ShutdownHandle::request`] was called, including signals created afterwards.
#[derive(Clone, Debug, Default)]
pub struct ShutdownHandle {
    inner: Arc<ShutdownInner>,
}

#[derive(Debug, Default)]
struct ShutdownInner {
    notify: Notify,
    requested: std::sync::atomic::AtomicBool,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        use std::sync::atomic::Ordering;

        if !self.inner.requested.swap(true, Ordering::SeqCst) {
            info!("Shutdown requested. Attempting graceful shutdown...");
        }
        self.inner.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.inner
            .requested
            .load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Signal resolving on [`Self::request`] only.
    pub fn signal(&self) -> ShutdownSignal {
        let inner = self.inner.clone();
        async move { wait_requested(&inner).await }.boxed().shared()
    }

    /// Signal resolving on [`Self::request`] or on a termination signal.
    pub fn signal_with_os(&self) -> ShutdownSignal {
        let inner = self.inner.clone();
        async move {
            select! {
                _ = wait_requested(&inner) => (),
                _ = shutdown_signal() => (),
            }
        }
        .boxed()
        .shared()
    }
}

async fn wait_requested(inner: &ShutdownInner) {
    use std::sync::atomic::Ordering;

    loop {
        let notified = inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent request is not missed.
        notified.as_mut().enable();
        if inner.requested.load(Ordering::SeqCst) {
            return;
        }
        notified.await;
    }
}
