//! Worker lifecycle: start/stop state, shutdown signalling and join-on-stop.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

/// Read side of a component's shutdown signal.
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested or the owning component is dropped.
    pub fn cancelled(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.rx.clone();
        async move {
            let _ = rx.wait_for(|stopping| *stopping).await;
        }
    }
}

/// Background tasks owned by one component.
///
/// `shutdown` signals every listener and then joins all spawned tasks, so
/// it returns only after the component's workers have exited.
#[derive(Debug)]
pub(crate) struct WorkerPool {
    name: &'static str,
    signal: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl WorkerPool {
    pub(crate) fn new(name: &'static str) -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            name,
            signal,
            workers: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    pub(crate) fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.signal.subscribe(),
        }
    }

    /// Transition to running. Returns `false` if already running.
    pub(crate) fn begin(&self) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.signal.send_replace(false);
        true
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) async fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        self.workers.lock().await.push(handle);
    }

    /// Signal shutdown and wait for every worker. Returns `false` if not running.
    pub(crate) async fn shutdown(&self) -> bool {
        if !self.running.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.signal.send_replace(true);

        let handles = std::mem::take(&mut *self.workers.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    tracing::error!(component = self.name, "Worker task panicked");
                }
            }
        }
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_begin_is_idempotent() {
        let pool = WorkerPool::new("test");
        assert!(pool.begin());
        assert!(!pool.begin());
        assert!(pool.is_running());
        assert!(pool.shutdown().await);
        assert!(!pool.shutdown().await);
        assert!(!pool.is_running());
    }

    #[tokio::test]
    async fn test_shutdown_joins_workers() {
        let pool = WorkerPool::new("test");
        pool.begin();
        let exited = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let listener = pool.listener();
            let exited = Arc::clone(&exited);
            pool.spawn(async move {
                listener.cancelled().await;
                tokio::time::sleep(Duration::from_millis(10)).await;
                exited.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        }

        pool.shutdown().await;
        assert_eq!(exited.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_restart_clears_signal() {
        let pool = WorkerPool::new("test");
        pool.begin();
        pool.shutdown().await;
        assert!(pool.listener().is_shutdown());

        pool.begin();
        assert!(!pool.listener().is_shutdown());
        pool.shutdown().await;
    }
}
