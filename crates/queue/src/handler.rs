//! Handler abstraction and isolated handler invocation.
//!
//! Every component runs user handlers through [`invoke`], which spawns the
//! handler on its own task so a panic is caught by the runtime instead of
//! unwinding through the worker loop, and bounds it by a deadline and by the
//! owning component's shutdown signal.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;

use crate::lifecycle::ShutdownListener;

/// Error type returned by handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result type returned by handlers.
pub type HandlerResult = Result<(), HandlerError>;

/// Consumer of queue items.
///
/// Implemented for any `Fn(T) -> impl Future<Output = HandlerResult>`, so
/// plain async closures can be registered directly.
#[async_trait]
pub trait Handler<T>: Send + Sync {
    /// Process one item.
    async fn handle(&self, item: T) -> HandlerResult;
}

#[async_trait]
impl<T, F, Fut> Handler<T> for F
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, item: T) -> HandlerResult {
        (self)(item).await
    }
}

/// Shared handler reference as stored in registries.
pub type SharedHandler<T> = Arc<dyn Handler<T>>;

/// How a single handler invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    Completed,
    Failed(String),
    Panicked(String),
    TimedOut(Duration),
    /// The owning component shut down while the handler ran.
    Cancelled,
}

impl Outcome {
    pub(crate) const fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Error text recorded with failed items.
    pub(crate) fn error_text(&self) -> Option<String> {
        match self {
            Self::Completed => None,
            Self::Failed(err) => Some(err.clone()),
            Self::Panicked(msg) => Some(format!("handler panicked: {msg}")),
            Self::TimedOut(after) => Some(format!("handler timed out after {after:?}")),
            Self::Cancelled => Some("handler cancelled".to_string()),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Run `handler` on `item` in its own task, bounded by `timeout` and `cancelled`.
pub(crate) async fn invoke<T: Send + 'static>(
    handler: SharedHandler<T>,
    item: T,
    timeout: Duration,
    cancelled: impl Future<Output = ()> + Send,
) -> Outcome {
    let mut task = tokio::spawn(async move { handler.handle(item).await });

    tokio::select! {
        joined = tokio::time::timeout(timeout, &mut task) => match joined {
            Ok(Ok(Ok(()))) => Outcome::Completed,
            Ok(Ok(Err(err))) => Outcome::Failed(err.to_string()),
            Ok(Err(join_err)) if join_err.is_panic() => {
                Outcome::Panicked(panic_message(join_err.into_panic().as_ref()))
            }
            Ok(Err(_)) => Outcome::Cancelled,
            Err(_) => {
                task.abort();
                Outcome::TimedOut(timeout)
            }
        },
        () = cancelled => {
            task.abort();
            Outcome::Cancelled
        }
    }
}

/// Tally of a fan-out delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct FanOut {
    pub succeeded: u64,
    pub failed: u64,
}

/// Deliver `item` to every handler concurrently and wait for all of them.
pub(crate) async fn fan_out<T: Clone + Send + 'static>(
    handlers: Vec<SharedHandler<T>>,
    item: &T,
    timeout: Duration,
    shutdown: &ShutdownListener,
) -> (FanOut, Vec<Outcome>) {
    let runs = handlers
        .into_iter()
        .map(|handler| invoke(handler, item.clone(), timeout, shutdown.cancelled()));
    let outcomes = join_all(runs).await;

    let mut tally = FanOut::default();
    for outcome in &outcomes {
        if outcome.is_success() {
            tally.succeeded += 1;
        } else {
            tally.failed += 1;
        }
    }
    (tally, outcomes)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::lifecycle::WorkerPool;

    fn never() -> impl Future<Output = ()> + Send {
        std::future::pending()
    }

    #[tokio::test]
    async fn test_closure_handler_completes() {
        let hits = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&hits);
        let handler: SharedHandler<u32> = Arc::new(move |n: u32| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(n, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        });

        let outcome = invoke(handler, 5, Duration::from_secs(1), never()).await;
        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(hits.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_error_is_reported() {
        let handler: SharedHandler<()> =
            Arc::new(|()| async { Err::<(), HandlerError>("transcoder offline".into()) });

        let outcome = invoke(handler, (), Duration::from_secs(1), never()).await;
        assert_eq!(outcome, Outcome::Failed("transcoder offline".to_string()));
        assert_eq!(outcome.error_text().unwrap(), "transcoder offline");
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let handler: SharedHandler<()> = Arc::new(|()| async {
            panic!("decoder exploded");
            #[allow(unreachable_code)]
            Ok::<(), HandlerError>(())
        });

        let outcome = invoke(handler, (), Duration::from_secs(1), never()).await;
        assert_eq!(outcome, Outcome::Panicked("decoder exploded".to_string()));
    }

    #[tokio::test]
    async fn test_timeout_aborts_handler() {
        let handler: SharedHandler<()> = Arc::new(|()| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<(), HandlerError>(())
        });

        let outcome = invoke(handler, (), Duration::from_millis(20), never()).await;
        assert!(matches!(outcome, Outcome::TimedOut(_)));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_handler() {
        let pool = WorkerPool::new("test");
        assert!(pool.begin());
        let listener = pool.listener();
        let handler: SharedHandler<()> = Arc::new(|()| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<(), HandlerError>(())
        });

        let run = tokio::spawn(async move {
            invoke(handler, (), Duration::from_secs(60), listener.cancelled()).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.shutdown().await;

        assert_eq!(run.await.unwrap(), Outcome::Cancelled);
    }

    #[tokio::test]
    async fn test_fan_out_counts_each_handler() {
        let pool = WorkerPool::new("test");
        assert!(pool.begin());
        let ok: SharedHandler<String> = Arc::new(|_: String| async { Ok::<(), HandlerError>(()) });
        let bad: SharedHandler<String> =
            Arc::new(|_: String| async { Err::<(), HandlerError>("nope".into()) });

        let (tally, outcomes) = fan_out(
            vec![Arc::clone(&ok), bad, ok],
            &"meeting.created".to_string(),
            Duration::from_secs(1),
            &pool.listener(),
        )
        .await;

        assert_eq!(tally, FanOut { succeeded: 2, failed: 1 });
        assert_eq!(outcomes.len(), 3);
    }
}
