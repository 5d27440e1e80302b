//! Last-resort funnel for sync task outcomes.
//!
//! Every sync task the executor spawns runs through
//! [`SyncExceptionHandler::run`]. Cancellation is routed to
//! `on_cancellation` and swallowed; typed failures go to `on_failure`; panics
//! and other untyped errors become [`CoreFailure::Unknown`].

use convsync_types::CoreFailure;
use std::future::Future;
use std::sync::Arc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::error::SyncError;

type CancellationCallback = Arc<dyn Fn() + Send + Sync>;
type FailureCallback = Arc<dyn Fn(CoreFailure) + Send + Sync>;

/// How a supervised task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The task returned `Ok`.
    Finished,
    /// The task was cancelled.
    Cancelled,
    /// The task failed or panicked.
    Failed(CoreFailure),
}

/// Routes task outcomes to two callbacks.
#[derive(Clone)]
pub struct SyncExceptionHandler {
    on_cancellation: CancellationCallback,
    on_failure: FailureCallback,
}

impl SyncExceptionHandler {
    /// Create a handler from the two callbacks.
    pub fn new(
        on_cancellation: impl Fn() + Send + Sync + 'static,
        on_failure: impl Fn(CoreFailure) + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_cancellation: Arc::new(on_cancellation),
            on_failure: Arc::new(on_failure),
        }
    }

    /// A handler that only logs.
    pub fn logging(task: &'static str) -> Self {
        Self::new(
            move || tracing::debug!(task, "sync task cancelled"),
            move |cause| tracing::error!(task, %cause, "sync task failed"),
        )
    }

    /// Classify a task result and invoke the matching callback.
    pub fn handle(&self, result: Result<(), SyncError>) -> TaskOutcome {
        let Err(error) = result else {
            return TaskOutcome::Finished;
        };
        match error.into_failure() {
            None => {
                (self.on_cancellation)();
                TaskOutcome::Cancelled
            }
            Some(cause) => {
                (self.on_failure)(cause.clone());
                TaskOutcome::Failed(cause)
            }
        }
    }

    /// Classify the outcome of a joined task.
    pub fn handle_join(&self, joined: Result<Result<(), SyncError>, JoinError>) -> TaskOutcome {
        self.handle(joined.unwrap_or_else(|e| Err(join_error(e))))
    }

    /// Run `task` on its own Tokio task until it finishes or `token` is
    /// cancelled, funnel the outcome through this handler and return it.
    ///
    /// Resolves only after the task future has been dropped.
    pub async fn run<F>(&self, name: &'static str, token: CancellationToken, task: F) -> TaskOutcome
    where
        F: Future<Output = Result<(), SyncError>> + Send + 'static,
    {
        let inner = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => Err(SyncError::Cancelled),
                result = task => result,
            }
        });
        let joined = inner.await;
        tracing::trace!(task = name, "sync task finished");
        self.handle_join(joined)
    }

    /// Spawn [`SyncExceptionHandler::run`] in the background.
    pub fn spawn<F>(&self, name: &'static str, token: CancellationToken, task: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<(), SyncError>> + Send + 'static,
    {
        let handler = self.clone();
        tokio::spawn(async move {
            handler.run(name, token, task).await;
        })
    }
}

fn join_error(error: JoinError) -> SyncError {
    if error.is_cancelled() {
        return SyncError::Cancelled;
    }
    match error.try_into_panic() {
        Ok(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            SyncError::Panicked(message)
        }
        Err(other) => SyncError::Internal(other.to_string()),
    }
}

/// Convert a joined task result into a [`SyncError`] result.
pub(crate) fn flatten_join<T>(
    joined: Result<Result<T, CoreFailure>, JoinError>,
) -> Result<T, SyncError> {
    match joined {
        Ok(result) => result.map_err(SyncError::from),
        Err(e) => Err(join_error(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorded {
        cancellations: usize,
        failures: Vec<CoreFailure>,
    }

    fn recording_handler() -> (SyncExceptionHandler, Arc<Mutex<Recorded>>) {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let on_cancel = recorded.clone();
        let on_fail = recorded.clone();
        let handler = SyncExceptionHandler::new(
            move || on_cancel.lock().unwrap().cancellations += 1,
            move |cause| on_fail.lock().unwrap().failures.push(cause),
        );
        (handler, recorded)
    }

    #[tokio::test]
    async fn success_invokes_nothing() {
        let (handler, recorded) = recording_handler();
        handler.handle(Ok(()));
        let recorded = recorded.lock().unwrap();
        assert_eq!(recorded.cancellations, 0);
        assert!(recorded.failures.is_empty());
    }

    #[tokio::test]
    async fn typed_failure_goes_to_on_failure() {
        let (handler, recorded) = recording_handler();
        handler.handle(Err(SyncError::failure("step", CoreFailure::SessionExpired)));
        assert_eq!(
            recorded.lock().unwrap().failures,
            vec![CoreFailure::SessionExpired]
        );
    }

    #[tokio::test]
    async fn cancellation_goes_to_on_cancellation() {
        let (handler, recorded) = recording_handler();
        let token = CancellationToken::new();

        let handle = handler.spawn("test", token.clone(), async {
            futures_util::future::pending::<()>().await;
            Ok(())
        });
        token.cancel();
        handle.await.unwrap();

        let recorded = recorded.lock().unwrap();
        assert_eq!(recorded.cancellations, 1);
        assert!(recorded.failures.is_empty());
    }

    #[tokio::test]
    async fn panic_becomes_unknown_failure() {
        let (handler, recorded) = recording_handler();

        let handle = handler.spawn("test", CancellationToken::new(), async {
            if true {
                panic!("receiver exploded");
            }
            Ok(())
        });
        handle.await.unwrap();

        let failures = recorded.lock().unwrap().failures.clone();
        assert_eq!(failures.len(), 1);
        assert!(matches!(&failures[0], CoreFailure::Unknown(m) if m.contains("receiver exploded")));
    }

    #[tokio::test]
    async fn internal_error_becomes_unknown_failure() {
        let (handler, recorded) = recording_handler();
        handler.handle(Err(SyncError::Internal("store gone".into())));
        assert_eq!(
            recorded.lock().unwrap().failures,
            vec![CoreFailure::Unknown("store gone".into())]
        );
    }

    #[tokio::test]
    async fn run_returns_the_outcome() {
        let (handler, _) = recording_handler();

        let finished = handler.run("test", CancellationToken::new(), async { Ok(()) }).await;
        let failed = handler
            .run("test", CancellationToken::new(), async {
                Err(SyncError::failure("step", CoreFailure::SessionExpired))
            })
            .await;
        let token = CancellationToken::new();
        token.cancel();
        let cancelled = handler
            .run("test", token, futures_util::future::pending())
            .await;

        assert_eq!(finished, TaskOutcome::Finished);
        assert_eq!(failed, TaskOutcome::Failed(CoreFailure::SessionExpired));
        assert_eq!(cancelled, TaskOutcome::Cancelled);
    }
}
