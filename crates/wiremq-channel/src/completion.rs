//! Single-assignment completion cells for in-flight RPCs.
//!
//! A cell is the rendezvous between the reader task that resolves an RPC and
//! the callers that await it. Resolution is first-wins and sticky: the first
//! result (reply or failure) is the one every waiter and continuation sees,
//! later resolution attempts are no-ops. Continuations attached before the
//! result run at resolution time; continuations attached after run
//! immediately. Either way each runs exactly once, on its own executor if one
//! was given, else on the cell's default executor, else inline on the
//! resolving task.
//!
//! Inline continuations execute on whichever task resolved the cell. When
//! replies come off a connection reader, that is the reader task itself, so
//! inline continuations must not block or every channel on the connection
//! stalls. Pass an executor for anything heavier than a result hand-off.

use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use wiremq_protocol::Method;

use crate::error::Result;
use crate::executor::Executor;

/// Outcome of one RPC: the reply method, or the failure that ended it.
pub type RpcResult = Result<Method>;

struct Continuation {
    executor: Option<Arc<dyn Executor>>,
    run: Box<dyn FnOnce(RpcResult) + Send>,
}

enum CellState {
    Pending(Vec<Continuation>),
    Resolved(RpcResult),
}

/// Single-assignment result cell shared between resolver and observers.
pub struct CompletionCell {
    state: Mutex<CellState>,
    resolved: Notify,
    default_executor: Option<Arc<dyn Executor>>,
}

impl CompletionCell {
    /// Creates an unresolved cell. Continuations attached without their own
    /// executor run on `default_executor`, or inline when that is `None`.
    pub fn new(default_executor: Option<Arc<dyn Executor>>) -> Self {
        CompletionCell {
            state: Mutex::new(CellState::Pending(Vec::new())),
            resolved: Notify::new(),
            default_executor,
        }
    }

    /// Resolves the cell. The first resolution wins; later calls are no-ops.
    ///
    /// Continuations attached so far are dispatched after the lock is
    /// released, so a continuation may safely attach further work or resolve
    /// other cells.
    pub fn resolve(&self, result: RpcResult) {
        let continuations = {
            let mut state = self.state.lock().unwrap();
            match &mut *state {
                CellState::Resolved(_) => return,
                CellState::Pending(continuations) => {
                    let continuations = std::mem::take(continuations);
                    *state = CellState::Resolved(result.clone());
                    continuations
                }
            }
        };
        self.resolved.notify_waiters();
        for continuation in continuations {
            self.dispatch(continuation, result.clone());
        }
    }

    /// The executor continuations fall back to when given none.
    pub fn default_executor(&self) -> Option<Arc<dyn Executor>> {
        self.default_executor.clone()
    }

    /// Non-blocking poll of the result.
    pub fn try_result(&self) -> Option<RpcResult> {
        match &*self.state.lock().unwrap() {
            CellState::Resolved(result) => Some(result.clone()),
            CellState::Pending(_) => None,
        }
    }

    /// True once the cell has been resolved.
    pub fn is_resolved(&self) -> bool {
        self.try_result().is_some()
    }

    /// Waits until the cell resolves and returns the result.
    pub async fn wait(&self) -> RpcResult {
        loop {
            let notified = self.resolved.notified();
            tokio::pin!(notified);
            // Arm the notification before checking state so a resolve that
            // lands between the check and the await is not lost.
            notified.as_mut().enable();
            if let Some(result) = self.try_result() {
                return result;
            }
            notified.await;
        }
    }

    /// Attaches a continuation, to run exactly once with the cell's result.
    ///
    /// With `executor: None` the continuation runs inline on the resolving
    /// task (often the connection reader) and must not block; see the module
    /// docs. If the cell is already resolved the continuation runs before
    /// this call returns, on the calling task when no executor applies.
    pub fn add_continuation(
        &self,
        executor: Option<Arc<dyn Executor>>,
        run: impl FnOnce(RpcResult) + Send + 'static,
    ) {
        let continuation = Continuation {
            executor,
            run: Box::new(run),
        };
        let already = {
            let mut state = self.state.lock().unwrap();
            match &mut *state {
                CellState::Pending(continuations) => {
                    continuations.push(continuation);
                    None
                }
                CellState::Resolved(result) => Some((continuation, result.clone())),
            }
        };
        if let Some((continuation, result)) = already {
            self.dispatch(continuation, result);
        }
    }

    fn dispatch(&self, continuation: Continuation, result: RpcResult) {
        let executor = continuation
            .executor
            .or_else(|| self.default_executor.clone());
        match executor {
            Some(executor) => {
                let run = continuation.run;
                executor.spawn(Box::pin(async move { run(result) }));
            }
            None => (continuation.run)(result),
        }
    }
}

impl fmt::Debug for CompletionCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.state.lock().unwrap() {
            CellState::Pending(continuations) => {
                format!("pending ({} continuations)", continuations.len())
            }
            CellState::Resolved(Ok(_)) => "resolved (ok)".to_string(),
            CellState::Resolved(Err(_)) => "resolved (err)".to_string(),
        };
        f.debug_struct("CompletionCell")
            .field("state", &state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChannelError;
    use crate::executor::TokioExecutor;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn reply() -> Method {
        Method::QueueBindOk
    }

    #[tokio::test]
    async fn test_wait_after_resolve() {
        let cell = CompletionCell::new(None);
        cell.resolve(Ok(reply()));
        assert!(cell.is_resolved());
        assert_eq!(cell.wait().await, Ok(reply()));
    }

    #[tokio::test]
    async fn test_wait_before_resolve() {
        let cell = Arc::new(CompletionCell::new(None));
        let waiter = {
            let cell = cell.clone();
            tokio::spawn(async move { cell.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cell.resolve(Ok(reply()));
        assert_eq!(waiter.await.unwrap(), Ok(reply()));
    }

    #[tokio::test]
    async fn test_first_resolution_wins() {
        let cell = CompletionCell::new(None);
        cell.resolve(Ok(reply()));
        cell.resolve(Err(ChannelError::closed("late")));
        assert_eq!(cell.try_result(), Some(Ok(reply())));
    }

    #[tokio::test]
    async fn test_continuation_runs_on_resolve() {
        let cell = CompletionCell::new(None);
        let hits = Arc::new(AtomicU32::new(0));
        let seen = hits.clone();
        cell.add_continuation(None, move |result| {
            assert_eq!(result, Ok(Method::QueueBindOk));
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        cell.resolve(Ok(reply()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_continuation_after_resolve_runs_immediately() {
        let cell = CompletionCell::new(None);
        cell.resolve(Err(ChannelError::closed("gone")));
        let hits = Arc::new(AtomicU32::new(0));
        let seen = hits.clone();
        cell.add_continuation(None, move |result| {
            assert!(result.is_err());
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_continuation_on_executor() {
        let cell = CompletionCell::new(None);
        let (tx, rx) = tokio::sync::oneshot::channel();
        let executor: Arc<dyn Executor> = Arc::new(TokioExecutor::current());
        cell.add_continuation(Some(executor), move |result| {
            let _ = tx.send(result);
        });
        cell.resolve(Ok(reply()));
        assert_eq!(rx.await.unwrap(), Ok(reply()));
    }

    #[tokio::test]
    async fn test_default_executor_applies() {
        let executor: Arc<dyn Executor> = Arc::new(TokioExecutor::current());
        let cell = CompletionCell::new(Some(executor));
        let (tx, rx) = tokio::sync::oneshot::channel();
        cell.add_continuation(None, move |result| {
            let _ = tx.send(result);
        });
        cell.resolve(Ok(reply()));
        assert_eq!(rx.await.unwrap(), Ok(reply()));
    }
}
