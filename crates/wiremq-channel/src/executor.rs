//! Pluggable executors for completion callbacks.
//!
//! The engine owns no worker pools. Callers that want a callback or a chain
//! stage to run somewhere specific hand in an [`Executor`]; callbacks with
//! no executor run inline on whichever task resolved the RPC.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// A unit of work handed to an executor.
pub type ExecutorTask = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Where completion callbacks and chain stages run.
pub trait Executor: fmt::Debug + Send + Sync {
    /// Spawns a task. Implementations must not block the caller.
    fn spawn(&self, task: ExecutorTask);
}

/// An [`Executor`] backed by a tokio runtime handle.
#[derive(Debug, Clone)]
pub struct TokioExecutor {
    handle: tokio::runtime::Handle,
}

impl TokioExecutor {
    /// Wraps an explicit runtime handle.
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        TokioExecutor { handle }
    }

    /// Captures the ambient runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime context.
    pub fn current() -> Self {
        TokioExecutor {
            handle: tokio::runtime::Handle::current(),
        }
    }
}

impl Executor for TokioExecutor {
    fn spawn(&self, task: ExecutorTask) {
        self.handle.spawn(task);
    }
}
