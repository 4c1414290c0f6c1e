//! Caller-side handle for an in-flight RPC.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use wiremq_protocol::Method;

use crate::channel::Channel;
use crate::completion::{CompletionCell, RpcResult};
use crate::error::{ChannelError, Result};
use crate::executor::Executor;

/// Handle to an RPC whose reply has not necessarily arrived yet.
///
/// Cloning is cheap; every clone observes the same underlying result.
#[derive(Debug, Clone)]
pub struct RpcHandle {
    channel: Channel,
    cell: Arc<CompletionCell>,
}

impl RpcHandle {
    pub(crate) fn new(channel: Channel, cell: Arc<CompletionCell>) -> Self {
        RpcHandle { channel, cell }
    }

    /// Waits for the reply, unbounded. Channel teardown resolves every
    /// outstanding handle, so this cannot outlive the channel.
    pub async fn wait(&self) -> Result<Method> {
        self.cell.wait().await
    }

    /// Bounded wait. On timeout the RPC keeps its correlation slot: a late
    /// reply still consumes it (resolving this handle), which keeps reply
    /// order intact for every later request of the same kind.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<Method> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Non-blocking poll of the result.
    pub fn try_result(&self) -> Option<RpcResult> {
        self.cell.try_result()
    }

    /// True once a reply or failure is in.
    pub fn is_resolved(&self) -> bool {
        self.cell.is_resolved()
    }

    /// Runs `f` with the result once it arrives (immediately if already
    /// resolved). Without a submission-time executor the callback runs
    /// inline on the resolving task, usually the connection reader, and
    /// must not block.
    pub fn on_complete<F>(&self, f: F)
    where
        F: FnOnce(RpcResult) + Send + 'static,
    {
        self.cell.add_continuation(None, f);
    }

    /// Runs `f` with the result on `executor` once it arrives.
    pub fn on_complete_on<F>(&self, executor: Arc<dyn Executor>, f: F)
    where
        F: FnOnce(RpcResult) + Send + 'static,
    {
        self.cell.add_continuation(Some(executor), f);
    }

    /// Chains a dependent RPC. When this one resolves successfully, `next`
    /// maps the reply to the follow-up request, which is submitted on the
    /// same channel; the returned handle resolves with the follow-up's
    /// reply. The first failure short-circuits: `next` never runs after a
    /// failure and the returned handle carries that first error. The new
    /// handle inherits this one's default executor.
    pub fn then_rpc<F>(&self, next: F) -> RpcHandle
    where
        F: FnOnce(Method) -> Result<Method> + Send + 'static,
    {
        self.chain(None, next)
    }

    /// Like [`then_rpc`], with the stage itself running on `executor`.
    ///
    /// [`then_rpc`]: RpcHandle::then_rpc
    pub fn then_rpc_on<F>(&self, executor: Arc<dyn Executor>, next: F) -> RpcHandle
    where
        F: FnOnce(Method) -> Result<Method> + Send + 'static,
    {
        self.chain(Some(executor), next)
    }

    fn chain<F>(&self, executor: Option<Arc<dyn Executor>>, next: F) -> RpcHandle
    where
        F: FnOnce(Method) -> Result<Method> + Send + 'static,
    {
        let stage_default = executor.clone().or_else(|| self.cell.default_executor());
        let stage_cell = Arc::new(CompletionCell::new(stage_default));
        let channel = self.channel.clone();
        let stage = stage_cell.clone();
        self.cell.add_continuation(executor, move |result| {
            let reply = match result {
                Ok(reply) => reply,
                Err(error) => {
                    stage.resolve(Err(error));
                    return;
                }
            };
            let request = match std::panic::catch_unwind(AssertUnwindSafe(|| next(reply))) {
                Ok(Ok(request)) => request,
                Ok(Err(error)) => {
                    stage.resolve(Err(error));
                    return;
                }
                Err(_) => {
                    stage.resolve(Err(ChannelError::usage("chained stage panicked")));
                    return;
                }
            };
            if let Err(error) = channel.submit_with_cell(request, stage.clone()) {
                stage.resolve(Err(error));
            }
        });
        RpcHandle::new(self.channel.clone(), stage_cell)
    }
}
