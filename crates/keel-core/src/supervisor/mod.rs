//! Lifecycle supervisor (§4.G): two LIFO registries of teardown closures,
//! `stoppers` (cooperative) and `aborters` (forced). Grounded on
//! `gator-cli::dispatch_cmd::run_dispatch`'s `CancellationToken` + bounded
//! drain-loop teardown discipline, generalized into a registrable, named
//! pair of registries per the spec's "breaking cyclic ownership by borrowed
//! capability" design note.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

type Handler = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send>;

/// Owns the operation's cancellation context and the two teardown
/// registries. Handlers are appended during phase setup (start-agent adds
/// an aborter that stops the agent; operation-complete adds a stopper) and
/// run in reverse registration order at teardown. Both `stop()` and
/// `abort()` are idempotent and may run concurrently with in-flight
/// `ExecutePlan` calls; the `cancel` token is shared with the plan engine.
pub struct LifecycleSupervisor {
    cancel: CancellationToken,
    stoppers: Vec<Handler>,
    aborters: Vec<Handler>,
    shutdown_timeout: Duration,
    torn_down: bool,
}

/// Errors collected from a LIFO teardown pass. Individual handler failures
/// never short-circuit the remaining handlers; they're aggregated here.
#[derive(Debug, Default)]
pub struct TeardownErrors(pub Vec<anyhow::Error>);

impl TeardownErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for TeardownErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return write!(f, "no teardown errors");
        }
        writeln!(f, "{} teardown error(s):", self.0.len())?;
        for e in &self.0 {
            writeln!(f, "  - {e}")?;
        }
        Ok(())
    }
}

impl LifecycleSupervisor {
    pub fn new(cancel: CancellationToken, shutdown_timeout: Duration) -> Self {
        Self {
            cancel,
            stoppers: Vec::new(),
            aborters: Vec::new(),
            shutdown_timeout,
            torn_down: false,
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Register a cooperative-shutdown handler, run on the `stop` path.
    /// Append-only during operation setup per §5's concurrency notes.
    pub fn add_stopper<F, Fut>(&mut self, handler: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.stoppers.push(Box::new(move || Box::pin(handler())));
    }

    /// Register a forced-teardown handler, run on the `abort` path.
    pub fn add_aborter<F, Fut>(&mut self, handler: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.aborters.push(Box::new(move || Box::pin(handler())));
    }

    /// Cooperative shutdown after successful completion: cancel the
    /// internal context, then run `stoppers` LIFO within
    /// `shutdown_timeout`. Idempotent -- a second call is a no-op.
    pub async fn stop(&mut self) -> TeardownErrors {
        if self.torn_down {
            return TeardownErrors::default();
        }
        self.torn_down = true;
        self.cancel.cancel();
        run_lifo(&mut self.stoppers, self.shutdown_timeout).await
    }

    /// Forced tear-down on failure: cancel the internal context, then run
    /// `aborters` LIFO regardless of individual failures, aggregating all
    /// errors. Idempotent, and may be called even after `stop()` has
    /// already run -- abort overrides stop per §5.
    pub async fn abort(&mut self) -> TeardownErrors {
        self.cancel.cancel();
        run_lifo(&mut self.aborters, self.shutdown_timeout).await
    }
}

async fn run_lifo(handlers: &mut Vec<Handler>, timeout: Duration) -> TeardownErrors {
    let mut errors = Vec::new();
    while let Some(handler) = handlers.pop() {
        match tokio::time::timeout(timeout, handler()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => errors.push(e),
            Err(_elapsed) => errors.push(anyhow::anyhow!("teardown handler exceeded shutdown timeout")),
        }
    }
    TeardownErrors(errors)
}
