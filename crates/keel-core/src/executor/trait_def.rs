//! The `PhaseExecutor` trait — §4.B's "selects an implementation by
//! `phase.executor`" contract.
//!
//! Grounded on `gator-core::harness::Harness`: an object-safe `async_trait`
//! stored as `Box<dyn PhaseExecutor>` in a name-keyed registry, the same
//! shape as the teacher's `Box<dyn Harness>` in `HarnessRegistry`.

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use keel_db::models::Phase;

use crate::errors::EngineError;
use crate::fabric::ProgressEvent;

/// The target context a phase implementation runs against, per §4.B's
/// `{operator, backend, local-backend, runner, silent, logger, operation,
/// server}`. Only the fields the controller-side executor actually needs
/// are kept; the rest (`silent`, `logger`) are ambient via `tracing` and
/// have no explicit struct field.
#[derive(Clone)]
pub struct ExecutorContext {
    pub operation_id: uuid::Uuid,
    pub plan_id: uuid::Uuid,
}

/// Adapter interface for running a single phase's work. Implementations
/// must be re-entrant: invoked more than once for the same phase id, they
/// must converge rather than double-apply.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    /// The `phase.executor` name this implementation answers to.
    fn name(&self) -> &str;

    /// Run the phase, returning its progress events as a stream. The last
    /// event must be terminal (`completed`/`completed-pending`/`failed`).
    /// A `Transport` error from the stream itself (rather than a `failed`
    /// terminal event) is retried by the registry per §7.
    async fn execute(
        &self,
        ctx: &ExecutorContext,
        phase: &Phase,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<ProgressEvent, EngineError>> + Send>>, EngineError>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn PhaseExecutor) {}
};
