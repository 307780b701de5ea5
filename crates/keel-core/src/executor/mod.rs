//! Phase executor (§4.B): selects an implementation by `phase.executor`
//! and drives it to a terminal outcome, retrying transport faults.
//!
//! Grounded on `gator-core::lifecycle::run_agent_lifecycle`'s numbered
//! sequence (dispatch -> collect events with timeout -> classify outcome),
//! generalized by dropping workspace/gate-policy concerns with no spec
//! counterpart. The transport retry loop (3 attempts, exponential backoff)
//! is new relative to the teacher, composed from the same
//! `tokio::time::timeout` + `tracing::warn` idiom the teacher uses for its
//! own per-task timeout path.

pub mod fabric_executor;
pub mod local;
pub mod registry;
pub mod trait_def;

pub use fabric_executor::FabricExecutor;
pub use local::CidrValidateExecutor;
pub use registry::ExecutorRegistry;
pub use trait_def::{ExecutorContext, PhaseExecutor};

use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;

use keel_db::models::Phase;

use crate::errors::EngineError;
use crate::fabric::ProgressEvent;

const MAX_TRANSPORT_ATTEMPTS: u32 = 3;

/// Run a phase to completion via its registered executor, forwarding
/// progress events to `sink` as they arrive. Transport-classified faults
/// from the stream are retried up to [`MAX_TRANSPORT_ATTEMPTS`] times with
/// exponential backoff, then reclassified as `phase-failed` once retries
/// are exhausted (§7); any other error (including a `failed` terminal
/// event) is returned immediately.
pub async fn run_phase(
    registry: &ExecutorRegistry,
    ctx: &ExecutorContext,
    phase: &Phase,
    sink: &mpsc::Sender<ProgressEvent>,
) -> Result<(), EngineError> {
    let executor = registry.get(&phase.executor).ok_or_else(|| {
        EngineError::NotImplemented(format!("no executor registered for '{}'", phase.executor))
    })?;

    let mut attempt = 0;
    loop {
        attempt += 1;
        let outcome = drive_once(executor, ctx, phase, sink).await;
        match outcome {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable_transport() && attempt < MAX_TRANSPORT_ATTEMPTS => {
                let backoff = Duration::from_millis(100 * 2u64.pow(attempt - 1));
                tracing::warn!(
                    phase_id = %phase.id,
                    attempt,
                    ?backoff,
                    error = %e,
                    "transport fault dispatching phase, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) if e.is_retryable_transport() => {
                tracing::warn!(
                    phase_id = %phase.id,
                    attempt,
                    error = %e,
                    "transport fault exhausted retries, reclassifying as phase-failed"
                );
                return Err(EngineError::phase_failed(phase.id.clone(), e.to_string()));
            }
            Err(e) => return Err(e),
        }
    }
}

async fn drive_once(
    executor: &dyn PhaseExecutor,
    ctx: &ExecutorContext,
    phase: &Phase,
    sink: &mpsc::Sender<ProgressEvent>,
) -> Result<(), EngineError> {
    let mut stream = executor.execute(ctx, phase).await?;

    while let Some(item) = stream.next().await {
        let event = item?;
        let terminal = event.is_terminal();
        let failed = event.status == keel_db::models::ProgressStatus::Failed;
        let error_message = event.error.clone();
        let _ = sink.send(event).await;

        if terminal {
            if failed {
                return Err(EngineError::phase_failed(
                    phase.id.clone(),
                    error_message.unwrap_or_else(|| "phase reported failure".to_string()),
                ));
            }
            return Ok(());
        }
    }

    Err(EngineError::Fatal(format!(
        "phase {} executor stream ended without a terminal event",
        phase.id
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use keel_db::models::PhaseState;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use uuid::Uuid;

    fn phase() -> Phase {
        Phase {
            plan_id: Uuid::nil(),
            id: "validate".to_string(),
            parent_id: None,
            executor: "flaky".to_string(),
            data: serde_json::json!({}),
            state: PhaseState::Unstarted,
            revision: 0,
            error_kind: None,
            error_message: None,
            updated_at: Utc::now(),
        }
    }

    fn ctx() -> ExecutorContext {
        ExecutorContext {
            operation_id: Uuid::new_v4(),
            plan_id: Uuid::nil(),
        }
    }

    struct FlakyExecutor {
        calls: Arc<AtomicU32>,
        fail_times: u32,
    }

    #[async_trait]
    impl PhaseExecutor for FlakyExecutor {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn execute(
            &self,
            _ctx: &ExecutorContext,
            phase: &Phase,
        ) -> Result<
            Pin<Box<dyn futures::Stream<Item = Result<ProgressEvent, EngineError>> + Send>>,
            EngineError,
        > {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                return Err(EngineError::Transport("connection reset".to_string()));
            }
            let id = phase.id.clone();
            Ok(Box::pin(futures::stream::iter(vec![
                Ok(ProgressEvent::running(id.clone(), "go")),
                Ok(ProgressEvent::completed(id)),
            ])))
        }
    }

    struct AlwaysFailsExecutor;

    #[async_trait]
    impl PhaseExecutor for AlwaysFailsExecutor {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn execute(
            &self,
            _ctx: &ExecutorContext,
            phase: &Phase,
        ) -> Result<
            Pin<Box<dyn futures::Stream<Item = Result<ProgressEvent, EngineError>> + Send>>,
            EngineError,
        > {
            let id = phase.id.clone();
            Ok(Box::pin(futures::stream::iter(vec![Ok(ProgressEvent::failed(
                id,
                "disk full",
            ))])))
        }
    }

    #[tokio::test]
    async fn run_phase_returns_not_implemented_for_unknown_executor() {
        let registry = ExecutorRegistry::new();
        let (tx, _rx) = mpsc::channel(8);
        let result = run_phase(&registry, &ctx(), &phase(), &tx).await;
        assert!(matches!(result, Err(EngineError::NotImplemented(_))));
    }

    #[tokio::test]
    async fn run_phase_retries_transport_faults_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = ExecutorRegistry::new();
        registry.register(FlakyExecutor {
            calls: calls.clone(),
            fail_times: 2,
        });
        let (tx, mut rx) = mpsc::channel(8);
        let result = run_phase(&registry, &ctx(), &phase(), &tx).await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let mut received = Vec::new();
        while let Ok(event) = rx.try_recv() {
            received.push(event);
        }
        assert_eq!(received.len(), 2);
    }

    #[tokio::test]
    async fn run_phase_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = ExecutorRegistry::new();
        registry.register(FlakyExecutor {
            calls: calls.clone(),
            fail_times: 10,
        });
        let (tx, _rx) = mpsc::channel(8);
        let result = run_phase(&registry, &ctx(), &phase(), &tx).await;
        assert!(matches!(result, Err(EngineError::PhaseFailed { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), MAX_TRANSPORT_ATTEMPTS);
    }

    #[tokio::test]
    async fn run_phase_surfaces_failed_terminal_event_as_phase_failed() {
        let mut registry = ExecutorRegistry::new();
        registry.register(AlwaysFailsExecutor);
        let (tx, _rx) = mpsc::channel(8);
        let result = run_phase(&registry, &ctx(), &phase(), &tx).await;
        match result {
            Err(EngineError::PhaseFailed { phase_id, message }) => {
                assert_eq!(phase_id, "validate");
                assert_eq!(message, "disk full");
            }
            other => panic!("expected PhaseFailed, got {other:?}"),
        }
    }
}
