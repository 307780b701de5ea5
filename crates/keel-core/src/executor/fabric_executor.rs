//! The "fabric" executor: a [`PhaseExecutor`] that dispatches a phase to a
//! remote peer agent via the [`crate::fabric::AgentRunner`] and forwards its
//! NDJSON progress stream back to the plan engine.
//!
//! This is the executor most phases in a real plan use — phase.data
//! carries the target server's advertise IP, which is looked up in the
//! registry's peer table to get the operation-scoped [`PeerProfile`].

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::sync::RwLock;

use keel_db::models::Phase;

use super::trait_def::{ExecutorContext, PhaseExecutor};
use crate::errors::EngineError;
use crate::fabric::{AgentRunner, DispatchRequest, PeerProfile, ProgressEvent};

/// Dispatches phases to peer agents. `peers` is keyed by advertise IP and
/// populated as the operation initializer discovers/joins servers.
///
/// `Clone` is cheap (an `Arc`'d peer map plus a pooled `reqwest::Client`) so
/// the same logical executor can be registered into an [`super::ExecutorRegistry`]
/// under the `"fabric"` name while a second handle is kept by the plan
/// engine to mint and register per-operation peer profiles into the same
/// underlying map.
#[derive(Clone)]
pub struct FabricExecutor {
    runner: AgentRunner,
    peers: Arc<RwLock<HashMap<String, PeerProfile>>>,
}

impl FabricExecutor {
    pub fn new(runner: AgentRunner) -> Self {
        Self {
            runner,
            peers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register_peer(&self, profile: PeerProfile) {
        self.peers.write().await.insert(profile.advertise_ip.clone(), profile);
    }

    pub async fn deregister_peer(&self, advertise_ip: &str) {
        self.peers.write().await.remove(advertise_ip);
    }

    fn target_server(phase: &Phase) -> Result<String, EngineError> {
        phase
            .data
            .get("server")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                EngineError::PreconditionFailed(format!(
                    "phase {} has no target server in its data payload",
                    phase.id
                ))
            })
    }
}

#[async_trait]
impl PhaseExecutor for FabricExecutor {
    fn name(&self) -> &str {
        "fabric"
    }

    async fn execute(
        &self,
        _ctx: &ExecutorContext,
        phase: &Phase,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<ProgressEvent, EngineError>> + Send>>, EngineError>
    {
        let server = Self::target_server(phase)?;
        let peer = {
            let peers = self.peers.read().await;
            peers
                .get(&server)
                .cloned()
                .ok_or_else(|| EngineError::Fatal(format!("no peer profile registered for {server}")))?
        };

        let req = DispatchRequest {
            phase_id: phase.id.clone(),
            executor: phase.executor.clone(),
            data: phase.data.clone(),
        };

        let stream = self.runner.dispatch(&peer, req).await?;
        Ok(Box::pin(stream.boxed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use keel_db::models::PhaseState;
    use uuid::Uuid;

    fn phase_for(server: &str) -> Phase {
        Phase {
            plan_id: Uuid::nil(),
            id: "apply/master-1".to_string(),
            parent_id: Some("apply".to_string()),
            executor: "fabric".to_string(),
            data: serde_json::json!({"server": server}),
            state: PhaseState::Unstarted,
            revision: 0,
            error_kind: None,
            error_message: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn target_server_extracts_server_field() {
        let phase = phase_for("10.0.0.5");
        assert_eq!(FabricExecutor::target_server(&phase).unwrap(), "10.0.0.5");
    }

    #[test]
    fn target_server_errors_without_server_field() {
        let mut phase = phase_for("10.0.0.5");
        phase.data = serde_json::json!({});
        let err = FabricExecutor::target_server(&phase).unwrap_err();
        assert!(matches!(err, EngineError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn execute_fails_fatally_when_peer_unregistered() {
        let executor = FabricExecutor::new(AgentRunner::new());
        let ctx = ExecutorContext {
            operation_id: Uuid::new_v4(),
            plan_id: Uuid::nil(),
        };
        let phase = phase_for("10.0.0.9");
        let result = executor.execute(&ctx, &phase).await;
        assert!(matches!(result, Err(EngineError::Fatal(_))));
    }

    #[tokio::test]
    async fn register_and_deregister_peer_round_trips() {
        let executor = FabricExecutor::new(AgentRunner::new());
        let profile = PeerProfile {
            advertise_ip: "10.0.0.5".to_string(),
            base_url: "http://10.0.0.5:7777".to_string(),
            token: "tok".to_string(),
        };
        executor.register_peer(profile).await;
        assert!(executor.peers.read().await.contains_key("10.0.0.5"));
        executor.deregister_peer("10.0.0.5").await;
        assert!(!executor.peers.read().await.contains_key("10.0.0.5"));
    }
}
