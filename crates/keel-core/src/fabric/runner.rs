//! Agent runner — the controller-side half of §4.C. Dials peer agents with
//! operation-scoped credentials and multiplexes `Dispatch`/`Abort`/`Stop`.
//!
//! Grounded on `jdsingh122918-forge`'s `reqwest`-based swarm-callback client
//! (same crate, same `json`/`rustls` feature set): the teacher's own
//! `Harness` trait only spawns local subprocesses, so the outbound HTTP
//! client is enriched from the wider example pack rather than the teacher.
//! One `reqwest::Client` is built per runner and reused for every peer —
//! reqwest's own pool gives the "one dial per peer" behavior §5 asks for
//! without a bespoke connection cache.

use futures::{Stream, StreamExt};
use reqwest::Client;

use super::types::{ControlRequest, DispatchRequest, PeerProfile, ProgressEvent, StatusResponse};
use crate::errors::EngineError;

/// Dials peer agents over HTTP. Holds one pooled `reqwest::Client` shared
/// across every peer this runner talks to for the lifetime of an operation.
#[derive(Debug, Clone)]
pub struct AgentRunner {
    client: Client,
}

impl Default for AgentRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRunner {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    /// Dispatch a phase to a peer and return the NDJSON progress stream,
    /// decoded line-by-line into [`ProgressEvent`]s.
    pub async fn dispatch(
        &self,
        peer: &PeerProfile,
        req: DispatchRequest,
    ) -> Result<impl Stream<Item = Result<ProgressEvent, EngineError>> + Unpin, EngineError> {
        let url = format!("{}/dispatch?token={}", peer.base_url, peer.token);
        let response = self
            .client
            .post(&url)
            .json(&req)
            .send()
            .await
            .map_err(|e| EngineError::Transport(format!("dial {}: {e}", peer.advertise_ip)))?;

        if !response.status().is_success() {
            return Err(EngineError::Transport(format!(
                "peer {} rejected dispatch: {}",
                peer.advertise_ip,
                response.status()
            )));
        }

        Ok(Box::pin(ndjson_events(response.bytes_stream())))
    }

    /// Cooperative shutdown of a phase already running on a peer. Idempotent.
    pub async fn stop(&self, peer: &PeerProfile, phase_id: &str) -> Result<(), EngineError> {
        self.control_call(peer, "stop", phase_id).await
    }

    /// Forced teardown of a phase on a peer. Idempotent.
    pub async fn abort(&self, peer: &PeerProfile, phase_id: &str) -> Result<(), EngineError> {
        self.control_call(peer, "abort", phase_id).await
    }

    async fn control_call(
        &self,
        peer: &PeerProfile,
        verb: &str,
        phase_id: &str,
    ) -> Result<(), EngineError> {
        let url = format!("{}/{verb}?token={}", peer.base_url, peer.token);
        let response = self
            .client
            .post(&url)
            .json(&ControlRequest {
                phase_id: phase_id.to_string(),
            })
            .send()
            .await
            .map_err(|e| EngineError::Transport(format!("{verb} {}: {e}", peer.advertise_ip)))?;

        if !response.status().is_success() {
            return Err(EngineError::Transport(format!(
                "peer {} rejected {verb}: {}",
                peer.advertise_ip,
                response.status()
            )));
        }
        Ok(())
    }

    pub async fn status(&self, peer: &PeerProfile) -> Result<StatusResponse, EngineError> {
        let url = format!("{}/status?token={}", peer.base_url, peer.token);
        self.client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::Transport(format!("status {}: {e}", peer.advertise_ip)))?
            .json::<StatusResponse>()
            .await
            .map_err(|e| EngineError::Transport(format!("decode status: {e}")))
    }
}

/// Decode a `reqwest` byte stream as newline-delimited JSON `ProgressEvent`s.
/// Buffers partial lines across chunk boundaries.
fn ndjson_events(
    mut bytes: impl Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin + Send + 'static,
) -> impl Stream<Item = Result<ProgressEvent, EngineError>> + Unpin {
    Box::pin(async_stream::stream! {
        let mut buf = String::new();
        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    yield Err(EngineError::Transport(format!("stream error: {e}")));
                    return;
                }
            };
            buf.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = buf.find('\n') {
                let line = buf[..pos].to_string();
                buf.drain(..=pos);
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<ProgressEvent>(&line) {
                    Ok(event) => yield Ok(event),
                    Err(e) => yield Err(EngineError::Transport(format!("malformed progress event: {e}"))),
                }
            }
        }
        if !buf.trim().is_empty() {
            match serde_json::from_str::<ProgressEvent>(buf.trim()) {
                Ok(event) => yield Ok(event),
                Err(e) => yield Err(EngineError::Transport(format!("malformed trailing progress event: {e}"))),
            }
        }
    })
}
