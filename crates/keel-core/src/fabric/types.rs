//! Wire types shared by the peer agent service and the controller-side
//! agent runner (§4.C, §6).

use std::fmt;

use keel_db::models::ProgressStatus;
use serde::{Deserialize, Serialize};

/// A progress event emitted while a phase runs on a peer agent, per §3's
/// Progress Event and §6's event wire format (`{progress?, status, error?}`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEvent {
    pub phase_id: Option<String>,
    pub message: String,
    pub completion_percent: Option<f32>,
    pub status: ProgressStatus,
    pub error: Option<String>,
}

impl ProgressEvent {
    pub fn running(phase_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            phase_id: Some(phase_id.into()),
            message: message.into(),
            completion_percent: None,
            status: ProgressStatus::Running,
            error: None,
        }
    }

    pub fn completed(phase_id: impl Into<String>) -> Self {
        Self {
            phase_id: Some(phase_id.into()),
            message: "completed".to_string(),
            completion_percent: Some(100.0),
            status: ProgressStatus::Completed,
            error: None,
        }
    }

    pub fn failed(phase_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            phase_id: Some(phase_id.into()),
            message: "failed".to_string(),
            completion_percent: None,
            status: ProgressStatus::Failed,
            error: Some(error.into()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            ProgressStatus::Completed | ProgressStatus::CompletedPending | ProgressStatus::Failed | ProgressStatus::Aborted
        )
    }
}

/// Request body for `POST /dispatch` on a peer agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub phase_id: String,
    pub executor: String,
    pub data: serde_json::Value,
}

/// Request body for `POST /abort` and `POST /stop`. Both are idempotent;
/// repeating either against an already-stopped phase is a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    pub phase_id: String,
}

/// Response body for `GET /status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub advertise_ip: String,
    pub in_flight: Vec<String>,
}

/// A peer agent's reachable address plus the scoped credential the runner
/// presents on every call, per §6 ("bearer token in URL").
#[derive(Debug, Clone)]
pub struct PeerProfile {
    pub advertise_ip: String,
    pub base_url: String,
    pub token: String,
}

impl fmt::Display for PeerProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.advertise_ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_event_is_terminal() {
        assert!(ProgressEvent::completed("validate").is_terminal());
    }

    #[test]
    fn running_event_is_not_terminal() {
        assert!(!ProgressEvent::running("validate", "working").is_terminal());
    }

    #[test]
    fn failed_event_carries_error_message() {
        let ev = ProgressEvent::failed("apply/master-1", "disk full");
        assert_eq!(ev.error.as_deref(), Some("disk full"));
        assert!(ev.is_terminal());
    }
}
