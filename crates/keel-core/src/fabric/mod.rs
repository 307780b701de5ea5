//! Agent fabric (§4.C): the peer-agent RPC service and the controller-side
//! runner that dials it, tied together by per-operation HMAC credentials.

pub mod peer;
pub mod runner;
pub mod types;

pub use peer::{PeerState, build_router as build_peer_router};
pub use runner::AgentRunner;
pub use types::{ControlRequest, DispatchRequest, PeerProfile, ProgressEvent, StatusResponse};

use uuid::Uuid;

use crate::token::{TokenConfig, generate_token};

/// Mint a [`PeerProfile`] for a node: its reachable base URL plus an
/// operation-scoped bearer token embedded per §6.
///
/// The token is scoped by `operation_id` (reusing the teacher's
/// `(task_id, attempt)` token shape with `attempt` fixed at `0`, since a
/// single operation has no retry-attempt dimension of its own at the
/// fabric-credential layer).
pub fn mint_peer_profile(
    token_config: &TokenConfig,
    operation_id: Uuid,
    advertise_ip: impl Into<String>,
    base_url: impl Into<String>,
) -> PeerProfile {
    PeerProfile {
        advertise_ip: advertise_ip.into(),
        base_url: base_url.into(),
        token: generate_token(token_config, operation_id, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::validate_token;

    #[test]
    fn mint_peer_profile_token_validates_against_same_config() {
        let config = TokenConfig::new(b"fabric-test-secret".to_vec());
        let op_id = Uuid::new_v4();
        let profile = mint_peer_profile(&config, op_id, "10.0.0.1", "http://10.0.0.1:7777");

        let claims = validate_token(&config, &profile.token).expect("token should validate");
        assert_eq!(claims.task_id, op_id);
        assert_eq!(claims.attempt, 0);
    }
}
