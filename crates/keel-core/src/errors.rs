//! Engine-wide error taxonomy.
//!
//! Every fallible operation in the plan engine, phase executor, and agent
//! fabric resolves to one of these kinds so that callers can branch on
//! `kind()` without downcasting. `keel-db`'s `PhaseStoreError` and
//! `TokenError` fold into this type at the boundary where the engine calls
//! into them.

use keel_db::models::ErrorKind;
use keel_db::queries::phases::PhaseStoreError;

use crate::token::TokenError;

/// An error surfaced by the plan engine, classified per the operation
/// error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("stale revision for phase {phase_id}: expected {expected}")]
    StaleRevision { phase_id: String, expected: i64 },

    #[error("phase {phase_id} failed: {message}")]
    PhaseFailed { phase_id: String, message: String },

    #[error("operation aborted: {0}")]
    Aborted(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl EngineError {
    /// The classification kind, matching the persisted `error_kind` column.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            EngineError::NotImplemented(_) => ErrorKind::NotImplemented,
            EngineError::StaleRevision { .. } => ErrorKind::StaleRevision,
            EngineError::PhaseFailed { .. } => ErrorKind::PhaseFailed,
            EngineError::Aborted(_) => ErrorKind::Aborted,
            EngineError::Transport(_) => ErrorKind::Transport,
            EngineError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    /// True if a failure of this kind should be retried by the phase
    /// executor's transport-retry policy (see §7: transport errors get
    /// three exponential-backoff attempts before being reclassified).
    pub fn is_retryable_transport(&self) -> bool {
        matches!(self, EngineError::Transport(_))
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        EngineError::Fatal(msg.into())
    }

    pub fn phase_failed(phase_id: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::PhaseFailed {
            phase_id: phase_id.into(),
            message: message.into(),
        }
    }
}

impl From<PhaseStoreError> for EngineError {
    fn from(err: PhaseStoreError) -> Self {
        match err {
            PhaseStoreError::NotFound { plan_id, phase_id } => {
                EngineError::Fatal(format!("phase {phase_id} not found in plan {plan_id}"))
            }
            PhaseStoreError::Stale {
                phase_id, expected, ..
            } => EngineError::StaleRevision { phase_id, expected },
            PhaseStoreError::BackendUnavailable(e) => {
                EngineError::Transport(format!("plan store unavailable: {e}"))
            }
        }
    }
}

impl From<TokenError> for EngineError {
    fn from(err: TokenError) -> Self {
        EngineError::PreconditionFailed(format!("credential rejected: {err}"))
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Fatal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(
            EngineError::PreconditionFailed("x".into()).kind(),
            ErrorKind::PreconditionFailed
        );
        assert_eq!(
            EngineError::phase_failed("a/b", "boom").kind(),
            ErrorKind::PhaseFailed
        );
        assert_eq!(
            EngineError::StaleRevision {
                phase_id: "a".into(),
                expected: 3
            }
            .kind(),
            ErrorKind::StaleRevision
        );
    }

    #[test]
    fn transport_is_retryable_others_are_not() {
        assert!(EngineError::Transport("timeout".into()).is_retryable_transport());
        assert!(!EngineError::fatal("nope").is_retryable_transport());
        assert!(!EngineError::Aborted("stop".into()).is_retryable_transport());
    }

    #[test]
    fn phase_store_stale_maps_to_stale_revision() {
        let err = PhaseStoreError::Stale {
            plan_id: uuid::Uuid::nil(),
            phase_id: "validate".into(),
            expected: 2,
        };
        let engine_err: EngineError = err.into();
        assert!(matches!(engine_err, EngineError::StaleRevision { .. }));
        assert_eq!(engine_err.kind(), ErrorKind::StaleRevision);
    }

    #[test]
    fn phase_store_backend_unavailable_maps_to_transport() {
        let sqlx_err = sqlx::Error::PoolTimedOut;
        let err: EngineError = PhaseStoreError::BackendUnavailable(sqlx_err).into();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }
}
