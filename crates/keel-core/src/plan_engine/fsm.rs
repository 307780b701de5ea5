//! The phase state machine: the valid-transition table backing
//! [`super::PlanEngine`]'s writes. Grounded on
//! `gator-core::state::TaskStateMachine::is_valid_transition`, generalized
//! from the teacher's 7-state task lifecycle to §3's 5-state phase
//! lifecycle plus a `rolled-back` terminal and its rollback-specific edge.

use keel_db::models::PhaseState;

/// ```text
/// unstarted   -> in-progress
/// in-progress -> completed
/// in-progress -> failed
/// failed      -> in-progress   (retry / re-run)
/// completed   -> in-progress   (rollback entry)
/// in-progress -> rolled-back   (rollback exit, only reachable from a
///                                completed phase's rollback in-progress)
/// ```
pub struct PhaseStateMachine;

impl PhaseStateMachine {
    pub fn is_valid_transition(from: PhaseState, to: PhaseState) -> bool {
        matches!(
            (from, to),
            (PhaseState::Unstarted, PhaseState::InProgress)
                | (PhaseState::InProgress, PhaseState::Completed)
                | (PhaseState::InProgress, PhaseState::Failed)
                | (PhaseState::Failed, PhaseState::InProgress)
                | (PhaseState::Completed, PhaseState::InProgress)
                | (PhaseState::InProgress, PhaseState::RolledBack)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_execution_edges_are_valid() {
        assert!(PhaseStateMachine::is_valid_transition(
            PhaseState::Unstarted,
            PhaseState::InProgress
        ));
        assert!(PhaseStateMachine::is_valid_transition(
            PhaseState::InProgress,
            PhaseState::Completed
        ));
        assert!(PhaseStateMachine::is_valid_transition(
            PhaseState::InProgress,
            PhaseState::Failed
        ));
    }

    #[test]
    fn retry_and_rollback_edges_are_valid() {
        assert!(PhaseStateMachine::is_valid_transition(
            PhaseState::Failed,
            PhaseState::InProgress
        ));
        assert!(PhaseStateMachine::is_valid_transition(
            PhaseState::Completed,
            PhaseState::InProgress
        ));
        assert!(PhaseStateMachine::is_valid_transition(
            PhaseState::InProgress,
            PhaseState::RolledBack
        ));
    }

    #[test]
    fn rolled_back_is_terminal() {
        for to in [
            PhaseState::Unstarted,
            PhaseState::InProgress,
            PhaseState::Completed,
            PhaseState::Failed,
            PhaseState::RolledBack,
        ] {
            assert!(!PhaseStateMachine::is_valid_transition(PhaseState::RolledBack, to));
        }
    }

    #[test]
    fn unstarted_cannot_skip_to_completed() {
        assert!(!PhaseStateMachine::is_valid_transition(
            PhaseState::Unstarted,
            PhaseState::Completed
        ));
    }
}
