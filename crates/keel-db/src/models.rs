use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Which lifecycle change an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OperationFlavor {
    Install,
    Reconfigure,
    Upgrade,
    Shrink,
    Expand,
}

impl fmt::Display for OperationFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Install => "install",
            Self::Reconfigure => "reconfigure",
            Self::Upgrade => "upgrade",
            Self::Shrink => "shrink",
            Self::Expand => "expand",
        };
        f.write_str(s)
    }
}

impl FromStr for OperationFlavor {
    type Err = OperationFlavorParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "install" => Ok(Self::Install),
            "reconfigure" => Ok(Self::Reconfigure),
            "upgrade" => Ok(Self::Upgrade),
            "shrink" => Ok(Self::Shrink),
            "expand" => Ok(Self::Expand),
            other => Err(OperationFlavorParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`OperationFlavor`] string.
#[derive(Debug, Clone)]
pub struct OperationFlavorParseError(pub String);

impl fmt::Display for OperationFlavorParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid operation flavor: {:?}", self.0)
    }
}

impl std::error::Error for OperationFlavorParseError {}

// ---------------------------------------------------------------------------

/// Top-level state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Initialized,
    InProgress,
    Completed,
    Failed,
    Aborted,
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initialized => "initialized",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

impl FromStr for OperationState {
    type Err = OperationStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initialized" => Ok(Self::Initialized),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "aborted" => Ok(Self::Aborted),
            other => Err(OperationStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`OperationState`] string.
#[derive(Debug, Clone)]
pub struct OperationStateParseError(pub String);

impl fmt::Display for OperationStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid operation state: {:?}", self.0)
    }
}

impl std::error::Error for OperationStateParseError {}

// ---------------------------------------------------------------------------

/// State of a single phase within a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    Unstarted,
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unstarted => "unstarted",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

impl FromStr for PhaseState {
    type Err = PhaseStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unstarted" => Ok(Self::Unstarted),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "rolled_back" => Ok(Self::RolledBack),
            other => Err(PhaseStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`PhaseState`] string.
#[derive(Debug, Clone)]
pub struct PhaseStateParseError(pub String);

impl fmt::Display for PhaseStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid phase state: {:?}", self.0)
    }
}

impl std::error::Error for PhaseStateParseError {}

// ---------------------------------------------------------------------------

/// Status carried on a progress event, per §3/§6 of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Running,
    CompletedPending,
    Completed,
    Failed,
    Aborted,
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::CompletedPending => "completed_pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

impl FromStr for ProgressStatus {
    type Err = ProgressStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed_pending" => Ok(Self::CompletedPending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "aborted" => Ok(Self::Aborted),
            other => Err(ProgressStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ProgressStatus`] string.
#[derive(Debug, Clone)]
pub struct ProgressStatusParseError(pub String);

impl fmt::Display for ProgressStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid progress status: {:?}", self.0)
    }
}

impl std::error::Error for ProgressStatusParseError {}

// ---------------------------------------------------------------------------

/// The §7 error taxonomy, stored alongside a failed phase's message so a
/// reload can recover `IsAbortedErr`-style classification without re-parsing
/// free text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    PreconditionFailed,
    NotImplemented,
    StaleRevision,
    PhaseFailed,
    Aborted,
    Transport,
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PreconditionFailed => "precondition-failed",
            Self::NotImplemented => "not-implemented",
            Self::StaleRevision => "stale-revision",
            Self::PhaseFailed => "phase-failed",
            Self::Aborted => "aborted",
            Self::Transport => "transport",
            Self::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

impl FromStr for ErrorKind {
    type Err = ErrorKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "precondition-failed" => Ok(Self::PreconditionFailed),
            "not-implemented" => Ok(Self::NotImplemented),
            "stale-revision" => Ok(Self::StaleRevision),
            "phase-failed" => Ok(Self::PhaseFailed),
            "aborted" => Ok(Self::Aborted),
            "transport" => Ok(Self::Transport),
            "fatal" => Ok(Self::Fatal),
            other => Err(ErrorKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ErrorKind`] string.
#[derive(Debug, Clone)]
pub struct ErrorKindParseError(pub String);

impl fmt::Display for ErrorKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid error kind: {:?}", self.0)
    }
}

impl std::error::Error for ErrorKindParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// An operation -- a named, persisted, resumable cluster-lifecycle change.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Operation {
    pub id: Uuid,
    pub account: String,
    pub cluster: String,
    pub flavor: OperationFlavor,
    pub state: OperationState,
    pub plan_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A plan -- the DAG of phases that realizes an operation. Immutable once
/// created except for per-phase state, which lives in [`Phase`] rows.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub operation_id: Uuid,
    pub cluster_revision: String,
    pub phase_count: i32,
    pub created_at: DateTime<Utc>,
}

/// A phase -- a re-entrant unit of work identified by a dotted path.
///
/// `revision` is the CAS guard for [`crate::queries::phases::update_phase`]:
/// every write compares-and-increments it, so a caller holding a stale
/// revision is rejected rather than silently overwriting a concurrent
/// transition.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Phase {
    pub plan_id: Uuid,
    pub id: String,
    pub parent_id: Option<String>,
    pub executor: String,
    pub data: serde_json::Value,
    pub state: PhaseState,
    pub revision: i64,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// An edge in a phase's `requires` set: `phase_id` may not start until
/// `requires_id` is `completed` or tolerably `rolled_back`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PhaseDependency {
    pub plan_id: Uuid,
    pub phase_id: String,
    pub requires_id: String,
}

/// An append-only changelog entry recording a plan-state transition.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ChangelogEntry {
    pub id: i64,
    pub operation_id: Uuid,
    pub revision: i64,
    pub phase_id: Option<String>,
    pub entry_type: String,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

/// A cluster node participating in the operation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Server {
    pub advertise_ip: String,
    pub operation_id: Uuid,
    pub role: String,
    pub hostname: String,
    pub profile_selector: String,
    pub joined_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_flavor_display_roundtrip() {
        let variants = [
            OperationFlavor::Install,
            OperationFlavor::Reconfigure,
            OperationFlavor::Upgrade,
            OperationFlavor::Shrink,
            OperationFlavor::Expand,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: OperationFlavor = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn operation_flavor_invalid() {
        assert!("bogus".parse::<OperationFlavor>().is_err());
    }

    #[test]
    fn operation_state_display_roundtrip() {
        let variants = [
            OperationState::Initialized,
            OperationState::InProgress,
            OperationState::Completed,
            OperationState::Failed,
            OperationState::Aborted,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: OperationState = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn operation_state_invalid() {
        assert!("nope".parse::<OperationState>().is_err());
    }

    #[test]
    fn phase_state_display_roundtrip() {
        let variants = [
            PhaseState::Unstarted,
            PhaseState::InProgress,
            PhaseState::Completed,
            PhaseState::Failed,
            PhaseState::RolledBack,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: PhaseState = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn phase_state_invalid() {
        assert!("tiny".parse::<PhaseState>().is_err());
    }

    #[test]
    fn progress_status_display_roundtrip() {
        let variants = [
            ProgressStatus::Running,
            ProgressStatus::CompletedPending,
            ProgressStatus::Completed,
            ProgressStatus::Failed,
            ProgressStatus::Aborted,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: ProgressStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn progress_status_invalid() {
        assert!("robot".parse::<ProgressStatus>().is_err());
    }

    #[test]
    fn error_kind_display_roundtrip() {
        let variants = [
            ErrorKind::PreconditionFailed,
            ErrorKind::NotImplemented,
            ErrorKind::StaleRevision,
            ErrorKind::PhaseFailed,
            ErrorKind::Aborted,
            ErrorKind::Transport,
            ErrorKind::Fatal,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: ErrorKind = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn error_kind_invalid() {
        assert!("magic".parse::<ErrorKind>().is_err());
    }
}
