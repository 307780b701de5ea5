//! Database query functions for the `phases` table: `UpdatePhase` and the
//! frontier query the plan engine drives off of.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{ErrorKind, Phase, PhaseState};

/// Error returned by [`update_phase`] when the caller's revision no longer
/// matches the persisted row.
#[derive(Debug, thiserror::Error)]
pub enum PhaseStoreError {
    #[error("phase {plan_id}/{phase_id} not found")]
    NotFound { plan_id: Uuid, phase_id: String },
    #[error(
        "stale revision for phase {plan_id}/{phase_id}: caller had {expected}, current differs"
    )]
    Stale { plan_id: Uuid, phase_id: String, expected: i64 },
    #[error(transparent)]
    BackendUnavailable(#[from] sqlx::Error),
}

/// Fetch a single phase by its path within a plan.
pub async fn get_phase(pool: &PgPool, plan_id: Uuid, phase_id: &str) -> Result<Option<Phase>> {
    let phase = sqlx::query_as::<_, Phase>("SELECT * FROM phases WHERE plan_id = $1 AND id = $2")
        .bind(plan_id)
        .bind(phase_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch phase")?;

    Ok(phase)
}

/// List every phase in a plan, ordered by path.
pub async fn list_phases(pool: &PgPool, plan_id: Uuid) -> Result<Vec<Phase>> {
    let phases =
        sqlx::query_as::<_, Phase>("SELECT * FROM phases WHERE plan_id = $1 ORDER BY id ASC")
            .bind(plan_id)
            .fetch_all(pool)
            .await
            .context("failed to list phases")?;

    Ok(phases)
}

/// Atomically transition a phase, guarded by the caller's known `revision`
/// (optimistic compare-and-swap). On success the new row -- with its
/// incremented revision -- is returned. On a revision mismatch,
/// [`PhaseStoreError::Stale`] is returned so the plan engine can retry or
/// surface `stale-revision` per §7.
pub async fn update_phase(
    pool: &PgPool,
    plan_id: Uuid,
    phase_id: &str,
    expected_revision: i64,
    new_state: PhaseState,
    error: Option<(ErrorKind, String)>,
) -> Result<Phase, PhaseStoreError> {
    let (error_kind, error_message) = match error {
        Some((kind, msg)) => (Some(kind), Some(msg)),
        None => (None, None),
    };

    let updated = sqlx::query_as::<_, Phase>(
        "UPDATE phases \
         SET state = $1, \
             revision = revision + 1, \
             error_kind = $2, \
             error_message = $3, \
             updated_at = $4 \
         WHERE plan_id = $5 AND id = $6 AND revision = $7 \
         RETURNING *",
    )
    .bind(new_state)
    .bind(error_kind)
    .bind(error_message)
    .bind(Utc::now())
    .bind(plan_id)
    .bind(phase_id)
    .bind(expected_revision)
    .fetch_optional(pool)
    .await?;

    match updated {
        Some(phase) => Ok(phase),
        None => match get_phase(pool, plan_id, phase_id)
            .await
            .map_err(|_| PhaseStoreError::NotFound {
                plan_id,
                phase_id: phase_id.to_owned(),
            })? {
            Some(_) => Err(PhaseStoreError::Stale {
                plan_id,
                phase_id: phase_id.to_owned(),
                expected: expected_revision,
            }),
            None => Err(PhaseStoreError::NotFound {
                plan_id,
                phase_id: phase_id.to_owned(),
            }),
        },
    }
}

/// Unconditionally write a phase's state, bypassing the revision guard.
/// Used by `SetPhase` (administrative override, manual recovery) -- the
/// engine is responsible for recording the accompanying changelog entry
/// tagging this as an override.
pub async fn set_phase_unconditional(
    pool: &PgPool,
    plan_id: Uuid,
    phase_id: &str,
    new_state: PhaseState,
) -> Result<Phase> {
    let phase = sqlx::query_as::<_, Phase>(
        "UPDATE phases \
         SET state = $1, revision = revision + 1, error_kind = NULL, error_message = NULL, updated_at = $2 \
         WHERE plan_id = $3 AND id = $4 \
         RETURNING *",
    )
    .bind(new_state)
    .bind(Utc::now())
    .bind(plan_id)
    .bind(phase_id)
    .fetch_optional(pool)
    .await
    .context("failed to set phase state")?;

    phase.ok_or_else(|| anyhow::anyhow!("phase {plan_id}/{phase_id} not found"))
}

/// Compute the frontier: every phase whose `requires` are all `completed`
/// (or `rolled_back`) and whose own state is `unstarted` or `failed`.
///
/// This is the set [`crate::queries::phases`] hands to the plan engine's
/// `ExecutePlan` loop each iteration; the engine picks the deterministically
/// earliest one by DFS pre-order with lexicographic tie-break.
pub async fn get_frontier(pool: &PgPool, plan_id: Uuid) -> Result<Vec<Phase>> {
    let phases = sqlx::query_as::<_, Phase>(
        "SELECT p.* \
         FROM phases p \
         WHERE p.plan_id = $1 \
           AND p.state IN ('unstarted', 'failed') \
           AND NOT EXISTS ( \
               SELECT 1 FROM phase_dependencies pd \
               JOIN phases dep ON dep.plan_id = pd.plan_id AND dep.id = pd.requires_id \
               WHERE pd.plan_id = p.plan_id AND pd.phase_id = p.id \
                 AND dep.state NOT IN ('completed', 'rolled_back') \
           ) \
         ORDER BY p.id ASC",
    )
    .bind(plan_id)
    .fetch_all(pool)
    .await
    .context("failed to compute phase frontier")?;

    Ok(phases)
}

/// Check whether every phase in a plan has reached `completed`.
pub async fn all_phases_completed(pool: &PgPool, plan_id: Uuid) -> Result<bool> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM phases WHERE plan_id = $1 AND state != 'completed'",
    )
    .bind(plan_id)
    .fetch_one(pool)
    .await
    .context("failed to check plan completion")?;

    Ok(row.0 == 0)
}

/// List phases currently `failed`, used to build the aggregated failure
/// `ExecutePlan` returns when the frontier is empty but the plan is not
/// fully completed.
pub async fn list_failed_phases(pool: &PgPool, plan_id: Uuid) -> Result<Vec<Phase>> {
    let phases = sqlx::query_as::<_, Phase>(
        "SELECT * FROM phases WHERE plan_id = $1 AND state = 'failed' ORDER BY id ASC",
    )
    .bind(plan_id)
    .fetch_all(pool)
    .await
    .context("failed to list failed phases")?;

    Ok(phases)
}

/// Reset phases stuck `in_progress` back to `failed` so a restarted
/// controller can resume them -- crash-recovery counterpart of the teacher's
/// `reset_orphaned_tasks`.
pub async fn reset_orphaned_phases(pool: &PgPool, plan_id: Uuid) -> Result<Vec<Phase>> {
    let phases = sqlx::query_as::<_, Phase>(
        "UPDATE phases \
         SET state = 'failed', \
             revision = revision + 1, \
             error_kind = 'fatal', \
             error_message = 'phase orphaned by controller restart', \
             updated_at = now() \
         WHERE plan_id = $1 AND state = 'in_progress' \
         RETURNING *",
    )
    .bind(plan_id)
    .fetch_all(pool)
    .await
    .context("failed to reset orphaned phases")?;

    Ok(phases)
}

/// Direct children of `parent_id` (or roots, when `parent_id` is `None`).
pub async fn list_children(
    pool: &PgPool,
    plan_id: Uuid,
    parent_id: Option<&str>,
) -> Result<Vec<Phase>> {
    let phases = match parent_id {
        Some(parent) => {
            sqlx::query_as::<_, Phase>(
                "SELECT * FROM phases WHERE plan_id = $1 AND parent_id = $2 ORDER BY id ASC",
            )
            .bind(plan_id)
            .bind(parent)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, Phase>(
                "SELECT * FROM phases WHERE plan_id = $1 AND parent_id IS NULL ORDER BY id ASC",
            )
            .bind(plan_id)
            .fetch_all(pool)
            .await
        }
    }
    .context("failed to list child phases")?;

    Ok(phases)
}
