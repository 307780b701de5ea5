//! Database query functions for the `plans` table: the plan store's `Save`
//! and `Load`.

use std::collections::HashSet;

use anyhow::{Context, Result, bail};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Phase, PhaseState, Plan};

/// A phase as supplied to [`save_plan`], before it has been persisted.
#[derive(Debug, Clone)]
pub struct NewPhase {
    pub id: String,
    pub parent_id: Option<String>,
    pub executor: String,
    pub data: serde_json::Value,
    pub requires: Vec<String>,
}

/// A plan together with every phase's latest persisted state, as returned
/// by `Load`.
#[derive(Debug, Clone)]
pub struct PlanView {
    pub plan: Plan,
    pub phases: Vec<Phase>,
}

/// Persist a brand-new plan and its phase graph in a single transaction.
///
/// Mirrors the plan store's `Save(plan)`: the plan row, every phase row, and
/// every `requires` edge are inserted atomically. If any `requires` edge
/// names a phase id absent from `phases`, the whole insert is rolled back.
pub async fn save_plan(
    pool: &PgPool,
    operation_id: Uuid,
    cluster_revision: &str,
    phases: &[NewPhase],
) -> Result<Plan> {
    let known_ids: HashSet<&str> = phases.iter().map(|p| p.id.as_str()).collect();
    let mut missing = Vec::new();
    for phase in phases {
        for dep in &phase.requires {
            if !known_ids.contains(dep.as_str()) {
                missing.push(format!("{} requires unknown phase {dep:?}", phase.id));
            }
        }
    }
    if !missing.is_empty() {
        bail!("plan references unknown phases:\n  {}", missing.join("\n  "));
    }

    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let plan = sqlx::query_as::<_, Plan>(
        "INSERT INTO plans (operation_id, cluster_revision, phase_count) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(operation_id)
    .bind(cluster_revision)
    .bind(phases.len() as i32)
    .fetch_one(&mut *tx)
    .await
    .context("failed to insert plan")?;

    for phase in phases {
        sqlx::query(
            "INSERT INTO phases (plan_id, id, parent_id, executor, data, state) \
             VALUES ($1, $2, $3, $4, $5, 'unstarted')",
        )
        .bind(plan.id)
        .bind(&phase.id)
        .bind(&phase.parent_id)
        .bind(&phase.executor)
        .bind(&phase.data)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to insert phase {:?}", phase.id))?;
    }

    for phase in phases {
        for dep in &phase.requires {
            sqlx::query(
                "INSERT INTO phase_dependencies (plan_id, phase_id, requires_id) \
                 VALUES ($1, $2, $3)",
            )
            .bind(plan.id)
            .bind(&phase.id)
            .bind(dep)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to insert dependency {} -> {}", phase.id, dep))?;
        }
    }

    tx.commit().await.context("failed to commit transaction")?;

    Ok(plan)
}

/// Fetch a plan row by the owning operation's id.
pub async fn get_plan_by_operation(pool: &PgPool, operation_id: Uuid) -> Result<Option<Plan>> {
    let plan = sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE operation_id = $1")
        .bind(operation_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch plan by operation")?;

    Ok(plan)
}

/// Load a plan together with every phase's latest state: `Load(opKey)`.
pub async fn load_plan(pool: &PgPool, operation_id: Uuid) -> Result<Option<PlanView>> {
    let Some(plan) = get_plan_by_operation(pool, operation_id).await? else {
        return Ok(None);
    };

    let phases = sqlx::query_as::<_, Phase>(
        "SELECT * FROM phases WHERE plan_id = $1 ORDER BY id ASC",
    )
    .bind(plan.id)
    .fetch_all(pool)
    .await
    .context("failed to load phases for plan")?;

    Ok(Some(PlanView { plan, phases }))
}

/// Fetch the `requires` set for a phase.
pub async fn get_requires(pool: &PgPool, plan_id: Uuid, phase_id: &str) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT requires_id FROM phase_dependencies WHERE plan_id = $1 AND phase_id = $2",
    )
    .bind(plan_id)
    .bind(phase_id)
    .fetch_all(pool)
    .await
    .context("failed to fetch phase dependencies")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Count phases in a plan currently in a given state.
pub async fn count_phases_in_state(pool: &PgPool, plan_id: Uuid, state: PhaseState) -> Result<i64> {
    let row: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM phases WHERE plan_id = $1 AND state = $2")
            .bind(plan_id)
            .bind(state)
            .fetch_one(pool)
            .await
            .context("failed to count phases by state")?;

    Ok(row.0)
}
