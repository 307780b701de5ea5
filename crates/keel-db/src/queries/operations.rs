//! Database query functions for the `operations` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Operation, OperationFlavor, OperationState};

/// Insert a new operation row. Returns the inserted operation in state
/// `initialized` with no plan attached yet.
pub async fn insert_operation(
    pool: &PgPool,
    account: &str,
    cluster: &str,
    flavor: OperationFlavor,
) -> Result<Operation> {
    let op = sqlx::query_as::<_, Operation>(
        "INSERT INTO operations (account, cluster, flavor, state) \
         VALUES ($1, $2, $3, 'initialized') \
         RETURNING *",
    )
    .bind(account)
    .bind(cluster)
    .bind(flavor)
    .fetch_one(pool)
    .await
    .context("failed to insert operation")?;

    Ok(op)
}

/// Fetch an operation by its ID.
pub async fn get_operation(pool: &PgPool, id: Uuid) -> Result<Option<Operation>> {
    let op = sqlx::query_as::<_, Operation>("SELECT * FROM operations WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch operation")?;

    Ok(op)
}

/// Find an operation by its `(account, cluster)` identity, if one is
/// currently active (not `completed`, `failed`, or `aborted`).
pub async fn find_active_operation(
    pool: &PgPool,
    account: &str,
    cluster: &str,
) -> Result<Option<Operation>> {
    let op = sqlx::query_as::<_, Operation>(
        "SELECT * FROM operations \
         WHERE account = $1 AND cluster = $2 \
           AND state NOT IN ('completed', 'failed', 'aborted') \
         ORDER BY created_at DESC \
         LIMIT 1",
    )
    .bind(account)
    .bind(cluster)
    .fetch_optional(pool)
    .await
    .context("failed to find active operation")?;

    Ok(op)
}

/// Attach a plan to an operation once it has been created.
pub async fn attach_plan(pool: &PgPool, operation_id: Uuid, plan_id: Uuid) -> Result<()> {
    let result = sqlx::query("UPDATE operations SET plan_id = $1 WHERE id = $2")
        .bind(plan_id)
        .bind(operation_id)
        .execute(pool)
        .await
        .context("failed to attach plan to operation")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("operation {operation_id} not found");
    }

    Ok(())
}

/// Unconditionally set an operation's state. Used by `Complete` and by the
/// engine's own terminal transitions.
pub async fn set_operation_state(
    pool: &PgPool,
    id: Uuid,
    state: OperationState,
) -> Result<Operation> {
    let completed_at_clause = matches!(
        state,
        OperationState::Completed | OperationState::Failed | OperationState::Aborted
    );

    let op = if completed_at_clause {
        sqlx::query_as::<_, Operation>(
            "UPDATE operations SET state = $1, completed_at = now() WHERE id = $2 RETURNING *",
        )
        .bind(state)
        .bind(id)
        .fetch_optional(pool)
        .await
    } else {
        sqlx::query_as::<_, Operation>("UPDATE operations SET state = $1 WHERE id = $2 RETURNING *")
            .bind(state)
            .bind(id)
            .fetch_optional(pool)
            .await
    }
    .context("failed to set operation state")?;

    op.ok_or_else(|| anyhow::anyhow!("operation {id} not found"))
}

/// List all operations, newest first.
pub async fn list_operations(pool: &PgPool) -> Result<Vec<Operation>> {
    let ops = sqlx::query_as::<_, Operation>("SELECT * FROM operations ORDER BY created_at DESC")
        .fetch_all(pool)
        .await
        .context("failed to list operations")?;

    Ok(ops)
}
