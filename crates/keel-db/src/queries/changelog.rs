//! Database query functions for the `changelog` table: `AppendChangelog`.
//!
//! Entries are append-only and totally ordered by monotonic revision (§4.A).

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::ChangelogEntry;

/// Append a changelog entry for an operation. `revision` should be the
/// phase's new revision (or the operation's own monotonic counter for
/// operation-level entries such as `Complete`).
pub async fn append_changelog(
    pool: &PgPool,
    operation_id: Uuid,
    revision: i64,
    phase_id: Option<&str>,
    entry_type: &str,
    message: &str,
) -> Result<ChangelogEntry> {
    let entry = sqlx::query_as::<_, ChangelogEntry>(
        "INSERT INTO changelog (operation_id, revision, phase_id, entry_type, message) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(operation_id)
    .bind(revision)
    .bind(phase_id)
    .bind(entry_type)
    .bind(message)
    .fetch_one(pool)
    .await
    .context("failed to append changelog entry")?;

    Ok(entry)
}

/// List every changelog entry for an operation, oldest first -- the audit
/// trail retained after the operation completes.
pub async fn list_changelog(pool: &PgPool, operation_id: Uuid) -> Result<Vec<ChangelogEntry>> {
    let entries = sqlx::query_as::<_, ChangelogEntry>(
        "SELECT * FROM changelog WHERE operation_id = $1 ORDER BY revision ASC, id ASC",
    )
    .bind(operation_id)
    .fetch_all(pool)
    .await
    .context("failed to list changelog entries")?;

    Ok(entries)
}
