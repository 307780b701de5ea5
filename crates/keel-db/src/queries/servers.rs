//! Database query functions for the `servers` table: cluster-node
//! membership, fixed for an operation's lifetime (§3).

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Server;

/// Register a node as a member of an operation. Idempotent: re-registering
/// the same `advertise_ip` updates its role/hostname/profile in place.
pub async fn upsert_server(
    pool: &PgPool,
    operation_id: Uuid,
    advertise_ip: &str,
    role: &str,
    hostname: &str,
    profile_selector: &str,
) -> Result<Server> {
    let server = sqlx::query_as::<_, Server>(
        "INSERT INTO servers (advertise_ip, operation_id, role, hostname, profile_selector) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (advertise_ip) DO UPDATE \
         SET role = EXCLUDED.role, \
             hostname = EXCLUDED.hostname, \
             profile_selector = EXCLUDED.profile_selector \
         RETURNING *",
    )
    .bind(advertise_ip)
    .bind(operation_id)
    .bind(role)
    .bind(hostname)
    .bind(profile_selector)
    .fetch_one(pool)
    .await
    .context("failed to upsert server")?;

    Ok(server)
}

/// List every server belonging to an operation.
pub async fn list_servers(pool: &PgPool, operation_id: Uuid) -> Result<Vec<Server>> {
    let servers = sqlx::query_as::<_, Server>(
        "SELECT * FROM servers WHERE operation_id = $1 ORDER BY advertise_ip ASC",
    )
    .bind(operation_id)
    .fetch_all(pool)
    .await
    .context("failed to list servers")?;

    Ok(servers)
}

/// Fetch a single server by its advertise-IP.
pub async fn get_server(pool: &PgPool, advertise_ip: &str) -> Result<Option<Server>> {
    let server = sqlx::query_as::<_, Server>("SELECT * FROM servers WHERE advertise_ip = $1")
        .bind(advertise_ip)
        .fetch_optional(pool)
        .await
        .context("failed to fetch server")?;

    Ok(server)
}
