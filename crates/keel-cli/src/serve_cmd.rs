//! Wires together the storage layer, executor/initializer registries, and
//! the lifecycle supervisor into a running controller server (§4.F). This
//! is the operator-facing `keelctl serve` entry point.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use keel_core::executor::{CidrValidateExecutor, ExecutorRegistry, FabricExecutor};
use keel_core::fabric::AgentRunner;
use keel_core::initializer::default_registry;
use keel_core::plan_engine::PlanEngine;
use keel_core::server::{self, ServerState};
use keel_core::supervisor::LifecycleSupervisor;
use keel_core::token::TokenConfig;
use keel_db::config::DbConfig;
use keel_db::pool;

/// Shutdown grace period: time a stop request waits for in-flight teardown
/// handlers before returning regardless.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// `keelctl serve`: ensure the database is migrated, build the registries,
/// and serve the controller's Unix-socket RPC surface until the lifecycle
/// supervisor's cancellation token fires.
pub async fn run_server(
    db_config: &DbConfig,
    token_config: TokenConfig,
    socket_path: &std::path::Path,
) -> Result<()> {
    pool::ensure_database_exists(db_config).await?;
    let db_pool = pool::create_pool(db_config).await?;
    pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;

    let fabric = FabricExecutor::new(AgentRunner::new());

    let mut executors = ExecutorRegistry::new();
    executors.register(CidrValidateExecutor);
    executors.register(fabric.clone());

    let engine = Arc::new(PlanEngine::new(
        db_pool.clone(),
        Arc::new(executors),
        Arc::new(default_registry()),
        fabric,
        Arc::new(token_config),
    ));

    let cancel = CancellationToken::new();
    let supervisor = Arc::new(Mutex::new(LifecycleSupervisor::new(cancel, SHUTDOWN_TIMEOUT)));
    let state = Arc::new(ServerState::new(engine, supervisor));

    let result = server::run_unix(state, socket_path).await;
    db_pool.close().await;
    result
}
