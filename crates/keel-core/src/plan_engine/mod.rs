//! Plan engine / FSM (§4.D): `ExecutePlan`, `ExecutePhase`, `RollbackPhase`,
//! `SetPhase`, `Complete`.
//!
//! Grounded on `gator-core::orchestrator::run_orchestrator` (DAG frontier
//! loop, cancellation draining, retry/escalate decision) generalized from
//! "tasks run by LLM harnesses" to "phases run by cluster agents", and on
//! `gator-core::state::TaskStateMachine` (valid-transition table +
//! optimistic-locked `transition`) generalized from the 7-state task
//! lifecycle to the 5-state phase lifecycle plus a `rolled-back` terminal.

pub mod fsm;

pub use fsm::PhaseStateMachine;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use keel_db::models::{ErrorKind, Operation, OperationFlavor, OperationState, Phase, PhaseState};
use keel_db::queries::{changelog, operations, phases as phase_db, plans as plan_db, servers as server_db};

use crate::errors::EngineError;
use crate::executor::{ExecutorContext, ExecutorRegistry, FabricExecutor};
use crate::fabric::{ProgressEvent, mint_peer_profile};
use crate::initializer::InitializerRegistry;
use crate::phase_graph::PhaseGraph;
use crate::token::TokenConfig;

/// Port every `keel-agentd` peer listens on. Servers are addressed by
/// hostname at this fixed port; there is no per-server port column in
/// `servers` since §3 fixes the peer-agent contract per deployment.
const PEER_AGENT_PORT: u16 = 7777;

/// What `ExecutePlan`/`ExecutePhase` settled on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanOutcome {
    /// Every phase reached `completed`.
    Completed,
    /// The frontier emptied out with one or more phases stuck `failed`.
    Failed { failed_phases: Vec<String> },
    /// Cancelled mid-flight; the in-flight phase was allowed to finish.
    Aborted,
}

/// A node to register as a member of the operation being created, per §3's
/// `Server` identity (advertise-IP, role, hostname, profile-selector).
#[derive(Debug, Clone)]
pub struct ServerRegistration {
    pub advertise_ip: String,
    pub role: String,
    pub hostname: String,
    pub profile_selector: String,
}

/// What `CreateOperation` settled on.
#[derive(Debug, Clone)]
pub enum CreateOperationOutcome {
    /// A fresh operation record was created for this `(account, cluster)`.
    Created(Operation),
    /// An operation already exists for this `(account, cluster)` and is not
    /// yet terminal; `already-exists` belongs here, not at `ExecutePlan`,
    /// since it is a plan-creation-time concept (§2, §8 scenario 5).
    AlreadyExists(Operation),
}

/// Holds the shared registries the plan engine drives phases through.
/// Constructed once per controller process.
pub struct PlanEngine {
    pool: sqlx::PgPool,
    executors: Arc<ExecutorRegistry>,
    initializers: Arc<InitializerRegistry>,
    fabric: FabricExecutor,
    token_config: Arc<TokenConfig>,
}

impl PlanEngine {
    pub fn new(
        pool: sqlx::PgPool,
        executors: Arc<ExecutorRegistry>,
        initializers: Arc<InitializerRegistry>,
        fabric: FabricExecutor,
        token_config: Arc<TokenConfig>,
    ) -> Self {
        Self {
            pool,
            executors,
            initializers,
            fabric,
            token_config,
        }
    }

    /// Mint a fresh operation-scoped [`crate::fabric::PeerProfile`] for
    /// every server that has joined this operation and register it with the
    /// fabric executor, so `"fabric"`-executor phases can dial out. Re-run
    /// on every `ExecutePlan` entry (including resumes) since the in-memory
    /// peer map does not survive a controller restart.
    async fn sync_peers(&self, operation_id: Uuid) -> Result<(), EngineError> {
        let servers = keel_db::queries::servers::list_servers(&self.pool, operation_id)
            .await
            .map_err(EngineError::from)?;
        for server in servers {
            let base_url = format!("http://{}:{PEER_AGENT_PORT}", server.hostname);
            let profile = mint_peer_profile(&self.token_config, operation_id, &server.advertise_ip, base_url);
            self.fabric.register_peer(profile).await;
        }
        Ok(())
    }

    /// §2/§4.E: validate preconditions, then create the operation and
    /// register its member servers. Idempotent by `(account, cluster)`
    /// identity: a non-terminal operation already on file for that pair is
    /// returned as `AlreadyExists` rather than validated or created again.
    pub async fn create_operation(
        &self,
        account: &str,
        cluster: &str,
        flavor: OperationFlavor,
        payload: &serde_json::Value,
        servers: &[ServerRegistration],
    ) -> Result<CreateOperationOutcome, EngineError> {
        if let Some(existing) = operations::find_active_operation(&self.pool, account, cluster)
            .await
            .map_err(EngineError::from)?
        {
            return Ok(CreateOperationOutcome::AlreadyExists(existing));
        }

        let initializer = self.initializers.get(flavor).ok_or_else(|| {
            EngineError::NotImplemented(format!("no initializer for flavor {flavor}"))
        })?;

        initializer.validate_preconditions(payload).await?;

        let operation = initializer.new_operation(&self.pool, account, cluster).await?;

        for server in servers {
            server_db::upsert_server(
                &self.pool,
                operation.id,
                &server.advertise_ip,
                &server.role,
                &server.hostname,
                &server.profile_selector,
            )
            .await
            .map_err(EngineError::from)?;
        }

        Ok(CreateOperationOutcome::Created(operation))
    }

    /// On first call for an operation with no plan yet, build one via the
    /// flavor's `newOperationPlan` and persist it. If a plan already
    /// exists, returns it unchanged (`already-exists`, treated as success).
    async fn ensure_plan(
        &self,
        operation_id: Uuid,
        payload: &serde_json::Value,
    ) -> Result<(keel_db::models::Plan, bool), EngineError> {
        if let Some(plan) = plan_db::get_plan_by_operation(&self.pool, operation_id)
            .await
            .map_err(EngineError::from)?
        {
            return Ok((plan, true));
        }

        let operation = operations::get_operation(&self.pool, operation_id)
            .await
            .map_err(EngineError::from)?
            .ok_or_else(|| EngineError::Fatal(format!("operation {operation_id} not found")))?;

        let initializer = self.initializers.get(operation.flavor).ok_or_else(|| {
            EngineError::NotImplemented(format!("no initializer for flavor {}", operation.flavor))
        })?;

        let cluster_revision = payload
            .get("cluster_revision")
            .and_then(|v| v.as_str())
            .unwrap_or("unset");

        let new_phases = initializer.new_operation_plan(&operation, payload).await?;
        let plan = plan_db::save_plan(&self.pool, operation_id, cluster_revision, &new_phases)
            .await
            .map_err(EngineError::from)?;
        operations::attach_plan(&self.pool, operation_id, plan.id)
            .await
            .map_err(EngineError::from)?;

        Ok((plan, false))
    }

    /// Drive the plan to completion, forwarding progress events to `sink`
    /// as they arrive. §4.D algorithm: load plan, compute frontier, run the
    /// deterministically earliest phase, repeat until the frontier is empty.
    pub async fn execute_plan(
        &self,
        operation_id: Uuid,
        payload: &serde_json::Value,
        sink: &mpsc::Sender<ProgressEvent>,
        cancel: CancellationToken,
    ) -> Result<PlanOutcome, EngineError> {
        self.sync_peers(operation_id).await?;

        let (plan, existed) = self.ensure_plan(operation_id, payload).await?;
        if existed {
            tracing::info!(plan_id = %plan.id, "plan already exists, resuming from the frontier");
        }

        let orphaned = phase_db::reset_orphaned_phases(&self.pool, plan.id)
            .await
            .map_err(EngineError::from)?;
        for phase in &orphaned {
            tracing::warn!(plan_id = %plan.id, phase_id = %phase.id, "reset orphaned phase to failed");
        }

        operations::set_operation_state(&self.pool, operation_id, OperationState::InProgress)
            .await
            .map_err(EngineError::from)?;

        loop {
            if cancel.is_cancelled() {
                tracing::info!(plan_id = %plan.id, "ExecutePlan cancelled, stopping after current phase");
                return Ok(PlanOutcome::Aborted);
            }

            if phase_db::all_phases_completed(&self.pool, plan.id)
                .await
                .map_err(EngineError::from)?
            {
                operations::set_operation_state(&self.pool, operation_id, OperationState::Completed)
                    .await
                    .map_err(EngineError::from)?;
                return Ok(PlanOutcome::Completed);
            }

            let frontier = phase_db::get_frontier(&self.pool, plan.id)
                .await
                .map_err(EngineError::from)?;

            if frontier.is_empty() {
                let failed = phase_db::list_failed_phases(&self.pool, plan.id)
                    .await
                    .map_err(EngineError::from)?;
                operations::set_operation_state(&self.pool, operation_id, OperationState::Failed)
                    .await
                    .map_err(EngineError::from)?;
                return Ok(PlanOutcome::Failed {
                    failed_phases: failed.into_iter().map(|p| p.id).collect(),
                });
            }

            let all = phase_db::list_phases(&self.pool, plan.id)
                .await
                .map_err(EngineError::from)?;
            let requires = collect_requires(&self.pool, plan.id, &all).await?;
            let graph = PhaseGraph::build(&all, &requires);
            let candidate_ids: Vec<String> = frontier.iter().map(|p| p.id.clone()).collect();
            let next_id = graph
                .earliest(&candidate_ids)
                .ok_or_else(|| EngineError::Fatal("frontier non-empty but graph disagrees".to_string()))?
                .to_string();
            let phase = frontier.into_iter().find(|p| p.id == next_id).expect("present");

            self.run_one_phase(operation_id, &plan, &phase, sink).await?;
        }
    }

    /// Run a single named phase (and its subtree, if it's a composite
    /// parent) per `ExecutePhase`. `force` skips the `requires` check.
    pub async fn execute_phase(
        &self,
        operation_id: Uuid,
        phase_id: &str,
        force: bool,
        dry_run: bool,
        sink: &mpsc::Sender<ProgressEvent>,
    ) -> Result<(), EngineError> {
        self.sync_peers(operation_id).await?;

        let plan = plan_db::get_plan_by_operation(&self.pool, operation_id)
            .await
            .map_err(EngineError::from)?
            .ok_or_else(|| EngineError::Fatal(format!("no plan for operation {operation_id}")))?;

        let phase = phase_db::get_phase(&self.pool, plan.id, phase_id)
            .await
            .map_err(EngineError::from)?
            .ok_or_else(|| EngineError::Fatal(format!("phase {phase_id} not found")))?;

        if !force {
            let all_phases = phase_db::list_phases(&self.pool, plan.id)
                .await
                .map_err(EngineError::from)?;
            let requires_ids =
                keel_db::queries::plans::get_requires(&self.pool, plan.id, phase_id)
                    .await
                    .map_err(EngineError::from)?;
            for req_id in &requires_ids {
                let dep = all_phases
                    .iter()
                    .find(|p| &p.id == req_id)
                    .ok_or_else(|| EngineError::Fatal(format!("unknown dependency {req_id}")))?;
                if !matches!(dep.state, PhaseState::Completed | PhaseState::RolledBack) {
                    return Err(EngineError::PreconditionFailed(format!(
                        "phase {phase_id} requires {req_id} to be completed or rolled back, got {}",
                        dep.state
                    )));
                }
            }
        }

        if dry_run {
            tracing::info!(plan_id = %plan.id, phase_id = %phase.id, "dry-run: would execute phase");
            return Ok(());
        }

        self.run_one_phase(operation_id, &plan, &phase, sink).await
    }

    /// Drive one phase through the executor registry, persisting the
    /// `in-progress -> completed|failed` transition with CAS and appending
    /// a changelog entry.
    async fn run_one_phase(
        &self,
        operation_id: Uuid,
        plan: &keel_db::models::Plan,
        phase: &Phase,
        sink: &mpsc::Sender<ProgressEvent>,
    ) -> Result<(), EngineError> {
        let started =
            phase_db::update_phase(&self.pool, plan.id, &phase.id, phase.revision, PhaseState::InProgress, None)
                .await?;

        changelog::append_changelog(
            &self.pool,
            operation_id,
            started.revision,
            Some(&phase.id),
            "phase-started",
            &format!("phase {} entered in-progress", phase.id),
        )
        .await
        .map_err(EngineError::from)?;

        let ctx = ExecutorContext {
            operation_id,
            plan_id: plan.id,
        };

        let outcome = crate::executor::run_phase(&self.executors, &ctx, &started, sink).await;

        match outcome {
            Ok(()) => {
                let done = phase_db::update_phase(
                    &self.pool,
                    plan.id,
                    &phase.id,
                    started.revision,
                    PhaseState::Completed,
                    None,
                )
                .await?;
                changelog::append_changelog(
                    &self.pool,
                    operation_id,
                    done.revision,
                    Some(&phase.id),
                    "phase-completed",
                    &format!("phase {} completed", phase.id),
                )
                .await
                .map_err(EngineError::from)?;
                Ok(())
            }
            Err(e) => {
                let kind = e.kind();
                let message = e.to_string();
                let failed = phase_db::update_phase(
                    &self.pool,
                    plan.id,
                    &phase.id,
                    started.revision,
                    PhaseState::Failed,
                    Some((kind, message.clone())),
                )
                .await?;
                changelog::append_changelog(
                    &self.pool,
                    operation_id,
                    failed.revision,
                    Some(&phase.id),
                    "phase-failed",
                    &message,
                )
                .await
                .map_err(EngineError::from)?;
                Err(e)
            }
        }
    }

    /// `RollbackPhase`: `completed -> in-progress(rollback) -> rolled-back`.
    /// Children must already be `rolled-back`/`unstarted` unless `force`.
    /// `timeout` bounds only this phase's rollback work.
    pub async fn rollback_phase(
        &self,
        operation_id: Uuid,
        phase_id: &str,
        force: bool,
        timeout: Duration,
        sink: &mpsc::Sender<ProgressEvent>,
    ) -> Result<(), EngineError> {
        self.sync_peers(operation_id).await?;

        let plan = plan_db::get_plan_by_operation(&self.pool, operation_id)
            .await
            .map_err(EngineError::from)?
            .ok_or_else(|| EngineError::Fatal(format!("no plan for operation {operation_id}")))?;

        let phase = phase_db::get_phase(&self.pool, plan.id, phase_id)
            .await
            .map_err(EngineError::from)?
            .ok_or_else(|| EngineError::Fatal(format!("phase {phase_id} not found")))?;

        if phase.state != PhaseState::Completed {
            return Err(EngineError::PreconditionFailed(format!(
                "phase {phase_id} is {}, only completed phases can be rolled back",
                phase.state
            )));
        }

        if !force {
            let children = phase_db::list_children(&self.pool, plan.id, Some(phase_id))
                .await
                .map_err(EngineError::from)?;
            for child in &children {
                if !matches!(child.state, PhaseState::RolledBack | PhaseState::Unstarted) {
                    return Err(EngineError::PreconditionFailed(format!(
                        "child phase {} must be rolled back or unstarted first",
                        child.id
                    )));
                }
            }
        }

        let in_progress = phase_db::update_phase(
            &self.pool,
            plan.id,
            &phase.id,
            phase.revision,
            PhaseState::InProgress,
            None,
        )
        .await?;

        let ctx = ExecutorContext {
            operation_id,
            plan_id: plan.id,
        };

        let rollback_result = tokio::time::timeout(
            timeout,
            crate::executor::run_phase(&self.executors, &ctx, &in_progress, sink),
        )
        .await;

        match rollback_result {
            Ok(Ok(())) => {
                let done = phase_db::update_phase(
                    &self.pool,
                    plan.id,
                    &phase.id,
                    in_progress.revision,
                    PhaseState::RolledBack,
                    None,
                )
                .await?;
                changelog::append_changelog(
                    &self.pool,
                    operation_id,
                    done.revision,
                    Some(&phase.id),
                    "phase-rolled-back",
                    &format!("phase {} rolled back", phase.id),
                )
                .await
                .map_err(EngineError::from)?;
                Ok(())
            }
            Ok(Err(e)) => {
                phase_db::update_phase(
                    &self.pool,
                    plan.id,
                    &phase.id,
                    in_progress.revision,
                    PhaseState::Failed,
                    Some((e.kind(), e.to_string())),
                )
                .await?;
                Err(e)
            }
            Err(_elapsed) => {
                let message = format!("rollback of phase {phase_id} exceeded its timeout");
                phase_db::update_phase(
                    &self.pool,
                    plan.id,
                    &phase.id,
                    in_progress.revision,
                    PhaseState::Failed,
                    Some((ErrorKind::Transport, message.clone())),
                )
                .await?;
                Err(EngineError::Transport(message))
            }
        }
    }

    /// `SetPhase`: administrative override. Bypasses the revision guard and
    /// tags the changelog entry as a manual override.
    pub async fn set_phase(
        &self,
        operation_id: Uuid,
        phase_id: &str,
        state: PhaseState,
    ) -> Result<Phase, EngineError> {
        let plan = plan_db::get_plan_by_operation(&self.pool, operation_id)
            .await
            .map_err(EngineError::from)?
            .ok_or_else(|| EngineError::Fatal(format!("no plan for operation {operation_id}")))?;

        let updated = phase_db::set_phase_unconditional(&self.pool, plan.id, phase_id, state)
            .await
            .map_err(EngineError::from)?;

        changelog::append_changelog(
            &self.pool,
            operation_id,
            updated.revision,
            Some(phase_id),
            "manual-override",
            &format!("phase {phase_id} manually set to {state}"),
        )
        .await
        .map_err(EngineError::from)?;

        Ok(updated)
    }

    /// `Complete`: mark the operation terminal. A manual error forces
    /// `Failed` without mutating any phase's persisted state -- this
    /// workspace's resolution of the Open Question on that interaction.
    pub async fn complete(
        &self,
        operation_id: Uuid,
        err: Option<String>,
    ) -> Result<keel_db::models::Operation, EngineError> {
        let state = if err.is_some() {
            OperationState::Failed
        } else {
            OperationState::Completed
        };

        let operation = operations::set_operation_state(&self.pool, operation_id, state)
            .await
            .map_err(EngineError::from)?;

        changelog::append_changelog(
            &self.pool,
            operation_id,
            0,
            None,
            "operation-completed",
            &err.unwrap_or_else(|| "operation completed".to_string()),
        )
        .await
        .map_err(EngineError::from)?;

        Ok(operation)
    }
}

async fn collect_requires(
    pool: &sqlx::PgPool,
    plan_id: Uuid,
    phases: &[Phase],
) -> Result<std::collections::HashMap<String, Vec<String>>, EngineError> {
    let mut out = std::collections::HashMap::new();
    for phase in phases {
        let requires = keel_db::queries::plans::get_requires(pool, plan_id, &phase.id)
            .await
            .map_err(EngineError::from)?;
        out.insert(phase.id.clone(), requires);
    }
    Ok(out)
}
