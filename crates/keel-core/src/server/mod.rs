//! Controller server (§4.F): the client-facing RPC surface over a local
//! listener. Grounded on `gator-cli::serve_cmd`'s axum Router/CorsLayer/
//! graceful-shutdown idiom, generalized from a read-only plan-inspection
//! API to the mutating `Execute`/`Complete`/`Abort`/`Shutdown`/`SetPhase`
//! surface of §6, with an execution-token semaphore serializing `Execute`
//! per §4.F/§5.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Mutex, Semaphore};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use keel_db::models::{OperationFlavor, PhaseState};

use crate::errors::EngineError;
use crate::fabric::ProgressEvent;
use crate::plan_engine::{CreateOperationOutcome, PlanEngine, PlanOutcome, ServerRegistration};
use crate::supervisor::LifecycleSupervisor;

const PROGRESS_CHANNEL_CAPACITY: usize = 1024;

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::PreconditionFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            EngineError::StaleRevision { .. } => StatusCode::CONFLICT,
            EngineError::PhaseFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::Aborted(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Transport(_) => StatusCode::BAD_GATEWAY,
            EngineError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

/// `ExecuteRequest.phase == None` means "run the whole plan" -- this is also
/// the resume path: the frontier calculation already skips `completed`
/// phases, so re-issuing a whole-plan `Execute` against an in-progress
/// operation picks up wherever it left off (§8 scenario 3). `phase: Some`
/// instead runs (or rolls back) one named phase via `ExecutePhase`/
/// `RollbackPhase`.
#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub operation_id: Uuid,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub phase: Option<PhaseRequest>,
}

/// Rollback timeout used when a `PhaseRequest` omits `timeout_secs`.
const DEFAULT_ROLLBACK_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Deserialize)]
pub struct PhaseRequest {
    pub id: String,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub rollback: bool,
    #[serde(default)]
    pub dry_run: bool,
    /// Only consulted when `rollback` is set; §4.D's `RollbackPhase(ctx,
    /// {phaseId, force, dry-run}, timeout)` takes an explicit timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub outcome: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_phases: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct OperationKeyRequest {
    pub operation_id: Uuid,
    #[serde(default)]
    pub error: Option<String>,
}

/// §3's `Server` identity, as supplied by the client at operation setup.
#[derive(Debug, Deserialize)]
pub struct ServerSpec {
    pub advertise_ip: String,
    pub role: String,
    pub hostname: String,
    pub profile_selector: String,
}

/// `CreateOperation` (§2, §4.E): validate preconditions for `flavor` against
/// `payload`, then create the operation and register `servers` as its
/// members. No operation record is created if validation fails (§8
/// scenario 4).
#[derive(Debug, Deserialize)]
pub struct CreateOperationRequest {
    pub account: String,
    pub cluster: String,
    pub flavor: OperationFlavor,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub servers: Vec<ServerSpec>,
}

#[derive(Debug, Serialize)]
pub struct CreateOperationResponse {
    pub operation_id: Uuid,
    pub outcome: String,
}

#[derive(Debug, Deserialize)]
pub struct SetPhaseRequest {
    pub operation_id: Uuid,
    pub id: String,
    pub state: PhaseState,
}

pub struct ServerState {
    pub engine: Arc<PlanEngine>,
    pub supervisor: Arc<Mutex<LifecycleSupervisor>>,
    execution_token: Arc<Semaphore>,
    progress_tx: broadcast::Sender<ProgressEvent>,
}

impl ServerState {
    pub fn new(engine: Arc<PlanEngine>, supervisor: Arc<Mutex<LifecycleSupervisor>>) -> Self {
        let (progress_tx, _rx) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        Self {
            engine,
            supervisor,
            execution_token: Arc::new(Semaphore::new(1)),
            progress_tx,
        }
    }
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/create-operation", post(create_operation))
        .route("/execute", post(execute))
        .route("/complete", post(complete))
        .route("/abort", post(abort))
        .route("/shutdown", post(shutdown))
        .route("/set-phase", post(set_phase))
        .route("/events", get(events))
        .with_state(state)
}

/// `Run(listener)`: serve until the lifecycle supervisor's cancellation
/// token fires, then return. Callers decide stop-vs-abort based on why the
/// token fired, per §4.F's run-loop termination rule.
pub async fn run_unix(state: Arc<ServerState>, socket_path: &std::path::Path) -> anyhow::Result<()> {
    let _ = std::fs::remove_file(socket_path);
    let app = build_router(state.clone());
    let listener = tokio::net::UnixListener::bind(socket_path)?;
    let cancel = state.supervisor.lock().await.cancellation_token();
    tracing::info!(path = %socket_path.display(), "controller server listening");

    let serve = axum::serve(listener, app.into_make_service());
    tokio::select! {
        result = serve => { result?; }
        _ = cancel.cancelled() => {
            tracing::info!("controller server shutting down on cancellation");
        }
    }

    tracing::info!("controller server shut down");
    Ok(())
}

async fn create_operation(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<CreateOperationRequest>,
) -> Result<Json<CreateOperationResponse>, AppError> {
    let servers: Vec<ServerRegistration> = req
        .servers
        .into_iter()
        .map(|s| ServerRegistration {
            advertise_ip: s.advertise_ip,
            role: s.role,
            hostname: s.hostname,
            profile_selector: s.profile_selector,
        })
        .collect();

    let outcome = state
        .engine
        .create_operation(&req.account, &req.cluster, req.flavor, &req.payload, &servers)
        .await?;

    let response = match outcome {
        CreateOperationOutcome::Created(operation) => CreateOperationResponse {
            operation_id: operation.id,
            outcome: "created".to_string(),
        },
        CreateOperationOutcome::AlreadyExists(operation) => CreateOperationResponse {
            operation_id: operation.id,
            outcome: "already-exists".to_string(),
        },
    };

    Ok(Json(response))
}

async fn execute(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, AppError> {
    let cancel = state.supervisor.lock().await.cancellation_token();

    let permit = tokio::select! {
        permit = state.execution_token.acquire() => permit.map_err(|_| AppError {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: "execution token closed".to_string(),
        })?,
        _ = cancel.cancelled() => {
            return Err(AppError {
                status: StatusCode::SERVICE_UNAVAILABLE,
                message: "cancelled waiting for execution token".to_string(),
            });
        }
    };

    let (sink, mut source) = mpsc::channel::<ProgressEvent>(256);
    let progress_tx = state.progress_tx.clone();
    let pump = tokio::spawn(async move {
        while let Some(event) = source.recv().await {
            let _ = progress_tx.send(event);
        }
    });

    let result = match &req.phase {
        None => state
            .engine
            .execute_plan(req.operation_id, &req.payload, &sink, cancel)
            .await
            .map(|outcome| match outcome {
                PlanOutcome::Completed => ExecuteResponse {
                    outcome: "completed".to_string(),
                    failed_phases: Vec::new(),
                },
                PlanOutcome::Failed { failed_phases } => ExecuteResponse {
                    outcome: "failed".to_string(),
                    failed_phases,
                },
                PlanOutcome::Aborted => ExecuteResponse {
                    outcome: "aborted".to_string(),
                    failed_phases: Vec::new(),
                },
            }),
        Some(phase) if phase.rollback => state
            .engine
            .rollback_phase(
                req.operation_id,
                &phase.id,
                phase.force,
                Duration::from_secs(phase.timeout_secs.unwrap_or(DEFAULT_ROLLBACK_TIMEOUT_SECS)),
                &sink,
            )
            .await
            .map(|()| ExecuteResponse {
                outcome: "rolled-back".to_string(),
                failed_phases: Vec::new(),
            }),
        Some(phase) => state
            .engine
            .execute_phase(req.operation_id, &phase.id, phase.force, phase.dry_run, &sink)
            .await
            .map(|()| ExecuteResponse {
                outcome: "completed".to_string(),
                failed_phases: Vec::new(),
            }),
    };

    drop(sink);
    let _ = pump.await;
    drop(permit);

    result.map(Json).map_err(AppError::from)
}

async fn complete(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<OperationKeyRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let operation = state.engine.complete(req.operation_id, req.error).await?;
    Ok(Json(serde_json::json!({ "state": operation.state })))
}

async fn abort(State(state): State<Arc<ServerState>>) -> Json<serde_json::Value> {
    let errors = state.supervisor.lock().await.abort().await;
    state.execution_token.close();
    Json(serde_json::json!({ "aborted": true, "teardown_errors": errors.0.len() }))
}

async fn shutdown(State(state): State<Arc<ServerState>>) -> Json<serde_json::Value> {
    let errors = state.supervisor.lock().await.stop().await;
    Json(serde_json::json!({ "stopped": true, "teardown_errors": errors.0.len() }))
}

async fn set_phase(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<SetPhaseRequest>,
) -> Result<Json<keel_db::models::Phase>, AppError> {
    let phase = state
        .engine
        .set_phase(req.operation_id, &req.id, req.state)
        .await?;
    Ok(Json(phase))
}

/// `Stream(progress)`: events broadcast to every connected client in FIFO
/// order. A slow/disconnected subscriber that falls behind the broadcast
/// channel's capacity is dropped rather than blocking the producer.
async fn events(
    State(state): State<Arc<ServerState>>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = state.progress_tx.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|item| match item {
        Ok(event) => serde_json::to_string(&event)
            .ok()
            .map(|json| Ok(SseEvent::default().data(json))),
        Err(_lagged) => None,
    });
    Sse::new(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{CidrValidateExecutor, ExecutorRegistry, FabricExecutor};
    use crate::fabric::AgentRunner;
    use crate::initializer::default_registry;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state(pool: sqlx::PgPool) -> Arc<ServerState> {
        let fabric = FabricExecutor::new(AgentRunner::new());
        let mut executors = ExecutorRegistry::new();
        executors.register(CidrValidateExecutor);
        executors.register(fabric.clone());
        let engine = Arc::new(PlanEngine::new(
            pool,
            Arc::new(executors),
            Arc::new(default_registry()),
            fabric,
            Arc::new(crate::token::TokenConfig::new(b"server-test-secret".to_vec())),
        ));
        let supervisor = Arc::new(Mutex::new(LifecycleSupervisor::new(
            CancellationToken::new(),
            Duration::from_secs(5),
        )));
        Arc::new(ServerState::new(engine, supervisor))
    }

    #[tokio::test]
    async fn complete_rejects_unknown_operation() {
        let (pool, db_name) = keel_test_utils::create_test_db().await;
        let app = build_router(test_state(pool.clone()));

        let body = serde_json::json!({ "operation_id": Uuid::new_v4() }).to_string();
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/complete")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        pool.close().await;
        keel_test_utils::drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn create_operation_rejects_conflicting_cidr_and_creates_nothing() {
        let (pool, db_name) = keel_test_utils::create_test_db().await;
        let app = build_router(test_state(pool.clone()));

        let body = serde_json::json!({
            "account": "acme",
            "cluster": "prod",
            "flavor": "reconfigure",
            "payload": {
                "requested_cidr": "10.0.0.128/25",
                "existing_cidrs": ["10.0.0.0/24"],
                "servers": ["10.0.0.5"],
            },
        })
        .to_string();

        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/create-operation")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let operations = keel_db::queries::operations::list_operations(&pool).await.unwrap();
        assert!(operations.is_empty());

        pool.close().await;
        keel_test_utils::drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn create_operation_succeeds_and_registers_servers() {
        let (pool, db_name) = keel_test_utils::create_test_db().await;
        let app = build_router(test_state(pool.clone()));

        let body = serde_json::json!({
            "account": "acme",
            "cluster": "prod",
            "flavor": "reconfigure",
            "payload": {
                "requested_cidr": "10.1.0.0/24",
                "existing_cidrs": ["10.0.0.0/24"],
                "servers": ["10.0.0.5"],
            },
            "servers": [{
                "advertise_ip": "10.0.0.5",
                "role": "master",
                "hostname": "node1",
                "profile_selector": "default",
            }],
        })
        .to_string();

        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/create-operation")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let body_bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let response: CreateOperationResponseBody = serde_json::from_slice(&body_bytes).unwrap();
        assert_eq!(response.outcome, "created");

        let servers = keel_db::queries::servers::list_servers(&pool, response.operation_id)
            .await
            .unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].advertise_ip, "10.0.0.5");

        pool.close().await;
        keel_test_utils::drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn create_operation_is_idempotent_by_account_and_cluster() {
        let (pool, db_name) = keel_test_utils::create_test_db().await;
        let app = build_router(test_state(pool.clone()));

        let body = serde_json::json!({
            "account": "acme",
            "cluster": "prod",
            "flavor": "reconfigure",
            "payload": {
                "requested_cidr": "10.1.0.0/24",
                "existing_cidrs": [],
                "servers": ["10.0.0.5"],
            },
        })
        .to_string();

        for _ in 0..2 {
            let resp = app
                .clone()
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/create-operation")
                        .header("content-type", "application/json")
                        .body(Body::from(body.clone()))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }

        let operations = keel_db::queries::operations::list_operations(&pool).await.unwrap();
        assert_eq!(operations.len(), 1);

        pool.close().await;
        keel_test_utils::drop_test_db(&db_name).await;
    }

    #[derive(serde::Deserialize)]
    struct CreateOperationResponseBody {
        operation_id: Uuid,
        outcome: String,
    }

    #[tokio::test]
    async fn shutdown_runs_stoppers_and_returns_ok() {
        let (pool, db_name) = keel_test_utils::create_test_db().await;
        let app = build_router(test_state(pool.clone()));

        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/shutdown")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        pool.close().await;
        keel_test_utils::drop_test_db(&db_name).await;
    }
}
