//! Peer agent service — the per-node half of §4.C. Runs as an `axum` HTTP
//! service inside the `keel-agent` binary; exposes `Dispatch`/`Stop`/`Abort`/
//! `Status` to the controller's [`super::runner::AgentRunner`].
//!
//! Grounded on `gator-cli::serve_cmd`'s house style: `Router` +
//! `tower_http::cors::CorsLayer` + graceful shutdown on `ctrl_c`. Adapted
//! from that file's read-only status API to a mutating RPC surface, and
//! bearer-token-gated per §6 ("agent URL encodes `https://host:port?token=…`").

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;

use super::types::{ControlRequest, DispatchRequest, ProgressEvent, StatusResponse};
use crate::token::{TokenConfig, validate_token};

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: String,
}

struct AppError(StatusCode, String);

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        (self.0, Json(serde_json::json!({ "error": self.1 }))).into_response()
    }
}

fn unauthorized(msg: impl Into<String>) -> AppError {
    AppError(StatusCode::UNAUTHORIZED, msg.into())
}

/// Shared state for the peer agent service: the credential it authenticates
/// inbound calls against, its own advertise IP, and the set of phase ids
/// currently in flight (for `GET /status`).
#[derive(Clone)]
pub struct PeerState {
    pub token_config: Arc<TokenConfig>,
    pub advertise_ip: String,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl PeerState {
    pub fn new(token_config: TokenConfig, advertise_ip: impl Into<String>) -> Self {
        Self {
            token_config: Arc::new(token_config),
            advertise_ip: advertise_ip.into(),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn authenticate(&self, token: &str) -> Result<(), AppError> {
        validate_token(&self.token_config, token)
            .map(|_| ())
            .map_err(|e| unauthorized(format!("invalid token: {e}")))
    }
}

pub fn build_router(state: PeerState) -> Router {
    Router::new()
        .route("/dispatch", post(dispatch))
        .route("/stop", post(stop))
        .route("/abort", post(abort))
        .route("/status", get(status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run_peer(state: PeerState, bind: &str, port: u16) -> anyhow::Result<()> {
    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!(%addr, "peer agent listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("peer agent shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

async fn dispatch(
    State(state): State<PeerState>,
    Query(q): Query<TokenQuery>,
    Json(req): Json<DispatchRequest>,
) -> Result<axum::response::Response, AppError> {
    state.authenticate(&q.token)?;

    let phase_id = req.phase_id.clone();
    state.in_flight.lock().await.insert(phase_id.clone());

    let in_flight = state.in_flight.clone();
    let body_stream = async_stream::stream! {
        let running = ProgressEvent::running(phase_id.clone(), format!("running executor {}", req.executor));
        yield Ok::<_, std::convert::Infallible>(axum::body::Bytes::from(ndjson_line(&running)));

        // The actual node-side action (writing config, restarting a
        // service, reconciling DNS/network state) is explicitly out of
        // scope for the common controller contract -- this path is the
        // point a concrete deployment wires its own node action into.
        tokio::time::sleep(Duration::from_millis(1)).await;

        let done = ProgressEvent::completed(phase_id.clone());
        yield Ok(axum::body::Bytes::from(ndjson_line(&done)));

        in_flight.lock().await.remove(&phase_id);
    };

    Ok(axum::response::Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/x-ndjson")
        .body(Body::from_stream(body_stream))
        .expect("building a streaming ndjson response must not fail")
        .into_response())
}

async fn stop(
    State(state): State<PeerState>,
    Query(q): Query<TokenQuery>,
    Json(req): Json<ControlRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.authenticate(&q.token)?;
    // Cooperative: idempotent whether or not the phase is still in flight.
    state.in_flight.lock().await.remove(&req.phase_id);
    Ok(Json(serde_json::json!({"stopped": req.phase_id})))
}

async fn abort(
    State(state): State<PeerState>,
    Query(q): Query<TokenQuery>,
    Json(req): Json<ControlRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.authenticate(&q.token)?;
    // Forced: same effect as stop at this layer: the registries that make
    // abort distinct from stop live in the controller's lifecycle
    // supervisor, not here.
    state.in_flight.lock().await.remove(&req.phase_id);
    Ok(Json(serde_json::json!({"aborted": req.phase_id})))
}

async fn status(
    State(state): State<PeerState>,
    Query(q): Query<TokenQuery>,
) -> Result<Json<StatusResponse>, AppError> {
    state.authenticate(&q.token)?;
    let in_flight: Vec<String> = state.in_flight.lock().await.iter().cloned().collect();
    Ok(Json(StatusResponse {
        advertise_ip: state.advertise_ip.clone(),
        in_flight,
    }))
}

fn ndjson_line(event: &ProgressEvent) -> String {
    let mut line = serde_json::to_string(event).expect("ProgressEvent always serializes");
    line.push('\n');
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::token::generate_token;

    fn test_state() -> PeerState {
        PeerState::new(TokenConfig::new(b"peer-test-secret".to_vec()), "10.0.0.5")
    }

    fn token_for(state: &PeerState) -> String {
        generate_token(&state.token_config, uuid::Uuid::nil(), 0)
    }

    #[tokio::test]
    async fn status_requires_valid_token() {
        let state = test_state();
        let app = build_router(state);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/status?token=garbage")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn status_reports_advertise_ip_with_valid_token() {
        let state = test_state();
        let token = token_for(&state);
        let app = build_router(state);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri(format!("/status?token={token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), 65536).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["advertise_ip"], "10.0.0.5");
    }

    #[tokio::test]
    async fn dispatch_streams_running_then_completed() {
        let state = test_state();
        let token = token_for(&state);
        let app = build_router(state);

        let req = DispatchRequest {
            phase_id: "validate".to_string(),
            executor: "validate".to_string(),
            data: serde_json::json!({}),
        };

        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/dispatch?token={token}"))
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&req).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(resp.into_body(), 65536).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"running\""));
        assert!(lines[1].contains("\"completed\""));
    }

    #[tokio::test]
    async fn stop_and_abort_are_idempotent() {
        let state = test_state();
        let token = token_for(&state);
        let app = build_router(state);

        for route in ["/stop", "/abort"] {
            for _ in 0..2 {
                let resp = app
                    .clone()
                    .oneshot(
                        Request::builder()
                            .method("POST")
                            .uri(format!("{route}?token={token}"))
                            .header("content-type", "application/json")
                            .body(Body::from(
                                serde_json::to_vec(&ControlRequest {
                                    phase_id: "validate".to_string(),
                                })
                                .unwrap(),
                            ))
                            .unwrap(),
                    )
                    .await
                    .unwrap();
                assert_eq!(resp.status(), StatusCode::OK);
            }
        }
    }
}
