use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;

use crate::error::GatewayError;
use crate::gateway::VerificationGateway;
use crate::manager::CircuitStatus;
use crate::session::CircuitSession;
use crate::types::{
    CircuitResponse, CircuitView, HealthResponse, ReloadResponse, VerifyRequest, VerifyResponse,
};

/// Shared application state passed to all route handlers.
pub struct AppState {
    pub gateway: VerificationGateway,
}

fn circuit_response(session: &CircuitSession) -> CircuitResponse {
    CircuitResponse {
        circuit: CircuitView::from(session),
        latency_ms: session.last_latency_ms().unwrap_or_default(),
    }
}

/// POST /verify: Verify a membership proof over the active circuit.
///
/// Request body: VerifyRequest { circuitId, proof, publicSignals }
/// Response: VerifyResponse { success, valid, method, circuitId, sessionId, timestamp }
pub async fn verify_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<VerifyRequest>,
) -> Result<Json<VerifyResponse>, GatewayError> {
    let result = state
        .gateway
        .verify_over_circuit(req.circuit_id, req.proof, req.public_signals)
        .await?;

    Ok(Json(VerifyResponse {
        success: true,
        valid: result.valid,
        method: result.method,
        circuit_id: result.circuit_id,
        session_id: result.session_id.to_string(),
        timestamp: result.timestamp,
    }))
}

/// POST /circuit/connect: Return the active circuit, building one if needed.
pub async fn connect_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<CircuitResponse>, GatewayError> {
    let session = state.gateway.circuits().ensure_active().await?;
    Ok(Json(circuit_response(&session)))
}

/// POST /circuit/rotate: Tear down the active circuit and build a new one.
pub async fn rotate_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<CircuitResponse>, GatewayError> {
    let session = state.gateway.circuits().rotate().await?;
    Ok(Json(circuit_response(&session)))
}

/// GET /circuit/status: Active circuit, history and counters.
pub async fn status_handler(State(state): State<Arc<AppState>>) -> Json<CircuitStatus> {
    Json(state.gateway.circuits().status())
}

/// POST /keys/:circuit_id/reload: Drop and reload a cached verification key.
pub async fn reload_key_handler(
    State(state): State<Arc<AppState>>,
    Path(circuit_id): Path<String>,
) -> Result<Json<ReloadResponse>, GatewayError> {
    let keys = Arc::clone(state.gateway.verifier().keys());
    let id = circuit_id.clone();
    let key = tokio::task::spawn_blocking(move || keys.reload(&id))
        .await
        .map_err(|e| GatewayError::Internal(format!("key reload task failed: {}", e)))??;

    Ok(Json(ReloadResponse {
        circuit_id,
        loaded: key.is_some(),
        fingerprint: key.map(|k| k.fingerprint.clone()),
    }))
}

/// GET /health: Health check endpoint.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let verifier = state.gateway.verifier();
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".to_string(),
            cached_keys: verifier.keys().cached_len(),
            active_circuit: state.gateway.circuits().active().is_some(),
            simulation_enabled: verifier.simulation_enabled(),
        }),
    )
}

/// Build the axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> axum::Router {
    use axum::routing::{get, post};
    use tower_http::cors::{Any, CorsLayer};

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    axum::Router::new()
        .route("/verify", post(verify_handler))
        .route("/circuit/connect", post(connect_handler))
        .route("/circuit/rotate", post(rotate_handler))
        .route("/circuit/status", get(status_handler))
        .route("/keys/:circuit_id/reload", post(reload_key_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .with_state(state)
}
