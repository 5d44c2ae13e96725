use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::{CircuitSession, SessionState};
use crate::verifier::VerificationMethod;

/// Body of `POST /verify`.
///
/// Every field is optional at the wire level so that an incomplete request is
/// reported as `MissingFields` by the verifier instead of a generic 422.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    #[serde(default)]
    pub circuit_id: String,
    #[serde(default)]
    pub proof: Option<serde_json::Value>,
    #[serde(default)]
    pub public_signals: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub success: bool,
    pub valid: bool,
    pub method: VerificationMethod,
    pub circuit_id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Public view of a routing circuit.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitView {
    pub id: String,
    pub hops: Vec<String>,
    pub node_count: usize,
    pub state: SessionState,
    pub established_at: Option<DateTime<Utc>>,
}

impl From<&CircuitSession> for CircuitView {
    fn from(session: &CircuitSession) -> Self {
        let hops: Vec<String> = session.hops().iter().map(|h| h.to_string()).collect();
        Self {
            id: session.id().to_string(),
            node_count: hops.len(),
            hops,
            state: session.state(),
            established_at: session.established_at(),
        }
    }
}

/// Response of `POST /circuit/connect` and `POST /circuit/rotate`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitResponse {
    pub circuit: CircuitView,
    pub latency_ms: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadResponse {
    pub circuit_id: String,
    pub loaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub cached_keys: usize,
    pub active_circuit: bool,
    pub simulation_enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}
