use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

use crate::error::{GatewayError, GatewayResult};
use crate::manager::CircuitManager;
use crate::session::{CircuitSession, SessionId};
use crate::verifier::{ProofVerifier, VerificationMethod};

/// Verdict for one request, tagged with the circuit that carried it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub circuit_id: String,
    pub valid: bool,
    pub method: VerificationMethod,
    pub timestamp: DateTime<Utc>,
    pub session_id: SessionId,
}

/// What actually travels over the circuit.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RelayEnvelope<'a> {
    circuit_id: &'a str,
    proof: Option<&'a Value>,
    public_signals: Option<&'a [Value]>,
}

/// Binds verification requests to the active routing circuit.
///
/// Nothing here is retried: a failed circuit build and a failed proof are
/// reported as different errors and the caller picks the policy.
pub struct VerificationGateway {
    verifier: Arc<ProofVerifier>,
    circuits: Arc<CircuitManager>,
    verify_timeout: Duration,
}

impl VerificationGateway {
    pub fn new(
        verifier: Arc<ProofVerifier>,
        circuits: Arc<CircuitManager>,
        verify_timeout: Duration,
    ) -> Self {
        Self {
            verifier,
            circuits,
            verify_timeout,
        }
    }

    pub fn verifier(&self) -> &Arc<ProofVerifier> {
        &self.verifier
    }

    pub fn circuits(&self) -> &Arc<CircuitManager> {
        &self.circuits
    }

    pub async fn verify_over_circuit(
        &self,
        circuit_id: String,
        proof: Option<Value>,
        public_signals: Option<Vec<Value>>,
    ) -> GatewayResult<VerificationResult> {
        let deadline = Instant::now() + self.verify_timeout;
        self.verify_over_circuit_by(circuit_id, proof, public_signals, deadline)
            .await
    }

    pub async fn verify_over_circuit_by(
        &self,
        circuit_id: String,
        proof: Option<Value>,
        public_signals: Option<Vec<Value>>,
        deadline: Instant,
    ) -> GatewayResult<VerificationResult> {
        let lease = self.circuits.bind_by(deadline).await?;
        let session = lease.session().clone();

        let payload = encode(&RelayEnvelope {
            circuit_id: &circuit_id,
            proof: proof.as_ref(),
            public_signals: public_signals.as_deref(),
        })?;
        let latency_ms = self.relay(&session, &payload, deadline).await?;
        tracing::debug!(
            "Request for circuit={} relayed over {} in {}ms",
            circuit_id,
            session.id(),
            latency_ms
        );
        self.circuits.record_latency(session.id(), latency_ms);

        let outcome = self
            .verifier
            .verify_by(circuit_id.clone(), proof, public_signals, deadline)
            .await?;

        let result = VerificationResult {
            circuit_id,
            valid: outcome.valid,
            method: outcome.method,
            timestamp: Utc::now(),
            session_id: session.id(),
        };

        // The verdict goes back to the client along the same circuit.
        self.relay(&session, &encode(&result)?, deadline).await?;

        drop(lease);
        Ok(result)
    }

    /// One leg over `session`. A transport failure degrades the circuit.
    async fn relay(
        &self,
        session: &CircuitSession,
        payload: &[u8],
        deadline: Instant,
    ) -> GatewayResult<u64> {
        let started = Instant::now();
        let relayed = tokio::time::timeout_at(
            deadline,
            self.circuits
                .transport()
                .send_over_circuit(session, payload),
        )
        .await;

        match relayed {
            Ok(Ok(_)) => Ok(started.elapsed().as_millis() as u64),
            Ok(Err(e)) => {
                tracing::warn!("Transport failure on circuit {}: {}", session.id(), e);
                self.circuits.report_failure(session.id());
                Err(GatewayError::Transport(e))
            }
            Err(_) => Err(GatewayError::DeadlineExceeded(format!(
                "relay over circuit {} did not finish in time",
                session.id()
            ))),
        }
    }
}

fn encode<T: Serialize>(value: &T) -> GatewayResult<Vec<u8>> {
    serde_json::to_vec(value)
        .map_err(|e| GatewayError::Internal(format!("failed to encode relay payload: {}", e)))
}
