use std::sync::Arc;

use ark_bn254::Bn254;
use ark_groth16::Groth16;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::error::{GatewayError, GatewayResult};
use crate::groth16::{decode_proof, decode_public_signals};
use crate::keys::VerificationKeyStore;

/// How a verification verdict was reached.
///
/// `Simulated` verdicts were accepted without a verification key and must not
/// be trusted where real membership matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationMethod {
    #[serde(rename = "simulation")]
    Simulated,
    #[serde(rename = "real")]
    Real,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationOutcome {
    pub valid: bool,
    pub method: VerificationMethod,
}

impl VerificationOutcome {
    fn simulated() -> Self {
        Self {
            valid: true,
            method: VerificationMethod::Simulated,
        }
    }

    fn real(valid: bool) -> Self {
        Self {
            valid,
            method: VerificationMethod::Real,
        }
    }
}

/// Checks Groth16 proofs against per-circuit verification keys.
pub struct ProofVerifier {
    keys: Arc<VerificationKeyStore>,
    allow_simulated: bool,
}

impl ProofVerifier {
    pub fn new(keys: Arc<VerificationKeyStore>, allow_simulated: bool) -> Self {
        Self {
            keys,
            allow_simulated,
        }
    }

    pub fn keys(&self) -> &Arc<VerificationKeyStore> {
        &self.keys
    }

    pub fn simulation_enabled(&self) -> bool {
        self.allow_simulated
    }

    /// Verify `proof` and `public_signals` for `circuit_id`.
    ///
    /// Request completeness is checked before any key lookup. A circuit with
    /// no key on file is accepted in simulated mode when it is enabled;
    /// repository failures are always errors.
    pub fn verify(
        &self,
        circuit_id: &str,
        proof: Option<&Value>,
        public_signals: Option<&[Value]>,
    ) -> GatewayResult<VerificationOutcome> {
        let (proof, public_signals) = require_fields(circuit_id, proof, public_signals)?;

        let Some(key) = self.keys.get(circuit_id)? else {
            if !self.allow_simulated {
                return Err(GatewayError::KeyNotFound(circuit_id.to_string()));
            }
            tracing::warn!(
                "No verification key for circuit={}, accepting in simulated mode",
                circuit_id
            );
            return Ok(VerificationOutcome::simulated());
        };

        let proof = decode_proof(proof).map_err(GatewayError::InvalidProofFormat)?;

        if public_signals.len() != key.n_public {
            return Err(GatewayError::InvalidProofFormat(format!(
                "circuit {} expects {} public signals, got {}",
                circuit_id,
                key.n_public,
                public_signals.len()
            )));
        }

        let Some(inputs) =
            decode_public_signals(public_signals).map_err(GatewayError::InvalidProofFormat)?
        else {
            tracing::info!(
                "Public signal outside the scalar field for circuit={}, rejecting",
                circuit_id
            );
            return Ok(VerificationOutcome::real(false));
        };

        tracing::debug!(
            "Verifying proof for circuit={} signals={} key={}",
            circuit_id,
            inputs.len(),
            key.fingerprint
        );

        let valid = Groth16::<Bn254>::verify_proof(&key.prepared, &proof, &inputs)
            .map_err(|e| GatewayError::InvalidProofFormat(format!("Verification failed: {}", e)))?;

        tracing::info!("Verification result for circuit={}: {}", circuit_id, valid);

        Ok(VerificationOutcome::real(valid))
    }

    /// Run [`verify`](Self::verify) on the blocking pool, abandoning it at
    /// `deadline`. An abandoned call can only have inserted a fully loaded key
    /// into the cache, never a partial one.
    pub async fn verify_by(
        self: &Arc<Self>,
        circuit_id: String,
        proof: Option<Value>,
        public_signals: Option<Vec<Value>>,
        deadline: Instant,
    ) -> GatewayResult<VerificationOutcome> {
        let verifier = Arc::clone(self);
        let id = circuit_id.clone();
        let task = tokio::task::spawn_blocking(move || {
            verifier.verify(&id, proof.as_ref(), public_signals.as_deref())
        });

        match tokio::time::timeout_at(deadline, task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_err)) => Err(GatewayError::Internal(format!(
                "verification task failed: {}",
                join_err
            ))),
            Err(_) => {
                tracing::warn!("Verification deadline exceeded for circuit={}", circuit_id);
                Err(GatewayError::DeadlineExceeded(format!(
                    "verification of {} did not finish in time",
                    circuit_id
                )))
            }
        }
    }
}

fn require_fields<'a>(
    circuit_id: &str,
    proof: Option<&'a Value>,
    public_signals: Option<&'a [Value]>,
) -> GatewayResult<(&'a Value, &'a [Value])> {
    let proof = proof.filter(|p| !p.is_null());
    let mut missing = Vec::new();
    if circuit_id.is_empty() {
        missing.push("circuitId");
    }
    if proof.is_none() {
        missing.push("proof");
    }
    if public_signals.is_none() {
        missing.push("publicSignals");
    }
    match (proof, public_signals) {
        (Some(proof), Some(signals)) if missing.is_empty() => Ok((proof, signals)),
        _ => Err(GatewayError::MissingFields(missing.join(", "))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{KeyRepository, MemoryKeyRepository};
    use crate::testing::GrothFixture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn verifier_with(repo: Arc<dyn KeyRepository>, allow_simulated: bool) -> ProofVerifier {
        ProofVerifier::new(Arc::new(VerificationKeyStore::new(repo)), allow_simulated)
    }

    fn groupb_verifier() -> ProofVerifier {
        verifier_with(GrothFixture::get().repository("groupB"), true)
    }

    struct CountingRepository(AtomicUsize);

    impl KeyRepository for CountingRepository {
        fn load_verification_key(&self, _circuit_id: &str) -> Result<Option<Vec<u8>>, String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    #[test]
    fn test_absent_key_is_simulated() {
        let verifier = verifier_with(Arc::new(MemoryKeyRepository::new()), true);
        let fixture = GrothFixture::get();
        let outcome = verifier
            .verify("groupA", Some(&fixture.proof_json), Some(&fixture.public_signals))
            .unwrap();
        assert_eq!(
            outcome,
            VerificationOutcome {
                valid: true,
                method: VerificationMethod::Simulated
            }
        );
        assert_ne!(outcome.method, VerificationMethod::Real);
    }

    #[test]
    fn test_simulated_accepts_any_proof_shape() {
        let verifier = verifier_with(Arc::new(MemoryKeyRepository::new()), true);
        let outcome = verifier
            .verify("groupA", Some(&Value::from("opaque")), Some(&[]))
            .unwrap();
        assert_eq!(outcome.method, VerificationMethod::Simulated);
    }

    #[test]
    fn test_absent_key_without_simulation_is_not_found() {
        let verifier = verifier_with(Arc::new(MemoryKeyRepository::new()), false);
        let fixture = GrothFixture::get();
        let err = verifier
            .verify("groupA", Some(&fixture.proof_json), Some(&fixture.public_signals))
            .unwrap_err();
        assert!(matches!(err, GatewayError::KeyNotFound(_)));
    }

    #[test]
    fn test_genuine_proof_is_valid() {
        let fixture = GrothFixture::get();
        let outcome = groupb_verifier()
            .verify("groupB", Some(&fixture.proof_json), Some(&fixture.public_signals))
            .unwrap();
        assert_eq!(outcome, VerificationOutcome::real(true));
    }

    #[test]
    fn test_altered_signals_are_invalid() {
        let fixture = GrothFixture::get();
        let outcome = groupb_verifier()
            .verify("groupB", Some(&fixture.proof_json), Some(&fixture.tampered_signals()))
            .unwrap();
        assert_eq!(outcome, VerificationOutcome::real(false));
    }

    #[test]
    fn test_real_verification_is_deterministic() {
        let fixture = GrothFixture::get();
        let verifier = groupb_verifier();
        for signals in [fixture.public_signals.clone(), fixture.tampered_signals()] {
            let first = verifier
                .verify("groupB", Some(&fixture.proof_json), Some(&signals))
                .unwrap();
            for _ in 0..3 {
                let again = verifier
                    .verify("groupB", Some(&fixture.proof_json), Some(&signals))
                    .unwrap();
                assert_eq!(first, again);
            }
        }
    }

    #[test]
    fn test_missing_fields_rejected_before_key_lookup() {
        let repo = Arc::new(CountingRepository(AtomicUsize::new(0)));
        let verifier = verifier_with(repo.clone(), true);
        let fixture = GrothFixture::get();

        let err = verifier
            .verify("groupA", None, Some(&fixture.public_signals))
            .unwrap_err();
        assert!(matches!(err, GatewayError::MissingFields(ref f) if f == "proof"));

        let err = verifier
            .verify("groupA", Some(&fixture.proof_json), None)
            .unwrap_err();
        assert!(matches!(err, GatewayError::MissingFields(ref f) if f == "publicSignals"));

        let err = verifier
            .verify("groupA", Some(&Value::Null), None)
            .unwrap_err();
        assert!(matches!(err, GatewayError::MissingFields(ref f) if f == "proof, publicSignals"));

        let err = verifier.verify("", None, None).unwrap_err();
        assert!(matches!(err, GatewayError::MissingFields(ref f) if f.starts_with("circuitId")));

        assert_eq!(repo.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_malformed_proof_is_format_error_not_invalid() {
        let fixture = GrothFixture::get();
        let err = groupb_verifier()
            .verify(
                "groupB",
                Some(&serde_json::json!({"pi_a": "nope"})),
                Some(&fixture.public_signals),
            )
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidProofFormat(_)));
    }

    #[test]
    fn test_wrong_signal_count_is_format_error() {
        let fixture = GrothFixture::get();
        let err = groupb_verifier()
            .verify(
                "groupB",
                Some(&fixture.proof_json),
                Some(&fixture.public_signals[..1]),
            )
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidProofFormat(ref m) if m.contains("expects 2")));
    }

    #[test]
    fn test_non_numeric_signal_is_format_error() {
        let fixture = GrothFixture::get();
        let signals = vec![Value::from("1000"), Value::from("lots")];
        let err = groupb_verifier()
            .verify("groupB", Some(&fixture.proof_json), Some(&signals))
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidProofFormat(_)));
    }

    #[test]
    fn test_out_of_field_signal_is_invalid() {
        let fixture = GrothFixture::get();
        let huge = "9".repeat(80);
        let signals = vec![Value::from(huge), fixture.public_signals[1].clone()];
        let outcome = groupb_verifier()
            .verify("groupB", Some(&fixture.proof_json), Some(&signals))
            .unwrap();
        assert_eq!(outcome, VerificationOutcome::real(false));
    }

    #[test]
    fn test_key_load_error_is_not_simulated() {
        struct Broken;
        impl KeyRepository for Broken {
            fn load_verification_key(&self, _: &str) -> Result<Option<Vec<u8>>, String> {
                Err("permission denied".to_string())
            }
        }
        let fixture = GrothFixture::get();
        let err = verifier_with(Arc::new(Broken), true)
            .verify("groupB", Some(&fixture.proof_json), Some(&fixture.public_signals))
            .unwrap_err();
        assert!(matches!(err, GatewayError::KeyLoad { .. }));
    }

    #[test]
    fn test_method_serializes_as_wire_names() {
        assert_eq!(
            serde_json::to_value(VerificationMethod::Simulated).unwrap(),
            "simulation"
        );
        assert_eq!(serde_json::to_value(VerificationMethod::Real).unwrap(), "real");
    }

    #[tokio::test]
    async fn test_verify_by_returns_outcome_before_deadline() {
        let fixture = GrothFixture::get();
        let verifier = Arc::new(groupb_verifier());
        let outcome = verifier
            .verify_by(
                "groupB".to_string(),
                Some(fixture.proof_json.clone()),
                Some(fixture.public_signals.clone()),
                Instant::now() + Duration::from_secs(30),
            )
            .await
            .unwrap();
        assert_eq!(outcome, VerificationOutcome::real(true));
    }

    #[tokio::test]
    async fn test_verify_by_expired_deadline() {
        let fixture = GrothFixture::get();
        let verifier = Arc::new(groupb_verifier());
        let result = verifier
            .verify_by(
                "groupB".to_string(),
                Some(fixture.proof_json.clone()),
                Some(fixture.public_signals.clone()),
                Instant::now(),
            )
            .await;
        // An already-expired deadline may still race a fast verification.
        match result {
            Err(GatewayError::DeadlineExceeded(_)) => {}
            Ok(outcome) => assert_eq!(outcome, VerificationOutcome::real(true)),
            Err(other) => panic!("unexpected error: {:?}", other),
        }
        // The cache is either empty or holds the complete key.
        if let Some(key) = verifier.keys().get("groupB").unwrap() {
            assert_eq!(key.n_public, 2);
        }
    }
}
