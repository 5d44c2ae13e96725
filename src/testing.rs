//! Shared test fixtures: a genuine Groth16 proof over a small R1CS circuit,
//! rendered in snarkjs JSON, plus transports with scripted behaviour.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use ark_bn254::{Bn254, Fq, Fr, G1Affine, G2Affine};
use ark_ec::AffineRepr;
use ark_groth16::{Groth16, Proof, VerifyingKey};
use ark_relations::lc;
use ark_relations::r1cs::{ConstraintSynthesizer, ConstraintSystemRef, SynthesisError, Variable};
use ark_snark::SNARK;
use ark_std::rand::rngs::StdRng;
use ark_std::rand::SeedableRng;
use async_trait::async_trait;
use num_bigint::BigUint;
use serde_json::{json, Value};

use crate::directory::{NodeId, StaticNodeDirectory};
use crate::keys::MemoryKeyRepository;
use crate::session::CircuitSession;
use crate::transport::{CircuitTransport, TransportError};

/// Proves `balance = threshold + surplus` and `balance * balance = commitment`
/// with `threshold` and `commitment` public.
#[derive(Clone)]
pub struct BalanceThresholdCircuit {
    pub threshold: Fr,
    pub commitment: Fr,
    pub balance: Fr,
    pub surplus: Fr,
}

impl ConstraintSynthesizer<Fr> for BalanceThresholdCircuit {
    fn generate_constraints(self, cs: ConstraintSystemRef<Fr>) -> Result<(), SynthesisError> {
        let threshold = cs.new_input_variable(|| Ok(self.threshold))?;
        let commitment = cs.new_input_variable(|| Ok(self.commitment))?;
        let balance = cs.new_witness_variable(|| Ok(self.balance))?;
        let surplus = cs.new_witness_variable(|| Ok(self.surplus))?;

        cs.enforce_constraint(
            lc!() + threshold + surplus,
            lc!() + Variable::One,
            lc!() + balance,
        )?;
        cs.enforce_constraint(lc!() + balance, lc!() + balance, lc!() + commitment)?;
        Ok(())
    }
}

pub struct GrothFixture {
    pub vk: VerifyingKey<Bn254>,
    pub proof: Proof<Bn254>,
    pub vk_json: String,
    pub proof_json: Value,
    pub public_signals: Vec<Value>,
}

impl GrothFixture {
    /// Trusted setup and proving run once per test binary.
    pub fn get() -> &'static GrothFixture {
        static FIXTURE: OnceLock<GrothFixture> = OnceLock::new();
        FIXTURE.get_or_init(Self::generate)
    }

    fn generate() -> Self {
        let mut rng = StdRng::seed_from_u64(0x5eed_0001);
        let threshold = Fr::from(1000u64);
        let balance = Fr::from(1500u64);
        let circuit = BalanceThresholdCircuit {
            threshold,
            commitment: balance * balance,
            balance,
            surplus: balance - threshold,
        };

        let (pk, vk) = Groth16::<Bn254>::circuit_specific_setup(circuit.clone(), &mut rng)
            .expect("trusted setup for test circuit");
        let proof = Groth16::<Bn254>::prove(&pk, circuit.clone(), &mut rng)
            .expect("proof for test circuit");

        let vk_json = json!({
            "protocol": "groth16",
            "curve": "bn128",
            "nPublic": 2,
            "vk_alpha_1": g1_json(&vk.alpha_g1),
            "vk_beta_2": g2_json(&vk.beta_g2),
            "vk_gamma_2": g2_json(&vk.gamma_g2),
            "vk_delta_2": g2_json(&vk.delta_g2),
            "IC": vk.gamma_abc_g1.iter().map(g1_json).collect::<Vec<_>>(),
        })
        .to_string();

        let proof_json = json!({
            "pi_a": g1_json(&proof.a),
            "pi_b": g2_json(&proof.b),
            "pi_c": g1_json(&proof.c),
            "protocol": "groth16",
            "curve": "bn128",
        });

        let public_signals = vec![fr_json(&circuit.threshold), fr_json(&circuit.commitment)];

        Self {
            vk,
            proof,
            vk_json,
            proof_json,
            public_signals,
        }
    }

    /// Public signals with the threshold bumped by one.
    pub fn tampered_signals(&self) -> Vec<Value> {
        let mut signals = self.public_signals.clone();
        signals[0] = Value::from("1001");
        signals
    }

    /// Repository holding the fixture key under `circuit_id`.
    pub fn repository(&self, circuit_id: &str) -> Arc<MemoryKeyRepository> {
        let repo = MemoryKeyRepository::new();
        repo.insert(circuit_id, self.vk_json.as_bytes().to_vec());
        Arc::new(repo)
    }
}

fn fq_json(value: &Fq) -> Value {
    let n: BigUint = (*value).into();
    Value::from(n.to_string())
}

fn fr_json(value: &Fr) -> Value {
    let n: BigUint = (*value).into();
    Value::from(n.to_string())
}

fn g1_json(point: &G1Affine) -> Value {
    if point.is_zero() {
        return json!(["0", "1", "0"]);
    }
    json!([fq_json(&point.x), fq_json(&point.y), "1"])
}

fn g2_json(point: &G2Affine) -> Value {
    json!([
        [fq_json(&point.x.c0), fq_json(&point.x.c1)],
        [fq_json(&point.y.c0), fq_json(&point.y.c1)],
        ["1", "0"]
    ])
}

pub fn relays(count: usize) -> Arc<StaticNodeDirectory> {
    let nodes = (1..=count).map(|i| NodeId::new(format!("relay-{}", i))).collect();
    Arc::new(StaticNodeDirectory::all_roles(nodes))
}

/// Transport that establishes instantly and fails the first `failures` sends.
#[derive(Default)]
pub struct ScriptedTransport {
    failures: AtomicUsize,
    pub sends: AtomicUsize,
    pub establishes: AtomicUsize,
}

impl ScriptedTransport {
    pub fn failing(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures: AtomicUsize::new(failures),
            ..Default::default()
        })
    }
}

#[async_trait]
impl CircuitTransport for ScriptedTransport {
    async fn establish(&self, _hops: &[NodeId]) -> Result<(), TransportError> {
        self.establishes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_over_circuit(
        &self,
        session: &CircuitSession,
        payload: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::Unreachable(format!(
                "exit of circuit {}",
                session.id()
            )));
        }
        Ok(payload.to_vec())
    }
}

/// Transport whose handshake never completes.
pub struct StalledTransport;

#[async_trait]
impl CircuitTransport for StalledTransport {
    async fn establish(&self, _hops: &[NodeId]) -> Result<(), TransportError> {
        std::future::pending::<()>().await;
        Ok(())
    }

    async fn send_over_circuit(
        &self,
        _session: &CircuitSession,
        payload: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        Ok(payload.to_vec())
    }
}
