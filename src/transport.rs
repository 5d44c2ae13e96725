use std::ops::RangeInclusive;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;

use crate::directory::NodeId;
use crate::session::CircuitSession;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("relay unreachable: {0}")]
    Unreachable(String),
    #[error("circuit closed: {0}")]
    Closed(String),
}

/// Link to the anonymity network that carries bound traffic.
#[async_trait]
pub trait CircuitTransport: Send + Sync {
    /// Negotiate a circuit through `hops`, in order.
    async fn establish(&self, hops: &[NodeId]) -> Result<(), TransportError>;

    /// Carry `payload` through `session` and return the far end's response.
    async fn send_over_circuit(
        &self,
        session: &CircuitSession,
        payload: &[u8],
    ) -> Result<Vec<u8>, TransportError>;
}

/// In-process stand-in for the anonymity network: every hop costs a random
/// delay drawn from `hop_latency_ms`, payloads are echoed back.
#[derive(Debug, Clone)]
pub struct SimulatedTransport {
    hop_latency_ms: RangeInclusive<u64>,
}

impl SimulatedTransport {
    pub fn new(hop_latency_ms: RangeInclusive<u64>) -> Self {
        Self { hop_latency_ms }
    }

    pub fn instant() -> Self {
        Self::new(0..=0)
    }

    fn path_delay(&self, hops: usize) -> Duration {
        if self.hop_latency_ms.is_empty() || *self.hop_latency_ms.end() == 0 {
            return Duration::ZERO;
        }
        let mut rng = rand::thread_rng();
        let total: u64 = (0..hops)
            .map(|_| rng.gen_range(self.hop_latency_ms.clone()))
            .sum();
        Duration::from_millis(total)
    }
}

#[async_trait]
impl CircuitTransport for SimulatedTransport {
    async fn establish(&self, hops: &[NodeId]) -> Result<(), TransportError> {
        if hops.is_empty() {
            return Err(TransportError::Unreachable("empty hop list".to_string()));
        }
        // One round trip per hop while extending the circuit.
        let delay = self.path_delay(hops.len() * 2);
        tokio::time::sleep(delay).await;
        Ok(())
    }

    async fn send_over_circuit(
        &self,
        session: &CircuitSession,
        payload: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        if session.hops().is_empty() {
            return Err(TransportError::Closed(session.id().to_string()));
        }
        let delay = self.path_delay(session.hops().len() * 2);
        tokio::time::sleep(delay).await;
        Ok(payload.to_vec())
    }
}
