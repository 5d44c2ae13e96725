use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use ark_bn254::Bn254;
use ark_groth16::PreparedVerifyingKey;
use dashmap::DashMap;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use crate::error::{GatewayError, GatewayResult};
use crate::groth16::decode_verifying_key;

const MAX_CIRCUIT_ID_LEN: usize = 128;

/// File name of a key inside `<keys_dir>/<circuit_id>/`.
pub const VERIFICATION_KEY_FILE: &str = "verification_key.json";

/// Source of raw verification key material.
///
/// `Ok(None)` means the key does not exist. `Err` means the repository was
/// reachable but the read failed; the string is the underlying reason.
pub trait KeyRepository: Send + Sync {
    fn load_verification_key(&self, circuit_id: &str) -> Result<Option<Vec<u8>>, String>;
}

/// Reads `<keys_dir>/<circuit_id>/verification_key.json`.
pub struct FsKeyRepository {
    keys_dir: PathBuf,
}

impl FsKeyRepository {
    pub fn new(keys_dir: impl Into<PathBuf>) -> Self {
        Self {
            keys_dir: keys_dir.into(),
        }
    }
}

impl KeyRepository for FsKeyRepository {
    fn load_verification_key(&self, circuit_id: &str) -> Result<Option<Vec<u8>>, String> {
        let path = self.keys_dir.join(circuit_id).join(VERIFICATION_KEY_FILE);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(format!("Failed to read {}: {}", path.display(), e)),
        }
    }
}

/// In-memory repository, used when keys are provisioned programmatically.
#[derive(Default)]
pub struct MemoryKeyRepository {
    keys: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryKeyRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, circuit_id: &str, bytes: Vec<u8>) {
        self.keys.write().insert(circuit_id.to_string(), bytes);
    }

    pub fn remove(&self, circuit_id: &str) {
        self.keys.write().remove(circuit_id);
    }
}

impl KeyRepository for MemoryKeyRepository {
    fn load_verification_key(&self, circuit_id: &str) -> Result<Option<Vec<u8>>, String> {
        Ok(self.keys.read().get(circuit_id).cloned())
    }
}

/// A parsed, ready-to-use Groth16 verification key.
pub struct VerificationKey {
    pub circuit_id: String,
    pub prepared: PreparedVerifyingKey<Bn254>,
    pub n_public: usize,
    /// Hex SHA-256 of the raw key material.
    pub fingerprint: String,
}

impl std::fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationKey")
            .field("circuit_id", &self.circuit_id)
            .field("n_public", &self.n_public)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

impl VerificationKey {
    pub fn parse(circuit_id: &str, bytes: &[u8]) -> Result<Self, String> {
        let decoded = decode_verifying_key(bytes)?;
        Ok(Self {
            circuit_id: circuit_id.to_string(),
            prepared: ark_groth16::prepare_verifying_key(&decoded.vk),
            n_public: decoded.n_public,
            fingerprint: hex::encode(Sha256::digest(bytes)),
        })
    }
}

/// Check a circuit identifier against the key-distribution naming convention.
pub fn validate_circuit_id(circuit_id: &str) -> GatewayResult<()> {
    if circuit_id.is_empty() {
        return Err(GatewayError::MissingFields("circuitId".to_string()));
    }
    let well_formed = circuit_id.len() <= MAX_CIRCUIT_ID_LEN
        && !circuit_id.starts_with('.')
        && circuit_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'));
    if !well_formed {
        return Err(GatewayError::InvalidCircuitId(circuit_id.to_string()));
    }
    Ok(())
}

/// Lazily loaded, process-lifetime cache of verification keys.
///
/// Concurrent misses on the same circuit may both hit the repository; the
/// first insert wins and later loads are discarded. Absent keys are not
/// cached.
pub struct VerificationKeyStore {
    repository: Arc<dyn KeyRepository>,
    cache: DashMap<String, Arc<VerificationKey>>,
}

impl VerificationKeyStore {
    pub fn new(repository: Arc<dyn KeyRepository>) -> Self {
        Self {
            repository,
            cache: DashMap::new(),
        }
    }

    /// Look up a key, loading it from the repository on first use.
    pub fn get(&self, circuit_id: &str) -> GatewayResult<Option<Arc<VerificationKey>>> {
        validate_circuit_id(circuit_id)?;

        if let Some(key) = self.cache.get(circuit_id) {
            return Ok(Some(Arc::clone(key.value())));
        }

        let Some(key) = self.load(circuit_id)? else {
            tracing::debug!("No verification key on file for {}", circuit_id);
            return Ok(None);
        };

        let cached = self
            .cache
            .entry(circuit_id.to_string())
            .or_insert_with(|| Arc::new(key))
            .value()
            .clone();
        Ok(Some(cached))
    }

    /// Drop any cached key for `circuit_id` and load it again.
    pub fn reload(&self, circuit_id: &str) -> GatewayResult<Option<Arc<VerificationKey>>> {
        validate_circuit_id(circuit_id)?;
        self.cache.remove(circuit_id);
        tracing::info!("Reloading verification key for {}", circuit_id);
        self.get(circuit_id)
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    pub fn cached_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.cache.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    fn load(&self, circuit_id: &str) -> GatewayResult<Option<VerificationKey>> {
        let bytes = self
            .repository
            .load_verification_key(circuit_id)
            .map_err(|reason| GatewayError::KeyLoad {
                circuit_id: circuit_id.to_string(),
                reason,
            })?;

        let Some(bytes) = bytes else {
            return Ok(None);
        };

        let key = VerificationKey::parse(circuit_id, &bytes).map_err(|reason| {
            GatewayError::KeyLoad {
                circuit_id: circuit_id.to_string(),
                reason,
            }
        })?;

        tracing::info!(
            "Verification key loaded: circuit={} nPublic={} fingerprint={}",
            circuit_id,
            key.n_public,
            key.fingerprint
        );
        Ok(Some(key))
    }
}
