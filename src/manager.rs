use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use tokio::time::Instant;

use crate::directory::{HopRole, NodeDirectory, NodeId};
use crate::error::{GatewayError, GatewayResult};
use crate::session::{CircuitSession, HealthPolicy, SessionId, SessionState};
use crate::transport::CircuitTransport;

/// Bind attempts before giving up when the active circuit keeps degrading
/// underneath us.
const BIND_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub hop_count: usize,
    pub build_timeout: Duration,
    pub health: HealthPolicy,
    pub history_limit: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            hop_count: 3,
            build_timeout: Duration::from_secs(5),
            health: HealthPolicy::default(),
            history_limit: 64,
        }
    }
}

/// Snapshot of the pool for metrics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitStatus {
    pub active: Option<CircuitSession>,
    /// Newest first.
    pub history: Vec<CircuitSession>,
    pub built: u64,
    pub failed: u64,
    pub rotations: u64,
    pub degradations: u64,
}

#[derive(Default)]
struct CircuitPool {
    sessions: Vec<CircuitSession>,
    active: Option<SessionId>,
    built: u64,
    failed: u64,
    rotations: u64,
    degradations: u64,
}

impl CircuitPool {
    fn get_mut(&mut self, id: SessionId) -> Option<&mut CircuitSession> {
        self.sessions.iter_mut().find(|s| s.id() == id)
    }

    /// The session bound to new traffic. A slot pointing at a session that
    /// left `Active` is cleared.
    fn active_session(&mut self) -> Option<&CircuitSession> {
        let id = self.active?;
        let still_active = self
            .sessions
            .iter()
            .any(|s| s.id() == id && s.state() == SessionState::Active);
        if !still_active {
            self.active = None;
            return None;
        }
        self.sessions.iter().find(|s| s.id() == id)
    }

    fn insert(&mut self, session: CircuitSession, history_limit: usize) {
        self.sessions.push(session);
        while self.sessions.len() > history_limit.max(1) {
            match self.sessions.iter().position(|s| s.state().is_terminal()) {
                Some(oldest) => {
                    self.sessions.remove(oldest);
                }
                None => break,
            }
        }
    }

    fn release(&mut self, id: SessionId) {
        if let Some(session) = self.get_mut(id) {
            session.release();
        }
    }
}

/// Owns every routing circuit and the single active slot.
///
/// Builds and rotations are serialized by `build_lock`, held across the whole
/// negotiation. The pool mutex is only ever held for short synchronous
/// sections.
pub struct CircuitManager {
    directory: Arc<dyn NodeDirectory>,
    transport: Arc<dyn CircuitTransport>,
    config: ManagerConfig,
    build_lock: tokio::sync::Mutex<()>,
    pool: Arc<Mutex<CircuitPool>>,
}

impl CircuitManager {
    pub fn new(
        directory: Arc<dyn NodeDirectory>,
        transport: Arc<dyn CircuitTransport>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            directory,
            transport,
            config,
            build_lock: tokio::sync::Mutex::new(()),
            pool: Arc::new(Mutex::new(CircuitPool::default())),
        }
    }

    pub fn transport(&self) -> &Arc<dyn CircuitTransport> {
        &self.transport
    }

    fn default_deadline(&self) -> Instant {
        Instant::now() + self.config.build_timeout
    }

    /// The active circuit, building one if there is none.
    pub async fn ensure_active(&self) -> GatewayResult<CircuitSession> {
        self.ensure_active_by(self.default_deadline()).await
    }

    pub async fn ensure_active_by(&self, deadline: Instant) -> GatewayResult<CircuitSession> {
        if let Some(session) = self.pool.lock().active_session() {
            return Ok(session.clone());
        }

        let _guard = self.lock_builds(deadline).await?;

        // Another caller may have finished a build while we waited.
        if let Some(session) = self.pool.lock().active_session() {
            return Ok(session.clone());
        }

        self.build(None, deadline).await
    }

    /// Tear down the active circuit and build a replacement.
    pub async fn rotate(&self) -> GatewayResult<CircuitSession> {
        self.rotate_by(self.default_deadline()).await
    }

    pub async fn rotate_by(&self, deadline: Instant) -> GatewayResult<CircuitSession> {
        let _guard = self.lock_builds(deadline).await?;

        let previous_hops = {
            let mut pool = self.pool.lock();
            pool.rotations += 1;
            let previous = match pool.active.take() {
                Some(id) => pool.get_mut(id),
                None => None,
            };
            match previous {
                Some(session) if session.state() == SessionState::Active => {
                    let hops = session.hops().to_vec();
                    if let Err(e) = session.tear_down() {
                        tracing::warn!("Rotation could not tear down circuit: {}", e);
                    }
                    tracing::info!("Circuit {} torn down for rotation", session.id());
                    Some(hops)
                }
                _ => None,
            }
        };

        self.build(previous_hops, deadline).await
    }

    /// Mark a session as failing. Rebuilding happens lazily on the next
    /// [`ensure_active`](Self::ensure_active).
    pub fn report_failure(&self, id: SessionId) {
        let mut pool = self.pool.lock();
        let Some(session) = pool.get_mut(id) else {
            tracing::warn!("Failure reported for unknown circuit {}", id);
            return;
        };

        match session.state() {
            SessionState::Building => {
                if session.fail("failure reported during build").is_ok() {
                    pool.failed += 1;
                }
            }
            SessionState::Active => {
                if session.degrade("failure reported by caller").is_ok() {
                    tracing::warn!("Circuit {} degraded after reported failure", id);
                    pool.degradations += 1;
                }
                if pool.active == Some(id) {
                    pool.active = None;
                }
            }
            state => {
                tracing::debug!("Failure reported for circuit {} already {}", id, state);
            }
        }
    }

    /// Feed a round-trip latency sample into the session's health tracking.
    pub fn record_latency(&self, id: SessionId, latency_ms: u64) {
        let mut pool = self.pool.lock();
        let health = self.config.health;
        let Some(session) = pool.get_mut(id) else {
            return;
        };
        if session.record_latency(latency_ms, &health) {
            tracing::warn!(
                "Circuit {} degraded: {}",
                id,
                session.reason().unwrap_or("slow")
            );
            pool.degradations += 1;
            if pool.active == Some(id) {
                pool.active = None;
            }
        }
    }

    /// Bind one request to the active circuit. The returned lease keeps the
    /// session's in-flight count until dropped.
    pub async fn bind_by(&self, deadline: Instant) -> GatewayResult<SessionLease> {
        for _ in 0..BIND_ATTEMPTS {
            let session = self.ensure_active_by(deadline).await?;
            let mut pool = self.pool.lock();
            if let Some(bound) = pool.get_mut(session.id()) {
                if bound.bind() {
                    return Ok(SessionLease {
                        pool: Arc::clone(&self.pool),
                        session: bound.clone(),
                    });
                }
            }
        }
        Err(GatewayError::NoCircuitAvailable(
            "active circuit degraded repeatedly while binding".to_string(),
        ))
    }

    pub fn active(&self) -> Option<CircuitSession> {
        self.pool.lock().active_session().cloned()
    }

    pub fn session(&self, id: SessionId) -> Option<CircuitSession> {
        self.pool.lock().sessions.iter().find(|s| s.id() == id).cloned()
    }

    pub fn status(&self) -> CircuitStatus {
        let mut pool = self.pool.lock();
        let active = pool.active_session().cloned();
        CircuitStatus {
            active,
            history: pool.sessions.iter().rev().cloned().collect(),
            built: pool.built,
            failed: pool.failed,
            rotations: pool.rotations,
            degradations: pool.degradations,
        }
    }

    async fn lock_builds(
        &self,
        deadline: Instant,
    ) -> GatewayResult<tokio::sync::MutexGuard<'_, ()>> {
        tokio::time::timeout_at(deadline, self.build_lock.lock())
            .await
            .map_err(|_| {
                GatewayError::NoCircuitAvailable(
                    "timed out waiting for an in-progress circuit build".to_string(),
                )
            })
    }

    /// Drive a fresh session from `Building` to `Active` or `Failed`.
    /// Caller holds `build_lock`.
    async fn build(
        &self,
        avoid: Option<Vec<NodeId>>,
        deadline: Instant,
    ) -> GatewayResult<CircuitSession> {
        let session = CircuitSession::building();
        let id = session.id();
        self.pool.lock().insert(session, self.config.history_limit);
        let mut abandoned = AbandonedBuild {
            pool: Arc::clone(&self.pool),
            id,
            armed: true,
        };

        let started = Instant::now();
        let bound = deadline.min(started + self.config.build_timeout);
        tracing::debug!("Building circuit {} with {} hops", id, self.config.hop_count);

        let outcome = match tokio::time::timeout_at(bound, self.negotiate(avoid.as_deref())).await
        {
            Ok(Ok(hops)) => Ok(hops),
            Ok(Err(reason)) => Err(reason),
            Err(_) => Err(format!(
                "circuit build timed out after {}ms",
                started.elapsed().as_millis()
            )),
        };
        let latency_ms = started.elapsed().as_millis() as u64;
        // Nothing below awaits, so the build can no longer be cancelled.
        abandoned.armed = false;

        let mut pool = self.pool.lock();
        let Some(session) = pool.get_mut(id) else {
            return Err(GatewayError::NoCircuitAvailable(
                "circuit evicted during build".to_string(),
            ));
        };

        match outcome {
            Ok(hops) => match session.activate(hops, latency_ms) {
                Ok(()) => {
                    let session = session.clone();
                    pool.active = Some(id);
                    pool.built += 1;
                    tracing::info!(
                        "Circuit {} active: hops=[{}] latency={}ms",
                        id,
                        join_hops(session.hops()),
                        latency_ms
                    );
                    Ok(session)
                }
                Err(e) => Err(GatewayError::NoCircuitAvailable(e.to_string())),
            },
            Err(reason) => {
                if session.fail(reason.clone()).is_ok() {
                    pool.failed += 1;
                }
                tracing::error!("Circuit {} failed to build: {}", id, reason);
                Err(GatewayError::NoCircuitAvailable(reason))
            }
        }
    }

    async fn negotiate(&self, avoid: Option<&[NodeId]>) -> Result<Vec<NodeId>, String> {
        let hop_count = self.config.hop_count;
        let mut candidates = Vec::with_capacity(hop_count);
        for index in 0..hop_count {
            let role = HopRole::for_position(index, hop_count);
            let nodes = self
                .directory
                .list_eligible_nodes(role)
                .await
                .map_err(|e| e.to_string())?;
            candidates.push(nodes);
        }

        let hops = select_hops(&candidates, avoid)?;

        self.transport
            .establish(&hops)
            .await
            .map_err(|e| format!("handshake failed: {}", e))?;
        Ok(hops)
    }
}

/// Fails a `Building` session whose build future was dropped before it
/// finished, e.g. when the requesting client disconnected.
struct AbandonedBuild {
    pool: Arc<Mutex<CircuitPool>>,
    id: SessionId,
    armed: bool,
}

impl Drop for AbandonedBuild {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut pool = self.pool.lock();
        let Some(session) = pool.get_mut(self.id) else {
            return;
        };
        if session.state() == SessionState::Building
            && session.fail("circuit build cancelled").is_ok()
        {
            pool.failed += 1;
            tracing::warn!("Circuit {} build cancelled before completion", self.id);
        }
    }
}

/// RAII binding of one request to a circuit.
pub struct SessionLease {
    pool: Arc<Mutex<CircuitPool>>,
    session: CircuitSession,
}

impl SessionLease {
    /// Session as it was when the request was bound.
    pub fn session(&self) -> &CircuitSession {
        &self.session
    }

    pub fn id(&self) -> SessionId {
        self.session.id()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.pool.lock().release(self.session.id());
    }
}

/// Choose one distinct node per role, uniformly at random among the eligible
/// ones. With `avoid`, the result differs from it whenever the combined pool
/// is larger than the hop count.
fn select_hops(candidates: &[Vec<NodeId>], avoid: Option<&[NodeId]>) -> Result<Vec<NodeId>, String> {
    let hop_count = candidates.len();
    let distinct: BTreeSet<&NodeId> = candidates.iter().flatten().collect();
    if distinct.len() < hop_count {
        return Err(format!(
            "node directory offers {} distinct nodes, {} hops required",
            distinct.len(),
            hop_count
        ));
    }

    let mut rng = rand::thread_rng();
    let orders: Vec<Vec<&NodeId>> = candidates
        .iter()
        .map(|eligible| {
            let mut order: Vec<&NodeId> = eligible.iter().collect();
            order.shuffle(&mut rng);
            order
        })
        .collect();

    let mut picked = Vec::with_capacity(hop_count);
    if !assign_distinct(&orders, &mut picked) {
        return Err(format!(
            "no assignment of {} distinct nodes to hop roles",
            hop_count
        ));
    }
    let mut hops: Vec<NodeId> = picked.into_iter().cloned().collect();

    if avoid == Some(hops.as_slice()) {
        diverge(&mut hops, candidates, &mut rng);
    }
    Ok(hops)
}

/// Depth-first search over the shuffled per-position orders. Returns `false`
/// only when no distinct assignment exists.
fn assign_distinct<'a>(orders: &[Vec<&'a NodeId>], picked: &mut Vec<&'a NodeId>) -> bool {
    let Some(order) = orders.get(picked.len()) else {
        return true;
    };
    for &node in order {
        if picked.contains(&node) {
            continue;
        }
        picked.push(node);
        if assign_distinct(orders, picked) {
            return true;
        }
        picked.pop();
    }
    false
}

/// Swap one hop for an unused node eligible for the same position.
fn diverge<R: Rng>(hops: &mut [NodeId], candidates: &[Vec<NodeId>], rng: &mut R) {
    let options: Vec<(usize, &NodeId)> = candidates
        .iter()
        .enumerate()
        .flat_map(|(i, eligible)| eligible.iter().map(move |n| (i, n)))
        .filter(|(_, n)| !hops.contains(n))
        .collect();
    if let Some((index, node)) = options.choose(rng) {
        hops[*index] = (*node).clone();
    }
}

fn join_hops(hops: &[NodeId]) -> String {
    hops.iter().map(NodeId::as_str).collect::<Vec<_>>().join(" -> ")
}

/// Best-effort periodic rotation. Errors are logged and the timer continues.
pub fn spawn_rotation_task(
    manager: Arc<CircuitManager>,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match manager.rotate().await {
                Ok(session) => {
                    tracing::info!("Scheduled rotation produced circuit {}", session.id())
                }
                Err(e) => tracing::warn!("Scheduled rotation failed: {}", e),
            }
        }
    })
}
