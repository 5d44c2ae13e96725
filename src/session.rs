//! Lifecycle of a single anonymizing circuit.
//!
//! ```text
//! Building ──► Active ──► Degraded ──► TornDown
//!    │           │  └──────────────────────▲
//!    └──► Failed ◄┘
//! ```

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::directory::NodeId;

/// Number of latency samples kept for the rolling average.
const LATENCY_WINDOW: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Building,
    Active,
    Degraded,
    TornDown,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::TornDown | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Building => "building",
            SessionState::Active => "active",
            SessionState::Degraded => "degraded",
            SessionState::TornDown => "torn_down",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("circuit {id}: illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub id: SessionId,
    pub from: SessionState,
    pub to: SessionState,
}

/// When an active circuit is considered too slow to keep.
#[derive(Debug, Clone, Copy)]
pub struct HealthPolicy {
    pub latency_threshold_ms: u64,
    /// Consecutive samples above the threshold before degrading.
    pub max_slow_samples: u32,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            latency_threshold_ms: 1500,
            max_slow_samples: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSession {
    id: SessionId,
    hops: Vec<NodeId>,
    state: SessionState,
    created_at: DateTime<Utc>,
    established_at: Option<DateTime<Utc>>,
    closed_at: Option<DateTime<Utc>>,
    last_latency_ms: Option<u64>,
    #[serde(skip)]
    latencies: VecDeque<u64>,
    #[serde(skip)]
    consecutive_slow: u32,
    in_flight: usize,
    reason: Option<String>,
}

impl CircuitSession {
    pub fn building() -> Self {
        Self {
            id: SessionId::new(),
            hops: Vec::new(),
            state: SessionState::Building,
            created_at: Utc::now(),
            established_at: None,
            closed_at: None,
            last_latency_ms: None,
            latencies: VecDeque::with_capacity(LATENCY_WINDOW),
            consecutive_slow: 0,
            in_flight: 0,
            reason: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn hops(&self) -> &[NodeId] {
        &self.hops
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn established_at(&self) -> Option<DateTime<Utc>> {
        self.established_at
    }

    pub fn last_latency_ms(&self) -> Option<u64> {
        self.last_latency_ms
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Why the session last left the happy path, if it did.
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn average_latency_ms(&self) -> Option<u64> {
        if self.latencies.is_empty() {
            return None;
        }
        let sum: u64 = self.latencies.iter().sum();
        Some(sum / self.latencies.len() as u64)
    }

    /// Building -> Active with the selected hops and the setup latency.
    pub fn activate(&mut self, hops: Vec<NodeId>, setup_latency_ms: u64) -> Result<(), TransitionError> {
        self.check(SessionState::Building, SessionState::Active)?;
        self.hops = hops;
        self.state = SessionState::Active;
        self.established_at = Some(Utc::now());
        self.last_latency_ms = Some(setup_latency_ms);
        Ok(())
    }

    /// Building | Active -> Failed.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        if !matches!(self.state, SessionState::Building | SessionState::Active) {
            return Err(self.illegal(SessionState::Failed));
        }
        self.state = SessionState::Failed;
        self.reason = Some(reason.into());
        self.close();
        Ok(())
    }

    /// Active -> Degraded. Once drained, the session is torn down.
    pub fn degrade(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.check(SessionState::Active, SessionState::Degraded)?;
        self.state = SessionState::Degraded;
        self.reason = Some(reason.into());
        self.finish_if_drained();
        Ok(())
    }

    /// Active | Degraded -> TornDown.
    pub fn tear_down(&mut self) -> Result<(), TransitionError> {
        if !matches!(self.state, SessionState::Active | SessionState::Degraded) {
            return Err(self.illegal(SessionState::TornDown));
        }
        self.state = SessionState::TornDown;
        self.close();
        Ok(())
    }

    /// Bind one request. Only active sessions accept new traffic.
    pub fn bind(&mut self) -> bool {
        if self.state != SessionState::Active {
            return false;
        }
        self.in_flight += 1;
        true
    }

    /// Release a bound request; a drained degraded session is torn down.
    pub fn release(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.finish_if_drained();
    }

    /// Record a round-trip sample. Returns `true` if it degraded the session.
    pub fn record_latency(&mut self, latency_ms: u64, policy: &HealthPolicy) -> bool {
        self.last_latency_ms = Some(latency_ms);
        if self.latencies.len() == LATENCY_WINDOW {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency_ms);

        if latency_ms > policy.latency_threshold_ms {
            self.consecutive_slow += 1;
        } else {
            self.consecutive_slow = 0;
        }

        if self.state == SessionState::Active && self.consecutive_slow >= policy.max_slow_samples {
            let reason = format!(
                "{} consecutive samples above {}ms",
                self.consecutive_slow, policy.latency_threshold_ms
            );
            return self.degrade(reason).is_ok();
        }
        false
    }

    fn finish_if_drained(&mut self) {
        if self.state == SessionState::Degraded && self.in_flight == 0 {
            self.state = SessionState::TornDown;
            self.close();
        }
    }

    fn close(&mut self) {
        if self.closed_at.is_none() {
            self.closed_at = Some(Utc::now());
        }
    }

    fn check(&self, from: SessionState, to: SessionState) -> Result<(), TransitionError> {
        if self.state != from {
            return Err(self.illegal(to));
        }
        Ok(())
    }

    fn illegal(&self, to: SessionState) -> TransitionError {
        TransitionError {
            id: self.id,
            from: self.state,
            to,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hops() -> Vec<NodeId> {
        vec![
            NodeId::new("entry"),
            NodeId::new("middle"),
            NodeId::new("exit"),
        ]
    }

    fn active() -> CircuitSession {
        let mut session = CircuitSession::building();
        session.activate(hops(), 40).unwrap();
        session
    }

    #[test]
    fn test_building_to_active() {
        let session = active();
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.hops().len(), 3);
        assert_eq!(session.last_latency_ms(), Some(40));
        assert!(session.established_at().is_some());
    }

    #[test]
    fn test_building_can_fail() {
        let mut session = CircuitSession::building();
        session.fail("timeout").unwrap();
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(session.reason(), Some("timeout"));
        assert!(session.state().is_terminal());
    }

    #[test]
    fn test_terminal_states_reject_transitions() {
        let mut session = active();
        session.tear_down().unwrap();
        let err = session.activate(hops(), 1).unwrap_err();
        assert_eq!(err.from, SessionState::TornDown);
        assert_eq!(err.to, SessionState::Active);
        assert!(session.fail("late").is_err());
        assert!(session.degrade("late").is_err());
        assert!(session.tear_down().is_err());
        assert!(!session.bind());
    }

    #[test]
    fn test_building_cannot_be_torn_down_or_degraded() {
        let mut session = CircuitSession::building();
        assert!(session.tear_down().is_err());
        assert!(session.degrade("x").is_err());
        assert!(!session.bind());
    }

    #[test]
    fn test_degraded_drains_in_flight_then_tears_down() {
        let mut session = active();
        assert!(session.bind());
        assert!(session.bind());
        session.degrade("transport").unwrap();
        assert_eq!(session.state(), SessionState::Degraded);
        assert!(!session.bind(), "degraded sessions take no new traffic");

        session.release();
        assert_eq!(session.state(), SessionState::Degraded);
        session.release();
        assert_eq!(session.state(), SessionState::TornDown);
        assert_eq!(session.in_flight(), 0);
    }

    #[test]
    fn test_degrade_with_nothing_in_flight_tears_down() {
        let mut session = active();
        session.degrade("transport").unwrap();
        assert_eq!(session.state(), SessionState::TornDown);
        assert_eq!(session.reason(), Some("transport"));
    }

    #[test]
    fn test_consecutive_slow_samples_degrade() {
        let policy = HealthPolicy {
            latency_threshold_ms: 100,
            max_slow_samples: 3,
        };
        let mut session = active();
        assert!(session.bind());
        assert!(!session.record_latency(150, &policy));
        assert!(!session.record_latency(150, &policy));
        assert!(!session.record_latency(50, &policy), "fast sample resets the streak");
        assert!(!session.record_latency(150, &policy));
        assert!(!session.record_latency(150, &policy));
        assert!(session.record_latency(150, &policy));
        assert_eq!(session.state(), SessionState::Degraded);
        assert_eq!(session.last_latency_ms(), Some(150));
    }

    #[test]
    fn test_average_latency_uses_rolling_window() {
        let policy = HealthPolicy::default();
        let mut session = active();
        assert_eq!(session.average_latency_ms(), None);
        for _ in 0..LATENCY_WINDOW {
            session.record_latency(1000, &policy);
        }
        session.record_latency(1000 + LATENCY_WINDOW as u64 * 10, &policy);
        assert_eq!(session.average_latency_ms(), Some(1010));
    }

    #[test]
    fn test_session_serializes_camel_case() {
        let json = serde_json::to_value(active()).unwrap();
        assert_eq!(json["state"], "active");
        assert_eq!(json["hops"][0], "entry");
        assert_eq!(json["lastLatencyMs"], 40);
        assert!(json.get("latencies").is_none());
    }

    #[test]
    fn test_session_id_parses_back() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
