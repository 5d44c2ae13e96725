use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::manager::ManagerConfig;
use crate::session::HealthPolicy;

/// Relays used when `NODES` is not set.
const DEFAULT_NODES: &str = "relay-ams-1,relay-fra-1,relay-lon-1,relay-par-1,relay-sto-1,relay-tor-1,relay-nyc-1,relay-sgp-1,relay-zrh-1";

#[derive(Error, Debug)]
#[error("invalid value for {name}: {value:?} ({reason})")]
pub struct ConfigError {
    pub name: &'static str,
    pub value: String,
    pub reason: String,
}

// ─────────────────────────────────────────────
// Configuration from environment
// ─────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub keys_dir: PathBuf,
    pub allow_simulated: bool,
    pub hop_count: usize,
    pub build_timeout: Duration,
    pub verify_timeout: Duration,
    pub latency_threshold_ms: u64,
    pub max_slow_samples: u32,
    pub history_limit: usize,
    /// `None` disables scheduled rotation.
    pub rotate_interval: Option<Duration>,
    pub hop_latency_ms: RangeInclusive<u64>,
    pub nodes: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 4003,
            keys_dir: PathBuf::from("./keys"),
            allow_simulated: true,
            hop_count: 3,
            build_timeout: Duration::from_millis(5000),
            verify_timeout: Duration::from_millis(10_000),
            latency_threshold_ms: 1500,
            max_slow_samples: 3,
            history_limit: 64,
            rotate_interval: None,
            hop_latency_ms: 20..=120,
            nodes: DEFAULT_NODES.to_string(),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars().collect())
    }

    /// Build from an explicit variable map; unset variables keep defaults.
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |name: &'static str| lookup(&vars, name);

        let hop_count = parse_or(get("HOP_COUNT"), "HOP_COUNT", defaults.hop_count)?;
        if hop_count == 0 {
            return Err(invalid("HOP_COUNT", "0", "at least one hop is required"));
        }

        let rotate_secs: u64 = parse_or(get("ROTATE_INTERVAL_SECS"), "ROTATE_INTERVAL_SECS", 0)?;

        Ok(Self {
            port: parse_or(get("PORT"), "PORT", defaults.port)?,
            keys_dir: get("KEYS_DIR").map(PathBuf::from).unwrap_or(defaults.keys_dir),
            allow_simulated: parse_bool(get("ALLOW_SIMULATED"), "ALLOW_SIMULATED", defaults.allow_simulated)?,
            hop_count,
            build_timeout: Duration::from_millis(parse_or(
                get("BUILD_TIMEOUT_MS"),
                "BUILD_TIMEOUT_MS",
                defaults.build_timeout.as_millis() as u64,
            )?),
            verify_timeout: Duration::from_millis(parse_or(
                get("VERIFY_TIMEOUT_MS"),
                "VERIFY_TIMEOUT_MS",
                defaults.verify_timeout.as_millis() as u64,
            )?),
            latency_threshold_ms: parse_or(
                get("LATENCY_THRESHOLD_MS"),
                "LATENCY_THRESHOLD_MS",
                defaults.latency_threshold_ms,
            )?,
            max_slow_samples: parse_or(
                get("MAX_SLOW_SAMPLES"),
                "MAX_SLOW_SAMPLES",
                defaults.max_slow_samples,
            )?,
            history_limit: parse_or(get("HISTORY_LIMIT"), "HISTORY_LIMIT", defaults.history_limit)?,
            rotate_interval: (rotate_secs > 0).then(|| Duration::from_secs(rotate_secs)),
            hop_latency_ms: match get("HOP_LATENCY_MS") {
                Some(raw) => parse_range("HOP_LATENCY_MS", raw)?,
                None => defaults.hop_latency_ms,
            },
            nodes: get("NODES").map(str::to_string).unwrap_or(defaults.nodes),
        })
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            hop_count: self.hop_count,
            build_timeout: self.build_timeout,
            health: HealthPolicy {
                latency_threshold_ms: self.latency_threshold_ms,
                max_slow_samples: self.max_slow_samples.max(1),
            },
            history_limit: self.history_limit,
        }
    }
}

fn lookup<'a>(vars: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    vars.get(name).map(|v| v.trim()).filter(|v| !v.is_empty())
}

fn invalid(name: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError {
        name,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_or<T>(raw: Option<&str>, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(v) => v.parse().map_err(|e: T::Err| invalid(name, v, e.to_string())),
    }
}

fn parse_bool(raw: Option<&str>, name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match raw.map(str::to_ascii_lowercase).as_deref() {
        None => Ok(default),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => Err(invalid(name, other, "expected true or false")),
    }
}

/// `"20-120"` or a single value `"50"`.
fn parse_range(name: &'static str, raw: &str) -> Result<RangeInclusive<u64>, ConfigError> {
    let (lo, hi) = match raw.split_once('-') {
        Some((lo, hi)) => (lo.trim(), hi.trim()),
        None => (raw, raw),
    };
    let lo: u64 = lo.parse().map_err(|_| invalid(name, raw, "expected <min>-<max>"))?;
    let hi: u64 = hi.parse().map_err(|_| invalid(name, raw, "expected <min>-<max>"))?;
    if lo > hi {
        return Err(invalid(name, raw, "min exceeds max"));
    }
    Ok(lo..=hi)
}
