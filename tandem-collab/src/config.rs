//! Server configuration.
//!
//! Every knob has a default; `from_env` overrides them from `TANDEM_*`
//! environment variables.

use std::time::Duration;

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Exponential backoff for store writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Total attempts including the first one.
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based: the delay after the first failure is `attempt = 1`).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            max_attempts: 8,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per document
    pub broadcast_capacity: usize,
    /// Maximum concurrent sessions on one document
    pub max_sessions_per_document: usize,
    /// Window for the auth collaborator to answer
    pub auth_timeout: Duration,
    /// Period of the dirty-document flush; bounds data loss on crash
    pub flush_interval: Duration,
    /// How long an empty document stays in memory
    pub eviction_grace: Duration,
    /// Malformed operations tolerated per session before closing it
    pub max_malformed_per_session: u32,
    /// Ping period; connections silent for 3 intervals are closed
    pub heartbeat_interval: Duration,
    /// Encoded state size above which a flush compacts the document first
    pub compaction_threshold_bytes: usize,
    pub flush_retry: RetryPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            max_sessions_per_document: 100,
            auth_timeout: Duration::from_secs(5),
            flush_interval: Duration::from_secs(2),
            eviction_grace: Duration::from_secs(30),
            max_malformed_per_session: 3,
            heartbeat_interval: Duration::from_secs(30),
            compaction_threshold_bytes: 1024 * 1024,
            flush_retry: RetryPolicy::default(),
        }
    }
}

impl ServerConfig {
    /// Small timings and an ephemeral port, for tests.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            broadcast_capacity: 64,
            max_sessions_per_document: 16,
            auth_timeout: Duration::from_millis(500),
            flush_interval: Duration::from_millis(50),
            eviction_grace: Duration::from_millis(200),
            max_malformed_per_session: 3,
            heartbeat_interval: Duration::from_secs(5),
            compaction_threshold_bytes: 64 * 1024,
            flush_retry: RetryPolicy {
                initial_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(50),
                max_attempts: 4,
            },
        }
    }

    /// Defaults overridden by `TANDEM_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("TANDEM_BIND_ADDR") {
            if addr.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "TANDEM_BIND_ADDR",
                    value: addr,
                    reason: "must not be empty".into(),
                });
            }
            config.bind_addr = addr;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "TANDEM_FLUSH_INTERVAL_MS")? {
            config.flush_interval = non_zero_millis("TANDEM_FLUSH_INTERVAL_MS", ms)?;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "TANDEM_EVICTION_GRACE_MS")? {
            config.eviction_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "TANDEM_AUTH_TIMEOUT_MS")? {
            config.auth_timeout = non_zero_millis("TANDEM_AUTH_TIMEOUT_MS", ms)?;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "TANDEM_HEARTBEAT_INTERVAL_MS")? {
            config.heartbeat_interval = non_zero_millis("TANDEM_HEARTBEAT_INTERVAL_MS", ms)?;
        }
        if let Some(n) = parse_var::<usize, _>(&lookup, "TANDEM_BROADCAST_CAPACITY")? {
            if n == 0 {
                return Err(zero("TANDEM_BROADCAST_CAPACITY"));
            }
            config.broadcast_capacity = n;
        }
        if let Some(n) = parse_var::<usize, _>(&lookup, "TANDEM_MAX_SESSIONS_PER_DOCUMENT")? {
            if n == 0 {
                return Err(zero("TANDEM_MAX_SESSIONS_PER_DOCUMENT"));
            }
            config.max_sessions_per_document = n;
        }
        if let Some(n) = parse_var::<u32, _>(&lookup, "TANDEM_MAX_MALFORMED")? {
            config.max_malformed_per_session = n;
        }

        Ok(config)
    }

    /// A connection with no inbound traffic for this long is dead.
    pub fn liveness_timeout(&self) -> Duration {
        self.heartbeat_interval * 3
    }
}

fn parse_var<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

fn non_zero_millis(key: &'static str, ms: u64) -> Result<Duration, ConfigError> {
    if ms == 0 {
        return Err(zero(key));
    }
    Ok(Duration::from_millis(ms))
}

fn zero(key: &'static str) -> ConfigError {
    ConfigError::InvalidValue {
        key,
        value: "0".into(),
        reason: "must be greater than zero".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.max_sessions_per_document, 100);
        assert_eq!(config.flush_interval, Duration::from_secs(2));
        assert_eq!(config.eviction_grace, Duration::from_secs(30));
        assert_eq!(config.liveness_timeout(), Duration::from_secs(90));
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("TANDEM_BIND_ADDR", "0.0.0.0:7000"),
            ("TANDEM_FLUSH_INTERVAL_MS", "500"),
            ("TANDEM_EVICTION_GRACE_MS", "0"),
            ("TANDEM_MAX_SESSIONS_PER_DOCUMENT", " 8 "),
            ("TANDEM_MAX_MALFORMED", "1"),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.flush_interval, Duration::from_millis(500));
        assert_eq!(config.eviction_grace, Duration::ZERO);
        assert_eq!(config.max_sessions_per_document, 8);
        assert_eq!(config.max_malformed_per_session, 1);
        assert_eq!(config.broadcast_capacity, 256);
    }

    #[test]
    fn test_from_lookup_rejects_bad_values() {
        let err = ServerConfig::from_lookup(lookup(&[("TANDEM_FLUSH_INTERVAL_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { key: "TANDEM_FLUSH_INTERVAL_MS", .. }
        ));

        let err = ServerConfig::from_lookup(lookup(&[("TANDEM_BROADCAST_CAPACITY", "0")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { key: "TANDEM_BROADCAST_CAPACITY", .. }
        ));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(10), Duration::from_secs(5));
        assert_eq!(policy.backoff(64), Duration::from_secs(5));
    }
}
