//! Server configuration loaded from environment variables.
//!
//! Every setting has a default so a local instance starts with no
//! configuration at all.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use pulse_shared::constants::{
    CALL_RING_TIMEOUT_SECS, DEFAULT_HTTP_PORT, MEMBERSHIP_TTL_MAX_SECS, MEMBERSHIP_TTL_MIN_SECS,
    OUTBOUND_QUEUE_CAPACITY, STALE_AFTER_SECS,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP + WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./pulse.db`
    pub database_path: PathBuf,

    /// Ed25519 public key of the token issuer (hex, 64 chars).
    /// Env: `AUTH_PUBKEY`
    /// Default: all-zeros, a weak key that every token fails against.
    pub auth_pubkey: [u8; 32],

    /// How long a call may ring before it is marked missed.
    /// Env: `CALL_RING_TIMEOUT_SECS`
    pub call_ring_timeout: Duration,

    /// Bounds of the randomized local membership cache TTL.
    /// Env: `MEMBERSHIP_TTL_MIN_SECS`, `MEMBERSHIP_TTL_MAX_SECS`
    pub membership_ttl_min: Duration,
    pub membership_ttl_max: Duration,

    /// Frames buffered per connection before the oldest is dropped.
    /// Env: `OUTBOUND_QUEUE_CAPACITY`
    pub outbound_queue_capacity: usize,

    /// Silence after which a connection is swept as stale.
    /// Env: `STALE_AFTER_SECS`
    pub stale_after: Duration,

    /// Endpoint receiving push notifications as JSON POSTs.
    /// Env: `PUSH_WEBHOOK_URL`
    /// Default: unset (notifications are only logged).
    pub push_webhook_url: Option<String>,

    /// Per-IP token bucket for the HTTP surface.
    /// Env: `RATE_LIMIT_PER_SEC`, `RATE_LIMIT_BURST`
    pub rate_limit_per_sec: f64,
    pub rate_limit_burst: f64,

    /// Shared secret for `/internal/*` routes used by the services that own
    /// conversation membership.
    /// Env: `INTERNAL_TOKEN`
    /// Default: unset (internal routes are disabled).
    pub internal_token: Option<String>,

    /// Redis holding the shared membership tier and its invalidation
    /// channel. Needed when more than one instance serves the same users.
    /// Env: `REDIS_URL`
    /// Default: unset (shared tier kept in process).
    pub redis_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./pulse.db"),
            auth_pubkey: [0u8; 32],
            call_ring_timeout: Duration::from_secs(CALL_RING_TIMEOUT_SECS),
            membership_ttl_min: Duration::from_secs(MEMBERSHIP_TTL_MIN_SECS),
            membership_ttl_max: Duration::from_secs(MEMBERSHIP_TTL_MAX_SECS),
            outbound_queue_capacity: OUTBOUND_QUEUE_CAPACITY,
            stale_after: Duration::from_secs(STALE_AFTER_SECS),
            push_webhook_url: None,
            rate_limit_per_sec: 10.0,
            rate_limit_burst: 30.0,
            internal_token: None,
            redis_url: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. `from_env` passes the
    /// process environment; tests pass a map.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            parse_into(&addr, "HTTP_ADDR", &mut config.http_addr);
        }

        if let Some(path) = lookup("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Some(hex_key) = lookup("AUTH_PUBKEY") {
            match parse_hex_pubkey(&hex_key) {
                Ok(key) => config.auth_pubkey = key,
                Err(e) => {
                    tracing::warn!(error = %e, "Invalid AUTH_PUBKEY, every token will be rejected");
                }
            }
        }

        if let Some(val) = lookup("CALL_RING_TIMEOUT_SECS") {
            parse_secs(&val, "CALL_RING_TIMEOUT_SECS", &mut config.call_ring_timeout);
        }
        if let Some(val) = lookup("MEMBERSHIP_TTL_MIN_SECS") {
            parse_secs(&val, "MEMBERSHIP_TTL_MIN_SECS", &mut config.membership_ttl_min);
        }
        if let Some(val) = lookup("MEMBERSHIP_TTL_MAX_SECS") {
            parse_secs(&val, "MEMBERSHIP_TTL_MAX_SECS", &mut config.membership_ttl_max);
        }
        if config.membership_ttl_min > config.membership_ttl_max {
            tracing::warn!(
                min = ?config.membership_ttl_min,
                max = ?config.membership_ttl_max,
                "Membership TTL bounds are inverted, swapping"
            );
            std::mem::swap(&mut config.membership_ttl_min, &mut config.membership_ttl_max);
        }

        if let Some(val) = lookup("OUTBOUND_QUEUE_CAPACITY") {
            parse_into(&val, "OUTBOUND_QUEUE_CAPACITY", &mut config.outbound_queue_capacity);
            config.outbound_queue_capacity = config.outbound_queue_capacity.max(1);
        }

        if let Some(val) = lookup("STALE_AFTER_SECS") {
            parse_secs(&val, "STALE_AFTER_SECS", &mut config.stale_after);
        }

        if let Some(url) = lookup("PUSH_WEBHOOK_URL") {
            if !url.is_empty() {
                config.push_webhook_url = Some(url);
            }
        }

        if let Some(val) = lookup("RATE_LIMIT_PER_SEC") {
            parse_into(&val, "RATE_LIMIT_PER_SEC", &mut config.rate_limit_per_sec);
        }
        if let Some(val) = lookup("RATE_LIMIT_BURST") {
            parse_into(&val, "RATE_LIMIT_BURST", &mut config.rate_limit_burst);
        }

        if let Some(token) = lookup("INTERNAL_TOKEN") {
            if !token.is_empty() {
                config.internal_token = Some(token);
            }
        }

        if let Some(url) = lookup("REDIS_URL") {
            if !url.is_empty() {
                config.redis_url = Some(url);
            }
        }

        // RUST_LOG is read by tracing-subscriber's EnvFilter directly.

        config
    }
}

fn parse_into<T: FromStr>(raw: &str, key: &str, slot: &mut T) {
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "Invalid value, using default"),
    }
}

fn parse_secs(raw: &str, key: &str, slot: &mut Duration) {
    let mut secs = slot.as_secs();
    parse_into(raw, key, &mut secs);
    *slot = Duration::from_secs(secs);
}

/// Parse a 64-character hex string into a 32-byte key.
fn parse_hex_pubkey(raw: &str) -> Result<[u8; 32], String> {
    let bytes = hex::decode(raw.trim()).map_err(|e| e.to_string())?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| format!("expected 32 bytes, got {}", b.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> ServerConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.call_ring_timeout, Duration::from_secs(30));
        assert_eq!(config.auth_pubkey, [0u8; 32]);
        assert!(config.push_webhook_url.is_none());
        assert!(config.internal_token.is_none());
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("HTTP_ADDR", "127.0.0.1:9000"),
            ("AUTH_PUBKEY", &"ab".repeat(32)),
            ("CALL_RING_TIMEOUT_SECS", "45"),
            ("OUTBOUND_QUEUE_CAPACITY", "16"),
            ("PUSH_WEBHOOK_URL", "https://push.internal/hook"),
            ("REDIS_URL", "redis://cache.internal:6379/0"),
        ]);
        assert_eq!(config.http_addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.auth_pubkey, [0xab; 32]);
        assert_eq!(config.call_ring_timeout, Duration::from_secs(45));
        assert_eq!(config.outbound_queue_capacity, 16);
        assert_eq!(config.push_webhook_url.as_deref(), Some("https://push.internal/hook"));
        assert_eq!(config.redis_url.as_deref(), Some("redis://cache.internal:6379/0"));
    }

    #[test]
    fn test_bad_values_keep_defaults() {
        let config = config_from(&[
            ("HTTP_ADDR", "not-an-addr"),
            ("AUTH_PUBKEY", "abcd"),
            ("STALE_AFTER_SECS", "soon"),
        ]);
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.auth_pubkey, [0u8; 32]);
        assert_eq!(config.stale_after, Duration::from_secs(90));
    }

    #[test]
    fn test_inverted_ttl_bounds_are_swapped() {
        let config = config_from(&[
            ("MEMBERSHIP_TTL_MIN_SECS", "500"),
            ("MEMBERSHIP_TTL_MAX_SECS", "100"),
        ]);
        assert_eq!(config.membership_ttl_min, Duration::from_secs(100));
        assert_eq!(config.membership_ttl_max, Duration::from_secs(500));
    }
}
