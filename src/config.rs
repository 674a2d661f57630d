//! Broker Configuration
//!
//! Runtime tunables read from `BROKER_*` environment variables. Every invalid
//! override is collected so a misconfigured deployment reports all of its
//! problems at once.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::events::{OverflowPolicy, StreamConfig};
use crate::network::{AuthConfig, BandwidthRegulator, BridgeConfig};

/// Default listen address.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:43127";

/// Default connection limit.
pub const DEFAULT_MAX_CLIENTS: usize = 256;

/// Default simulation rate.
pub const DEFAULT_TICK_RATE: u32 = 60;

/// Default consecutive out-of-range intents before a disconnect.
pub const DEFAULT_MAX_INTENT_STRIKES: u32 = 3;

/// Default clock skew tolerated on token expiry.
pub const DEFAULT_AUTH_LEEWAY: Duration = Duration::from_secs(2);

/// Configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// One or more variables failed to parse.
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// TCP listen address (`BROKER_ADDR`)
    pub bind_addr: String,
    /// Concurrent connection limit, 0 = unlimited (`BROKER_MAX_CLIENTS`)
    pub max_clients: usize,
    /// Simulation ticks per second (`BROKER_TICK_RATE`)
    pub tick_rate: u32,
    /// Retained stream envelopes (`BROKER_EVENT_RETENTION`)
    pub event_retention: usize,
    /// Per-subscription channel capacity (`BROKER_SUBSCRIBER_BUFFER`)
    pub subscriber_buffer: usize,
    /// Outbound frames per second per client (`BROKER_OUTBOUND_RATE_HZ`)
    pub outbound_rate_hz: u32,
    /// World diffs published per second, at most the outbound rate (`BROKER_PUBLISH_RATE_HZ`)
    pub publish_rate_hz: u32,
    /// Events a bridge reads ahead of its ticker (`BROKER_OUTBOUND_BUFFER`)
    pub outbound_buffer: usize,
    /// Per-client outbound byte budget, 0 = unlimited (`BROKER_BANDWIDTH_BYTES_PER_SEC`)
    pub bandwidth_bytes_per_sec: u64,
    /// Per-intent deadline (`BROKER_INTENT_TIMEOUT_MS`)
    pub intent_timeout: Duration,
    /// Respawn shield stamped on respawn events (`BROKER_SPAWN_SHIELD_MS`)
    pub spawn_shield: Duration,
    /// Full-channel behaviour (`BROKER_OVERFLOW_POLICY`)
    pub overflow_policy: OverflowPolicy,
    /// Consecutive strikes before disconnect (`BROKER_MAX_INTENT_STRIKES`)
    pub max_intent_strikes: u32,
    /// HS256 secret; `None` disables token auth (`BROKER_AUTH_SECRET`)
    pub auth_secret: Option<String>,
    /// Log filter (`BROKER_LOG_LEVEL`)
    pub log_level: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let stream = StreamConfig::default();
        let bridge = BridgeConfig::default();
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            max_clients: DEFAULT_MAX_CLIENTS,
            tick_rate: DEFAULT_TICK_RATE,
            event_retention: stream.retention,
            subscriber_buffer: stream.subscriber_buffer,
            outbound_rate_hz: bridge.outbound_rate_hz,
            publish_rate_hz: bridge.outbound_rate_hz,
            outbound_buffer: bridge.max_buffered,
            bandwidth_bytes_per_sec: 0,
            intent_timeout: bridge.intent_timeout,
            spawn_shield: stream.spawn_shield,
            overflow_policy: stream.overflow_policy,
            max_intent_strikes: DEFAULT_MAX_INTENT_STRIKES,
            auth_secret: None,
            log_level: "info".to_string(),
        }
    }
}

impl BrokerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create config from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let mut problems = Vec::new();

        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(addr) = get("BROKER_ADDR") {
            // ":port" binds every interface
            cfg.bind_addr = if addr.starts_with(':') {
                format!("0.0.0.0{}", addr)
            } else {
                addr
            };
        }

        parse_into(&get, "BROKER_MAX_CLIENTS", "a non-negative integer", &mut problems, |v: usize| {
            cfg.max_clients = v;
            true
        });
        parse_into(&get, "BROKER_TICK_RATE", "a positive integer", &mut problems, |v: u32| {
            cfg.tick_rate = v;
            v > 0
        });
        parse_into(&get, "BROKER_EVENT_RETENTION", "a positive integer", &mut problems, |v: usize| {
            cfg.event_retention = v;
            v > 0
        });
        parse_into(&get, "BROKER_SUBSCRIBER_BUFFER", "a positive integer", &mut problems, |v: usize| {
            cfg.subscriber_buffer = v;
            v > 0
        });
        parse_into(&get, "BROKER_OUTBOUND_RATE_HZ", "a positive integer", &mut problems, |v: u32| {
            cfg.outbound_rate_hz = v;
            v > 0
        });
        parse_into(&get, "BROKER_PUBLISH_RATE_HZ", "a positive integer", &mut problems, |v: u32| {
            cfg.publish_rate_hz = v;
            v > 0
        });
        parse_into(&get, "BROKER_OUTBOUND_BUFFER", "a positive integer", &mut problems, |v: usize| {
            cfg.outbound_buffer = v;
            v > 0
        });
        parse_into(&get, "BROKER_BANDWIDTH_BYTES_PER_SEC", "a non-negative integer", &mut problems, |v: u64| {
            cfg.bandwidth_bytes_per_sec = v;
            true
        });
        parse_into(&get, "BROKER_INTENT_TIMEOUT_MS", "a positive integer", &mut problems, |v: u64| {
            cfg.intent_timeout = Duration::from_millis(v);
            v > 0
        });
        parse_into(&get, "BROKER_SPAWN_SHIELD_MS", "a non-negative integer", &mut problems, |v: u64| {
            cfg.spawn_shield = Duration::from_millis(v);
            true
        });
        parse_into(&get, "BROKER_OVERFLOW_POLICY", "drop_live or deactivate", &mut problems, |v: OverflowPolicy| {
            cfg.overflow_policy = v;
            true
        });
        parse_into(&get, "BROKER_MAX_INTENT_STRIKES", "a positive integer", &mut problems, |v: u32| {
            cfg.max_intent_strikes = v;
            v > 0
        });

        // A diff feed faster than the outbound pace backs up without bound
        if cfg.publish_rate_hz > cfg.outbound_rate_hz && cfg.outbound_rate_hz > 0 {
            problems.push(format!(
                "BROKER_PUBLISH_RATE_HZ ({}) must not exceed BROKER_OUTBOUND_RATE_HZ ({})",
                cfg.publish_rate_hz, cfg.outbound_rate_hz
            ));
        }

        cfg.auth_secret = get("BROKER_AUTH_SECRET");
        if let Some(level) = get("BROKER_LOG_LEVEL") {
            cfg.log_level = level;
        }

        if problems.is_empty() {
            Ok(cfg)
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    /// Reliable stream settings.
    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            retention: self.event_retention,
            subscriber_buffer: self.subscriber_buffer,
            spawn_shield: self.spawn_shield,
            overflow_policy: self.overflow_policy,
        }
    }

    /// Per-client bridge settings.
    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            outbound_rate_hz: self.outbound_rate_hz,
            intent_timeout: self.intent_timeout,
            subscriber_buffer: self.subscriber_buffer,
            max_buffered: self.outbound_buffer,
        }
    }

    /// Shared byte budget for every client, if one is configured.
    pub fn bandwidth_regulator(&self) -> Option<Arc<BandwidthRegulator>> {
        (self.bandwidth_bytes_per_sec > 0).then(|| Arc::new(BandwidthRegulator::new(self.bandwidth_bytes_per_sec)))
    }

    /// Token auth settings.
    pub fn auth_config(&self) -> AuthConfig {
        AuthConfig {
            secret: self.auth_secret.clone(),
            leeway: DEFAULT_AUTH_LEEWAY,
        }
    }

    /// Simulation step.
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_rate.max(1)))
    }

    /// Simulation steps folded into each published diff.
    pub fn ticks_per_publish(&self) -> u32 {
        self.tick_rate.max(1).div_ceil(self.publish_rate_hz.max(1)).max(1)
    }
}

/// Parse `key` if set; `apply` stores the value and reports whether it is in range.
fn parse_into<T, G, A>(get: &G, key: &str, expected: &str, problems: &mut Vec<String>, mut apply: A)
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
    A: FnMut(T) -> bool,
{
    let Some(raw) = get(key) else {
        return;
    };
    let valid = match raw.parse::<T>() {
        Ok(value) => apply(value),
        Err(_) => false,
    };
    if !valid {
        problems.push(format!("{} must be {}, got {:?}", key, expected, raw));
    }
}

// =============================================================================
// TESTS
// =============================================================================
