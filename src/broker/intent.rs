//! Intent Ledger
//!
//! Decodes and validates client control intents and keeps the latest accepted
//! intent per controller. Clients that keep sending out-of-range controls are
//! disconnected after a configurable number of consecutive strikes.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::network::IntentVerdict;

/// Default consecutive range violations tolerated before a disconnect.
pub const DEFAULT_MAX_STRIKES: u32 = 3;

/// Decoded control intent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentPayload {
    /// Payload schema version
    pub schema_version: String,
    /// Controlled vehicle (defaults to the sending client)
    pub controller_id: String,
    /// Per-controller monotonic sequence, starting at 1
    pub sequence_id: u64,
    /// Throttle in [-1, 1]
    pub throttle: f64,
    /// Brake in [0, 1]
    pub brake: f64,
    /// Steering in [-1, 1]
    pub steer: f64,
    /// Handbrake engaged
    pub handbrake: bool,
    /// Gear in [-1, 9]
    pub gear: i32,
    /// Boost engaged
    pub boost: bool,
    /// Client send time (Unix ms)
    pub sent_at_ms: i64,
}

/// Intent validation errors.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum IntentError {
    /// No bytes.
    #[error("intent payload is empty")]
    EmptyPayload,

    /// Not valid intent JSON.
    #[error("decode intent: {0}")]
    Decode(String),

    /// `schema_version` not set.
    #[error("intent missing schema_version")]
    MissingSchemaVersion,

    /// Neither a controller id nor a client id.
    #[error("intent missing controller_id")]
    MissingController,

    /// Sequences start at 1.
    #[error("intent sequence_id must be positive")]
    ZeroSequence,

    /// A control channel outside its allowed range.
    #[error("{channel} {value} outside allowed range")]
    OutOfRange {
        /// Offending channel
        channel: &'static str,
        /// Received value
        value: f64,
    },

    /// Sequence not newer than the last accepted one.
    #[error("stale sequence {got} (last accepted {last})")]
    StaleSequence {
        /// Received sequence
        got: u64,
        /// Last accepted sequence
        last: u64,
    },
}

impl IntentError {
    /// Whether the error counts towards the client's strikes.
    pub fn is_strike(&self) -> bool {
        matches!(self, IntentError::OutOfRange { .. })
    }
}

/// Inclusive bounds of one control channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Range {
    /// Lower bound
    pub min: f64,
    /// Upper bound
    pub max: f64,
}

impl Range {
    /// Create a range.
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// NaN is never contained.
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Allowed control ranges.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlRanges {
    /// Throttle bounds
    pub throttle: Range,
    /// Brake bounds
    pub brake: Range,
    /// Steering bounds
    pub steer: Range,
    /// Gear bounds
    pub gear: Range,
}

impl Default for ControlRanges {
    fn default() -> Self {
        Self {
            throttle: Range::new(-1.0, 1.0),
            brake: Range::new(0.0, 1.0),
            steer: Range::new(-1.0, 1.0),
            gear: Range::new(-1.0, 9.0),
        }
    }
}

impl ControlRanges {
    /// Check every channel, reporting the first violation.
    pub fn check(&self, intent: &IntentPayload) -> Result<(), IntentError> {
        let channels = [
            ("throttle", intent.throttle, self.throttle),
            ("brake", intent.brake, self.brake),
            ("steer", intent.steer, self.steer),
            ("gear", f64::from(intent.gear), self.gear),
        ];
        for (channel, value, range) in channels {
            if !range.contains(value) {
                return Err(IntentError::OutOfRange { channel, value });
            }
        }
        Ok(())
    }
}

/// Ledger configuration.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Allowed control ranges
    pub ranges: ControlRanges,
    /// Consecutive strikes before disconnect (0 = never)
    pub max_strikes: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            ranges: ControlRanges::default(),
            max_strikes: DEFAULT_MAX_STRIKES,
        }
    }
}

#[derive(Debug, Default)]
struct LedgerInner {
    latest: BTreeMap<String, IntentPayload>,
    strikes: BTreeMap<String, u32>,
}

/// Latest accepted intent per controller.
#[derive(Debug, Default)]
pub struct IntentLedger {
    config: LedgerConfig,
    inner: Mutex<LedgerInner>,
}

impl IntentLedger {
    /// Create a ledger.
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(LedgerInner::default()),
        }
    }

    /// Decode `raw` without touching ledger state.
    ///
    /// An empty `controller_id` falls back to `client_id`.
    pub fn decode(client_id: &str, raw: &[u8]) -> Result<IntentPayload, IntentError> {
        if raw.is_empty() {
            return Err(IntentError::EmptyPayload);
        }
        let mut intent: IntentPayload =
            serde_json::from_slice(raw).map_err(|e| IntentError::Decode(e.to_string()))?;

        intent.schema_version = intent.schema_version.trim().to_string();
        intent.controller_id = intent.controller_id.trim().to_string();
        if intent.schema_version.is_empty() {
            return Err(IntentError::MissingSchemaVersion);
        }
        if intent.controller_id.is_empty() {
            intent.controller_id = client_id.trim().to_string();
        }
        if intent.controller_id.is_empty() {
            return Err(IntentError::MissingController);
        }
        if intent.sequence_id == 0 {
            return Err(IntentError::ZeroSequence);
        }
        Ok(intent)
    }

    /// Validate, store and judge one intent from `client_id`.
    pub fn submit(&self, client_id: &str, raw: &[u8]) -> IntentVerdict {
        match self.apply(client_id, raw) {
            Ok(()) => IntentVerdict::Accepted,
            Err(error) if error.is_strike() => {
                let strikes = {
                    let mut inner = self.inner.lock();
                    let strikes = inner.strikes.entry(client_id.to_string()).or_default();
                    *strikes += 1;
                    *strikes
                };
                if self.config.max_strikes > 0 && strikes >= self.config.max_strikes {
                    warn!(client = %client_id, strikes, %error, "Too many invalid intents");
                    IntentVerdict::Disconnect {
                        reason: format!("{} consecutive invalid intents: {}", strikes, error),
                    }
                } else {
                    debug!(client = %client_id, strikes, %error, "Intent out of range");
                    IntentVerdict::Rejected {
                        reason: error.to_string(),
                    }
                }
            }
            Err(error) => {
                debug!(client = %client_id, %error, "Intent rejected");
                IntentVerdict::Rejected {
                    reason: error.to_string(),
                }
            }
        }
    }

    fn apply(&self, client_id: &str, raw: &[u8]) -> Result<(), IntentError> {
        let intent = Self::decode(client_id, raw)?;
        self.config.ranges.check(&intent)?;

        let mut inner = self.inner.lock();
        if let Some(last) = inner.latest.get(&intent.controller_id) {
            if intent.sequence_id <= last.sequence_id {
                return Err(IntentError::StaleSequence {
                    got: intent.sequence_id,
                    last: last.sequence_id,
                });
            }
        }
        inner.strikes.remove(client_id);
        inner.latest.insert(intent.controller_id.clone(), intent);
        Ok(())
    }

    /// Latest accepted intent for a controller.
    pub fn latest(&self, controller_id: &str) -> Option<IntentPayload> {
        self.inner.lock().latest.get(controller_id).cloned()
    }

    /// Current consecutive strikes of a client.
    pub fn strikes(&self, client_id: &str) -> u32 {
        self.inner.lock().strikes.get(client_id).copied().unwrap_or(0)
    }

    /// Forget a client's strikes (on disconnect).
    pub fn forget_client(&self, client_id: &str) {
        self.inner.lock().strikes.remove(client_id);
    }

    /// Number of controllers with an accepted intent.
    pub fn controllers(&self) -> usize {
        self.inner.lock().latest.len()
    }
}

// =============================================================================
// TESTS
// =============================================================================
