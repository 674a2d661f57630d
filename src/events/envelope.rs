//! Sequenced payloads.

use serde::{Deserialize, Serialize};

use super::telemetry::{CombatEvent, GameEvent, RadarContact};
use crate::state::WorldDiff;

/// Payload kinds carried by the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// World state diff
    Diff,
    /// Combat telemetry
    Combat,
    /// Radar sweep
    Radar,
    /// Vehicle respawn
    Respawn,
    /// Match lifecycle transition
    Lifecycle,
}

impl EventKind {
    /// Wire name of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Diff => "diff",
            EventKind::Combat => "combat",
            EventKind::Radar => "radar",
            EventKind::Respawn => "respawn",
            EventKind::Lifecycle => "lifecycle",
        }
    }
}

/// Closed set of publishable payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum EventPayload {
    /// World state diff
    Diff(WorldDiff),
    /// Combat event
    Combat(CombatEvent),
    /// Radar sweep
    Radar(RadarContact),
    /// Respawn (always a `Spawned` game event)
    Respawn(GameEvent),
    /// Destroyed, objective captured or score update
    Lifecycle(GameEvent),
}

impl EventPayload {
    /// Kind tag of this payload.
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Diff(_) => EventKind::Diff,
            EventPayload::Combat(_) => EventKind::Combat,
            EventPayload::Radar(_) => EventKind::Radar,
            EventPayload::Respawn(_) => EventKind::Respawn,
            EventPayload::Lifecycle(_) => EventKind::Lifecycle,
        }
    }
}

/// One sequenced payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Global sequence number (starts at 1)
    pub sequence: u64,
    /// The payload
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Envelope {
    /// Kind tag of the payload.
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Serialize to JSON bytes.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from JSON bytes.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
