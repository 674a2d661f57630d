//! Gameplay Telemetry
//!
//! Payload types produced by the combat, radar and match systems and carried
//! by the reliable event stream. Damage resolution and sensor rolls happen
//! elsewhere; this module only describes their results.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::Vector3;

// =============================================================================
// COMBAT
// =============================================================================

/// Combat event classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombatEventKind {
    /// Not classified
    #[default]
    Unspecified,
    /// A projectile or beam connected with its target
    DirectHit,
    /// The target's shield collapsed
    ShieldBreak,
}

/// Damage metrics of one combat event.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DamageDetails {
    /// Damage dealt
    pub amount: f64,
    /// Damage type ("kinetic", "explosive", ...)
    #[serde(rename = "type")]
    pub damage_type: String,
    /// Critical hit flag
    pub critical: bool,
}

/// Combat telemetry as produced by the damage resolver.
#[derive(Debug, Clone, PartialEq)]
pub struct CombatTelemetry {
    /// Payload schema version
    pub schema_version: String,
    /// Unique event id
    pub event_id: String,
    /// When the hit happened
    pub occurred_at: DateTime<Utc>,
    /// Event classification
    pub kind: CombatEventKind,
    /// Attacking entity
    pub attacker_entity_id: String,
    /// Defending entity
    pub defender_entity_id: String,
    /// Impact position
    pub position: Vector3,
    /// Impact direction
    pub direction: Vector3,
    /// Damage dealt
    pub damage: DamageDetails,
    /// Free-form annotations
    pub metadata: BTreeMap<String, String>,
}

impl CombatTelemetry {
    /// Build the wire event, dropping metadata entries with an empty key.
    pub fn to_event(&self) -> CombatEvent {
        let metadata = self
            .metadata
            .iter()
            .filter(|(key, _)| !key.is_empty())
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        CombatEvent {
            schema_version: self.schema_version.clone(),
            event_id: self.event_id.clone(),
            occurred_at_ms: self.occurred_at.timestamp_millis(),
            kind: self.kind,
            attacker_entity_id: self.attacker_entity_id.clone(),
            defender_entity_id: self.defender_entity_id.clone(),
            position: self.position,
            direction: self.direction,
            damage: self.damage.clone(),
            metadata,
        }
    }
}

/// Combat event as delivered to clients.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CombatEvent {
    /// Payload schema version
    pub schema_version: String,
    /// Unique event id
    pub event_id: String,
    /// When the hit happened (unix milliseconds)
    pub occurred_at_ms: i64,
    /// Event classification
    pub kind: CombatEventKind,
    /// Attacking entity
    pub attacker_entity_id: String,
    /// Defending entity
    pub defender_entity_id: String,
    /// Impact position
    pub position: Vector3,
    /// Impact direction
    pub direction: Vector3,
    /// Damage dealt
    pub damage: DamageDetails,
    /// Annotations (never contains an empty key)
    pub metadata: BTreeMap<String, String>,
}

// =============================================================================
// RADAR
// =============================================================================

/// Level of detail a client should render a contact at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterestTier {
    /// Not classified
    #[default]
    Unspecified,
    /// The observer itself
    #[serde(rename = "self")]
    SelfTier,
    /// Close range, full fidelity
    Nearby,
    /// Medium range
    Extended,
    /// Far range, low update rate
    Passive,
    /// Radar blip only
    Radar,
}

/// One sensed target inside a radar sweep.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RadarContactEntry {
    /// Sensed entity
    pub target_entity_id: String,
    /// Estimated position
    pub position: Vector3,
    /// Estimated velocity
    pub velocity: Vector3,
    /// Track confidence in [0, 1]
    pub confidence: f64,
    /// Whether terrain occludes the target
    pub occluded: bool,
    /// Suggested rendering tier
    pub suggested_tier: InterestTier,
}

/// Radar sweep bundled per source entity.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RadarContact {
    /// Entity whose sensors produced the sweep
    pub source_entity_id: String,
    /// Sweep time (unix milliseconds)
    pub captured_at_ms: i64,
    /// Contacts in this sweep
    pub entries: Vec<RadarContactEntry>,
}

// =============================================================================
// GAME EVENTS
// =============================================================================

/// Match lifecycle event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameEventType {
    /// Not classified
    #[default]
    Unspecified,
    /// A vehicle (re)spawned
    Spawned,
    /// A vehicle was destroyed
    Destroyed,
    /// An objective changed hands
    ObjectiveCaptured,
    /// Scores changed
    ScoreUpdate,
}

impl GameEventType {
    /// Types accepted on the lifecycle channel.
    pub fn is_lifecycle(self) -> bool {
        matches!(
            self,
            GameEventType::Destroyed | GameEventType::ObjectiveCaptured | GameEventType::ScoreUpdate
        )
    }
}

/// Match lifecycle event.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GameEvent {
    /// Unique event id
    pub event_id: String,
    /// Event type
    #[serde(rename = "type")]
    pub event_type: GameEventType,
    /// When the event happened (unix milliseconds)
    pub occurred_at_ms: i64,
    /// Entity the event is about
    pub primary_entity_id: String,
    /// Other entities involved
    pub related_entity_ids: Vec<String>,
    /// Free-form annotations
    pub metadata: BTreeMap<String, String>,
}

impl GameEvent {
    /// Create an event with the given id and type.
    pub fn new(event_id: impl Into<String>, event_type: GameEventType) -> Self {
        Self {
            event_id: event_id.into(),
            event_type,
            ..Default::default()
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
