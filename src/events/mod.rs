//! Reliable gameplay event delivery.
//!
//! This module contains:
//! - Telemetry payload types (combat, radar, match lifecycle)
//! - The sequenced envelope wrapping every published payload
//! - The reliable stream with ack tracking and reconnect replay

pub mod envelope;
pub mod stream;
pub mod telemetry;

pub use envelope::{Envelope, EventKind, EventPayload};
pub use stream::{
    OverflowPolicy, ReliableEventStream, StreamConfig, StreamError, StreamStats, Subscription,
    SPAWN_SHIELD_METADATA_KEY,
};
pub use telemetry::{
    CombatEvent, CombatEventKind, CombatTelemetry, DamageDetails, GameEvent, GameEventType,
    InterestTier, RadarContact, RadarContactEntry,
};
