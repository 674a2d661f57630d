//! Authoritative world state.
//!
//! Stores mutated by the simulation tick and drained into per-tick diffs.

pub mod entity;
pub mod events;
pub mod world;

pub use entity::{EntityDiff, EntityState, EntityStateStore, StoreError};
pub use events::EventStore;
pub use world::{TickDiff, WorldDiff, WorldState};
