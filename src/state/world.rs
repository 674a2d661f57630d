//! World State
//!
//! Aggregates every authoritative store the simulation advances each tick and
//! folds their changes into one [`TickDiff`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::entity::{EntityDiff, EntityStateStore};
use super::events::EventStore;
use crate::events::GameEvent;

/// All changes produced by one simulation tick.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TickDiff {
    /// Vehicle changes
    pub vehicles: EntityDiff,
    /// Projectile changes
    pub projectiles: EntityDiff,
    /// Game events queued during the tick
    pub events: Vec<GameEvent>,
}

impl TickDiff {
    /// Whether the diff carries anything worth broadcasting.
    pub fn has_changes(&self) -> bool {
        !self.vehicles.is_empty() || !self.projectiles.is_empty() || !self.events.is_empty()
    }
}

/// A tick diff stamped with its authoritative tick number.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorldDiff {
    /// Tick the diff was produced on
    pub tick: u64,
    /// The changes
    pub diff: TickDiff,
}

/// Authoritative world containers.
#[derive(Debug, Default)]
pub struct WorldState {
    /// Vehicles
    pub vehicles: EntityStateStore,
    /// Projectiles in flight
    pub projectiles: EntityStateStore,
    /// Pending game events
    pub events: EventStore,
}

impl WorldState {
    /// Create an empty world.
    pub fn new() -> Self {
        Self::default()
    }

    /// Integrate motion for `step` and collect the tick's changes.
    pub fn advance_tick(&self, step: Duration) -> TickDiff {
        self.step(step);
        self.consume_diff()
    }

    /// Integrate motion for `step` without collecting anything.
    ///
    /// Changes accumulate until the next [`consume_diff`](Self::consume_diff),
    /// so several steps fold into one diff carrying the latest states.
    pub fn step(&self, step: Duration) {
        let dt = step.as_secs_f64();
        self.vehicles.advance(dt);
        self.projectiles.advance(dt);
    }

    /// Take every change accumulated since the last call.
    pub fn consume_diff(&self) -> TickDiff {
        TickDiff {
            vehicles: self.vehicles.consume_diff(),
            projectiles: self.projectiles.consume_diff(),
            events: self.events.consume(),
        }
    }

    /// Full copy of every entity, for bootstrap and debugging.
    ///
    /// Nothing is consumed: pending changes and events stay queued.
    pub fn snapshot(&self) -> TickDiff {
        TickDiff {
            vehicles: EntityDiff {
                updated: self.vehicles.snapshot(),
                removed: Vec::new(),
            },
            projectiles: EntityDiff {
                updated: self.projectiles.snapshot(),
                removed: Vec::new(),
            },
            events: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Vector3;
    use crate::events::GameEventType;
    use crate::state::EntityState;

    #[test]
    fn test_advance_tick_collects_all_stores() {
        let world = WorldState::new();
        world
            .vehicles
            .upsert(&EntityState::new("car", Vector3::ZERO, Vector3::new(0.0, 0.0, 20.0)))
            .unwrap();
        world
            .projectiles
            .upsert(&EntityState::new("shell", Vector3::ZERO, Vector3::new(100.0, 0.0, 0.0)))
            .unwrap();
        world.events.add(&GameEvent::new("boom", GameEventType::Destroyed));

        let diff = world.advance_tick(Duration::from_millis(100));
        assert!(diff.has_changes());
        assert_eq!(diff.vehicles.updated[0].position, Vector3::new(0.0, 0.0, 2.0));
        assert_eq!(diff.projectiles.updated[0].position, Vector3::new(10.0, 0.0, 0.0));
        assert_eq!(diff.events.len(), 1);
    }

    #[test]
    fn test_steps_fold_into_one_diff() {
        let world = WorldState::new();
        world
            .vehicles
            .upsert(&EntityState::new("car", Vector3::ZERO, Vector3::new(10.0, 0.0, 0.0)))
            .unwrap();
        world.events.add(&GameEvent::new("first", GameEventType::ScoreUpdate));

        world.step(Duration::from_millis(500));
        world.events.add(&GameEvent::new("second", GameEventType::ScoreUpdate));
        world.step(Duration::from_millis(500));

        let diff = world.consume_diff();
        assert_eq!(diff.vehicles.updated.len(), 1);
        assert_eq!(diff.vehicles.updated[0].position, Vector3::new(10.0, 0.0, 0.0));
        assert_eq!(diff.events.len(), 2);
        assert!(!world.consume_diff().has_changes());
    }

    #[test]
    fn test_empty_world_has_no_changes() {
        let world = WorldState::new();
        assert!(!world.advance_tick(Duration::from_millis(16)).has_changes());
    }

    #[test]
    fn test_snapshot_consumes_nothing() {
        let world = WorldState::new();
        world
            .vehicles
            .upsert(&EntityState::new("car", Vector3::ZERO, Vector3::ZERO))
            .unwrap();
        world.events.add(&GameEvent::new("boom", GameEventType::Destroyed));

        let snapshot = world.snapshot();
        assert_eq!(snapshot.vehicles.updated.len(), 1);
        assert!(snapshot.events.is_empty());

        // The pending upsert and event are still delivered by the next tick.
        let diff = world.advance_tick(Duration::from_millis(16));
        assert_eq!(diff.vehicles.updated.len(), 1);
        assert_eq!(diff.events.len(), 1);
    }
}
