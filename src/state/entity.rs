//! Entity State Store
//!
//! Authoritative per-entity motion table with dirty tracking.
//!
//! Every tick the simulation upserts or removes entities, calls
//! [`EntityStateStore::advance`] and then [`EntityStateStore::consume_diff`] to
//! collect exactly what changed since the previous collection. Stored states
//! never leave the store by reference: every read hands out a clone.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{Orientation, Vector3};

/// Motion state of one vehicle or projectile.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EntityState {
    /// Unique entity id
    pub id: String,
    /// World position (metres)
    pub position: Vector3,
    /// Velocity (metres per second)
    pub velocity: Vector3,
    /// Orientation
    pub orientation: Orientation,
    /// Last authoritative update (unix milliseconds)
    pub updated_at_ms: i64,
}

impl EntityState {
    /// Create a state at `position` moving with `velocity`.
    pub fn new(id: impl Into<String>, position: Vector3, velocity: Vector3) -> Self {
        Self {
            id: id.into(),
            position,
            velocity,
            ..Default::default()
        }
    }
}

/// Changes accumulated since the previous [`EntityStateStore::consume_diff`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EntityDiff {
    /// Cloned states of every entity touched this tick, ascending by id
    pub updated: Vec<EntityState>,
    /// Ids removed this tick, ascending
    pub removed: Vec<String>,
}

impl EntityDiff {
    /// True when nothing was updated or removed.
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Store errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Entity ids must be non-empty.
    #[error("entity id must not be empty")]
    EmptyId,
}

#[derive(Debug, Default)]
struct StoreInner {
    states: BTreeMap<String, EntityState>,
    dirty: BTreeSet<String>,
    removed: BTreeSet<String>,
}

/// Thread-safe entity table.
///
/// One read-write lock guards states and both tracking sets, so a diff is
/// always a consistent cut of the table.
#[derive(Debug, Default)]
pub struct EntityStateStore {
    inner: RwLock<StoreInner>,
}

impl EntityStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entity and flag it for the next diff.
    pub fn upsert(&self, state: &EntityState) -> Result<(), StoreError> {
        if state.id.is_empty() {
            return Err(StoreError::EmptyId);
        }

        let state = state.clone();
        let mut inner = self.inner.write();
        inner.removed.remove(&state.id);
        inner.dirty.insert(state.id.clone());
        inner.states.insert(state.id.clone(), state);
        Ok(())
    }

    /// Delete an entity and report it as removed in the next diff.
    ///
    /// Unknown ids are still reported, so a client that missed the insert
    /// converges on the removal anyway.
    pub fn remove(&self, id: &str) -> Result<(), StoreError> {
        if id.is_empty() {
            return Err(StoreError::EmptyId);
        }

        let mut inner = self.inner.write();
        inner.states.remove(id);
        inner.dirty.remove(id);
        inner.removed.insert(id.to_string());
        Ok(())
    }

    /// Clone of the stored state, if present.
    pub fn get(&self, id: &str) -> Option<EntityState> {
        self.inner.read().states.get(id).cloned()
    }

    /// Integrate `position += velocity * dt` for every entity and mark all dirty.
    ///
    /// Non-positive or non-finite steps are ignored.
    pub fn advance(&self, dt_seconds: f64) {
        if !dt_seconds.is_finite() || dt_seconds <= 0.0 {
            return;
        }

        let mut inner = self.inner.write();
        let StoreInner { states, dirty, .. } = &mut *inner;
        for (id, state) in states.iter_mut() {
            state.position = state.position.integrate(state.velocity, dt_seconds);
            dirty.insert(id.clone());
        }
    }

    /// Take the accumulated changes and reset tracking.
    pub fn consume_diff(&self) -> EntityDiff {
        let mut inner = self.inner.write();
        let dirty = std::mem::take(&mut inner.dirty);
        let removed = std::mem::take(&mut inner.removed);

        let updated = dirty
            .iter()
            .filter_map(|id| inner.states.get(id).cloned())
            .collect();

        EntityDiff {
            updated,
            removed: removed.into_iter().collect(),
        }
    }

    /// Clones of every stored entity, ascending by id.
    pub fn snapshot(&self) -> Vec<EntityState> {
        self.inner.read().states.values().cloned().collect()
    }

    /// Number of stored entities.
    pub fn len(&self) -> usize {
        self.inner.read().states.len()
    }

    /// True when no entity is stored.
    pub fn is_empty(&self) -> bool {
        self.inner.read().states.is_empty()
    }
}

// =============================================================================
// TESTS
// =============================================================================
