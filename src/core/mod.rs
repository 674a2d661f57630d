//! Core primitives.
//!
//! Motion math shared by the state stores and the cancellation scope shared by
//! every long-running task.

pub mod context;
pub mod vec3;

// Re-export core types
pub use context::{CancelHandle, CancelReason, Context};
pub use vec3::{Orientation, Vector3};
