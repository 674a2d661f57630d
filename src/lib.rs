//! # DriftPursuit Broker
//!
//! World-state synchronization core for DriftPursuit: an authoritative entity
//! store, a reliable sequenced event stream and a per-client transport bridge.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   DRIFTPURSUIT BROKER                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Shared primitives                         │
//! │  ├── vec3.rs     - 3D motion vectors                         │
//! │  └── context.rs  - Cancellation and deadlines                │
//! │                                                              │
//! │  state/          - Authoritative world                       │
//! │  ├── entity.rs   - Entity store with dirty tracking          │
//! │  ├── events.rs   - Pending game events                       │
//! │  └── world.rs    - Per-tick diff aggregation                 │
//! │                                                              │
//! │  events/         - Reliable delivery                         │
//! │  ├── telemetry.rs- Combat, radar and lifecycle payloads      │
//! │  ├── envelope.rs - Sequenced envelope                        │
//! │  └── stream.rs   - Ack tracking and reconnect replay         │
//! │                                                              │
//! │  broker/         - Simulation loop and intent ledger         │
//! │                                                              │
//! │  network/        - Client transport                          │
//! │  ├── bridge.rs   - Paced outbound, deadline-bound inbound    │
//! │  ├── compress.rs - Payload codecs                            │
//! │  ├── bandwidth.rs- Per-client byte budgets                   │
//! │  ├── protocol.rs - Message types                             │
//! │  ├── auth.rs     - HS256 handshake tokens                    │
//! │  └── server.rs   - WebSocket server                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Delivery Guarantee
//!
//! Every subscriber sees published envelopes in sequence order, at least
//! once. Unacknowledged envelopes stay retained and are replayed when the
//! subscriber reconnects under the same id.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod broker;
pub mod config;
pub mod core;
pub mod events;
pub mod network;
pub mod state;

// Re-export commonly used types
pub use broker::{Broker, IntentLedger, IntentPayload};
pub use config::{BrokerConfig, ConfigError};
pub use crate::core::{Context, Vector3};
pub use events::{Envelope, EventPayload, ReliableEventStream, StreamConfig, Subscription};
pub use network::{BrokerServer, TransportBridge};
pub use state::{EntityDiff, EntityState, EntityStateStore, WorldState};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
