//! Thronglet Core - Creature Simulation and Peer Migration Protocol
//!
//! This library runs a population of creatures on one node and moves them
//! between cooperating nodes on a local network:
//! 1. **Tick loop**: every creature is advanced through a behavior FSM
//!    against a shared world of food, temperature and capacity
//! 2. **Discovery**: nodes broadcast announcements and track live peers
//! 3. **Migration**: eligible creatures are handed to the most attractive
//!    peer through a request/acknowledge handshake
//!
//! All I/O goes through `thronglet_env`, so the same `Node` runs as a
//! daemon or inside the deterministic simulator.

pub mod allowlist;
pub mod api;
pub mod behavior;
pub mod config;
pub mod creature;
pub mod discovery;
pub mod error;
pub mod handlers;
pub mod migration;
pub mod peers;
pub mod persistence;
pub mod protocol;
pub mod runtime;
pub mod simulation;
pub mod stats;
pub mod world;

#[cfg(test)]
mod testing;

// Re-export key types for convenience
pub use api::{NetworkStats, NodeStatus};
pub use config::NodeConfig;
pub use creature::{Creature, CreatureId, CreatureState, CreatureSummary};
pub use error::{ConfigError, MigrationError, PersistError, ProtocolError, SimulationError};
pub use migration::{MigrationEvent, MigrationOutcome, MigrationPolicy};
pub use peers::{Peer, PeerDirectory};
pub use persistence::{
    JsonFileStore, JsonLinesMigrationLog, MemoryMigrationLog, MemorySnapshotStore, MigrationLog, SnapshotStore,
};
pub use runtime::{Node, NodeHandle};
pub use simulation::{Simulation, SimulationStats, TickReport, WorldSnapshot};
pub use world::{WorldConfig, WorldState};
