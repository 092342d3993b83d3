//! Thronglet Deterministic Simulation Harness
//!
//! This crate runs a whole Thronglet network inside one process, on a
//! virtual clock, reproducibly from a single seed.
//!
//! # Core Principle: The Reactor Pattern
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: Virtual clock advances only when the cluster steps
//! - **Network**: In-memory fabric with partitions, loss and disconnects
//! - **Randomness**: All entropy derived from a single 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        SimCluster                           │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ SimContext (virtual clock, per-node seed forks)      │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │       │                        │                            │
//! │  ┌────▼────┐              ┌────▼────┐                       │
//! │  │  Node   │◄────────────►│  Node   │     ...               │
//! │  │ 10.0.0.1│  SimFabric   │ 10.0.0.2│                       │
//! │  └─────────┘              └─────────┘                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use thronglet_sim::{ClusterConfig, SimCluster};
//!
//! let mut cluster = SimCluster::new(ClusterConfig { seed: 42, ..Default::default() })?;
//! cluster.run(100).await;
//! cluster.check_invariants()?;
//! ```

mod context;
mod network;
mod runner;
pub mod scenarios;
mod world;

pub use context::{SimContext, SIM_EPOCH_SECS};
pub use network::{host_ip, FabricStats, SimFabric, SimNetwork};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use world::{ClusterConfig, ClusterError, SimCluster, SimNode, StepReport};
