//! Thronglet Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction allowing Thronglet nodes
//! to run in both **Production** (tokio sockets) and **Simulation**
//! (in-memory fabric, virtual clock) environments.
//!
//! # Core Concept: The Reactor Pattern
//!
//! Everything that would make a node non-reproducible is intercepted:
//! - Time (`now()`, `system_time()`, `sleep()`)
//! - Network (`broadcast()`, `send_to()`, `request()`, `serve()`)
//! - Randomness (`derive_rng()`)
//!
//! By deriving all entropy from a single 64-bit seed, a simulated run of a
//! whole cluster becomes reproducible from its seed number.
//!
//! # Example
//!
//! ```ignore
//! use thronglet_env::{ThrongletContext, NetworkTransport};
//!
//! async fn tick_loop<Ctx: ThrongletContext>(ctx: &Ctx) {
//!     loop {
//!         ctx.sleep(Duration::from_secs(5)).await;
//!         tick(ctx.unix_time());
//!     }
//! }
//! ```

mod context;
mod network;
mod types;
mod error;
mod tokio_impl;
mod tokio_net;

pub use context::{ThrongletContext, unix_secs};
pub use network::{NetworkTransport, NetworkController, RequestHandler};
pub use types::{NodeId, Datagram};
pub use error::EnvError;
pub use tokio_impl::TokioContext;
pub use tokio_net::{TokioTransport, TransportConfig};
