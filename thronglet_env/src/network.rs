//! Network transport abstraction for Thronglet nodes.

use async_trait::async_trait;
use crate::error::EnvError;
use crate::types::Datagram;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

/// Server side of the reliable channel.
///
/// The transport invokes `handle` once per inbound request, on its own
/// short-lived task. Returning `None` closes the exchange without a reply
/// (malformed or untrusted input).
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, from: SocketAddr, payload: Vec<u8>) -> Option<Vec<u8>>;
}

/// Abstraction for network I/O between Thronglet nodes.
///
/// Two channels are exposed:
/// - a connectionless **discovery** channel (broadcast + unicast datagrams)
/// - a reliable **request/response** channel with a bounded round trip
///
/// # Implementations
///
/// - **Production**: `TokioTransport` (UDP broadcast + length-prefixed TCP)
/// - **Simulation**: `SimNetwork` (in-memory fabric with partitions and loss)
///
/// # Packet Flow
///
/// ```text
/// Node A                      Fabric                      Node B
///   |                           |                           |
///   |-- broadcast(announce) --->|-------------------------->| recv_datagram()
///   |<--------------------------|<-- send_to(A, response) --|
///   |                           |                           |
///   |-- request(B, migrate) --->|-------------------------->| handler.handle()
///   |<------------------------- ack ------------------------|
/// ```
#[async_trait]
pub trait NetworkTransport: Send + Sync + 'static {
    /// Address of this node's reliable endpoint.
    fn local_addr(&self) -> SocketAddr;

    /// Broadcasts a datagram on the discovery channel.
    ///
    /// Returns the number of receivers the datagram was handed to (the
    /// production transport reports 1 for a successful broadcast send).
    async fn broadcast(&self, payload: Vec<u8>) -> Result<usize, EnvError>;

    /// Sends a unicast datagram on the discovery channel.
    ///
    /// Success does not guarantee delivery.
    async fn send_to(&self, target: SocketAddr, payload: Vec<u8>) -> Result<(), EnvError>;

    /// Waits for the next discovery datagram.
    ///
    /// Returns `None` once the transport is closed.
    async fn recv_datagram(&self) -> Option<Datagram>;

    /// Returns an already-queued datagram without waiting.
    fn try_recv_datagram(&self) -> Option<Datagram>;

    /// Performs one request/response round trip on the reliable channel.
    ///
    /// The whole exchange (connect, send, receive) is bounded by `timeout`.
    async fn request(
        &self,
        target: SocketAddr,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, EnvError>;

    /// Starts serving inbound reliable requests with `handler`.
    fn serve(&self, handler: Arc<dyn RequestHandler>) -> Result<(), EnvError>;

    /// Closes listening sockets. Pending accepts are released.
    fn close(&self);
}

/// Fault-injection controls for simulated networks.
///
/// Links are addressed by host IP since every simulated node owns one.
pub trait NetworkController: Send + Sync {
    /// Creates a network partition between two host sets.
    fn partition(&self, group_a: &[IpAddr], group_b: &[IpAddr]);

    /// Heals all partitions.
    fn heal_all(&self);

    /// Sets packet loss probability for a link (0.0 - 1.0).
    fn set_link_loss(&self, from: IpAddr, to: IpAddr, loss_rate: f64);

    /// Takes a host off the fabric entirely (crash).
    fn disconnect(&self, host: IpAddr);
}
