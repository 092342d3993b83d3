//! Simulated network fabric with fault injection.
//!
//! Every simulated node gets a `SimNetwork` attached to one shared
//! `SimFabric`. The fabric owns:
//! - A datagram inbox per host (discovery traffic)
//! - The request handler each host serves (reliable exchanges)
//! - Fault state: partitions, per-link loss, disconnected hosts
//!
//! Requests are dispatched synchronously to the target's handler, so a
//! migration handshake completes inside a single `await` on the caller
//! with no sockets and no wall-clock waiting.

use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thronglet_env::{Datagram, EnvError, NetworkController, NetworkTransport, RequestHandler, TransportConfig};
use tokio::sync::Notify;
use tracing::trace;

/// Address of the `index`-th simulated host (10.0.0.1, 10.0.0.2, ...).
pub fn host_ip(index: usize) -> IpAddr {
    let n = index as u32 + 1;
    IpAddr::V4(Ipv4Addr::new(10, (n >> 16) as u8, (n >> 8) as u8, n as u8))
}

/// Traffic counters kept by the fabric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FabricStats {
    pub datagrams_delivered: u64,
    pub datagrams_dropped: u64,
    pub requests_served: u64,
    pub requests_failed: u64,
}

struct Host {
    comm_port: u16,
    discovery_port: u16,
    inbox: VecDeque<Datagram>,
    handler: Option<Arc<dyn RequestHandler>>,
    closed: bool,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct FabricState {
    hosts: BTreeMap<IpAddr, Host>,
    partitions: Vec<(Vec<IpAddr>, Vec<IpAddr>)>,
    link_loss: HashMap<(IpAddr, IpAddr), f64>,
    disconnected: HashSet<IpAddr>,
    stats: FabricStats,
}

impl FabricState {
    fn partitioned(&self, from: IpAddr, to: IpAddr) -> bool {
        self.partitions.iter().any(|(group_a, group_b)| {
            (group_a.contains(&from) && group_b.contains(&to))
                || (group_b.contains(&from) && group_a.contains(&to))
        })
    }

    fn can_communicate(&self, from: IpAddr, to: IpAddr) -> bool {
        !self.disconnected.contains(&from) && !self.disconnected.contains(&to) && !self.partitioned(from, to)
    }

    fn loss(&self, from: IpAddr, to: IpAddr) -> f64 {
        self.link_loss.get(&(from, to)).copied().unwrap_or(0.0)
    }
}

/// Shared in-memory network that all simulated hosts attach to.
pub struct SimFabric {
    state: Mutex<FabricState>,
    /// Loss rolls; seeded so lossy runs replay exactly
    rng: Mutex<ChaCha8Rng>,
}

impl SimFabric {
    /// Creates an empty fabric whose loss decisions derive from `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            state: Mutex::new(FabricState::default()),
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
        }
    }

    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    fn state(&self) -> MutexGuard<'_, FabricState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attaches a host at `ip` using the ports and size limit from `config`.
    ///
    /// Re-attaching an address replaces the previous host and its inbox.
    pub fn attach(self: &Arc<Self>, ip: IpAddr, config: &TransportConfig) -> SimNetwork {
        let notify = Arc::new(Notify::new());
        let host = Host {
            comm_port: config.comm_port,
            discovery_port: config.discovery_port,
            inbox: VecDeque::new(),
            handler: None,
            closed: false,
            notify: Arc::clone(&notify),
        };
        self.state().hosts.insert(ip, host);

        SimNetwork {
            fabric: Arc::clone(self),
            addr: SocketAddr::new(ip, config.comm_port),
            discovery_port: config.discovery_port,
            max_message_size: config.max_message_size,
            notify,
        }
    }

    /// Lifts a `disconnect` for `host`.
    pub fn reconnect(&self, host: IpAddr) {
        self.state().disconnected.remove(&host);
    }

    /// True when no partition or disconnect separates the two hosts.
    pub fn can_communicate(&self, from: IpAddr, to: IpAddr) -> bool {
        self.state().can_communicate(from, to)
    }

    pub fn stats(&self) -> FabricStats {
        self.state().stats
    }

    /// Rolls the loss die for one transmission.
    fn lost(&self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        rng.gen::<f64>() < rate
    }

    /// Queues a datagram at `to`, applying faults. Returns true if delivered.
    fn deliver(&self, from: SocketAddr, to: IpAddr, payload: Vec<u8>) -> bool {
        let mut state = self.state();
        let open = state.hosts.get(&to).map_or(false, |host| !host.closed);
        if !open || !state.can_communicate(from.ip(), to) {
            state.stats.datagrams_dropped += 1;
            return false;
        }
        let rate = state.loss(from.ip(), to);
        if self.lost(rate) {
            state.stats.datagrams_dropped += 1;
            trace!("Datagram {} -> {} lost", from, to);
            return false;
        }

        state.stats.datagrams_delivered += 1;
        if let Some(host) = state.hosts.get_mut(&to) {
            host.inbox.push_back(Datagram::new(from, payload));
            host.notify.notify_one();
        }
        true
    }

    /// Finds the handler serving `target`, applying faults.
    fn route_request(&self, from: IpAddr, target: SocketAddr, timeout: Duration) -> Result<Arc<dyn RequestHandler>, EnvError> {
        let mut state = self.state();
        if !state.can_communicate(from, target.ip()) {
            state.stats.requests_failed += 1;
            return Err(EnvError::unreachable(target));
        }

        let handler = state
            .hosts
            .get(&target.ip())
            .filter(|host| !host.closed && host.comm_port == target.port())
            .and_then(|host| host.handler.clone());
        let Some(handler) = handler else {
            state.stats.requests_failed += 1;
            return Err(EnvError::unreachable(target));
        };

        // A lost request or reply looks like silence to the caller
        let rate = state.loss(from, target.ip()).max(state.loss(target.ip(), from));
        if self.lost(rate) {
            state.stats.requests_failed += 1;
            return Err(EnvError::timeout(timeout));
        }
        Ok(handler)
    }
}

impl NetworkController for SimFabric {
    fn partition(&self, group_a: &[IpAddr], group_b: &[IpAddr]) {
        self.state().partitions.push((group_a.to_vec(), group_b.to_vec()));
    }

    fn heal_all(&self) {
        let mut state = self.state();
        state.partitions.clear();
        state.disconnected.clear();
    }

    fn set_link_loss(&self, from: IpAddr, to: IpAddr, loss_rate: f64) {
        self.state().link_loss.insert((from, to), loss_rate.clamp(0.0, 1.0));
    }

    fn disconnect(&self, host: IpAddr) {
        self.state().disconnected.insert(host);
    }
}

/// One host's view of the fabric.
pub struct SimNetwork {
    fabric: Arc<SimFabric>,
    addr: SocketAddr,
    discovery_port: u16,
    max_message_size: usize,
    notify: Arc<Notify>,
}

impl SimNetwork {
    pub fn fabric(&self) -> &Arc<SimFabric> {
        &self.fabric
    }

    /// Address datagrams from this host carry.
    pub fn discovery_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr.ip(), self.discovery_port)
    }

    fn check_size(&self, size: usize) -> Result<(), EnvError> {
        if size > self.max_message_size {
            return Err(EnvError::MessageTooLarge {
                size,
                max: self.max_message_size,
            });
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.fabric
            .state()
            .hosts
            .get(&self.addr.ip())
            .map_or(true, |host| host.closed)
    }
}

#[async_trait]
impl NetworkTransport for SimNetwork {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn broadcast(&self, payload: Vec<u8>) -> Result<usize, EnvError> {
        self.check_size(payload.len())?;
        if self.is_closed() {
            return Err(EnvError::Closed);
        }

        let me = self.addr.ip();
        let targets: Vec<IpAddr> = {
            let state = self.fabric.state();
            let targets = state
                .hosts
                .iter()
                .filter(|(ip, host)| **ip != me && host.discovery_port == self.discovery_port)
                .map(|(ip, _)| *ip)
                .collect();
            targets
        };

        let from = self.discovery_addr();
        let delivered = targets
            .into_iter()
            .filter(|ip| self.fabric.deliver(from, *ip, payload.clone()))
            .count();
        Ok(delivered)
    }

    async fn send_to(&self, target: SocketAddr, payload: Vec<u8>) -> Result<(), EnvError> {
        self.check_size(payload.len())?;
        if self.is_closed() {
            return Err(EnvError::Closed);
        }
        // Datagram semantics: a drop is not an error for the sender
        self.fabric.deliver(self.discovery_addr(), target.ip(), payload);
        Ok(())
    }

    async fn recv_datagram(&self) -> Option<Datagram> {
        loop {
            if let Some(datagram) = self.try_recv_datagram() {
                return Some(datagram);
            }
            if self.is_closed() {
                return None;
            }
            self.notify.notified().await;
        }
    }

    fn try_recv_datagram(&self) -> Option<Datagram> {
        let mut state = self.fabric.state();
        state.hosts.get_mut(&self.addr.ip()).and_then(|host| host.inbox.pop_front())
    }

    async fn request(&self, target: SocketAddr, payload: Vec<u8>, timeout: Duration) -> Result<Vec<u8>, EnvError> {
        self.check_size(payload.len())?;
        if self.is_closed() {
            return Err(EnvError::Closed);
        }

        let handler = self.fabric.route_request(self.addr.ip(), target, timeout)?;
        let reply = handler.handle(self.addr, payload).await;

        let mut state = self.fabric.state();
        match reply {
            Some(reply) if reply.len() <= self.max_message_size => {
                state.stats.requests_served += 1;
                Ok(reply)
            }
            Some(reply) => {
                state.stats.requests_failed += 1;
                Err(EnvError::MessageTooLarge {
                    size: reply.len(),
                    max: self.max_message_size,
                })
            }
            None => {
                state.stats.requests_failed += 1;
                Err(EnvError::network(format!("{} closed without a reply", target)))
            }
        }
    }

    fn serve(&self, handler: Arc<dyn RequestHandler>) -> Result<(), EnvError> {
        let mut state = self.fabric.state();
        let host = state.hosts.get_mut(&self.addr.ip()).ok_or(EnvError::Closed)?;
        if host.closed {
            return Err(EnvError::Closed);
        }
        if host.handler.is_some() {
            return Err(EnvError::network(format!("{} is already serving", self.addr)));
        }
        host.handler = Some(handler);
        Ok(())
    }

    fn close(&self) {
        let mut state = self.fabric.state();
        if let Some(host) = state.hosts.get_mut(&self.addr.ip()) {
            host.closed = true;
            host.handler = None;
            host.inbox.clear();
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, _from: SocketAddr, payload: Vec<u8>) -> Option<Vec<u8>> {
            Some(payload)
        }
    }

    fn config() -> TransportConfig {
        TransportConfig::default()
    }

    fn pair() -> (Arc<SimFabric>, SimNetwork, SimNetwork) {
        let fabric = SimFabric::shared(7);
        let a = fabric.attach(host_ip(0), &config());
        let b = fabric.attach(host_ip(1), &config());
        (fabric, a, b)
    }

    #[test]
    fn test_host_ips_are_distinct() {
        assert_eq!(host_ip(0), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(host_ip(255), IpAddr::V4(Ipv4Addr::new(10, 0, 1, 0)));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_others_not_self() {
        let (fabric, a, b) = pair();
        let c = fabric.attach(host_ip(2), &config());

        let delivered = a.broadcast(b"hello".to_vec()).await.unwrap();
        assert_eq!(delivered, 2);
        assert!(a.try_recv_datagram().is_none());

        let datagram = b.try_recv_datagram().unwrap();
        assert_eq!(datagram.payload, b"hello");
        assert_eq!(datagram.from, a.discovery_addr());
        assert!(c.try_recv_datagram().is_some());
    }

    #[tokio::test]
    async fn test_request_dispatches_to_handler() {
        let (_fabric, a, b) = pair();
        b.serve(Arc::new(Echo)).unwrap();

        let reply = a
            .request(b.local_addr(), b"ping".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, b"ping");
    }

    #[tokio::test]
    async fn test_request_to_host_without_handler_is_unreachable() {
        let (_fabric, a, b) = pair();
        let err = a
            .request(b.local_addr(), b"ping".to_vec(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_unreachable());
    }

    #[tokio::test]
    async fn test_partition_blocks_both_directions() {
        let (fabric, a, b) = pair();
        b.serve(Arc::new(Echo)).unwrap();
        fabric.partition(&[host_ip(0)], &[host_ip(1)]);

        assert!(!fabric.can_communicate(host_ip(1), host_ip(0)));
        assert_eq!(a.broadcast(b"x".to_vec()).await.unwrap(), 0);
        let err = a
            .request(b.local_addr(), b"x".to_vec(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_unreachable());

        fabric.heal_all();
        assert_eq!(a.broadcast(b"x".to_vec()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_and_reconnect() {
        let (fabric, a, b) = pair();
        fabric.disconnect(host_ip(1));
        a.send_to(b.discovery_addr(), b"lost".to_vec()).await.unwrap();
        assert!(b.try_recv_datagram().is_none());

        fabric.reconnect(host_ip(1));
        a.send_to(b.discovery_addr(), b"found".to_vec()).await.unwrap();
        assert_eq!(b.try_recv_datagram().unwrap().payload, b"found");
    }

    #[tokio::test]
    async fn test_total_loss_drops_everything() {
        let (fabric, a, b) = pair();
        b.serve(Arc::new(Echo)).unwrap();
        fabric.set_link_loss(host_ip(0), host_ip(1), 1.0);

        assert_eq!(a.broadcast(b"x".to_vec()).await.unwrap(), 0);
        let err = a
            .request(b.local_addr(), b"x".to_vec(), Duration::from_secs(3))
            .await
            .unwrap_err();
        assert!(matches!(err, EnvError::Timeout(3000)));
        assert_eq!(fabric.stats().datagrams_dropped, 1);
        assert_eq!(fabric.stats().requests_failed, 1);
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected() {
        let (_fabric, a, _b) = pair();
        let big = vec![0u8; config().max_message_size + 1];
        let err = a.broadcast(big).await.unwrap_err();
        assert!(matches!(err, EnvError::MessageTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_close_stops_serving_and_wakes_receiver() {
        let (_fabric, a, b) = pair();
        b.serve(Arc::new(Echo)).unwrap();
        b.close();

        assert!(b.recv_datagram().await.is_none());
        assert!(b.serve(Arc::new(Echo)).is_err());
        let err = a
            .request(b.local_addr(), b"x".to_vec(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_unreachable());
    }

    #[tokio::test]
    async fn test_serve_twice_is_rejected() {
        let (_fabric, a, _b) = pair();
        a.serve(Arc::new(Echo)).unwrap();
        assert!(a.serve(Arc::new(Echo)).is_err());
    }
}
