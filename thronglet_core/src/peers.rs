//! Peer directory with liveness tracking.
//!
//! A peer is alive while `now - last_seen < timeout`. Expired peers are
//! invisible to readers immediately and physically removed by the sweep.

use crate::protocol::{Announcement, StatusReport};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;
use thronglet_env::NodeId;
use tracing::info;

/// Known remote node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub node_id: NodeId,

    /// Reliable endpoint (sender IP + advertised comm port)
    pub address: SocketAddr,

    pub population: u32,
    pub food: u32,
    pub max_population: Option<u32>,
    pub max_food: Option<u32>,
    pub temperature: Option<i32>,
    pub protocol_version: String,

    pub first_seen: f64,
    pub last_seen: f64,
}

impl Peer {
    /// Builds a peer from a discovery announcement received from `address`.
    pub fn from_announcement(node_id: NodeId, address: SocketAddr, ann: &Announcement, now: f64) -> Self {
        Self {
            node_id,
            address: SocketAddr::new(address.ip(), ann.comm_port),
            population: ann.population,
            food: ann.food,
            max_population: ann.max_population,
            max_food: ann.max_food,
            temperature: None,
            protocol_version: ann.protocol_version.clone(),
            first_seen: now,
            last_seen: now,
        }
    }

    pub fn is_alive(&self, now: f64, timeout: Duration) -> bool {
        now - self.last_seen < timeout.as_secs_f64()
    }
}

/// Directory of known peers, keyed by node id.
#[derive(Debug, Clone)]
pub struct PeerDirectory {
    peers: BTreeMap<NodeId, Peer>,
    timeout: Duration,
}

impl PeerDirectory {
    pub fn new(timeout: Duration) -> Self {
        Self {
            peers: BTreeMap::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of entries, alive or not.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.peers.contains_key(node_id)
    }

    pub fn get(&self, node_id: &NodeId) -> Option<&Peer> {
        self.peers.get(node_id)
    }

    /// Inserts or refreshes a peer from an announcement.
    ///
    /// # Returns
    /// `true` if the peer was not known before.
    pub fn record_announcement(&mut self, peer: Peer) -> bool {
        match self.peers.get_mut(&peer.node_id) {
            Some(existing) => {
                existing.address = peer.address;
                existing.population = peer.population;
                existing.food = peer.food;
                existing.max_population = peer.max_population.or(existing.max_population);
                existing.max_food = peer.max_food.or(existing.max_food);
                existing.protocol_version = peer.protocol_version;
                existing.last_seen = peer.last_seen;
                false
            }
            None => {
                info!("🔗 Discovered peer {} at {}", peer.node_id, peer.address);
                self.peers.insert(peer.node_id, peer);
                true
            }
        }
    }

    /// Applies a detailed status reply.
    pub fn record_status(&mut self, node_id: &NodeId, status: &StatusReport, now: f64) {
        if let Some(peer) = self.peers.get_mut(node_id) {
            peer.population = status.population;
            peer.food = status.food;
            peer.max_population = Some(status.max_population);
            peer.max_food = Some(status.max_food);
            peer.temperature = Some(status.temperature);
            peer.last_seen = now;
        }
    }

    /// Refreshes resource signals carried by a migration ack.
    pub fn record_resources(&mut self, node_id: &NodeId, population: u32, food: u32, now: f64) {
        if let Some(peer) = self.peers.get_mut(node_id) {
            peer.population = population;
            peer.food = food;
            peer.last_seen = now;
        }
    }

    /// Marks a known peer as heard from.
    pub fn touch(&mut self, node_id: &NodeId, now: f64) {
        if let Some(peer) = self.peers.get_mut(node_id) {
            peer.last_seen = now;
        }
    }

    /// Live peers in directory order.
    pub fn live_peers(&self, now: f64) -> Vec<Peer> {
        self.peers
            .values()
            .filter(|p| p.is_alive(now, self.timeout))
            .cloned()
            .collect()
    }

    pub fn live_count(&self, now: f64) -> usize {
        self.peers.values().filter(|p| p.is_alive(now, self.timeout)).count()
    }

    /// Removes every expired peer and returns their ids.
    pub fn purge_expired(&mut self, now: f64) -> Vec<NodeId> {
        let timeout = self.timeout;
        let expired: Vec<NodeId> = self
            .peers
            .values()
            .filter(|p| !p.is_alive(now, timeout))
            .map(|p| p.node_id)
            .collect();

        for id in &expired {
            self.peers.remove(id);
            info!("Peer {} timed out", id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announcement(population: u32) -> Announcement {
        Announcement {
            comm_port: 7891,
            population,
            food: 80,
            protocol_version: "1.0".to_string(),
            max_population: Some(50),
            max_food: Some(100),
        }
    }

    fn peer(seed: u64, now: f64) -> Peer {
        let addr: SocketAddr = format!("10.0.0.{}:7890", seed).parse().unwrap();
        Peer::from_announcement(NodeId::from_seed(seed), addr, &announcement(3), now)
    }

    #[test]
    fn test_address_uses_advertised_port() {
        let p = peer(2, 0.0);
        assert_eq!(p.address.to_string(), "10.0.0.2:7891");
    }

    #[test]
    fn test_record_announcement() {
        let mut dir = PeerDirectory::new(Duration::from_secs(60));
        assert!(dir.record_announcement(peer(2, 0.0)));

        let mut update = peer(2, 10.0);
        update.population = 9;
        assert!(!dir.record_announcement(update));

        let stored = dir.get(&NodeId::from_seed(2)).unwrap();
        assert_eq!(stored.population, 9);
        assert_eq!(stored.first_seen, 0.0);
        assert_eq!(stored.last_seen, 10.0);
    }

    #[test]
    fn test_liveness_boundary() {
        let mut dir = PeerDirectory::new(Duration::from_secs(60));
        dir.record_announcement(peer(2, 0.0));
        assert_eq!(dir.live_count(59.9), 1);
        assert_eq!(dir.live_count(60.0), 0);
        assert!(dir.live_peers(60.0).is_empty());
    }

    #[test]
    fn test_purge_expired() {
        let mut dir = PeerDirectory::new(Duration::from_secs(60));
        dir.record_announcement(peer(2, 0.0));
        dir.record_announcement(peer(3, 30.0));

        let purged = dir.purge_expired(61.0);
        assert_eq!(purged, vec![NodeId::from_seed(2)]);
        assert_eq!(dir.len(), 1);
        assert!(dir.contains(&NodeId::from_seed(3)));
    }

    #[test]
    fn test_record_status_and_resources() {
        let mut dir = PeerDirectory::new(Duration::from_secs(60));
        let id = NodeId::from_seed(2);
        dir.record_announcement(peer(2, 0.0));

        let status = StatusReport {
            population: 12,
            food: 40,
            max_population: 20,
            max_food: 60,
            temperature: 22,
            state_counts: Default::default(),
        };
        dir.record_status(&id, &status, 5.0);
        let p = dir.get(&id).unwrap();
        assert_eq!(p.max_population, Some(20));
        assert_eq!(p.temperature, Some(22));
        assert_eq!(p.last_seen, 5.0);

        dir.record_resources(&id, 13, 39, 7.0);
        let p = dir.get(&id).unwrap();
        assert_eq!((p.population, p.food, p.last_seen), (13, 39, 7.0));
    }
}
