//! Discovery: decides what an inbound announcement means for the directory.
//!
//! The I/O (broadcast, listen, unicast reply) lives in the runtime; this
//! module only applies the rules:
//!
//! 1. Senders outside the allow-list are dropped before decoding.
//! 2. Our own announcements (echoed by broadcast) are ignored.
//! 3. A different protocol major version is ignored.
//! 4. Unknown senders are registered; a `discovery` from one is answered
//!    with a unicast `discovery_response`.

use crate::allowlist::AllowList;
use crate::error::ProtocolError;
use crate::peers::{Peer, PeerDirectory};
use crate::protocol::{versions_compatible, Announcement, Message, MessageKind};
use crate::world::WorldState;
use std::net::{IpAddr, SocketAddr};
use thronglet_env::NodeId;
use tracing::debug;

/// Why an inbound discovery message was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    OwnMessage,
    IncompatibleVersion,
    NotDiscovery,
}

/// Effect of one inbound discovery message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryAction {
    Ignored(IgnoreReason),
    /// New peer; `reply` asks the caller to send a `discovery_response`
    Registered { peer: NodeId, reply: bool },
    Refreshed(NodeId),
}

/// Discovery rules for one node.
#[derive(Debug, Clone)]
pub struct DiscoveryService {
    node_id: NodeId,
    allow: AllowList,
    protocol_version: String,
}

impl DiscoveryService {
    pub fn new(node_id: NodeId, allow: AllowList, protocol_version: impl Into<String>) -> Self {
        Self {
            node_id,
            allow,
            protocol_version: protocol_version.into(),
        }
    }

    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    pub fn is_trusted(&self, ip: IpAddr) -> bool {
        self.allow.allows(ip)
    }

    /// Our advertisement for the current world state.
    pub fn announcement(&self, world: &WorldState, comm_port: u16) -> Announcement {
        Announcement {
            comm_port,
            population: world.population_count,
            food: world.food,
            protocol_version: self.protocol_version.clone(),
            max_population: Some(world.max_population),
            max_food: Some(world.max_food),
        }
    }

    /// Applies a decoded message from a trusted `from` address.
    pub fn handle(
        &self,
        directory: &mut PeerDirectory,
        from: SocketAddr,
        message: &Message,
        now: f64,
    ) -> Result<DiscoveryAction, ProtocolError> {
        if message.sender_id == self.node_id {
            return Ok(DiscoveryAction::Ignored(IgnoreReason::OwnMessage));
        }
        if !matches!(message.kind, MessageKind::Discovery | MessageKind::DiscoveryResponse) {
            return Ok(DiscoveryAction::Ignored(IgnoreReason::NotDiscovery));
        }

        let announcement: Announcement = message.payload_as()?;
        if !versions_compatible(&announcement.protocol_version, &self.protocol_version) {
            debug!(
                "Ignoring {} speaking protocol {}",
                message.sender_id, announcement.protocol_version
            );
            return Ok(DiscoveryAction::Ignored(IgnoreReason::IncompatibleVersion));
        }

        let peer = Peer::from_announcement(message.sender_id, from, &announcement, now);
        if directory.record_announcement(peer) {
            Ok(DiscoveryAction::Registered {
                peer: message.sender_id,
                reply: message.kind == MessageKind::Discovery,
            })
        } else {
            Ok(DiscoveryAction::Refreshed(message.sender_id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageFactory;
    use crate::world::WorldConfig;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::time::Duration;

    fn service() -> DiscoveryService {
        let allow = AllowList::parse(&["10.0.0.0/8"]).unwrap();
        DiscoveryService::new(NodeId::from_seed(1), allow, "1.0")
    }

    fn announce_from(seed: u64, kind: MessageKind, version: &str) -> Message {
        let world = WorldState::new(&WorldConfig::default(), 0.0);
        let mut ann = service().announcement(&world, 7891);
        ann.protocol_version = version.to_string();
        MessageFactory::new(NodeId::from_seed(seed), ChaCha8Rng::seed_from_u64(seed))
            .build(kind, None, &ann, 0.0)
            .unwrap()
    }

    fn addr() -> SocketAddr {
        "10.0.0.2:7890".parse().unwrap()
    }

    #[test]
    fn test_trust() {
        let svc = service();
        assert!(svc.is_trusted("10.1.1.1".parse().unwrap()));
        assert!(!svc.is_trusted("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_unknown_sender_registered_and_answered() {
        let svc = service();
        let mut dir = PeerDirectory::new(Duration::from_secs(60));
        let msg = announce_from(2, MessageKind::Discovery, "1.0");

        let action = svc.handle(&mut dir, addr(), &msg, 5.0).unwrap();
        assert_eq!(
            action,
            DiscoveryAction::Registered { peer: NodeId::from_seed(2), reply: true }
        );
        let peer = dir.get(&NodeId::from_seed(2)).unwrap();
        assert_eq!(peer.address, "10.0.0.2:7891".parse().unwrap());
        assert_eq!(peer.max_population, Some(50));

        let again = svc.handle(&mut dir, addr(), &msg, 6.0).unwrap();
        assert_eq!(again, DiscoveryAction::Refreshed(NodeId::from_seed(2)));
    }

    #[test]
    fn test_response_is_not_answered() {
        let svc = service();
        let mut dir = PeerDirectory::new(Duration::from_secs(60));
        let msg = announce_from(3, MessageKind::DiscoveryResponse, "1.0");
        let action = svc.handle(&mut dir, addr(), &msg, 0.0).unwrap();
        assert_eq!(action, DiscoveryAction::Registered { peer: NodeId::from_seed(3), reply: false });
    }

    #[test]
    fn test_own_and_incompatible_ignored() {
        let svc = service();
        let mut dir = PeerDirectory::new(Duration::from_secs(60));

        let own = announce_from(1, MessageKind::Discovery, "1.0");
        assert_eq!(
            svc.handle(&mut dir, addr(), &own, 0.0).unwrap(),
            DiscoveryAction::Ignored(IgnoreReason::OwnMessage)
        );

        let future = announce_from(4, MessageKind::Discovery, "2.1");
        assert_eq!(
            svc.handle(&mut dir, addr(), &future, 0.0).unwrap(),
            DiscoveryAction::Ignored(IgnoreReason::IncompatibleVersion)
        );
        assert!(dir.is_empty());
    }

    #[test]
    fn test_non_discovery_kind_ignored() {
        let svc = service();
        let mut dir = PeerDirectory::new(Duration::from_secs(60));
        let msg = announce_from(5, MessageKind::Heartbeat, "1.0");
        assert_eq!(
            svc.handle(&mut dir, addr(), &msg, 0.0).unwrap(),
            DiscoveryAction::Ignored(IgnoreReason::NotDiscovery)
        );
    }
}
