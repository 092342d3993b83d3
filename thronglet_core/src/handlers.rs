//! Inbound reliable-channel handling: heartbeats and migration requests.

use crate::protocol::{HeartbeatRequest, Message, MessageKind, MigrationAck, MigrationRequest};
use crate::error::ProtocolError;
use crate::runtime::Node;
use crate::simulation::Admission;
use async_trait::async_trait;
use std::net::SocketAddr;
use thronglet_env::{NetworkTransport, RequestHandler, ThrongletContext};
use tracing::{debug, info, warn};

impl<Ctx, Net> Node<Ctx, Net>
where
    Ctx: ThrongletContext,
    Net: NetworkTransport,
{
    /// Answers one inbound request.
    ///
    /// Untrusted senders, malformed input and unexpected kinds get no reply.
    pub fn handle_request(&self, from: SocketAddr, payload: &[u8]) -> Option<Vec<u8>> {
        if !self.is_trusted(from) {
            self.counters().record_untrusted();
            return None;
        }

        let max = self.config().max_message_size;
        let message = match Message::decode(payload, max) {
            Ok(message) => message,
            Err(e) => {
                self.counters().record_malformed();
                debug!("Dropping request from {}: {}", from, e);
                return None;
            }
        };
        self.counters().record_received();

        let reply = match message.kind {
            MessageKind::Heartbeat => self.on_heartbeat(&message),
            MessageKind::CreatureMigration => self.on_migration(&message),
            other => {
                debug!("Ignoring {} from {} on the reliable channel", other, from);
                return None;
            }
        };

        let encoded = reply.and_then(|reply| reply.encode(max));
        match encoded {
            Ok(bytes) => {
                self.counters().record_sent();
                Some(bytes)
            }
            Err(e @ ProtocolError::TooLarge { .. }) => {
                warn!("Reply to {} not sent: {}", from, e);
                None
            }
            Err(e) => {
                self.counters().record_malformed();
                debug!("Rejecting request from {}: {}", from, e);
                None
            }
        }
    }

    fn on_heartbeat(&self, message: &Message) -> Result<Message, ProtocolError> {
        let request: HeartbeatRequest = message.payload_as()?;
        let now = self.now();
        self.with_peers(|peers| peers.touch(&message.sender_id, now));

        if !request.request_detailed_status {
            return self.build(MessageKind::Heartbeat, Some(message.sender_id), &serde_json::json!({}));
        }
        let status = self.status_report();
        self.build(MessageKind::Heartbeat, Some(message.sender_id), &status)
    }

    fn on_migration(&self, message: &Message) -> Result<Message, ProtocolError> {
        let request: MigrationRequest = message.payload_as()?;
        let creature_id = request.creature_data.id;
        let name = request.creature_data.name.clone();
        let now = self.now();

        let (admission, population, food) = self.with_simulation(|sim| {
            let admission = sim.admit_migrant(request.creature_data, message.sender_id, message.message_id, now);
            (admission, sim.world().population_count, sim.world().food)
        });

        match &admission {
            Admission::Welcome => self.counters().record_migration_in(),
            Admission::AlreadyAccepted => debug!("Re-delivered migration of {} acknowledged", name),
            Admission::Invalid(reason) => warn!("Refused invalid migrant {}: {}", name, reason),
            other => info!("Refused {} from {}: {}", name, message.sender_id, other.reason()),
        }

        let ack = MigrationAck {
            accepted: admission.accepted(),
            reason: admission.reason().to_string(),
            creature_id,
            population: Some(population),
            food: Some(food),
        };
        self.build(MessageKind::CreatureMigrationAck, Some(message.sender_id), &ack)
    }
}

#[async_trait]
impl<Ctx, Net> RequestHandler for Node<Ctx, Net>
where
    Ctx: ThrongletContext,
    Net: NetworkTransport,
{
    async fn handle(&self, from: SocketAddr, payload: Vec<u8>) -> Option<Vec<u8>> {
        self.handle_request(from, &payload)
    }
}

#[cfg(test)]
mod tests {
    use crate::creature::Creature;
    use crate::protocol::{MessageFactory, StatusReport};
    use crate::testing::null_node;
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use thronglet_env::NodeId;
    use uuid::Uuid;

    fn peer_addr() -> SocketAddr {
        "10.0.0.2:40000".parse().unwrap()
    }

    fn factory() -> MessageFactory {
        MessageFactory::new(NodeId::from_seed(2), ChaCha8Rng::seed_from_u64(2))
    }

    fn migration_bytes(factory: &mut MessageFactory, creature: &Creature) -> Vec<u8> {
        let request = MigrationRequest {
            creature_data: creature.clone(),
            migration_reason: "exploration".into(),
        };
        factory
            .build(MessageKind::CreatureMigration, None, &request, 0.0)
            .unwrap()
            .encode(64_000)
            .unwrap()
    }

    fn traveller() -> Creature {
        let mut c = Creature::new(Uuid::from_u128(77), "Traveller", NodeId::from_seed(2), 0.0);
        c.age = 80;
        c.energy = 60;
        c
    }

    fn decode_ack(bytes: Vec<u8>) -> MigrationAck {
        let reply = Message::decode(&bytes, 64_000).unwrap();
        assert_eq!(reply.kind, MessageKind::CreatureMigrationAck);
        reply.payload_as().unwrap()
    }

    #[test]
    fn test_heartbeat_reply() {
        let node = null_node(1);
        node.add_agent(None).unwrap();
        let request = factory()
            .build(MessageKind::Heartbeat, None, &HeartbeatRequest { request_detailed_status: true }, 0.0)
            .unwrap()
            .encode(64_000)
            .unwrap();

        let reply = node.handle_request(peer_addr(), &request).unwrap();
        let reply = Message::decode(&reply, 64_000).unwrap();
        let status: StatusReport = reply.payload_as().unwrap();
        assert_eq!(status.population, 1);
        assert_eq!(status.state_counts["idle"], 1);
        assert_eq!(reply.recipient_id, Some(NodeId::from_seed(2)));
    }

    #[test]
    fn test_plain_heartbeat_reply_is_empty() {
        let node = null_node(1);
        node.add_agent(None).unwrap();
        let request = factory()
            .build(MessageKind::Heartbeat, None, &HeartbeatRequest { request_detailed_status: false }, 0.0)
            .unwrap()
            .encode(64_000)
            .unwrap();

        let reply = node.handle_request(peer_addr(), &request).unwrap();
        let reply = Message::decode(&reply, 64_000).unwrap();
        assert_eq!(reply.kind, MessageKind::Heartbeat);
        assert_eq!(reply.payload, serde_json::json!({}));
        assert!(reply.payload_as::<StatusReport>().is_err());
    }

    #[test]
    fn test_migration_accepted_then_redelivered() {
        let node = null_node(1);
        let mut f = factory();
        let bytes = migration_bytes(&mut f, &traveller());

        let ack = decode_ack(node.handle_request(peer_addr(), &bytes).unwrap());
        assert!(ack.accepted);
        assert_eq!(ack.reason, "welcome");
        assert_eq!(ack.population, Some(1));

        let again = decode_ack(node.handle_request(peer_addr(), &bytes).unwrap());
        assert!(again.accepted);
        assert_eq!(again.reason, "already_accepted");
        assert_eq!(node.list_agents().len(), 1);

        let fresh = migration_bytes(&mut f, &traveller());
        let dup = decode_ack(node.handle_request(peer_addr(), &fresh).unwrap());
        assert!(!dup.accepted);
        assert_eq!(dup.reason, "duplicate");
        assert_eq!(node.counters().snapshot().migrations_in, 1);
    }

    #[test]
    fn test_untrusted_request_gets_no_reply() {
        let node = null_node(1);
        let bytes = migration_bytes(&mut factory(), &traveller());
        assert!(node.handle_request("203.0.113.9:5000".parse().unwrap(), &bytes).is_none());
        assert!(node.list_agents().is_empty());
        assert_eq!(node.counters().snapshot().dropped_untrusted, 1);
    }

    #[test]
    fn test_malformed_request_gets_no_reply() {
        let node = null_node(1);
        assert!(node.handle_request(peer_addr(), b"\x00\x01").is_none());

        let wrong_payload = factory()
            .build(MessageKind::CreatureMigration, None, &HeartbeatRequest { request_detailed_status: true }, 0.0)
            .unwrap()
            .encode(64_000)
            .unwrap();
        assert!(node.handle_request(peer_addr(), &wrong_payload).is_none());
        assert_eq!(node.counters().snapshot().dropped_malformed, 2);
    }

    #[test]
    fn test_out_of_range_vitals_rejected() {
        let node = null_node(1);
        let mut bad = traveller();
        bad.hunger = 200;
        let bytes = migration_bytes(&mut factory(), &bad);
        let ack = decode_ack(node.handle_request(peer_addr(), &bytes).unwrap());
        assert!(!ack.accepted);
        assert_eq!(ack.reason, "invalid");
    }
}
