//! Wire protocol: one JSON envelope per datagram or reliable frame.
//!
//! ```text
//! {
//!   "kind": "creature_migration",
//!   "sender_id": "…", "recipient_id": "…" | null,
//!   "timestamp": 1700000000.25,
//!   "payload": { … },
//!   "message_id": "…"
//! }
//! ```

use crate::creature::{Creature, CreatureId};
use crate::error::ProtocolError;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thronglet_env::NodeId;
use uuid::Uuid;

/// Message type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Discovery,
    DiscoveryResponse,
    Heartbeat,
    CreatureMigration,
    CreatureMigrationAck,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Discovery => "discovery",
            MessageKind::DiscoveryResponse => "discovery_response",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::CreatureMigration => "creature_migration",
            MessageKind::CreatureMigrationAck => "creature_migration_ack",
        };
        f.write_str(name)
    }
}

/// Protocol envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    pub sender_id: NodeId,
    #[serde(default)]
    pub recipient_id: Option<NodeId>,
    /// Unix seconds at the sender
    pub timestamp: f64,
    #[serde(default)]
    pub payload: Value,
    pub message_id: Uuid,
}

impl Message {
    /// Serializes the envelope, enforcing `max_size`.
    pub fn encode(&self, max_size: usize) -> Result<Vec<u8>, ProtocolError> {
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > max_size {
            return Err(ProtocolError::TooLarge { size: bytes.len(), max: max_size });
        }
        Ok(bytes)
    }

    /// Parses an envelope, enforcing `max_size` before touching the bytes.
    pub fn decode(bytes: &[u8], max_size: usize) -> Result<Self, ProtocolError> {
        if bytes.len() > max_size {
            return Err(ProtocolError::TooLarge { size: bytes.len(), max: max_size });
        }
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Interprets the payload as `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| ProtocolError::Payload {
            kind: self.kind,
            reason: e.to_string(),
        })
    }
}

// =============================================================================
// PAYLOADS
// =============================================================================

/// `discovery` and `discovery_response` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    pub comm_port: u16,
    pub population: u32,
    pub food: u32,
    pub protocol_version: String,
    #[serde(default)]
    pub max_population: Option<u32>,
    #[serde(default)]
    pub max_food: Option<u32>,
}

/// `heartbeat` request payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub request_detailed_status: bool,
}

/// `heartbeat` reply payload when detailed status was requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub population: u32,
    pub food: u32,
    pub max_population: u32,
    pub max_food: u32,
    pub temperature: i32,
    #[serde(default)]
    pub state_counts: BTreeMap<String, usize>,
}

/// `creature_migration` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRequest {
    pub creature_data: Creature,
    pub migration_reason: String,
}

/// `creature_migration_ack` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationAck {
    pub accepted: bool,
    pub reason: String,
    pub creature_id: CreatureId,
    /// Destination population after the decision
    #[serde(default)]
    pub population: Option<u32>,
    #[serde(default)]
    pub food: Option<u32>,
}

/// Major component of a version string (text before the first `.`).
pub fn major_version(version: &str) -> &str {
    version.split('.').next().unwrap_or(version)
}

pub fn versions_compatible(a: &str, b: &str) -> bool {
    major_version(a) == major_version(b)
}

/// Stamps outgoing envelopes with the sender id and reproducible ids.
#[derive(Debug)]
pub struct MessageFactory {
    node_id: NodeId,
    rng: ChaCha8Rng,
}

impl MessageFactory {
    pub fn new(node_id: NodeId, rng: ChaCha8Rng) -> Self {
        Self { node_id, rng }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Builds an envelope around `payload`.
    pub fn build<P: Serialize>(
        &mut self,
        kind: MessageKind,
        recipient_id: Option<NodeId>,
        payload: &P,
        now: f64,
    ) -> Result<Message, ProtocolError> {
        Ok(Message {
            kind,
            sender_id: self.node_id,
            recipient_id,
            timestamp: now,
            payload: serde_json::to_value(payload)?,
            message_id: uuid::Builder::from_random_bytes(self.rng.gen()).into_uuid(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn factory(seed: u64) -> MessageFactory {
        MessageFactory::new(NodeId::from_seed(1), ChaCha8Rng::seed_from_u64(seed))
    }

    #[test]
    fn test_kind_wire_names() {
        let json = serde_json::to_string(&MessageKind::CreatureMigrationAck).unwrap();
        assert_eq!(json, "\"creature_migration_ack\"");
        assert_eq!(MessageKind::DiscoveryResponse.to_string(), "discovery_response");
    }

    #[test]
    fn test_envelope_shape() {
        let hb = HeartbeatRequest { request_detailed_status: true };
        let msg = factory(1).build(MessageKind::Heartbeat, None, &hb, 12.5).unwrap();
        let value: Value = serde_json::from_slice(&msg.encode(64_000).unwrap()).unwrap();

        for field in ["kind", "sender_id", "recipient_id", "timestamp", "payload", "message_id"] {
            assert!(value.get(field).is_some(), "missing {}", field);
        }
        assert_eq!(value["kind"], "heartbeat");
        assert_eq!(value["payload"]["request_detailed_status"], true);
    }

    #[test]
    fn test_decode_and_payload() {
        let ann = Announcement {
            comm_port: 7891,
            population: 4,
            food: 90,
            protocol_version: "1.0".into(),
            max_population: Some(50),
            max_food: None,
        };
        let msg = factory(2).build(MessageKind::Discovery, None, &ann, 1.0).unwrap();
        let decoded = Message::decode(&msg.encode(64_000).unwrap(), 64_000).unwrap();
        assert_eq!(decoded.payload_as::<Announcement>().unwrap(), ann);
    }

    #[test]
    fn test_malformed_input() {
        assert!(matches!(
            Message::decode(b"{not json", 64_000),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_size_limits() {
        assert!(matches!(
            Message::decode(&[b' '; 100], 10),
            Err(ProtocolError::TooLarge { size: 100, max: 10 })
        ));
        let msg = factory(3).build(MessageKind::Heartbeat, None, &HeartbeatRequest { request_detailed_status: false }, 0.0).unwrap();
        assert!(matches!(msg.encode(8), Err(ProtocolError::TooLarge { .. })));
    }

    #[test]
    fn test_payload_mismatch() {
        let msg = factory(4)
            .build(MessageKind::Discovery, None, &HeartbeatRequest { request_detailed_status: true }, 0.0)
            .unwrap();
        assert!(matches!(
            msg.payload_as::<Announcement>(),
            Err(ProtocolError::Payload { kind: MessageKind::Discovery, .. })
        ));
    }

    #[test]
    fn test_message_ids_reproducible() {
        let hb = HeartbeatRequest { request_detailed_status: true };
        let a = factory(9).build(MessageKind::Heartbeat, None, &hb, 0.0).unwrap();
        let b = factory(9).build(MessageKind::Heartbeat, None, &hb, 0.0).unwrap();
        let mut f = factory(9);
        f.build(MessageKind::Heartbeat, None, &hb, 0.0).unwrap();
        let c = f.build(MessageKind::Heartbeat, None, &hb, 0.0).unwrap();
        assert_eq!(a.message_id, b.message_id);
        assert_ne!(a.message_id, c.message_id);
    }

    #[test]
    fn test_versions() {
        assert!(versions_compatible("1.0", "1.7"));
        assert!(!versions_compatible("1.0", "2.0"));
        assert_eq!(major_version("3"), "3");
    }
}
