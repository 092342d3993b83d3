//! Error types for the Thronglet core.
//!
//! Each concern gets its own enum. Capacity rejection during migration is
//! deliberately absent: it is a normal outcome carried in the ack, not an
//! error.

use crate::creature::CreatureId;
use crate::protocol::MessageKind;
use thiserror::Error;
use thronglet_env::EnvError;

/// Registry and behavior-engine failures.
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("Population limit reached ({max})")]
    PopulationLimit { max: u32 },

    #[error("Creature not found: {0}")]
    CreatureNotFound(String),

    #[error("Invalid creature {id}: {reason}")]
    InvalidCreature { id: CreatureId, reason: String },
}

/// Wire-level decoding failures. Always dropped and logged by receivers.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Message of {size} bytes exceeds limit of {max} bytes")]
    TooLarge { size: usize, max: usize },

    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unexpected {kind} payload: {reason}")]
    Payload { kind: MessageKind, reason: String },
}

/// Failures of one migration attempt. The creature always stays local.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Transport failure: {0}")]
    Transport(#[from] EnvError),

    #[error("Protocol failure: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Unexpected reply kind: {0}")]
    UnexpectedReply(MessageKind),
}

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Invalid network range '{0}'")]
    BadRange(String),

    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid { field, reason: reason.into() }
    }
}

/// Snapshot and migration-log storage failures.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage encoding error: {0}")]
    Json(#[from] serde_json::Error),
}
