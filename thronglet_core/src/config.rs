//! Node configuration.
//!
//! Every field has a default so a config file only needs the values it
//! changes. `validate()` is the single gate: a node is never built from an
//! unvalidated config.

use crate::allowlist::AllowList;
use crate::error::ConfigError;
use crate::migration::MigrationPolicy;
use crate::simulation::SimulationSettings;
use crate::world::WorldConfig;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thronglet_env::TransportConfig;

/// Configuration of one Thronglet node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub discovery_port: u16,
    pub comm_port: u16,
    /// Reserved for the local front end
    pub ipc_port: u16,
    pub bind_ip: IpAddr,
    pub broadcast_ip: IpAddr,

    pub tick_interval_secs: u64,
    pub discovery_interval_secs: u64,
    pub discovery_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub peer_timeout_secs: u64,
    pub peer_sweep_interval_secs: u64,

    pub migration_chance: f64,
    pub migration_interval_secs: u64,
    pub max_migration_size: usize,
    pub migration_energy_cost: u8,
    pub migration_hunger_penalty: u8,

    pub message_timeout_secs: u64,
    pub max_message_size: usize,
    pub allowed_networks: Vec<String>,
    pub protocol_version: String,

    /// Master seed; `None` draws from entropy
    pub seed: Option<u64>,

    pub world: WorldConfig,
    pub snapshot_every_ticks: u64,
    pub telemetry_every_ticks: u64,

    /// Directory for snapshots and the migration log; `None` disables persistence
    pub data_dir: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            discovery_port: 7890,
            comm_port: 7891,
            ipc_port: 7892,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            broadcast_ip: IpAddr::V4(Ipv4Addr::BROADCAST),
            tick_interval_secs: 5,
            discovery_interval_secs: 30,
            discovery_timeout_secs: 5,
            heartbeat_interval_secs: 15,
            peer_timeout_secs: 60,
            peer_sweep_interval_secs: 45,
            migration_chance: 0.1,
            migration_interval_secs: 120,
            max_migration_size: 3,
            migration_energy_cost: 5,
            migration_hunger_penalty: 10,
            message_timeout_secs: 10,
            max_message_size: 64_000,
            allowed_networks: vec![
                "192.168.0.0/16".to_string(),
                "10.0.0.0/8".to_string(),
                "172.16.0.0/12".to_string(),
                "127.0.0.0/8".to_string(),
            ],
            protocol_version: "1.0".to_string(),
            seed: None,
            world: WorldConfig::default(),
            snapshot_every_ticks: 6,
            telemetry_every_ticks: 12,
            data_dir: None,
        }
    }
}

impl NodeConfig {
    /// Reads and validates a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.migration_chance) {
            return Err(ConfigError::invalid(
                "migration_chance",
                format!("{} is outside [0, 1]", self.migration_chance),
            ));
        }
        if self.max_migration_size == 0 {
            return Err(ConfigError::invalid("max_migration_size", "must be at least 1"));
        }

        let intervals = [
            ("tick_interval_secs", self.tick_interval_secs),
            ("discovery_interval_secs", self.discovery_interval_secs),
            ("discovery_timeout_secs", self.discovery_timeout_secs),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("peer_timeout_secs", self.peer_timeout_secs),
            ("peer_sweep_interval_secs", self.peer_sweep_interval_secs),
            ("migration_interval_secs", self.migration_interval_secs),
            ("message_timeout_secs", self.message_timeout_secs),
        ];
        for (field, value) in intervals {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be greater than zero"));
            }
        }

        if self.max_message_size == 0 {
            return Err(ConfigError::invalid("max_message_size", "must be greater than zero"));
        }
        if self.world.max_population == 0 {
            return Err(ConfigError::invalid("world.max_population", "must be at least 1"));
        }
        if self.protocol_version.trim().is_empty() {
            return Err(ConfigError::invalid("protocol_version", "must not be empty"));
        }

        self.allow_list()?;
        Ok(())
    }

    pub fn allow_list(&self) -> Result<AllowList, ConfigError> {
        AllowList::parse(&self.allowed_networks)
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            bind_ip: self.bind_ip,
            discovery_port: self.discovery_port,
            comm_port: self.comm_port,
            broadcast_ip: self.broadcast_ip,
            max_message_size: self.max_message_size,
            io_timeout: self.message_timeout(),
        }
    }

    pub fn simulation_settings(&self) -> SimulationSettings {
        SimulationSettings {
            snapshot_every_ticks: self.snapshot_every_ticks,
            telemetry_every_ticks: self.telemetry_every_ticks,
            migration_energy_cost: self.migration_energy_cost,
            migration_hunger_penalty: self.migration_hunger_penalty,
        }
    }

    pub fn migration_policy(&self) -> MigrationPolicy {
        MigrationPolicy {
            chance: self.migration_chance,
            max_batch: self.max_migration_size,
            ..MigrationPolicy::default()
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }

    pub fn peer_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.peer_sweep_interval_secs)
    }

    pub fn migration_interval(&self) -> Duration {
        Duration::from_secs(self.migration_interval_secs)
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_secs(self.message_timeout_secs)
    }
}
