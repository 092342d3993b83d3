//! Front-end operations exposed by a node.
//!
//! These are the calls a local command dispatcher maps its requests onto.
//! Business-level outcomes (no peers, rejected, too weak) are values; only
//! unknown creatures and a full world are errors.

use crate::creature::{Creature, CreatureId, CreatureState, CreatureSummary};
use crate::error::SimulationError;
use crate::migration::{MigrationEvent, MigrationOutcome};
use crate::peers::Peer;
use crate::runtime::Node;
use crate::simulation::SimulationStats;
use crate::stats::CounterSnapshot;
use serde::{Deserialize, Serialize};
use thronglet_env::{NetworkTransport, NodeId, ThrongletContext};
use tracing::info;

/// Migration events included in network stats.
pub const RECENT_MIGRATIONS: usize = 10;

/// Reason attached to operator-initiated migrations.
pub const FORCED_REASON: &str = "forced";

/// Summary returned by `get_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub tick_count: u64,
    pub uptime_secs: f64,
    pub population: u32,
    pub max_population: u32,
    pub food: u32,
    pub max_food: u32,
    pub temperature: i32,
    pub live_peers: usize,
    pub protocol_version: String,
}

/// Report returned by `get_network_stats`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkStats {
    pub node_id: NodeId,
    pub live_peers: usize,
    pub peers: Vec<Peer>,
    pub counters: CounterSnapshot,
    pub recent_migrations: Vec<MigrationEvent>,
}

impl<Ctx, Net> Node<Ctx, Net>
where
    Ctx: ThrongletContext,
    Net: NetworkTransport,
{
    pub fn get_status(&self) -> NodeStatus {
        let now = self.now();
        let live_peers = self.peers().live_count(now);
        let sim = self.simulation();
        let world = sim.world();
        let stats = sim.stats(now);

        NodeStatus {
            node_id: self.node_id(),
            tick_count: sim.tick_count(),
            uptime_secs: stats.runtime.uptime_secs,
            population: world.population_count,
            max_population: world.max_population,
            food: world.food,
            max_food: world.max_food,
            temperature: world.temperature,
            live_peers,
            protocol_version: self.config().protocol_version.clone(),
        }
    }

    /// Every local creature in registry order.
    pub fn list_agents(&self) -> Vec<CreatureSummary> {
        self.simulation().creatures().map(Creature::summary).collect()
    }

    /// Adds a creature; `None` picks a default name.
    pub fn add_agent(&self, name: Option<&str>) -> Result<Creature, SimulationError> {
        let now = self.now();
        self.simulation().add_creature(name, now)
    }

    pub fn remove_agent(&self, id: &CreatureId) -> Result<Creature, SimulationError> {
        let removed = self.simulation().remove_creature(id);
        match removed {
            Some(creature) => {
                info!("Removed creature {}", creature.name);
                Ok(creature)
            }
            None => Err(SimulationError::CreatureNotFound(id.to_string())),
        }
    }

    pub fn get_network_stats(&self) -> NetworkStats {
        let peers = self.get_connected_peers();
        NetworkStats {
            node_id: self.node_id(),
            live_peers: peers.len(),
            peers,
            counters: self.counters().snapshot(),
            recent_migrations: self.migration_log().recent(RECENT_MIGRATIONS),
        }
    }

    /// Live peers only.
    pub fn get_connected_peers(&self) -> Vec<Peer> {
        let now = self.now();
        self.peers().live_peers(now)
    }

    /// Migrates the named creature, or a random eligible one.
    ///
    /// A named creature skips the energy and age thresholds but must not be
    /// Dying or Reproducing.
    pub async fn force_migration(&self, name: Option<&str>) -> Result<MigrationOutcome, SimulationError> {
        let target = match name {
            Some(name) => {
                let found = self
                    .simulation()
                    .find_by_name(name)
                    .map(|c| (c.id, c.state));
                match found {
                    Some((_, CreatureState::Dying | CreatureState::Reproducing)) => None,
                    Some((id, _)) => Some(id),
                    None => return Err(SimulationError::CreatureNotFound(name.to_string())),
                }
            }
            None => {
                let sim = self.simulation();
                let mut rng = self.migration_rng();
                let picked = self.policy().pick_random(sim.creatures(), &mut *rng);
                picked
            }
        };

        match target {
            Some(id) => Ok(self.migrate_creature(id, FORCED_REASON).await),
            None => Ok(MigrationOutcome::NoCandidate),
        }
    }

    /// Drives a creature into Reproducing.
    ///
    /// # Returns
    /// `Ok(false)` when it is too weak, Dying, or the world is full.
    pub fn force_reproduction(&self, id: &CreatureId) -> Result<bool, SimulationError> {
        let now = self.now();
        self.simulation().force_reproduction(id, now)
    }

    /// Feeds every hungry creature and returns how many ate.
    pub fn feed_all(&self) -> usize {
        self.simulation().feed_all()
    }

    pub fn get_simulation_stats(&self) -> SimulationStats {
        let now = self.now();
        self.simulation().stats(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::null_node;
    use uuid::Uuid;

    #[test]
    fn test_add_agent_fluffy() {
        let node = null_node(1);
        let fluffy = node.add_agent(Some("Fluffy")).unwrap();
        assert!((40..=60).contains(&fluffy.happiness));

        let status = node.get_status();
        assert_eq!(status.population, 1);
        assert_eq!(status.live_peers, 0);

        let listed = node.list_agents();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "Fluffy");
        assert_eq!(listed[0].state, CreatureState::Idle);
    }

    #[test]
    fn test_add_agent_at_capacity() {
        let node = crate::testing::null_node_with(1, |c| c.world.max_population = 1);
        node.add_agent(None).unwrap();
        assert!(matches!(
            node.add_agent(None),
            Err(SimulationError::PopulationLimit { max: 1 })
        ));
    }

    #[test]
    fn test_remove_agent() {
        let node = null_node(1);
        let id = node.add_agent(None).unwrap().id;
        assert_eq!(node.remove_agent(&id).unwrap().id, id);
        assert_eq!(node.get_status().population, 0);
        assert!(matches!(
            node.remove_agent(&id),
            Err(SimulationError::CreatureNotFound(_))
        ));
    }

    #[test]
    fn test_feed_all_and_stats() {
        let node = null_node(1);
        let id = node.add_agent(None).unwrap().id;
        node.with_simulation(|sim| {
            sim.tick(0.0);
        });
        assert_eq!(node.feed_all(), 0);

        node.with_simulation(|sim| {
            let mut snapshot = sim.snapshot(0.0);
            snapshot.creatures[0].hunger = 90;
            sim.restore(snapshot);
        });
        assert_eq!(node.feed_all(), 1);

        let stats = node.get_simulation_stats();
        assert_eq!(stats.runtime.tick_count, 1);
        assert_eq!(stats.population.total_population, 1);
        assert!(node.force_reproduction(&id).is_ok());
    }

    #[test]
    fn test_force_reproduction_unknown() {
        let node = null_node(1);
        assert!(node.force_reproduction(&Uuid::from_u128(5)).is_err());
    }

    #[tokio::test]
    async fn test_force_migration_outcomes() {
        let node = null_node(1);
        assert!(matches!(
            node.force_migration(Some("Ghost")).await,
            Err(SimulationError::CreatureNotFound(_))
        ));
        assert_eq!(node.force_migration(None).await.unwrap(), MigrationOutcome::NoCandidate);

        node.add_agent(Some("Homebody")).unwrap();
        assert_eq!(
            node.force_migration(Some("Homebody")).await.unwrap(),
            MigrationOutcome::NoPeers
        );
    }

    #[test]
    fn test_network_stats_empty() {
        let node = null_node(1);
        let stats = node.get_network_stats();
        assert_eq!(stats.node_id, NodeId::from_seed(1));
        assert_eq!(stats.live_peers, 0);
        assert!(stats.recent_migrations.is_empty());
        assert_eq!(stats.counters, CounterSnapshot::default());
    }
}
