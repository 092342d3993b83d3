//! SimCluster - a whole network of Thronglet nodes on one virtual clock.
//!
//! ```text
//!   ┌──────────── SimContext (shared virtual clock) ────────────┐
//!   │                                                           │
//!   │  Node 0 (10.0.0.1)   Node 1 (10.0.0.2)   Node N ...       │
//!   │      │                   │                   │            │
//!   │      └──────── SimFabric (datagrams, requests) ┘          │
//!   └───────────────────────────────────────────────────────────┘
//! ```
//!
//! `step()` advances the clock by one tick interval, ticks every running
//! node, then runs whichever periodic rounds (announce, sweep, heartbeat,
//! migration) came due. Nodes run in index order so a seed replays exactly.

use crate::context::SimContext;
use crate::network::{host_ip, FabricStats, SimFabric, SimNetwork};

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use thronglet_core::creature::VITAL_MAX;
use thronglet_core::{ConfigError, MigrationOutcome, Node, NodeConfig, TickReport};
use thronglet_env::{EnvError, NetworkController, NetworkTransport, NodeId, RequestHandler, ThrongletContext};
use tracing::{debug, info};

/// A node running on the simulated fabric.
pub type SimNode = Node<SimContext, SimNetwork>;

/// Errors building a cluster.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("invalid node configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("fabric error: {0}")]
    Transport(#[from] EnvError),

    #[error("node {0} could not seed its population: {1}")]
    Seeding(usize, String),
}

/// Configuration for a simulated cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Number of nodes to create
    pub num_nodes: usize,

    /// Creatures each node starts with
    pub initial_creatures: usize,

    /// Configuration shared by every node (`seed` is overridden per node)
    pub node: NodeConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            num_nodes: 3,
            initial_creatures: 5,
            node: NodeConfig::default(),
        }
    }
}

/// Fixed-period schedule measured on the virtual clock.
#[derive(Debug, Clone, Copy)]
struct Every {
    period: Duration,
    next: Duration,
}

impl Every {
    fn new(period: Duration, first: Duration) -> Self {
        Self { period, next: first }
    }

    fn due(&mut self, now: Duration) -> bool {
        if now < self.next {
            return false;
        }
        while self.next <= now {
            self.next += self.period;
        }
        true
    }
}

/// What happened during one `step()`.
#[derive(Debug, Clone, Default)]
pub struct StepReport {
    pub step: u64,
    pub time_secs: f64,
    pub ticks: Vec<TickReport>,
    pub announcements: usize,
    pub datagrams_handled: usize,
    pub peers_purged: usize,
    pub heartbeats_answered: usize,
    pub migrations: Vec<MigrationOutcome>,
}

impl StepReport {
    pub fn births(&self) -> usize {
        self.ticks.iter().map(|t| t.births.len()).sum()
    }

    pub fn deaths(&self) -> usize {
        self.ticks.iter().map(|t| t.deaths.len()).sum()
    }

    pub fn migrated(&self) -> usize {
        self.migrations.iter().filter(|o| o.is_migrated()).count()
    }

    pub fn rejected(&self) -> usize {
        self.migrations
            .iter()
            .filter(|o| matches!(o, MigrationOutcome::Rejected { .. }))
            .count()
    }
}

/// The SimCluster - container for a whole simulated network.
pub struct SimCluster {
    config: ClusterConfig,
    context: Arc<SimContext>,
    fabric: Arc<SimFabric>,
    nodes: Vec<Arc<SimNode>>,
    /// Indices of nodes that are switched off
    down: BTreeSet<usize>,
    announce: Every,
    sweep: Every,
    heartbeat: Every,
    migration: Every,
    step_count: u64,
}

impl SimCluster {
    /// Builds the cluster, seeds every node's population and starts serving.
    pub fn new(config: ClusterConfig) -> Result<Self, ClusterError> {
        // Separate seeds for the clock/nodes and the fabric's loss rolls
        let context = SimContext::shared(config.seed);
        let fabric = SimFabric::shared(config.seed.wrapping_mul(0x9e37_79b9_7f4a_7c15));

        let mut nodes = Vec::with_capacity(config.num_nodes);
        for index in 0..config.num_nodes {
            let node_context = Arc::new(context.fork(index as u64));
            let mut node_config = config.node.clone();
            node_config.seed = Some(node_context.seed());

            let network = Arc::new(fabric.attach(host_ip(index), &node_config.transport_config()));
            let node = Arc::new(Node::new(
                NodeId::from_seed(index as u64),
                node_config,
                node_context,
                network,
            )?);
            let handler: Arc<dyn RequestHandler> = node.clone();
            node.network().serve(handler)?;

            for _ in 0..config.initial_creatures {
                node.add_agent(None)
                    .map_err(|e| ClusterError::Seeding(index, e.to_string()))?;
            }
            nodes.push(node);
        }

        let node = &config.node;
        let start = Duration::ZERO;
        info!(
            "🌐 Cluster ready: {} nodes, {} creatures each (seed={})",
            config.num_nodes, config.initial_creatures, config.seed
        );

        Ok(Self {
            announce: Every::new(node.discovery_interval(), start),
            sweep: Every::new(node.peer_sweep_interval(), node.peer_sweep_interval()),
            heartbeat: Every::new(node.heartbeat_interval(), node.heartbeat_interval()),
            migration: Every::new(node.migration_interval(), node.migration_interval()),
            config,
            context,
            fabric,
            nodes,
            down: BTreeSet::new(),
            step_count: 0,
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<SimContext> {
        &self.context
    }

    pub fn fabric(&self) -> &Arc<SimFabric> {
        &self.fabric
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> Option<&Arc<SimNode>> {
        self.nodes.get(index)
    }

    pub fn nodes(&self) -> &[Arc<SimNode>] {
        &self.nodes
    }

    pub fn node_ip(&self, index: usize) -> IpAddr {
        host_ip(index)
    }

    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    /// Virtual seconds since the cluster was built.
    pub fn time_secs(&self) -> f64 {
        self.context.now().as_secs_f64()
    }

    pub fn fabric_stats(&self) -> FabricStats {
        self.fabric.stats()
    }

    pub fn is_up(&self, index: usize) -> bool {
        index < self.nodes.len() && !self.down.contains(&index)
    }

    fn running(&self) -> impl Iterator<Item = &Arc<SimNode>> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.down.contains(i))
            .map(|(_, node)| node)
    }

    // =========================================================================
    // FAULTS
    // =========================================================================

    /// Switches a node off: it stops ticking and the fabric isolates it.
    pub fn crash(&mut self, index: usize) {
        if index < self.nodes.len() && self.down.insert(index) {
            self.fabric.disconnect(host_ip(index));
            info!("💥 Node {} crashed", index);
        }
    }

    /// Brings a crashed node back; its state is as it was when it went down.
    pub fn recover(&mut self, index: usize) {
        if self.down.remove(&index) {
            self.fabric.reconnect(host_ip(index));
            info!("🔌 Node {} recovered", index);
        }
    }

    /// Splits the cluster into two groups of node indices.
    pub fn partition(&self, group_a: &[usize], group_b: &[usize]) {
        let a: Vec<IpAddr> = group_a.iter().map(|i| host_ip(*i)).collect();
        let b: Vec<IpAddr> = group_b.iter().map(|i| host_ip(*i)).collect();
        self.fabric.partition(&a, &b);
    }

    pub fn heal(&self) {
        self.fabric.heal_all();
        for index in &self.down {
            self.fabric.disconnect(host_ip(*index));
        }
    }

    // =========================================================================
    // STEPPING
    // =========================================================================

    /// Advances one tick interval and runs every round that came due.
    pub async fn step(&mut self) -> StepReport {
        self.context.advance_time(self.config.node.tick_interval());
        self.step_count += 1;
        let now = self.context.now();

        let mut report = StepReport {
            step: self.step_count,
            time_secs: now.as_secs_f64(),
            ..StepReport::default()
        };

        for node in self.running() {
            report.ticks.push(node.run_tick());
        }

        if self.announce.due(now) {
            for node in self.running() {
                report.announcements += node.announce().await;
            }
        }

        // Two passes: announcements, then the responses they triggered
        for _ in 0..2 {
            for node in self.running() {
                report.datagrams_handled += node.drain_discovery().await;
            }
        }

        if self.sweep.due(now) {
            for node in self.running() {
                report.peers_purged += node.sweep_peers().len();
            }
        }

        if self.heartbeat.due(now) {
            for node in self.running() {
                report.heartbeats_answered += node.heartbeat_round().await;
            }
        }

        if self.migration.due(now) {
            for node in self.running() {
                report.migrations.extend(node.migration_round().await);
            }
        }

        debug!(
            "  t={:.0}s | population={} | migrated={} | purged={}",
            report.time_secs,
            self.total_population(),
            report.migrated(),
            report.peers_purged
        );
        report
    }

    /// Runs `steps` steps and returns their reports.
    pub async fn run(&mut self, steps: u64) -> Vec<StepReport> {
        let mut reports = Vec::with_capacity(steps as usize);
        for _ in 0..steps {
            reports.push(self.step().await);
        }
        reports
    }

    /// Steps until every running node sees every other running node.
    ///
    /// # Returns
    /// `true` if the mesh formed within `max_steps`.
    pub async fn converge(&mut self, max_steps: u64) -> bool {
        for _ in 0..max_steps {
            if self.fully_connected() {
                return true;
            }
            self.step().await;
        }
        self.fully_connected()
    }

    /// True when every running node has all other running nodes as live peers.
    pub fn fully_connected(&self) -> bool {
        let expected = self.running().count().saturating_sub(1);
        self.running().all(|node| node.get_connected_peers().len() >= expected)
    }

    // =========================================================================
    // OBSERVATION
    // =========================================================================

    /// Creatures across all nodes, including crashed ones.
    pub fn total_population(&self) -> usize {
        self.nodes.iter().map(|n| n.with_simulation(|sim| sim.len())).sum()
    }

    pub fn populations(&self) -> Vec<usize> {
        self.nodes.iter().map(|n| n.with_simulation(|sim| sim.len())).collect()
    }

    /// Checks the properties that must hold after every step.
    ///
    /// - population_count equals registry size on every node
    /// - population never exceeds max_population
    /// - vitals are within range and age is bounded by max_age + 1
    /// - no creature id lives on two nodes at once
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut seen = BTreeSet::new();

        for (index, node) in self.nodes.iter().enumerate() {
            let result = node.with_simulation(|sim| {
                let world = sim.world();
                if world.population_count as usize != sim.len() {
                    return Err(format!(
                        "node {}: population_count {} but {} creatures",
                        index,
                        world.population_count,
                        sim.len()
                    ));
                }
                if world.population_count > world.max_population {
                    return Err(format!(
                        "node {}: population {} over limit {}",
                        index, world.population_count, world.max_population
                    ));
                }
                for creature in sim.creatures() {
                    if creature.energy > VITAL_MAX || creature.happiness > VITAL_MAX || creature.hunger > VITAL_MAX {
                        return Err(format!("node {}: {} has vitals out of range", index, creature.name));
                    }
                    if creature.age > creature.max_age + 1 {
                        return Err(format!("node {}: {} aged past its limit", index, creature.name));
                    }
                    if !seen.insert(creature.id) {
                        return Err(format!("creature {} exists on more than one node", creature.id));
                    }
                }
                Ok(())
            });
            result?;
        }
        Ok(())
    }
}
