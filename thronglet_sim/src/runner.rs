//! Scenario runner - executes cluster scenarios on the virtual clock.

use crate::scenarios::ScenarioId;
use crate::world::{ClusterConfig, SimCluster, StepReport};

use serde::Serialize;
use std::net::IpAddr;
use thronglet_core::{MigrationOutcome, NodeConfig};
use thronglet_env::NetworkController;
use tracing::{debug, info, warn};

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Cluster steps executed
    pub total_steps: u64,

    /// Final virtual time in seconds
    pub final_time_secs: f64,

    /// Creatures alive across the cluster at the end
    pub final_population: usize,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScenarioMetrics {
    pub births: u64,
    pub deaths: u64,
    pub migrations: u64,
    pub rejections: u64,
    pub migration_failures: u64,
    pub peers_purged: u64,
    pub heartbeats_answered: u64,
    pub datagrams_delivered: u64,
    pub datagrams_dropped: u64,
    pub requests_failed: u64,
}

impl ScenarioMetrics {
    fn absorb(&mut self, report: &StepReport) {
        self.births += report.births() as u64;
        self.deaths += report.deaths() as u64;
        self.peers_purged += report.peers_purged as u64;
        self.heartbeats_answered += report.heartbeats_answered as u64;
        for outcome in &report.migrations {
            self.record(outcome);
        }
    }

    fn record(&mut self, outcome: &MigrationOutcome) {
        match outcome {
            MigrationOutcome::Migrated { .. } => self.migrations += 1,
            MigrationOutcome::Rejected { .. } => self.rejections += 1,
            MigrationOutcome::Failed { .. } => self.migration_failures += 1,
            MigrationOutcome::NoPeers | MigrationOutcome::NoCandidate => {}
        }
    }
}

/// A cluster under test plus the bookkeeping every scenario needs.
struct Run {
    cluster: SimCluster,
    metrics: ScenarioMetrics,
    initial_population: usize,
}

impl Run {
    fn new(config: ClusterConfig) -> Result<Self, String> {
        let cluster = SimCluster::new(config).map_err(|e| e.to_string())?;
        let initial_population = cluster.total_population();
        Ok(Self {
            cluster,
            metrics: ScenarioMetrics::default(),
            initial_population,
        })
    }

    /// One step with invariants checked afterwards.
    async fn step(&mut self) -> Result<StepReport, String> {
        let report = self.cluster.step().await;
        self.metrics.absorb(&report);
        self.cluster
            .check_invariants()
            .map_err(|e| format!("step {}: {}", report.step, e))?;
        Ok(report)
    }

    async fn steps(&mut self, count: u64) -> Result<(), String> {
        for _ in 0..count {
            self.step().await?;
        }
        Ok(())
    }

    async fn converge(&mut self, max_steps: u64) -> Result<(), String> {
        for _ in 0..max_steps {
            if self.cluster.fully_connected() {
                return Ok(());
            }
            self.step().await?;
        }
        if self.cluster.fully_connected() {
            Ok(())
        } else {
            Err(format!("mesh did not form within {} steps", max_steps))
        }
    }

    /// Creatures are only created by births and only destroyed by deaths.
    fn check_conservation(&self) -> Result<(), String> {
        let expected = self.initial_population as i64 + self.metrics.births as i64 - self.metrics.deaths as i64;
        let actual = self.cluster.total_population() as i64;
        if expected != actual {
            return Err(format!(
                "population {} but births and deaths account for {}",
                actual, expected
            ));
        }
        Ok(())
    }

    /// Forces migration of the first `count` creatures on `node`.
    async fn force_from(&mut self, node: usize, count: usize) -> Result<Vec<MigrationOutcome>, String> {
        let source = self
            .cluster
            .node(node)
            .cloned()
            .ok_or_else(|| format!("no node {}", node))?;
        let names: Vec<String> = source.list_agents().into_iter().take(count).map(|c| c.name).collect();

        let mut outcomes = Vec::with_capacity(names.len());
        for name in names {
            let outcome = source
                .force_migration(Some(&name))
                .await
                .map_err(|e| e.to_string())?;
            self.metrics.record(&outcome);
            outcomes.push(outcome);
        }
        self.cluster.check_invariants()?;
        Ok(outcomes)
    }
}

/// Runs cluster scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Node count override
    num_nodes: Option<usize>,

    /// Virtual duration override in seconds
    duration_secs: Option<f64>,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            num_nodes: None,
            duration_secs: None,
        }
    }

    /// Overrides every scenario's node count.
    pub fn with_nodes(mut self, nodes: usize) -> Self {
        self.num_nodes = Some(nodes);
        self
    }

    /// Overrides the virtual duration of open-ended phases.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.duration_secs = Some(secs);
        self
    }

    /// Runs a scenario on a fresh single-threaded runtime.
    ///
    /// Must not be called from inside another tokio runtime; use
    /// [`ScenarioRunner::run_async`] there.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_time().build();
        match runtime {
            Ok(runtime) => runtime.block_on(self.run_async(scenario)),
            Err(e) => self.failed(scenario, format!("could not build runtime: {}", e)),
        }
    }

    /// Runs a scenario and returns the result.
    pub async fn run_async(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let mut run = match Run::new(self.cluster_config(scenario)) {
            Ok(run) => run,
            Err(e) => return self.failed(scenario, e),
        };

        let outcome = match scenario {
            ScenarioId::Bootstrap => self.run_bootstrap(&mut run).await,
            ScenarioId::Migration => self.run_migration(&mut run).await,
            ScenarioId::Capacity => self.run_capacity(&mut run).await,
            ScenarioId::Churn => self.run_churn(&mut run).await,
            ScenarioId::LongRun => self.run_long_run(&mut run).await,
        };
        let outcome = outcome.and_then(|()| run.check_conservation());

        let fabric = run.cluster.fabric_stats();
        run.metrics.datagrams_delivered = fabric.datagrams_delivered;
        run.metrics.datagrams_dropped = fabric.datagrams_dropped;
        run.metrics.requests_failed = fabric.requests_failed;

        if let Err(reason) = &outcome {
            warn!("{} failed: {}", scenario.name(), reason);
        }

        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: outcome.is_ok(),
            total_steps: run.cluster.step_count(),
            final_time_secs: run.cluster.time_secs(),
            final_population: run.cluster.total_population(),
            failure_reason: outcome.err(),
            metrics: run.metrics,
        }
    }

    fn failed(&self, scenario: ScenarioId, reason: String) -> ScenarioResult {
        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: false,
            total_steps: 0,
            final_time_secs: 0.0,
            final_population: 0,
            failure_reason: Some(reason),
            metrics: ScenarioMetrics::default(),
        }
    }

    /// Steps needed to cover `default_secs` (or the duration override).
    fn steps_for(&self, default_secs: f64, node: &NodeConfig) -> u64 {
        let secs = self.duration_secs.unwrap_or(default_secs);
        (secs / node.tick_interval_secs as f64).ceil().max(1.0) as u64
    }

    fn cluster_config(&self, scenario: ScenarioId) -> ClusterConfig {
        let mut node = NodeConfig::default();
        let mut initial_creatures = 5;

        match scenario {
            ScenarioId::Bootstrap | ScenarioId::Churn => {}
            ScenarioId::Migration => {
                node.migration_chance = 1.0;
                node.migration_interval_secs = 30;
                initial_creatures = 8;
            }
            ScenarioId::Capacity => {
                node.world.max_population = 6;
                initial_creatures = 6;
            }
            ScenarioId::LongRun => {
                node.migration_chance = 0.5;
                node.migration_interval_secs = 60;
                initial_creatures = 8;
            }
        }

        ClusterConfig {
            seed: self.seed,
            num_nodes: self.num_nodes.unwrap_or_else(|| scenario.default_nodes()),
            initial_creatures,
            node,
        }
    }

    /// SIM-001: Bootstrap - cold start discovery.
    ///
    /// **Assertion**: every node lists every other node as a live peer after
    /// the first announcement round, and the mesh survives heartbeats and
    /// sweeps for several minutes.
    async fn run_bootstrap(&self, run: &mut Run) -> Result<(), String> {
        info!("SIM-001: Bootstrap - cold start discovery");

        run.converge(3).await?;
        info!("✓ Mesh formed after {} steps", run.cluster.step_count());

        let steps = self.steps_for(300.0, &run.cluster.config().node);
        run.steps(steps).await?;
        if !run.cluster.fully_connected() {
            return Err("mesh fell apart with every node healthy".to_string());
        }
        if run.metrics.peers_purged > 0 {
            return Err(format!("{} healthy peers were purged", run.metrics.peers_purged));
        }
        if run.metrics.heartbeats_answered == 0 {
            return Err("no heartbeat was ever answered".to_string());
        }

        info!(
            "✓ Bootstrap complete: {} nodes, {} heartbeats answered",
            run.cluster.len(),
            run.metrics.heartbeats_answered
        );
        Ok(())
    }

    /// SIM-002: Migration - creatures cross the network intact.
    ///
    /// **Assertion**: forced migrations land on a peer with a bumped
    /// migration count, and no creature is lost or duplicated.
    async fn run_migration(&self, run: &mut Run) -> Result<(), String> {
        info!("SIM-002: Migration - forced and scheduled moves");

        run.converge(3).await?;
        let outcomes = run.force_from(0, 3).await?;

        for outcome in &outcomes {
            let MigrationOutcome::Migrated { creature_id, destination, .. } = outcome else {
                debug!("Forced migration did not move a creature: {:?}", outcome);
                continue;
            };
            let arrived = run
                .cluster
                .nodes()
                .iter()
                .find(|n| n.node_id() == *destination)
                .and_then(|n| n.with_simulation(|sim| sim.get(creature_id).map(|c| c.migration_count())));
            match arrived {
                Some(count) if count >= 1 => {}
                Some(count) => return Err(format!("{} arrived with migration_count {}", creature_id, count)),
                None => return Err(format!("{} is missing at {}", creature_id, destination)),
            }
        }
        if !outcomes.iter().any(MigrationOutcome::is_migrated) {
            return Err(format!("no forced migration succeeded: {:?}", outcomes));
        }

        let steps = self.steps_for(600.0, &run.cluster.config().node);
        run.steps(steps).await?;

        info!(
            "✓ Migration complete: {} migrated, {} rejected, {} failed",
            run.metrics.migrations, run.metrics.rejections, run.metrics.migration_failures
        );
        Ok(())
    }

    /// SIM-003: Capacity - full nodes turn migrants away.
    ///
    /// **Assertion**: every forced migration into a full peer is rejected
    /// with reason "capacity" and the creature is still at its source.
    async fn run_capacity(&self, run: &mut Run) -> Result<(), String> {
        info!("SIM-003: Capacity - migration into a full node");

        run.converge(3).await?;
        let before = run.cluster.populations();
        let outcomes = run.force_from(0, 2).await?;

        for outcome in &outcomes {
            match outcome {
                MigrationOutcome::Rejected { reason } if reason == "capacity" => {}
                MigrationOutcome::NoCandidate => {}
                other => return Err(format!("expected a capacity rejection, got {:?}", other)),
            }
        }
        if run.metrics.rejections == 0 {
            return Err("no migration was rejected".to_string());
        }
        if run.cluster.populations() != before {
            return Err(format!(
                "populations moved from {:?} to {:?}",
                before,
                run.cluster.populations()
            ));
        }

        info!("✓ Capacity complete: {} rejections, populations {:?}", run.metrics.rejections, before);
        Ok(())
    }

    /// SIM-004: Churn - crash and recovery.
    ///
    /// **Assertion**: a crashed node disappears from every directory after
    /// the peer timeout plus one sweep, and is rediscovered after recovery.
    async fn run_churn(&self, run: &mut Run) -> Result<(), String> {
        info!("SIM-004: Churn - node crash and recovery");

        run.converge(3).await?;
        let victim = run.cluster.len() - 1;
        let victim_id = run
            .cluster
            .node(victim)
            .map(|n| n.node_id())
            .ok_or("cluster has no nodes")?;
        run.cluster.crash(victim);

        let node = run.cluster.config().node.clone();
        let outage = node.peer_timeout_secs + node.peer_sweep_interval_secs + node.tick_interval_secs;
        run.steps(self.steps_for(outage as f64, &node)).await?;

        for (index, n) in run.cluster.nodes().iter().enumerate() {
            if index == victim {
                continue;
            }
            if n.get_connected_peers().iter().any(|p| p.node_id == victim_id) {
                return Err(format!("node {} still lists crashed node {}", index, victim_id));
            }
            if n.with_peers(|dir| dir.contains(&victim_id)) {
                return Err(format!("node {} never purged crashed node {}", index, victim_id));
            }
        }
        info!("✓ Crashed node purged after {:.0}s", run.cluster.time_secs());

        run.cluster.recover(victim);
        let rejoin = node.discovery_interval_secs / node.tick_interval_secs + 2;
        run.converge(rejoin).await?;

        info!("✓ Churn complete: node {} rejoined", victim);
        Ok(())
    }

    /// SIM-005: LongRun - sustained operation under packet loss.
    ///
    /// **Assertion**: invariants hold after every step and the population
    /// is conserved across migrations.
    async fn run_long_run(&self, run: &mut Run) -> Result<(), String> {
        info!("SIM-005: LongRun - sustained operation with 10% loss");

        let hosts: Vec<IpAddr> = (0..run.cluster.len()).map(|i| run.cluster.node_ip(i)).collect();
        for from in &hosts {
            for to in &hosts {
                if from != to {
                    run.cluster.fabric().set_link_loss(*from, *to, 0.1);
                }
            }
        }

        let steps = self.steps_for(1800.0, &run.cluster.config().node);
        run.steps(steps).await?;

        info!(
            "✓ LongRun complete: {} births, {} deaths, {} migrations, {} dropped datagrams",
            run.metrics.births,
            run.metrics.deaths,
            run.metrics.migrations,
            run.cluster.fabric_stats().datagrams_dropped
        );
        Ok(())
    }
}
