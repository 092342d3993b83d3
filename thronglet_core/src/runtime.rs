//! Node runtime: wires the simulation, peer directory and protocols to an
//! environment context and a transport.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Node<Ctx, Net>                        │
//! │                                                              │
//! │   Mutex<Simulation>            Mutex<PeerDirectory>          │
//! │   (registry + world)           (known peers)                 │
//! │        ▲   ▲                        ▲    ▲                   │
//! │   tick │   │ admit/release          │    │ discovery, sweep, │
//! │   loop │   │                        │    │ heartbeat         │
//! │        │   └───── migration loop ───┘    │                   │
//! │        │                                 │                   │
//! │  Context: ThrongletContext     Network: NetworkTransport     │
//! │  • unix_time() → timestamps    • broadcast / send_to         │
//! │  • sleep() → loop cadence      • request (reliable)          │
//! │  • derive_rng() → streams      • serve (inbound handler)     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Neither lock is ever held across an `.await`.
//!
//! # Usage
//!
//! ```ignore
//! let node = Arc::new(Node::new(node_id, config, ctx, transport)?);
//! let handle = node.start()?;
//! tokio::signal::ctrl_c().await?;
//! handle.shutdown().await;
//! ```

use crate::config::NodeConfig;
use crate::creature::{CreatureId, CreatureState};
use crate::discovery::{DiscoveryAction, DiscoveryService};
use crate::error::{ConfigError, MigrationError, ProtocolError};
use crate::migration::{choose_destination, MigrationEvent, MigrationOutcome, MigrationPolicy};
use crate::peers::{Peer, PeerDirectory};
use crate::persistence::{MemoryMigrationLog, MigrationLog, SnapshotStore};
use crate::protocol::{
    HeartbeatRequest, Message, MessageFactory, MessageKind, MigrationAck, MigrationRequest, StatusReport,
};
use crate::simulation::{Simulation, TickReport};
use crate::stats::NetworkCounters;
use rand_chacha::ChaCha8Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thronglet_env::{Datagram, EnvError, NetworkTransport, NodeId, RequestHandler, ThrongletContext};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Random stream ids handed to `ThrongletContext::derive_rng`.
pub const SIMULATION_STREAM: u64 = 1;
pub const MIGRATION_STREAM: u64 = 2;
pub const MESSAGE_STREAM: u64 = 3;

/// Reason attached to scheduled migrations.
pub const SCHEDULED_REASON: &str = "exploration";

/// Upper bound on waiting for one background task at shutdown.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A Thronglet node.
///
/// Generic over the context and network implementations, so the same node
/// runs as a daemon (tokio) or inside the deterministic cluster harness.
pub struct Node<Ctx, Net>
where
    Ctx: ThrongletContext,
    Net: NetworkTransport,
{
    node_id: NodeId,
    config: NodeConfig,
    context: Arc<Ctx>,
    network: Arc<Net>,

    simulation: Mutex<Simulation>,
    peers: Mutex<PeerDirectory>,

    discovery: DiscoveryService,
    policy: MigrationPolicy,
    messages: Mutex<MessageFactory>,
    migration_rng: Mutex<ChaCha8Rng>,

    counters: NetworkCounters,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    migration_log: Arc<dyn MigrationLog>,
}

impl<Ctx, Net> Node<Ctx, Net>
where
    Ctx: ThrongletContext,
    Net: NetworkTransport,
{
    /// Builds a node from a validated configuration.
    ///
    /// # Arguments
    /// * `node_id` - Identity of this node; never read from the host
    /// * `config` - Node configuration, validated here
    /// * `context` - Clock, sleep, spawn and random streams
    /// * `network` - Bound transport
    pub fn new(
        node_id: NodeId,
        config: NodeConfig,
        context: Arc<Ctx>,
        network: Arc<Net>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let allow = config.allow_list()?;
        let now = context.unix_time();

        let simulation = Simulation::new(
            node_id,
            &config.world,
            config.simulation_settings(),
            context.derive_rng(SIMULATION_STREAM),
            now,
        );

        Ok(Self {
            node_id,
            discovery: DiscoveryService::new(node_id, allow, config.protocol_version.clone()),
            policy: config.migration_policy(),
            peers: Mutex::new(PeerDirectory::new(config.peer_timeout())),
            messages: Mutex::new(MessageFactory::new(node_id, context.derive_rng(MESSAGE_STREAM))),
            migration_rng: Mutex::new(context.derive_rng(MIGRATION_STREAM)),
            simulation: Mutex::new(simulation),
            counters: NetworkCounters::default(),
            snapshots: None,
            migration_log: Arc::new(MemoryMigrationLog::default()),
            config,
            context,
            network,
        })
    }

    /// Persists snapshots through `store`.
    pub fn with_snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(store);
        self
    }

    /// Records completed migrations in `log`.
    pub fn with_migration_log(mut self, log: Arc<dyn MigrationLog>) -> Self {
        self.migration_log = log;
        self
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<Ctx> {
        &self.context
    }

    pub fn network(&self) -> &Arc<Net> {
        &self.network
    }

    pub fn counters(&self) -> &NetworkCounters {
        &self.counters
    }

    pub(crate) fn migration_log(&self) -> &Arc<dyn MigrationLog> {
        &self.migration_log
    }

    pub(crate) fn policy(&self) -> &MigrationPolicy {
        &self.policy
    }

    pub(crate) fn is_trusted(&self, addr: SocketAddr) -> bool {
        self.discovery.is_trusted(addr.ip())
    }

    /// Current wall-clock time in Unix seconds.
    pub fn now(&self) -> f64 {
        self.context.unix_time()
    }

    pub(crate) fn simulation(&self) -> MutexGuard<'_, Simulation> {
        self.simulation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn peers(&self) -> MutexGuard<'_, PeerDirectory> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn migration_rng(&self) -> MutexGuard<'_, ChaCha8Rng> {
        self.migration_rng.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` with exclusive access to the registry and world.
    pub fn with_simulation<R>(&self, f: impl FnOnce(&mut Simulation) -> R) -> R {
        let mut sim = self.simulation();
        f(&mut sim)
    }

    /// Runs `f` with exclusive access to the peer directory.
    pub fn with_peers<R>(&self, f: impl FnOnce(&mut PeerDirectory) -> R) -> R {
        let mut peers = self.peers();
        f(&mut peers)
    }

    pub(crate) fn build<P: Serialize>(
        &self,
        kind: MessageKind,
        recipient: Option<NodeId>,
        payload: &P,
    ) -> Result<Message, ProtocolError> {
        let now = self.now();
        let mut factory = self.messages.lock().unwrap_or_else(PoisonError::into_inner);
        factory.build(kind, recipient, payload, now)
    }

    // =========================================================================
    // TICK & PERSISTENCE
    // =========================================================================

    /// Loads the stored snapshot, if persistence is configured.
    pub fn restore_snapshot(&self) -> usize {
        let Some(store) = &self.snapshots else {
            return 0;
        };
        match store.load() {
            Ok(Some(snapshot)) => self.simulation().restore(snapshot),
            Ok(None) => 0,
            Err(e) => {
                warn!("Failed to load snapshot, starting empty: {}", e);
                0
            }
        }
    }

    /// Saves a snapshot; failures are logged and never propagate.
    pub fn save_snapshot(&self) -> bool {
        let Some(store) = &self.snapshots else {
            return false;
        };
        let now = self.now();
        let snapshot = self.simulation().snapshot(now);
        match store.save(&snapshot) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to save snapshot: {}", e);
                false
            }
        }
    }

    /// Runs one simulation tick.
    pub fn run_tick(&self) -> TickReport {
        let now = self.now();
        let report = self.simulation().tick(now);
        if report.snapshot_due {
            self.save_snapshot();
        }
        report
    }

    // =========================================================================
    // DISCOVERY
    // =========================================================================

    /// Current status in heartbeat form.
    pub fn status_report(&self) -> StatusReport {
        let sim = self.simulation();
        let world = sim.world();
        StatusReport {
            population: world.population_count,
            food: world.food,
            max_population: world.max_population,
            max_food: world.max_food,
            temperature: world.temperature,
            state_counts: sim.state_counts(),
        }
    }

    fn announcement_message(&self, kind: MessageKind, recipient: Option<NodeId>) -> Result<Vec<u8>, ProtocolError> {
        let comm_port = self.network.local_addr().port();
        let announcement = {
            let sim = self.simulation();
            let announcement = self.discovery.announcement(sim.world(), comm_port);
            announcement
        };
        self.build(kind, recipient, &announcement)?
            .encode(self.config.max_message_size)
    }

    /// Broadcasts one discovery announcement.
    ///
    /// # Returns
    /// Number of receivers reported by the transport (0 on failure).
    pub async fn announce(&self) -> usize {
        let bytes = match self.announcement_message(MessageKind::Discovery, None) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode announcement: {}", e);
                return 0;
            }
        };
        match self.network.broadcast(bytes).await {
            Ok(receivers) => {
                self.counters.record_sent();
                debug!("📡 Announced to {} receivers", receivers);
                receivers
            }
            Err(e) => {
                warn!("Discovery broadcast failed: {}", e);
                0
            }
        }
    }

    /// Applies one inbound discovery datagram.
    pub async fn handle_datagram(&self, datagram: Datagram) -> Option<DiscoveryAction> {
        if !self.discovery.is_trusted(datagram.from.ip()) {
            self.counters.record_untrusted();
            return None;
        }

        let message = match Message::decode(&datagram.payload, self.config.max_message_size) {
            Ok(message) => message,
            Err(e) => {
                self.counters.record_malformed();
                debug!("Dropping datagram from {}: {}", datagram.from, e);
                return None;
            }
        };
        self.counters.record_received();

        let now = self.now();
        let result = {
            let mut peers = self.peers();
            let result = self.discovery.handle(&mut peers, datagram.from, &message, now);
            result
        };
        let action = match result {
            Ok(action) => action,
            Err(e) => {
                self.counters.record_malformed();
                debug!("Dropping discovery from {}: {}", datagram.from, e);
                return None;
            }
        };

        if let DiscoveryAction::Registered { peer, reply: true } = action {
            self.respond_to_discovery(peer, datagram.from).await;
        }
        Some(action)
    }

    async fn respond_to_discovery(&self, peer: NodeId, to: SocketAddr) {
        let bytes = match self.announcement_message(MessageKind::DiscoveryResponse, Some(peer)) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode discovery response: {}", e);
                return;
            }
        };
        match self.network.send_to(to, bytes).await {
            Ok(()) => self.counters.record_sent(),
            Err(e) => debug!("Discovery response to {} failed: {}", to, e),
        }
    }

    /// Handles every datagram already queued, without waiting.
    pub async fn drain_discovery(&self) -> usize {
        let mut handled = 0;
        while let Some(datagram) = self.network.try_recv_datagram() {
            self.handle_datagram(datagram).await;
            handled += 1;
        }
        handled
    }

    /// Purges expired peers.
    pub fn sweep_peers(&self) -> Vec<NodeId> {
        let now = self.now();
        self.peers().purge_expired(now)
    }

    // =========================================================================
    // RELIABLE EXCHANGES
    // =========================================================================

    async fn exchange(&self, target: SocketAddr, message: Message) -> Result<Message, MigrationError> {
        let max = self.config.max_message_size;
        let bytes = message.encode(max)?;
        self.counters.record_sent();
        let reply = self
            .network
            .request(target, bytes, self.config.message_timeout())
            .await?;
        let reply = Message::decode(&reply, max)?;
        self.counters.record_received();
        Ok(reply)
    }

    fn expect_reply<T: DeserializeOwned>(reply: &Message, kind: MessageKind) -> Result<T, MigrationError> {
        if reply.kind != kind {
            return Err(MigrationError::UnexpectedReply(reply.kind));
        }
        Ok(reply.payload_as()?)
    }

    async fn heartbeat(&self, peer: &Peer) -> Result<StatusReport, MigrationError> {
        let request = HeartbeatRequest { request_detailed_status: true };
        let message = self.build(MessageKind::Heartbeat, Some(peer.node_id), &request)?;
        let reply = self.exchange(peer.address, message).await?;
        Self::expect_reply(&reply, MessageKind::Heartbeat)
    }

    /// Sends a heartbeat to every live peer.
    ///
    /// # Returns
    /// Number of peers that answered.
    pub async fn heartbeat_round(&self) -> usize {
        let now = self.now();
        let peers = self.peers().live_peers(now);
        let mut answered = 0;

        for peer in peers {
            match self.heartbeat(&peer).await {
                Ok(status) => {
                    let now = self.now();
                    self.peers().record_status(&peer.node_id, &status, now);
                    answered += 1;
                }
                Err(e) => warn!("Heartbeat to {} failed: {}", peer.node_id, e),
            }
        }
        answered
    }

    // =========================================================================
    // MIGRATION
    // =========================================================================

    /// Runs one scheduled migration round.
    pub async fn migration_round(&self) -> Vec<MigrationOutcome> {
        let batch = {
            let sim = self.simulation();
            let mut rng = self.migration_rng();
            let batch = self.policy.select_batch(sim.creatures(), &mut *rng);
            batch
        };
        if batch.is_empty() {
            return Vec::new();
        }

        let now = self.now();
        if self.peers().live_count(now) == 0 {
            debug!("{} creatures want to migrate but no peers are known", batch.len());
            return vec![MigrationOutcome::NoPeers];
        }

        let mut outcomes = Vec::with_capacity(batch.len());
        for id in batch {
            // Earlier exchanges may have outlasted a tick
            let still_eligible = self.simulation().get(&id).is_some_and(|c| self.policy.is_eligible(c));
            if !still_eligible {
                outcomes.push(MigrationOutcome::NoCandidate);
                continue;
            }
            outcomes.push(self.migrate_creature(id, SCHEDULED_REASON).await);
        }
        outcomes
    }

    /// Runs the migration handshake for one creature.
    ///
    /// The creature is removed locally only after the destination accepted
    /// it. Every failure leaves it in place.
    pub async fn migrate_creature(&self, id: CreatureId, reason: &str) -> MigrationOutcome {
        let creature = self.simulation().get(&id).cloned();
        let Some(creature) = creature else {
            return MigrationOutcome::NoCandidate;
        };
        if matches!(creature.state, CreatureState::Dying | CreatureState::Reproducing) {
            debug!("{} is {} and stays home", creature.name, creature.state);
            return MigrationOutcome::NoCandidate;
        }

        let now = self.now();
        let peers = self.peers().live_peers(now);
        let Some(destination) = choose_destination(&peers).cloned() else {
            return MigrationOutcome::NoPeers;
        };

        let request = MigrationRequest {
            creature_data: creature.clone(),
            migration_reason: reason.to_string(),
        };
        let message = match self.build(MessageKind::CreatureMigration, Some(destination.node_id), &request) {
            Ok(message) => message,
            Err(e) => {
                self.counters.record_migration_failed();
                return MigrationOutcome::Failed { error: e.to_string() };
            }
        };

        info!("🚀 Sending {} to {} ({})", creature.name, destination.node_id, reason);
        let ack = match self.exchange(destination.address, message).await {
            Ok(reply) => Self::expect_reply::<MigrationAck>(&reply, MessageKind::CreatureMigrationAck),
            Err(e) => Err(e),
        };

        let ack = match ack {
            Ok(ack) if ack.creature_id == id => ack,
            Ok(ack) => {
                self.counters.record_migration_failed();
                warn!("Ack for {} does not match creature {}", ack.creature_id, id);
                return MigrationOutcome::Failed {
                    error: format!("ack for unexpected creature {}", ack.creature_id),
                };
            }
            Err(e) => {
                self.counters.record_migration_failed();
                warn!("Migration of {} to {} failed: {}", creature.name, destination.node_id, e);
                return MigrationOutcome::Failed { error: e.to_string() };
            }
        };

        let now = self.now();
        if let (Some(population), Some(food)) = (ack.population, ack.food) {
            self.peers().record_resources(&destination.node_id, population, food, now);
        }

        if !ack.accepted {
            self.counters.record_migration_rejected();
            info!("{} was rejected by {}: {}", creature.name, destination.node_id, ack.reason);
            return MigrationOutcome::Rejected { reason: ack.reason };
        }

        self.simulation().release_migrant(&id);
        self.counters.record_migration_out();
        info!("✈️  {} migrated to {}", creature.name, destination.node_id);

        let event = MigrationEvent {
            creature_name: creature.name.clone(),
            creature_id: id,
            from: self.node_id,
            to: destination.node_id,
            timestamp: now,
            reason: reason.to_string(),
        };
        if let Err(e) = self.migration_log.append(event) {
            warn!("Failed to record migration: {}", e);
        }

        MigrationOutcome::Migrated {
            creature_id: id,
            creature_name: creature.name,
            destination: destination.node_id,
        }
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Restores state, starts serving and spawns every background loop.
    pub fn start(self: &Arc<Self>) -> Result<NodeHandle<Ctx, Net>, EnvError> {
        let restored = self.restore_snapshot();
        let handler: Arc<dyn RequestHandler> = self.clone();
        self.network.serve(handler)?;

        let (stop, stop_rx) = watch::channel(false);
        let config = &self.config;
        let tasks = vec![
            self.spawn_periodic("tick", config.tick_interval(), false, stop_rx.clone(), |node| async move {
                node.run_tick();
            }),
            self.spawn_periodic("announce", config.discovery_interval(), true, stop_rx.clone(), |node| async move {
                node.announce().await;
            }),
            self.spawn_listener(stop_rx.clone()),
            self.spawn_periodic("peer-sweep", config.peer_sweep_interval(), false, stop_rx.clone(), |node| async move {
                node.sweep_peers();
            }),
            self.spawn_periodic("heartbeat", config.heartbeat_interval(), false, stop_rx.clone(), |node| async move {
                node.heartbeat_round().await;
            }),
            self.spawn_periodic("migration", config.migration_interval(), false, stop_rx, |node| async move {
                node.migration_round().await;
            }),
        ];

        info!(
            "🐾 Node {} started on {} ({} creatures restored)",
            self.node_id,
            self.network.local_addr(),
            restored
        );
        Ok(NodeHandle {
            node: Arc::clone(self),
            stop,
            tasks,
        })
    }

    fn spawn_periodic<F, Fut>(
        self: &Arc<Self>,
        name: &'static str,
        period: Duration,
        immediate: bool,
        mut stop: watch::Receiver<bool>,
        step: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let node = Arc::clone(self);
        let context = Arc::clone(&self.context);
        self.context.spawn(name, async move {
            if immediate {
                step(Arc::clone(&node)).await;
            }
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = context.sleep(period) => step(Arc::clone(&node)).await,
                }
            }
            debug!("{} loop stopped", name);
        })
    }

    fn spawn_listener(self: &Arc<Self>, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        let node = Arc::clone(self);
        let context = Arc::clone(&self.context);
        let wait = self.config.discovery_timeout();
        self.context.spawn("discovery-listen", async move {
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    datagram = node.network.recv_datagram() => match datagram {
                        Some(datagram) => {
                            node.handle_datagram(datagram).await;
                        }
                        None => break,
                    },
                    // Bounded wait so the stop signal is observed promptly
                    _ = context.sleep(wait) => {}
                }
            }
            debug!("discovery-listen loop stopped");
        })
    }
}

/// Running node: owns the background tasks and the stop signal.
pub struct NodeHandle<Ctx, Net>
where
    Ctx: ThrongletContext,
    Net: NetworkTransport,
{
    node: Arc<Node<Ctx, Net>>,
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl<Ctx, Net> NodeHandle<Ctx, Net>
where
    Ctx: ThrongletContext,
    Net: NetworkTransport,
{
    pub fn node(&self) -> &Arc<Node<Ctx, Net>> {
        &self.node
    }

    /// Closes listeners, stops every loop and saves a final snapshot.
    pub async fn shutdown(self) {
        info!("Shutting down node {}", self.node.node_id);
        self.node.network.close();
        let _ = self.stop.send(true);

        for mut task in self.tasks {
            if tokio::time::timeout(JOIN_TIMEOUT, &mut task).await.is_err() {
                warn!("Background task did not stop in time; aborting");
                task.abort();
            }
        }
        self.node.save_snapshot();
    }
}
