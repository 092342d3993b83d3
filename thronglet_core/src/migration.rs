//! Migration policy: who leaves, and where to.
//!
//! Selection and scoring are pure functions over the registry and the peer
//! directory; the handshake itself is driven by the node runtime.

use crate::creature::{Creature, CreatureId, CreatureState};
use crate::peers::Peer;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thronglet_env::NodeId;

/// Assumed peer maxima when a peer never advertised them.
pub const DEFAULT_PEER_MAX_FOOD: u32 = 100;
pub const DEFAULT_PEER_MAX_POPULATION: u32 = 50;

/// Selection rules for migration rounds.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationPolicy {
    /// Probability that an eligible creature joins a batch
    pub chance: f64,
    pub max_batch: usize,
    /// Energy must be strictly above this
    pub min_energy: u8,
    /// Age must be strictly above this
    pub min_age: u32,
}

impl Default for MigrationPolicy {
    fn default() -> Self {
        Self {
            chance: 0.1,
            max_batch: 3,
            min_energy: 30,
            min_age: 50,
        }
    }
}

impl MigrationPolicy {
    pub fn is_eligible(&self, creature: &Creature) -> bool {
        !matches!(creature.state, CreatureState::Dying | CreatureState::Reproducing)
            && creature.energy > self.min_energy
            && creature.age > self.min_age
    }

    /// Picks this round's migrants in registry order.
    pub fn select_batch<'a, R: Rng + ?Sized>(
        &self,
        creatures: impl IntoIterator<Item = &'a Creature>,
        rng: &mut R,
    ) -> Vec<CreatureId> {
        let mut batch = Vec::new();
        for creature in creatures {
            if batch.len() >= self.max_batch {
                break;
            }
            if self.is_eligible(creature) && rng.gen_bool(self.chance) {
                batch.push(creature.id);
            }
        }
        batch
    }

    /// Picks one eligible creature at random.
    pub fn pick_random<'a, R: Rng + ?Sized>(
        &self,
        creatures: impl IntoIterator<Item = &'a Creature>,
        rng: &mut R,
    ) -> Option<CreatureId> {
        let eligible: Vec<CreatureId> = creatures
            .into_iter()
            .filter(|c| self.is_eligible(c))
            .map(|c| c.id)
            .collect();
        eligible.choose(rng).copied()
    }
}

/// How attractive `peer` is as a destination, in [0, 1].
pub fn attractiveness(peer: &Peer) -> f64 {
    if peer.population == 0 {
        return 1.0;
    }
    let max_food = f64::from(peer.max_food.unwrap_or(DEFAULT_PEER_MAX_FOOD).max(1));
    let max_population = f64::from(peer.max_population.unwrap_or(DEFAULT_PEER_MAX_POPULATION).max(1));

    let food_score = (f64::from(peer.food) / max_food).min(1.0);
    let room_score = (1.0 - f64::from(peer.population) / max_population).max(0.1);
    0.5 * food_score + 0.5 * room_score
}

/// Highest-scoring peer; the first one wins ties.
pub fn choose_destination(peers: &[Peer]) -> Option<&Peer> {
    let mut best: Option<(&Peer, f64)> = None;
    for peer in peers {
        let score = attractiveness(peer);
        match best {
            Some((_, top)) if score <= top => {}
            _ => best = Some((peer, score)),
        }
    }
    best.map(|(peer, _)| peer)
}

/// One completed migration, as recorded in the migration log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationEvent {
    pub creature_name: String,
    pub creature_id: CreatureId,
    pub from: NodeId,
    pub to: NodeId,
    pub timestamp: f64,
    pub reason: String,
}

/// Result of a single migration attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MigrationOutcome {
    Migrated {
        creature_id: CreatureId,
        creature_name: String,
        destination: NodeId,
    },
    Rejected { reason: String },
    NoPeers,
    NoCandidate,
    Failed { error: String },
}

impl MigrationOutcome {
    pub fn is_migrated(&self) -> bool {
        matches!(self, MigrationOutcome::Migrated { .. })
    }
}
