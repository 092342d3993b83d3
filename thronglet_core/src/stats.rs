//! Population statistics and node message counters.
//!
//! Population stats are computed on demand from the registry; the network
//! counters are lock-free and bumped from every loop and handler task.

use crate::creature::{Creature, CreatureState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// POPULATION
// =============================================================================

/// Age buckets, in ticks.
pub const YOUNG_BELOW: u32 = 200;
pub const ADULT_BELOW: u32 = 700;

/// Aggregate view of a registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PopulationStats {
    pub total_population: usize,
    pub average_age: f64,
    pub average_energy: f64,
    pub average_happiness: f64,
    pub average_hunger: f64,
    pub state_distribution: BTreeMap<String, usize>,
    pub age_distribution: BTreeMap<String, usize>,
    pub happiness_distribution: BTreeMap<String, usize>,
    pub generation_distribution: BTreeMap<u64, usize>,
}

/// Mood bucket for a happiness value.
pub fn mood(happiness: u8) -> &'static str {
    match happiness {
        0..=19 => "miserable",
        20..=39 => "sad",
        40..=59 => "content",
        60..=79 => "happy",
        _ => "ecstatic",
    }
}

fn age_group(age: u32) -> &'static str {
    if age < YOUNG_BELOW {
        "young"
    } else if age < ADULT_BELOW {
        "adult"
    } else {
        "old"
    }
}

impl PopulationStats {
    /// Computes stats over `creatures`.
    pub fn collect<'a>(creatures: impl IntoIterator<Item = &'a Creature>) -> Self {
        let mut stats = Self::default();
        let (mut age, mut energy, mut happiness, mut hunger) = (0u64, 0u64, 0u64, 0u64);

        for c in creatures {
            stats.total_population += 1;
            age += u64::from(c.age);
            energy += u64::from(c.energy);
            happiness += u64::from(c.happiness);
            hunger += u64::from(c.hunger);

            *stats.state_distribution.entry(c.state.to_string()).or_insert(0) += 1;
            *stats.age_distribution.entry(age_group(c.age).to_string()).or_insert(0) += 1;
            *stats.happiness_distribution.entry(mood(c.happiness).to_string()).or_insert(0) += 1;
            *stats.generation_distribution.entry(c.generation()).or_insert(0) += 1;
        }

        if stats.total_population > 0 {
            let n = stats.total_population as f64;
            stats.average_age = age as f64 / n;
            stats.average_energy = energy as f64 / n;
            stats.average_happiness = happiness as f64 / n;
            stats.average_hunger = hunger as f64 / n;
        }
        stats
    }

    /// Count of creatures in `state`.
    pub fn in_state(&self, state: CreatureState) -> usize {
        self.state_distribution.get(state.as_str()).copied().unwrap_or(0)
    }
}

// =============================================================================
// NETWORK COUNTERS
// =============================================================================

/// Message and migration counters for one node.
#[derive(Debug, Default)]
pub struct NetworkCounters {
    sent: AtomicU64,
    received: AtomicU64,
    dropped_malformed: AtomicU64,
    dropped_untrusted: AtomicU64,
    migrations_out: AtomicU64,
    migrations_in: AtomicU64,
    migrations_rejected: AtomicU64,
    migrations_failed: AtomicU64,
}

/// Point-in-time copy of [`NetworkCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub dropped_malformed: u64,
    pub dropped_untrusted: u64,
    pub migrations_out: u64,
    pub migrations_in: u64,
    pub migrations_rejected: u64,
    pub migrations_failed: u64,
}

impl NetworkCounters {
    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.dropped_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_untrusted(&self) {
        self.dropped_untrusted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_migration_out(&self) {
        self.migrations_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_migration_in(&self) {
        self.migrations_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_migration_rejected(&self) {
        self.migrations_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_migration_failed(&self) {
        self.migrations_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            messages_sent: self.sent.load(Ordering::Relaxed),
            messages_received: self.received.load(Ordering::Relaxed),
            dropped_malformed: self.dropped_malformed.load(Ordering::Relaxed),
            dropped_untrusted: self.dropped_untrusted.load(Ordering::Relaxed),
            migrations_out: self.migrations_out.load(Ordering::Relaxed),
            migrations_in: self.migrations_in.load(Ordering::Relaxed),
            migrations_rejected: self.migrations_rejected.load(Ordering::Relaxed),
            migrations_failed: self.migrations_failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::creature::trait_keys;
    use thronglet_env::NodeId;
    use uuid::Uuid;

    fn creature(n: u128, age: u32, happiness: u8) -> Creature {
        let mut c = Creature::new(Uuid::from_u128(n), format!("c{}", n), NodeId::from_seed(1), 0.0);
        c.age = age;
        c.happiness = happiness;
        c
    }

    #[test]
    fn test_empty_population() {
        let stats = PopulationStats::collect(std::iter::empty());
        assert_eq!(stats.total_population, 0);
        assert_eq!(stats.average_energy, 0.0);
        assert!(stats.state_distribution.is_empty());
    }

    #[test]
    fn test_distributions() {
        let mut old = creature(3, 800, 90);
        old.state = CreatureState::Hungry;
        old.set_trait(trait_keys::GENERATION, 2u64);
        let all = vec![creature(1, 10, 10), creature(2, 300, 50), old];

        let stats = PopulationStats::collect(&all);
        assert_eq!(stats.total_population, 3);
        assert_eq!(stats.age_distribution["young"], 1);
        assert_eq!(stats.age_distribution["adult"], 1);
        assert_eq!(stats.age_distribution["old"], 1);
        assert_eq!(stats.happiness_distribution["miserable"], 1);
        assert_eq!(stats.happiness_distribution["content"], 1);
        assert_eq!(stats.happiness_distribution["ecstatic"], 1);
        assert_eq!(stats.generation_distribution[&0], 2);
        assert_eq!(stats.generation_distribution[&2], 1);
        assert_eq!(stats.in_state(CreatureState::Idle), 2);
        assert_eq!(stats.in_state(CreatureState::Hungry), 1);
        assert!((stats.average_age - 370.0).abs() < 1e-9);
    }

    #[test]
    fn test_counters() {
        let counters = NetworkCounters::default();
        counters.record_sent();
        counters.record_sent();
        counters.record_untrusted();
        counters.record_migration_rejected();

        let snap = counters.snapshot();
        assert_eq!(snap.messages_sent, 2);
        assert_eq!(snap.dropped_untrusted, 1);
        assert_eq!(snap.migrations_rejected, 1);
        assert_eq!(snap.migrations_out, 0);
    }
}
