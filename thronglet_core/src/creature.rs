//! The creature model.
//!
//! A creature is plain data: vitals, lifespan, behavior state and a
//! free-form provenance map. All mutation of vitals goes through the
//! clamping helpers so the [0, 100] invariant cannot be broken.

use crate::error::SimulationError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thronglet_env::NodeId;
use uuid::Uuid;

/// Opaque creature identity.
pub type CreatureId = Uuid;

/// Free-form provenance map carried with a creature across nodes.
pub type Traits = BTreeMap<String, Value>;

/// Upper bound shared by energy, happiness and hunger.
pub const VITAL_MAX: u8 = 100;

/// Default lifespan ceiling in ticks.
pub const DEFAULT_MAX_AGE: u32 = 1000;

/// Well-known keys in the trait map.
pub mod trait_keys {
    pub const GENERATION: &str = "generation";
    pub const PARENT_ID: &str = "parent_id";
    pub const BIRTH_TIME: &str = "birth_time";
    pub const MIGRATION_COUNT: &str = "migration_count";
    pub const LAST_MIGRATION: &str = "last_migration";
    pub const MIGRATED_FROM: &str = "migrated_from";
    pub const DEATH_CAUSE: &str = "death_cause";
    pub const DEATH_TIME: &str = "death_time";
}

/// Behavior state of a creature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreatureState {
    Idle,
    Hungry,
    Eating,
    Reproducing,
    Dying,
}

impl CreatureState {
    /// Every state, in declaration order.
    pub const ALL: [CreatureState; 5] = [
        CreatureState::Idle,
        CreatureState::Hungry,
        CreatureState::Eating,
        CreatureState::Reproducing,
        CreatureState::Dying,
    ];

    /// Returns the wire name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            CreatureState::Idle => "idle",
            CreatureState::Hungry => "hungry",
            CreatureState::Eating => "eating",
            CreatureState::Reproducing => "reproducing",
            CreatureState::Dying => "dying",
        }
    }
}

impl std::fmt::Display for CreatureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a creature entered Dying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeathCause {
    OldAge,
    Starvation,
}

impl DeathCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeathCause::OldAge => "old_age",
            DeathCause::Starvation => "starvation",
        }
    }
}

/// One simulated creature.
///
/// This is also the full snapshot sent as `creature_data` during migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Creature {
    pub id: CreatureId,
    pub name: String,

    /// Ticks survived
    pub age: u32,

    pub energy: u8,
    pub happiness: u8,
    pub hunger: u8,

    /// Lifespan ceiling in ticks
    pub max_age: u32,

    pub state: CreatureState,

    /// Node whose registry owns this creature
    pub home_node: NodeId,

    #[serde(default)]
    pub traits: Traits,

    /// Unix seconds of the last successful meal
    pub last_fed: f64,

    /// Unix seconds of the last reproduction (0 = never)
    #[serde(default)]
    pub last_reproduced: f64,
}

fn clamp_vital(value: u8, delta: i32) -> u8 {
    (i32::from(value) + delta).clamp(0, i32::from(VITAL_MAX)) as u8
}

impl Creature {
    /// Creates a creature with default vitals, owned by `home_node`.
    pub fn new(id: CreatureId, name: impl Into<String>, home_node: NodeId, now: f64) -> Self {
        Self {
            id,
            name: name.into(),
            age: 0,
            energy: VITAL_MAX,
            happiness: 50,
            hunger: 0,
            max_age: DEFAULT_MAX_AGE,
            state: CreatureState::Idle,
            home_node,
            traits: Traits::new(),
            last_fed: now,
            last_reproduced: 0.0,
        }
    }

    pub fn adjust_energy(&mut self, delta: i32) {
        self.energy = clamp_vital(self.energy, delta);
    }

    pub fn adjust_happiness(&mut self, delta: i32) {
        self.happiness = clamp_vital(self.happiness, delta);
    }

    pub fn adjust_hunger(&mut self, delta: i32) {
        self.hunger = clamp_vital(self.hunger, delta);
    }

    /// True when the creature has outlived its lifespan or run out of energy.
    pub fn should_die(&self) -> bool {
        self.age >= self.max_age || self.energy == 0
    }

    /// Cause of death if the creature died right now.
    pub fn death_cause_now(&self) -> DeathCause {
        if self.age >= self.max_age {
            DeathCause::OldAge
        } else {
            DeathCause::Starvation
        }
    }

    /// Fraction of lifespan consumed.
    pub fn age_ratio(&self) -> f64 {
        f64::from(self.age) / f64::from(self.max_age.max(1))
    }

    /// Rejects records the behavior engine cannot safely step.
    pub fn validate(&self) -> Result<(), SimulationError> {
        let reason = if self.max_age == 0 {
            Some("max_age is zero".to_string())
        } else if self.energy > VITAL_MAX || self.happiness > VITAL_MAX || self.hunger > VITAL_MAX {
            Some(format!(
                "vitals out of range (energy={}, happiness={}, hunger={})",
                self.energy, self.happiness, self.hunger
            ))
        } else {
            None
        };

        match reason {
            Some(reason) => Err(SimulationError::InvalidCreature { id: self.id, reason }),
            None => Ok(()),
        }
    }

    /// Sets a provenance trait.
    pub fn set_trait(&mut self, key: &str, value: impl Into<Value>) {
        self.traits.insert(key.to_string(), value.into());
    }

    /// Generation number (0 for manually added creatures).
    pub fn generation(&self) -> u64 {
        self.traits
            .get(trait_keys::GENERATION)
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    pub fn parent_id(&self) -> Option<CreatureId> {
        self.traits
            .get(trait_keys::PARENT_ID)
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    /// Number of completed migrations.
    pub fn migration_count(&self) -> u64 {
        self.traits
            .get(trait_keys::MIGRATION_COUNT)
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    /// Recorded cause of death, once the creature entered Dying.
    pub fn death_cause(&self) -> Option<&str> {
        self.traits.get(trait_keys::DEATH_CAUSE).and_then(Value::as_str)
    }

    /// Short form used by listings.
    pub fn summary(&self) -> CreatureSummary {
        CreatureSummary {
            id: self.id,
            name: self.name.clone(),
            age: self.age,
            max_age: self.max_age,
            energy: self.energy,
            hunger: self.hunger,
            happiness: self.happiness,
            state: self.state,
            generation: self.generation(),
        }
    }
}

/// Listing row for `list_agents`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatureSummary {
    pub id: CreatureId,
    pub name: String,
    pub age: u32,
    pub max_age: u32,
    pub energy: u8,
    pub hunger: u8,
    pub happiness: u8,
    pub state: CreatureState,
    pub generation: u64,
}
