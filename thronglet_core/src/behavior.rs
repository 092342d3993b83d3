//! Behavior engine: a finite-state machine advancing one creature one step.
//!
//! ```text
//!            hunger > 70            food > 0
//!   ┌──────┐ ─────────────▶ ┌────────┐ ───────▶ ┌────────┐
//!   │ Idle │                │ Hungry │          │ Eating │
//!   └──────┘ ◀───────────── └────────┘          └────────┘
//!     │  ▲     hunger <= 30                          │
//!     │  └───────────────────────────────────────────┘
//!     │  ▲
//!     ▼  │ (spawn request)         any state, age >= max_age
//!  ┌─────────────┐                  or energy == 0
//!  │ Reproducing │                ─────────────────▶ ┌───────┐
//!  └─────────────┘                                    │ Dying │ (terminal)
//!                                                     └───────┘
//! ```
//!
//! Each state is a [`BehaviorState`] handler looked up from a static table.
//! Offspring are never inserted here: Reproducing pushes a [`SpawnRequest`]
//! that the tick scheduler materializes after cleanup.

use crate::creature::{trait_keys, Creature, CreatureId, CreatureState};
use crate::error::SimulationError;
use crate::world::WorldState;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use thronglet_env::NodeId;
use tracing::debug;

pub const HUNGER_THRESHOLD: u8 = 70;
pub const SATED_THRESHOLD: u8 = 30;
pub const REPRODUCTION_MIN_AGE: u32 = 100;
pub const REPRODUCTION_MIN_ENERGY: u8 = 50;
pub const REPRODUCTION_MIN_HAPPINESS: u8 = 60;
pub const REPRODUCTION_COOLDOWN_SECS: f64 = 300.0;

/// Smallest lifespan an offspring can inherit.
pub const MIN_OFFSPRING_MAX_AGE: i64 = 500;

/// Request to create one offspring, consumed by the tick scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnRequest {
    pub name: String,
    pub max_age: u32,
    pub energy: u8,
    pub happiness: u8,
    pub parent_id: CreatureId,
    pub parent_generation: u64,
}

impl SpawnRequest {
    /// Derives an offspring request from its parent.
    pub fn from_parent(parent: &Creature, now: f64, rng: &mut ChaCha8Rng) -> Self {
        let suffix = (now.max(0.0) as u64) % 1000;
        let variance: i64 = rng.gen_range(-50..50);
        let max_age = (i64::from(parent.max_age) + variance).max(MIN_OFFSPRING_MAX_AGE);
        let jitter: i32 = rng.gen_range(-5..=5);
        let happiness = (i32::from(parent.happiness.clamp(30, 70)) + jitter).clamp(0, 100);

        Self {
            name: format!("{}-Jr-{}", parent.name, suffix),
            max_age: u32::try_from(max_age).unwrap_or(u32::MAX),
            energy: parent.energy.saturating_add(10).min(100),
            happiness: happiness as u8,
            parent_id: parent.id,
            parent_generation: parent.generation(),
        }
    }

    /// Builds the offspring creature, owned by `home_node`.
    pub fn into_creature(self, id: CreatureId, home_node: NodeId, now: f64) -> Creature {
        let mut child = Creature::new(id, self.name, home_node, now);
        child.max_age = self.max_age;
        child.energy = self.energy;
        child.happiness = self.happiness;
        child.set_trait(trait_keys::GENERATION, self.parent_generation + 1);
        child.set_trait(trait_keys::PARENT_ID, self.parent_id.to_string());
        child.set_trait(trait_keys::BIRTH_TIME, now);
        child
    }
}

/// Everything a handler may touch besides the creature itself.
pub struct StepContext<'a> {
    pub world: &'a mut WorldState,
    /// Unix seconds
    pub now: f64,
    pub rng: &'a mut ChaCha8Rng,
    pub offspring: &'a mut Vec<SpawnRequest>,
}

/// One behavior state.
pub trait BehaviorState: Send + Sync {
    /// Runs once when the creature enters this state.
    fn enter(&self, creature: &mut Creature, ctx: &mut StepContext<'_>);

    /// Runs every tick; returns the next state when a transition is due.
    fn update(&self, creature: &mut Creature, ctx: &mut StepContext<'_>) -> Option<CreatureState>;

    /// Runs once when the creature leaves this state.
    fn exit(&self, _creature: &mut Creature, _ctx: &mut StepContext<'_>) {}
}

struct IdleState;
struct HungryState;
struct EatingState;
struct ReproducingState;
struct DyingState;

impl BehaviorState for IdleState {
    fn enter(&self, creature: &mut Creature, _ctx: &mut StepContext<'_>) {
        creature.adjust_energy(-1);
    }

    fn update(&self, creature: &mut Creature, ctx: &mut StepContext<'_>) -> Option<CreatureState> {
        if creature.should_die() {
            return Some(CreatureState::Dying);
        }
        if creature.hunger > HUNGER_THRESHOLD && ctx.world.has_food() {
            return Some(CreatureState::Hungry);
        }
        let rested = ctx.now - creature.last_reproduced > REPRODUCTION_COOLDOWN_SECS;
        if creature.age > REPRODUCTION_MIN_AGE
            && creature.energy > REPRODUCTION_MIN_ENERGY
            && creature.happiness > REPRODUCTION_MIN_HAPPINESS
            && ctx.world.can_support_creature()
            && rested
        {
            return Some(CreatureState::Reproducing);
        }
        None
    }
}

impl BehaviorState for HungryState {
    fn enter(&self, creature: &mut Creature, _ctx: &mut StepContext<'_>) {
        creature.adjust_happiness(-5);
        creature.adjust_energy(-2);
    }

    fn update(&self, creature: &mut Creature, ctx: &mut StepContext<'_>) -> Option<CreatureState> {
        if creature.should_die() {
            Some(CreatureState::Dying)
        } else if ctx.world.has_food() {
            Some(CreatureState::Eating)
        } else if creature.hunger <= SATED_THRESHOLD {
            Some(CreatureState::Idle)
        } else {
            None
        }
    }
}

impl BehaviorState for EatingState {
    fn enter(&self, creature: &mut Creature, ctx: &mut StepContext<'_>) {
        if ctx.world.consume_food(1) {
            creature.adjust_hunger(-30);
            creature.adjust_energy(10);
            creature.adjust_happiness(5);
            creature.last_fed = ctx.now;
        } else {
            creature.adjust_happiness(-10);
        }
    }

    fn update(&self, creature: &mut Creature, _ctx: &mut StepContext<'_>) -> Option<CreatureState> {
        if creature.should_die() {
            Some(CreatureState::Dying)
        } else {
            Some(CreatureState::Idle)
        }
    }
}

impl BehaviorState for ReproducingState {
    fn enter(&self, creature: &mut Creature, ctx: &mut StepContext<'_>) {
        creature.adjust_energy(-20);
        creature.adjust_happiness(15);
        creature.last_reproduced = ctx.now;
    }

    fn update(&self, creature: &mut Creature, ctx: &mut StepContext<'_>) -> Option<CreatureState> {
        if creature.should_die() {
            return Some(CreatureState::Dying);
        }
        if ctx.world.can_support_creature() {
            let request = SpawnRequest::from_parent(creature, ctx.now, ctx.rng);
            debug!("{} requests offspring {}", creature.name, request.name);
            ctx.offspring.push(request);
        }
        Some(CreatureState::Idle)
    }
}

impl BehaviorState for DyingState {
    fn enter(&self, creature: &mut Creature, ctx: &mut StepContext<'_>) {
        let cause = creature.death_cause_now();
        creature.energy = 0;
        creature.adjust_happiness(-20);
        creature.set_trait(trait_keys::DEATH_CAUSE, cause.as_str());
        creature.set_trait(trait_keys::DEATH_TIME, ctx.now);
    }

    fn update(&self, _creature: &mut Creature, _ctx: &mut StepContext<'_>) -> Option<CreatureState> {
        None
    }
}

fn handler(state: CreatureState) -> &'static dyn BehaviorState {
    match state {
        CreatureState::Idle => &IdleState,
        CreatureState::Hungry => &HungryState,
        CreatureState::Eating => &EatingState,
        CreatureState::Reproducing => &ReproducingState,
        CreatureState::Dying => &DyingState,
    }
}

/// Dispatches creatures to their state handlers and counts transitions.
#[derive(Debug, Default, Clone)]
pub struct BehaviorFsm {
    transitions: BTreeMap<(CreatureState, CreatureState), u64>,
}

impl BehaviorFsm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances `creature` by one step.
    ///
    /// # Returns
    /// The new state if a transition happened. Invalid records are rejected
    /// before anything is mutated.
    pub fn update_creature(
        &mut self,
        creature: &mut Creature,
        ctx: &mut StepContext<'_>,
    ) -> Result<Option<CreatureState>, SimulationError> {
        creature.validate()?;

        match handler(creature.state).update(creature, ctx) {
            Some(next) if next != creature.state => {
                self.transition(creature, next, ctx);
                Ok(Some(next))
            }
            _ => Ok(None),
        }
    }

    /// Moves `creature` to `target` through the normal exit/enter path.
    ///
    /// Returns `false` without touching the creature when it is Dying or
    /// already in `target`.
    pub fn force_transition(
        &mut self,
        creature: &mut Creature,
        target: CreatureState,
        ctx: &mut StepContext<'_>,
    ) -> Result<bool, SimulationError> {
        creature.validate()?;
        if creature.state == CreatureState::Dying || creature.state == target {
            return Ok(false);
        }
        self.transition(creature, target, ctx);
        Ok(true)
    }

    fn transition(&mut self, creature: &mut Creature, next: CreatureState, ctx: &mut StepContext<'_>) {
        let from = creature.state;
        handler(from).exit(creature, ctx);
        creature.state = next;
        handler(next).enter(creature, ctx);
        *self.transitions.entry((from, next)).or_insert(0) += 1;
        debug!("{}: {} -> {}", creature.name, from, next);
    }

    pub fn transition_count(&self, from: CreatureState, to: CreatureState) -> u64 {
        self.transitions.get(&(from, to)).copied().unwrap_or(0)
    }

    /// Transition counts keyed `"from->to"`.
    pub fn transition_stats(&self) -> BTreeMap<String, u64> {
        self.transitions
            .iter()
            .map(|((from, to), count)| (format!("{}->{}", from, to), *count))
            .collect()
    }

    pub fn reset_stats(&mut self) {
        self.transitions.clear();
    }
}
