//! World resource model: food, temperature and capacity shared by every
//! creature on a node.

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

pub const MIN_TEMPERATURE: i32 = 10;
pub const MAX_TEMPERATURE: i32 = 30;

/// Environmental drift and random events run once every this many ticks.
pub const ENVIRONMENT_PERIOD_TICKS: u64 = 60;

/// Probability of a random event on an environment tick.
pub const EVENT_CHANCE: f64 = 0.1;

pub const ABUNDANCE_FOOD: u32 = 20;
pub const SCARCITY_FOOD: u32 = 15;

/// Initial world parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    pub max_food: u32,
    pub max_population: u32,
    pub food_regen_rate: u32,
    pub temperature: i32,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            max_food: 100,
            max_population: 50,
            food_regen_rate: 1,
            temperature: 20,
        }
    }
}

/// Random world event rolled on environment ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorldEvent {
    /// Food +20; the simulation also lifts every creature's happiness.
    Abundance,
    /// Food -15; the simulation also lowers every creature's happiness.
    Scarcity,
}

/// Shared resource counters for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldState {
    pub food: u32,
    pub max_food: u32,
    pub temperature: i32,
    pub population_count: u32,
    pub max_population: u32,
    pub food_regen_rate: u32,
    /// Unix seconds of the last world update
    pub last_update: f64,
}

impl WorldState {
    /// Builds a full-food world from the configuration.
    pub fn new(config: &WorldConfig, now: f64) -> Self {
        Self {
            food: config.max_food,
            max_food: config.max_food,
            temperature: config.temperature.clamp(MIN_TEMPERATURE, MAX_TEMPERATURE),
            population_count: 0,
            max_population: config.max_population,
            food_regen_rate: config.food_regen_rate,
            last_update: now,
        }
    }

    pub fn can_support_creature(&self) -> bool {
        self.population_count < self.max_population
    }

    pub fn has_food(&self) -> bool {
        self.food > 0
    }

    /// Takes `amount` food if that much is available.
    pub fn consume_food(&mut self, amount: u32) -> bool {
        if self.food >= amount {
            self.food -= amount;
            true
        } else {
            false
        }
    }

    pub fn add_food(&mut self, amount: u32) {
        self.food = self.food.saturating_add(amount).min(self.max_food);
    }

    pub fn remove_food(&mut self, amount: u32) {
        self.food = self.food.saturating_sub(amount);
    }

    pub fn shift_temperature(&mut self, delta: i32) {
        self.temperature = self.temperature.saturating_add(delta).clamp(MIN_TEMPERATURE, MAX_TEMPERATURE);
    }

    /// Fraction of capacity in use.
    pub fn population_ratio(&self) -> f64 {
        f64::from(self.population_count) / f64::from(self.max_population.max(1))
    }

    /// Advances the world by one tick.
    ///
    /// Food regenerates every tick. Every [`ENVIRONMENT_PERIOD_TICKS`] the
    /// temperature drifts by up to two degrees and an event may fire; the
    /// event is returned so the caller can apply its effect on creatures.
    pub fn update(&mut self, tick: u64, now: f64, rng: &mut ChaCha8Rng) -> Option<WorldEvent> {
        self.add_food(self.food_regen_rate);
        self.last_update = now;

        if tick == 0 || tick % ENVIRONMENT_PERIOD_TICKS != 0 {
            return None;
        }

        self.shift_temperature(rng.gen_range(-2..=2));

        if !rng.gen_bool(EVENT_CHANCE) {
            return None;
        }
        let event = if rng.gen_bool(0.5) {
            self.add_food(ABUNDANCE_FOOD);
            WorldEvent::Abundance
        } else {
            self.remove_food(SCARCITY_FOOD);
            WorldEvent::Scarcity
        };
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;

    #[test]
    fn test_new_world_is_full() {
        let world = WorldState::new(&WorldConfig::default(), 0.0);
        assert_eq!(world.food, 100);
        assert_eq!(world.temperature, 20);
        assert_eq!(world.population_count, 0);
        assert!(world.can_support_creature());
    }

    #[test]
    fn test_consume_food() {
        let mut world = WorldState::new(&WorldConfig::default(), 0.0);
        world.food = 1;
        assert!(world.consume_food(1));
        assert!(!world.has_food());
        assert!(!world.consume_food(1));
    }

    #[test]
    fn test_regen_is_clamped() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut world = WorldState::new(&WorldConfig::default(), 0.0);
        world.update(1, 1.0, &mut rng);
        assert_eq!(world.food, world.max_food);

        world.food = 50;
        world.update(2, 2.0, &mut rng);
        assert_eq!(world.food, 51);
        assert_eq!(world.last_update, 2.0);
    }

    #[test]
    fn test_capacity() {
        let mut world = WorldState::new(&WorldConfig::default(), 0.0);
        world.population_count = world.max_population;
        assert!(!world.can_support_creature());
    }

    #[test]
    fn test_temperature_clamped() {
        let mut world = WorldState::new(&WorldConfig::default(), 0.0);
        world.shift_temperature(100);
        assert_eq!(world.temperature, MAX_TEMPERATURE);
        world.shift_temperature(-100);
        assert_eq!(world.temperature, MIN_TEMPERATURE);
    }

    proptest! {
        #[test]
        fn prop_update_bounded(seed in any::<u64>(), food in 0u32..=100, temp in 10i32..=30, ticks in 1u64..400) {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let mut world = WorldState::new(&WorldConfig::default(), 0.0);
            world.food = food;
            world.temperature = temp;

            for tick in 1..=ticks {
                let before_food = world.food as i64;
                let before_temp = world.temperature;
                world.update(tick, tick as f64, &mut rng);

                prop_assert!(world.food <= world.max_food);
                prop_assert!((world.food as i64 - before_food) <= (world.food_regen_rate + ABUNDANCE_FOOD) as i64);
                prop_assert!((world.temperature - before_temp).abs() <= 2);
                prop_assert!((MIN_TEMPERATURE..=MAX_TEMPERATURE).contains(&world.temperature));
            }
        }
    }
}
