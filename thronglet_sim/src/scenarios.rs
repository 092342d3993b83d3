//! Cluster scenarios for deterministic simulation testing.

use serde::Serialize;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// SIM-001: Nodes find each other from cold start
    Bootstrap,

    /// SIM-002: Creatures move between nodes and arrive intact
    Migration,

    /// SIM-003: A full node refuses migrants, sources keep them
    Capacity,

    /// SIM-004: Nodes crash and recover, directories follow
    Churn,

    /// SIM-005: Hours of virtual time with invariants checked every step
    LongRun,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Bootstrap,
            ScenarioId::Migration,
            ScenarioId::Capacity,
            ScenarioId::Churn,
            ScenarioId::LongRun,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Bootstrap => "bootstrap",
            ScenarioId::Migration => "migration",
            ScenarioId::Capacity => "capacity",
            ScenarioId::Churn => "churn",
            ScenarioId::LongRun => "long_run",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Bootstrap => "Cold start, every node discovers every other node",
            ScenarioId::Migration => "Forced and scheduled migrations, no creature lost or duplicated",
            ScenarioId::Capacity => "Migrants sent to a full node are rejected and stay home",
            ScenarioId::Churn => "Crashed nodes are purged after the peer timeout and rejoin on recovery",
            ScenarioId::LongRun => "Long run under packet loss, invariants checked after every step",
        }
    }

    /// Number of nodes the scenario builds when not overridden.
    pub fn default_nodes(&self) -> usize {
        match self {
            ScenarioId::Bootstrap => 5,
            ScenarioId::Migration => 3,
            ScenarioId::Capacity => 2,
            ScenarioId::Churn => 4,
            ScenarioId::LongRun => 4,
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bootstrap" | "sim-001" => Ok(ScenarioId::Bootstrap),
            "migration" | "sim-002" => Ok(ScenarioId::Migration),
            "capacity" | "sim-003" => Ok(ScenarioId::Capacity),
            "churn" | "sim-004" => Ok(ScenarioId::Churn),
            "long_run" | "longrun" | "sim-005" => Ok(ScenarioId::LongRun),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_parse_back() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>(), Ok(scenario));
            assert_eq!(scenario.to_string(), scenario.name());
        }
    }

    #[test]
    fn test_aliases_and_unknown() {
        assert_eq!("LongRun".parse::<ScenarioId>(), Ok(ScenarioId::LongRun));
        assert_eq!("SIM-003".parse::<ScenarioId>(), Ok(ScenarioId::Capacity));
        assert!("split_brain".parse::<ScenarioId>().is_err());
    }
}
