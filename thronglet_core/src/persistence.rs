//! Persistence seam: world snapshots and the migration log.
//!
//! The node only talks to the traits. JSON files are the shipped
//! implementation; in-memory variants back tests and the simulator.

use crate::error::PersistError;
use crate::migration::MigrationEvent;
use crate::simulation::WorldSnapshot;
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

pub const SNAPSHOT_FILE: &str = "world_snapshot.json";
pub const MIGRATION_LOG_FILE: &str = "migrations.jsonl";

/// Events kept in memory for `recent()`.
pub const RECENT_EVENTS: usize = 100;

/// Storage for registry + world snapshots.
pub trait SnapshotStore: Send + Sync {
    /// Loads the last snapshot, if any was saved.
    fn load(&self) -> Result<Option<WorldSnapshot>, PersistError>;

    fn save(&self, snapshot: &WorldSnapshot) -> Result<(), PersistError>;
}

/// Append-only record of completed outbound migrations.
pub trait MigrationLog: Send + Sync {
    fn append(&self, event: MigrationEvent) -> Result<(), PersistError>;

    /// Most recent events, newest last.
    fn recent(&self, limit: usize) -> Vec<MigrationEvent>;
}

// =============================================================================
// SNAPSHOTS
// =============================================================================

/// Pretty-printed JSON snapshot under a data directory.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(SNAPSHOT_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotStore for JsonFileStore {
    fn load(&self) -> Result<Option<WorldSnapshot>, PersistError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let file = File::open(&self.path)?;
        let snapshot = serde_json::from_reader(BufReader::new(file))?;
        Ok(Some(snapshot))
    }

    fn save(&self, snapshot: &WorldSnapshot) -> Result<(), PersistError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        // Readers only ever see a complete file
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp)?;
            serde_json::to_writer_pretty(&mut file, snapshot)?;
            file.flush()?;
        }
        fs::rename(&tmp, &self.path)?;
        debug!("Snapshot saved to {}", self.path.display());
        Ok(())
    }
}

/// Snapshot store kept in memory.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    slot: Mutex<Option<WorldSnapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self) -> Result<Option<WorldSnapshot>, PersistError> {
        Ok(self.slot.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn save(&self, snapshot: &WorldSnapshot) -> Result<(), PersistError> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot.clone());
        Ok(())
    }
}

// =============================================================================
// MIGRATION LOG
// =============================================================================

/// Bounded in-memory ring of events.
#[derive(Debug)]
pub struct MemoryMigrationLog {
    events: Mutex<VecDeque<MigrationEvent>>,
    capacity: usize,
}

impl MemoryMigrationLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    fn push(&self, event: MigrationEvent) {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        events.push_back(event);
        while events.len() > self.capacity {
            events.pop_front();
        }
    }
}

impl Default for MemoryMigrationLog {
    fn default() -> Self {
        Self::new(RECENT_EVENTS)
    }
}

impl MigrationLog for MemoryMigrationLog {
    fn append(&self, event: MigrationEvent) -> Result<(), PersistError> {
        self.push(event);
        Ok(())
    }

    fn recent(&self, limit: usize) -> Vec<MigrationEvent> {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = events.len().saturating_sub(limit);
        events.iter().skip(skip).cloned().collect()
    }
}

/// JSON-lines file with an in-memory tail for `recent()`.
#[derive(Debug)]
pub struct JsonLinesMigrationLog {
    path: PathBuf,
    tail: MemoryMigrationLog,
}

impl JsonLinesMigrationLog {
    /// Opens the log under `data_dir`, loading the existing tail.
    ///
    /// Unparseable lines are skipped.
    pub fn open(data_dir: &Path) -> Result<Self, PersistError> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(MIGRATION_LOG_FILE);
        let tail = MemoryMigrationLog::default();

        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<MigrationEvent>(&line) {
                    Ok(event) => tail.push(event),
                    Err(e) => warn!("Skipping bad migration log line: {}", e),
                }
            }
        }
        Ok(Self { path, tail })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MigrationLog for JsonLinesMigrationLog {
    fn append(&self, event: MigrationEvent) -> Result<(), PersistError> {
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(line.as_bytes())?;
        self.tail.push(event);
        Ok(())
    }

    fn recent(&self, limit: usize) -> Vec<MigrationEvent> {
        self.tail.recent(limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::{Simulation, SimulationSettings};
    use crate::world::WorldConfig;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use thronglet_env::NodeId;
    use uuid::Uuid;

    fn snapshot() -> WorldSnapshot {
        let mut sim = Simulation::new(
            NodeId::from_seed(1),
            &WorldConfig::default(),
            SimulationSettings::default(),
            ChaCha8Rng::seed_from_u64(1),
            0.0,
        );
        sim.add_creature(Some("Saved"), 0.0).unwrap();
        sim.tick(5.0);
        sim.snapshot(5.0)
    }

    fn event(n: u128) -> MigrationEvent {
        MigrationEvent {
            creature_name: format!("c{}", n),
            creature_id: Uuid::from_u128(n),
            from: NodeId::from_seed(1),
            to: NodeId::from_seed(2),
            timestamp: n as f64,
            reason: "exploration".into(),
        }
    }

    #[test]
    fn test_json_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        assert!(store.load().unwrap().is_none());

        let snap = snapshot();
        store.save(&snap).unwrap();
        assert!(store.path().ends_with(SNAPSHOT_FILE));
        assert_eq!(store.load().unwrap(), Some(snap));
    }

    #[test]
    fn test_json_store_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        fs::write(store.path(), "{ truncated").unwrap();
        assert!(matches!(store.load(), Err(PersistError::Json(_))));
    }

    #[test]
    fn test_memory_store() {
        let store = MemorySnapshotStore::new();
        assert!(store.load().unwrap().is_none());
        store.save(&snapshot()).unwrap();
        assert_eq!(store.load().unwrap().unwrap().creatures.len(), 1);
    }

    #[test]
    fn test_memory_log_is_bounded() {
        let log = MemoryMigrationLog::new(3);
        for n in 0..5 {
            log.append(event(n)).unwrap();
        }
        let recent = log.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].creature_id, Uuid::from_u128(2));
        assert_eq!(log.recent(1)[0].creature_id, Uuid::from_u128(4));
    }

    #[test]
    fn test_json_lines_log_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = JsonLinesMigrationLog::open(dir.path()).unwrap();
            log.append(event(1)).unwrap();
            log.append(event(2)).unwrap();
        }
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join(MIGRATION_LOG_FILE))
            .unwrap();
        writeln!(file, "not json").unwrap();

        let reopened = JsonLinesMigrationLog::open(dir.path()).unwrap();
        let recent = reopened.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1], event(2));
    }
}
