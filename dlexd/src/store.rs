//! Interface to the experiment store collaborator.
//!
//! Persistence itself lives outside this crate; the supervision core only
//! needs the narrow surface below. [`MemoryStore`] is the in-memory twin
//! used by tests and single-process wiring.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend failure: {0}")]
    Backend(String),
}

/// One persisted experiment: which definition to run, with which
/// hyperparameters, and the supervisor pid once one is attached.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentRecord {
    pub id: i64,
    pub definition_path: PathBuf,
    pub hyperparams: Value,
    pub pid: Option<u32>,
}

pub trait ExperimentStore: Send + Sync {
    /// Persists a new experiment and returns its id.
    fn create_experiment(
        &self,
        definition_path: &std::path::Path,
        hyperparams: Value,
    ) -> Result<i64, StoreError>;

    fn get_experiment(&self, id: i64) -> Result<Option<ExperimentRecord>, StoreError>;

    /// Returns whether an experiment with that id existed.
    fn delete_experiment(&self, id: i64) -> Result<bool, StoreError>;

    /// Attaches the supervising process id. Returns false for an unknown
    /// experiment.
    fn set_pid(&self, id: i64, pid: u32) -> Result<bool, StoreError>;
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    next_id: i64,
    records: HashMap<i64, ExperimentRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record under a caller-chosen id, replacing any existing
    /// one. For seeding process-local stores from launch arguments.
    pub fn insert(&self, record: ExperimentRecord) {
        let mut inner = self.inner.lock().expect("store mutex");
        inner.next_id = inner.next_id.max(record.id);
        inner.records.insert(record.id, record);
    }
}

impl ExperimentStore for MemoryStore {
    fn create_experiment(
        &self,
        definition_path: &std::path::Path,
        hyperparams: Value,
    ) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().expect("store mutex");
        inner.next_id += 1;
        let id = inner.next_id;
        inner.records.insert(
            id,
            ExperimentRecord {
                id,
                definition_path: definition_path.to_path_buf(),
                hyperparams,
                pid: None,
            },
        );
        Ok(id)
    }

    fn get_experiment(&self, id: i64) -> Result<Option<ExperimentRecord>, StoreError> {
        let inner = self.inner.lock().expect("store mutex");
        Ok(inner.records.get(&id).cloned())
    }

    fn delete_experiment(&self, id: i64) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().expect("store mutex");
        Ok(inner.records.remove(&id).is_some())
    }

    fn set_pid(&self, id: i64, pid: u32) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().expect("store mutex");
        match inner.records.get_mut(&id) {
            Some(record) => {
                record.pid = Some(pid);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
