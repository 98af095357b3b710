//! Control-plane caller: run, observe, and steer experiments from outside
//! the daemon's process tree.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;

use crate::rpc::{RpcClient, RpcError};
use crate::store::{ExperimentStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("experiment {0} not found")]
    UnknownExperiment(i64),

    #[error("failed to reach the daemon: {0}")]
    Connect(#[from] std::io::Error),
}

/// Combined live + persisted view of one experiment.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentStatus {
    pub experiment_id: i64,
    pub definition_path: PathBuf,
    /// Daemon's live status, if it knows the experiment.
    pub status: Option<String>,
    pub loss: Option<f64>,
    pub epoch: Option<u64>,
    pub pid: Option<u32>,
    /// Whether the supervising process answers a `kill(pid, 0)` probe.
    pub supervisor_alive: bool,
}

/// Issues `run`/`status`/`pause` style operations against a daemon whose
/// endpoint is passed in explicitly.
pub struct ControlClient {
    store: Arc<dyn ExperimentStore>,
    socket_path: PathBuf,
}

impl ControlClient {
    pub fn new(store: Arc<dyn ExperimentStore>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            store,
            socket_path: socket_path.into(),
        }
    }

    async fn connect(&self) -> Result<RpcClient, ClientError> {
        Ok(RpcClient::connect(&self.socket_path).await?)
    }

    /// Persists a new experiment and asks the daemon to launch a supervisor
    /// for it. Returns the experiment id.
    pub async fn run(
        &self,
        definition_path: &Path,
        hyperparams: Value,
    ) -> Result<i64, ClientError> {
        let experiment_id = self.store.create_experiment(definition_path, hyperparams)?;
        let mut rpc = self.connect().await?;
        rpc.run(experiment_id).await?;
        tracing::info!(experiment_id, "experiment submitted");
        Ok(experiment_id)
    }

    /// Live metrics merged with the persisted record. A daemon that does not
    /// know the experiment yields `None` fields rather than an error — the
    /// record may predate the daemon or outlive its supervisor.
    pub async fn status(&self, experiment_id: i64) -> Result<ExperimentStatus, ClientError> {
        let record = self
            .store
            .get_experiment(experiment_id)?
            .ok_or(ClientError::UnknownExperiment(experiment_id))?;

        let mut rpc = self.connect().await?;
        let status = optional(rpc.get_status(experiment_id).await)?
            .and_then(|v| v.as_str().map(str::to_owned));
        let loss = optional(rpc.get_loss(experiment_id).await)?.and_then(|v| v.as_f64());
        let epoch = optional(rpc.get_epoch(experiment_id).await)?.and_then(|v| v.as_u64());

        let pid = record.pid;
        Ok(ExperimentStatus {
            experiment_id,
            definition_path: record.definition_path,
            status,
            loss,
            epoch,
            pid,
            supervisor_alive: pid.is_some_and(process_alive),
        })
    }

    pub async fn pause(&self, experiment_id: i64) -> Result<(), ClientError> {
        self.connect().await?.pause(experiment_id).await?;
        Ok(())
    }

    pub async fn unpause(&self, experiment_id: i64) -> Result<(), ClientError> {
        self.connect().await?.unpause(experiment_id).await?;
        Ok(())
    }

    /// Requests termination. Advisory: the runner acknowledges through its
    /// own status trail, polled between training steps.
    pub async fn terminate(&self, experiment_id: i64) -> Result<(), ClientError> {
        self.connect().await?.terminate(experiment_id).await?;
        Ok(())
    }
}

fn optional(result: Result<Value, RpcError>) -> Result<Option<Value>, ClientError> {
    match result {
        Ok(Value::Null) => Ok(None),
        Ok(value) => Ok(Some(value)),
        // The daemon not knowing the experiment is an absence, not a fault.
        Err(RpcError::Remote(_) | RpcError::UnknownMethod) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Null-signal liveness probe for a supervisor pid.
pub fn process_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}
