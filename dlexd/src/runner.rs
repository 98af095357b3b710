//! Runner: the child process that drives one experiment.
//!
//! Lifecycle: `Loading → Initializing → Running ⇄ Paused → {Done, Failed,
//! Terminated}`. Progress goes out over the right pipe end; control messages
//! are polled non-blockingly between training steps, so cancellation is
//! cooperative — a step that never returns cannot be interrupted here.

use std::env;
use std::os::fd::RawFd;
use std::path::PathBuf;

use serde_json::Value;

use crate::bridge::protocol::{ControlMessage, ProgressEvent, RunStatus};
use crate::experiment::{Experiment, LoadedDefinition, StepOutcome};
use crate::pipe::{PipeEndpoint, PipeError, Polled};

/// Environment contract between the spawner and the runner process it
/// launches.
pub const ENV_PIPE_READ_FD: &str = "DLEX_PIPE_READ_FD";
pub const ENV_PIPE_WRITE_FD: &str = "DLEX_PIPE_WRITE_FD";
pub const ENV_DEFINITION_PATH: &str = "DLEX_DEFINITION_PATH";
pub const ENV_HYPERPARAMS: &str = "DLEX_HYPERPARAMS";
pub const ENV_EXPERIMENT_ID: &str = "DLEX_EXPERIMENT_ID";

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub definition_path: PathBuf,
    pub hyperparams: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value in environment variable {name}: {detail}")]
    Invalid { name: &'static str, detail: String },
}

/// Launch data a runner process recovers from its environment.
#[derive(Debug)]
pub struct RunnerProcessEnv {
    pub experiment_id: i64,
    pub pipe_read_fd: RawFd,
    pub pipe_write_fd: RawFd,
    pub config: RunnerConfig,
}

impl RunnerProcessEnv {
    pub fn from_env() -> Result<Self, EnvError> {
        fn var(name: &'static str) -> Result<String, EnvError> {
            env::var(name).map_err(|_| EnvError::Missing(name))
        }

        fn parsed<T: std::str::FromStr>(name: &'static str) -> Result<T, EnvError>
        where
            T::Err: std::fmt::Display,
        {
            var(name)?.parse().map_err(|e: T::Err| EnvError::Invalid {
                name,
                detail: e.to_string(),
            })
        }

        let hyperparams =
            serde_json::from_str(&var(ENV_HYPERPARAMS)?).map_err(|e| EnvError::Invalid {
                name: ENV_HYPERPARAMS,
                detail: e.to_string(),
            })?;

        Ok(Self {
            experiment_id: parsed(ENV_EXPERIMENT_ID)?,
            pipe_read_fd: parsed(ENV_PIPE_READ_FD)?,
            pipe_write_fd: parsed(ENV_PIPE_WRITE_FD)?,
            config: RunnerConfig {
                definition_path: PathBuf::from(var(ENV_DEFINITION_PATH)?),
                hyperparams,
            },
        })
    }
}

/// Loads the definition and runs the experiment to a terminal state.
///
/// A definition that cannot be loaded reports `Status(failed)` and returns
/// cleanly — it is the expected failure of the loading phase, not a crash.
pub async fn run<R, W>(
    endpoint: &mut PipeEndpoint<ControlMessage, ProgressEvent, R, W>,
    config: &RunnerConfig,
) -> Result<(), PipeError>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    endpoint
        .send(ProgressEvent::Status(RunStatus::Loading))
        .await?;

    let definition = match LoadedDefinition::load(&config.definition_path) {
        Ok(definition) => definition,
        Err(e) => {
            tracing::error!(
                path = %config.definition_path.display(),
                error = %e,
                "definition load failed"
            );
            endpoint
                .send(ProgressEvent::Status(RunStatus::Failed))
                .await?;
            return Ok(());
        }
    };

    endpoint
        .send(ProgressEvent::Status(RunStatus::Initializing))
        .await?;
    let experiment = definition.instantiate(&config.hyperparams);

    match drive(endpoint, experiment).await {
        // The spawner exiting under us just ends the run.
        Err(PipeError::PeerGone) => {
            tracing::warn!("spawner end of the pipe is gone, stopping");
            Ok(())
        }
        other => other,
    }
}

/// The `Running ⇄ Paused` heart of the state machine, driving an already
/// instantiated experiment. Separated from [`run`] so it can be exercised
/// without a compiled definition library.
pub async fn drive<R, W>(
    endpoint: &mut PipeEndpoint<ControlMessage, ProgressEvent, R, W>,
    mut experiment: Box<dyn Experiment>,
) -> Result<(), PipeError>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    endpoint
        .send(ProgressEvent::Epoch(experiment.epoch()))
        .await?;
    endpoint
        .send(ProgressEvent::Status(RunStatus::Running))
        .await?;

    let mut paused = false;
    loop {
        if experiment.is_done() {
            break;
        }

        if experiment.should_pause() {
            paused = true;
        } else {
            match experiment.step() {
                Ok(StepOutcome::EpochBoundary) => {
                    endpoint
                        .send(ProgressEvent::Epoch(experiment.epoch()))
                        .await?;
                }
                Ok(StepOutcome::Advanced) => {}
                Err(e) => {
                    tracing::error!(error = %e, "training step failed");
                    endpoint
                        .send(ProgressEvent::Status(RunStatus::Failed))
                        .await?;
                    return Ok(());
                }
            }
            endpoint
                .send(ProgressEvent::Loss(experiment.loss()))
                .await?;
            endpoint
                .send(ProgressEvent::Position(experiment.position()))
                .await?;
        }

        match endpoint.try_recv()? {
            Polled::Received(ControlMessage::Terminate) => {
                endpoint
                    .send(ProgressEvent::Status(RunStatus::Terminated))
                    .await?;
                return Ok(());
            }
            // Stop the loop and let the terminal status report as done;
            // checkpoint persistence belongs to the experiment code.
            Polled::Received(ControlMessage::Save) => break,
            Polled::Received(ControlMessage::Pause) => paused = true,
            Polled::Received(ControlMessage::Unpause) => {}
            Polled::Pending => {}
            Polled::Closed => return Ok(()),
        }

        // Once paused, only unpause is serviced. No training progress, no
        // events.
        while paused {
            match endpoint.recv().await? {
                Some(ControlMessage::Unpause) => paused = false,
                Some(other) => {
                    tracing::debug!(message = ?other, "ignored while paused");
                }
                None => return Ok(()),
            }
        }
    }

    endpoint
        .send(ProgressEvent::Status(RunStatus::Done))
        .await?;
    Ok(())
}
