//! Spawner: daemonized supervisor of one runner process.
//!
//! Flow:
//! 1. Detach from the launching process (new session, null stdio)
//! 2. Connect to the daemon and announce `running(exp_id, pid)`
//! 3. Create the duplex pipe and spawn the runner child with the right end
//! 4. Bridge pipe events up to the daemon and pumped control calls down to
//!    the runner until both channels are closed
//! 5. Reap the runner child
//!
//! The bridging loop is single-threaded and cooperative: it blocks only in
//! the readiness wait, never inside a handler.

use std::io;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::bridge::protocol::{ControlMessage, ProgressEvent};
use crate::pipe::{DuplexPipe, PipeEndpoint, PipeError};
use crate::rpc::{RpcClient, RpcError};
use crate::runner::{
    ENV_DEFINITION_PATH, ENV_EXPERIMENT_ID, ENV_HYPERPARAMS, ENV_PIPE_READ_FD, ENV_PIPE_WRITE_FD,
};
use crate::store::{ExperimentStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum SpawnerError {
    #[error("experiment {0} not found in the store")]
    UnknownExperiment(i64),

    #[error("store refused the pid update for experiment {0}")]
    PidNotRecorded(i64),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The daemon became unreachable mid-bridge. Not retried; fatal to this
    /// spawner.
    #[error("daemon rpc failed: {0}")]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Pipe(#[from] PipeError),

    #[error("failed to launch runner: {0}")]
    Launch(#[from] SpawnError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct SpawnerConfig {
    pub experiment_id: i64,
    /// Daemon endpoint, passed explicitly at every boundary.
    pub socket_path: PathBuf,
}

/// Everything a runner process needs to come up: launch data plus the
/// inherited pipe descriptors.
#[derive(Debug)]
pub struct RunnerLaunch {
    pub experiment_id: i64,
    pub definition_path: PathBuf,
    pub hyperparams: Value,
    pub pipe_read_fd: RawFd,
    pub pipe_write_fd: RawFd,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),

    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for how the runner child comes into being.
pub trait RunnerSpawner: Send + Sync {
    fn spawn(&self, launch: &RunnerLaunch) -> Result<Child, SpawnError>;
}

/// Default spawner: re-executes the current binary's hidden `runner`
/// subcommand, handing over the pipe and launch data through the
/// environment.
pub struct ExecSpawner;

impl RunnerSpawner for ExecSpawner {
    fn spawn(&self, launch: &RunnerLaunch) -> Result<Child, SpawnError> {
        let exe = std::env::current_exe()?;
        let child = Command::new(exe)
            .arg("runner")
            .env(ENV_EXPERIMENT_ID, launch.experiment_id.to_string())
            .env(ENV_PIPE_READ_FD, launch.pipe_read_fd.to_string())
            .env(ENV_PIPE_WRITE_FD, launch.pipe_write_fd.to_string())
            .env(ENV_DEFINITION_PATH, &launch.definition_path)
            .env(ENV_HYPERPARAMS, launch.hyperparams.to_string())
            .stdin(Stdio::null())
            .spawn()?;
        Ok(child)
    }
}

/// Arguments for launching a detached supervisor process.
#[derive(Debug, Clone)]
pub struct DetachedSpawn {
    pub experiment_id: i64,
    pub socket_path: PathBuf,
    pub definition_path: PathBuf,
    pub hyperparams: Value,
}

/// Launches the `supervise` entry point as an independent process: its own
/// session, null stdio, no tie to the caller's lifetime. Returns the
/// supervisor's pid.
pub fn spawn_detached(request: &DetachedSpawn) -> io::Result<u32> {
    use std::os::unix::process::CommandExt;

    let exe = std::env::current_exe()?;
    let mut command = std::process::Command::new(exe);
    command
        .arg("supervise")
        .arg("--experiment-id")
        .arg(request.experiment_id.to_string())
        .arg("--socket")
        .arg(&request.socket_path)
        .arg("--definition")
        .arg(&request.definition_path)
        .arg("--hyperparams")
        .arg(request.hyperparams.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    // Safety: setsid is async-signal-safe and the closure does nothing else
    // between fork and exec.
    unsafe {
        command.pre_exec(|| {
            nix::unistd::setsid()?;
            Ok(())
        });
    }

    let child = command.spawn()?;
    tracing::info!(
        experiment_id = request.experiment_id,
        pid = child.id(),
        "supervisor detached"
    );
    Ok(child.id())
}

/// The supervisor body: announce, spawn the runner, bridge until both
/// channels close, reap the child.
pub async fn run(
    config: SpawnerConfig,
    store: Arc<dyn ExperimentStore>,
    runner_spawner: &dyn RunnerSpawner,
) -> Result<(), SpawnerError> {
    let pid = std::process::id();

    let mut client = RpcClient::connect(&config.socket_path).await?;
    client.running(config.experiment_id, pid).await?;

    if !store.set_pid(config.experiment_id, pid)? {
        return Err(SpawnerError::PidNotRecorded(config.experiment_id));
    }
    let record = store
        .get_experiment(config.experiment_id)?
        .ok_or(SpawnerError::UnknownExperiment(config.experiment_id))?;

    let pipe = DuplexPipe::new()?;
    let (pipe_read_fd, pipe_write_fd) = pipe.inheritable_right_fds()?;
    let mut child = runner_spawner.spawn(&RunnerLaunch {
        experiment_id: config.experiment_id,
        definition_path: record.definition_path,
        hyperparams: record.hyperparams,
        pipe_read_fd,
        pipe_write_fd,
    })?;
    let mut endpoint = pipe.use_left()?;
    tracing::info!(
        experiment_id = config.experiment_id,
        runner_pid = ?child.id(),
        "runner spawned"
    );

    let (control_tx, control_rx) = mpsc::unbounded_channel();
    register_control_handlers(&mut client, &control_tx);

    let outcome = bridge(&mut endpoint, &mut client, config.experiment_id, pid, control_rx).await;

    // Closing our pipe end lets a runner that is still training notice at
    // its next control poll and stop.
    drop(endpoint);
    let status = child.wait().await?;
    tracing::info!(code = ?status.code(), "runner exited");
    outcome
}

/// Registers the control methods the daemon may push at this spawner. Each
/// handler only enqueues; the bridging loop owns the pipe and does the
/// forwarding.
fn register_control_handlers(
    client: &mut RpcClient,
    control_tx: &mpsc::UnboundedSender<ControlMessage>,
) {
    let forwarded = [
        ("pause", ControlMessage::Pause),
        ("unpause", ControlMessage::Unpause),
        ("save", ControlMessage::Save),
    ];
    for (name, message) in forwarded {
        let tx = control_tx.clone();
        client.register(
            name,
            Box::new(move |_args, _kwargs| {
                tx.send(message)
                    .map_err(|_| "control queue closed".to_string())?;
                Ok(json!("ok"))
            }),
        );
    }

    // The terminate handler's return value doubles as the close signal for
    // the bridging loop once the pipe is gone.
    let tx = control_tx.clone();
    client.register(
        "terminate",
        Box::new(move |_args, _kwargs| {
            tx.send(ControlMessage::Terminate)
                .map_err(|_| "control queue closed".to_string())?;
            Ok(json!("terminate"))
        }),
    );
}

/// Bridges one runner pipe and one daemon connection until both are closed.
///
/// Loss and epoch events become `set_loss`/`set_epoch` calls; a terminal
/// status triggers the `done(exp_id, pid)` round-trip, and a `"terminate"`
/// reply closes the RPC side. Pumped control calls are forwarded down the
/// pipe. A broken pipe write means the runner is gone — the pipe is marked
/// closed, nothing is retried.
pub async fn bridge<R, W>(
    pipe: &mut PipeEndpoint<ProgressEvent, ControlMessage, R, W>,
    client: &mut RpcClient,
    experiment_id: i64,
    pid: u32,
    mut control_rx: mpsc::UnboundedReceiver<ControlMessage>,
) -> Result<(), SpawnerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut pipe_open = true;
    let mut rpc_open = true;

    while pipe_open || rpc_open {
        tokio::select! {
            event = pipe.recv(), if pipe_open => match event? {
                None => {
                    tracing::debug!("pipe end of stream");
                    pipe_open = false;
                }
                Some(ProgressEvent::Loss(loss)) => {
                    if rpc_open {
                        client.set_loss(experiment_id, loss).await?;
                    }
                }
                Some(ProgressEvent::Epoch(epoch)) => {
                    if rpc_open {
                        client.set_epoch(experiment_id, epoch).await?;
                    }
                }
                Some(ProgressEvent::Position(position)) => {
                    tracing::trace!(%position, "runner position");
                }
                Some(ProgressEvent::Status(status)) if status.is_terminal() && rpc_open => {
                    tracing::info!(%status, "runner reached a terminal state");
                    let reply = client.done(experiment_id, pid).await?;
                    if reply.as_str() == Some("terminate") {
                        client.close().await;
                        rpc_open = false;
                    }
                }
                Some(ProgressEvent::Status(status)) => {
                    tracing::debug!(%status, "runner status");
                }
            },

            pumped = client.pump_one(), if rpc_open => match pumped {
                Ok(pumped) => {
                    tracing::debug!(method = %pumped.method, "pumped control call");
                    while let Ok(message) = control_rx.try_recv() {
                        if !pipe_open {
                            continue;
                        }
                        match pipe.send(message).await {
                            Ok(()) => {}
                            Err(PipeError::PeerGone) => {
                                tracing::warn!("runner gone, dropping control message");
                                pipe_open = false;
                            }
                            Err(e) => return Err(e.into()),
                        }
                    }
                    // With no runner left to acknowledge, the terminate
                    // handler's reply is the whole exchange: close up.
                    if !pipe_open
                        && pumped.method == "terminate"
                        && matches!(&pumped.outcome, Ok(v) if v.as_str() == Some("terminate"))
                    {
                        client.close().await;
                        rpc_open = false;
                    }
                }
                Err(RpcError::ConnectionClosed) => {
                    tracing::debug!("daemon closed the rpc connection");
                    rpc_open = false;
                }
                Err(e) => return Err(e.into()),
            },
        }
    }

    Ok(())
}
