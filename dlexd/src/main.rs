//! dlexd process entry points.
//!
//! `daemon` is the long-lived RPC peer. `supervise` and `runner` are
//! internal: `supervise` is what [`dlexd::spawn_detached`] re-executes into
//! its own session, and `runner` is the child a supervisor spawns with the
//! pipe descriptors in its environment. The user-facing CLI lives elsewhere
//! and talks to the daemon through [`dlexd::ControlClient`].

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use dlexd::daemon::{Daemon, DaemonConfig, DetachedLauncher};
use dlexd::pipe::RightEndpoint;
use dlexd::runner::RunnerProcessEnv;
use dlexd::spawner::{ExecSpawner, SpawnerConfig};
use dlexd::store::{ExperimentRecord, ExperimentStore, MemoryStore};

#[derive(Parser)]
#[command(
    name = "dlexd",
    version = env!("CARGO_PKG_VERSION"),
    about = "dlex experiment supervision daemon"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the central daemon on a unix socket.
    Daemon {
        /// Endpoint path; must not already exist.
        #[arg(long)]
        socket: PathBuf,
    },

    /// Supervise one experiment (internal; launched detached by `run`).
    #[command(hide = true)]
    Supervise {
        #[arg(long)]
        experiment_id: i64,
        #[arg(long)]
        socket: PathBuf,
        #[arg(long)]
        definition: PathBuf,
        #[arg(long, default_value = "{}")]
        hyperparams: String,
    },

    /// Drive one experiment (internal; spawned by a supervisor with pipe
    /// descriptors in the environment).
    #[command(hide = true)]
    Runner,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        Command::Daemon { socket } => {
            let store: Arc<dyn ExperimentStore> = Arc::new(MemoryStore::new());
            let daemon = Daemon::build(
                &DaemonConfig {
                    socket_path: socket,
                },
                store,
                Arc::new(DetachedLauncher),
            )
            .context("failed to bind the daemon socket")?;
            daemon.serve().await.context("daemon stopped")?;
        }

        Command::Supervise {
            experiment_id,
            socket,
            definition,
            hyperparams,
        } => {
            let hyperparams =
                serde_json::from_str(&hyperparams).context("invalid --hyperparams JSON")?;

            // Persistent storage is a collaborator; this process carries its
            // launch data as a seeded in-memory record.
            let store = MemoryStore::new();
            store.insert(ExperimentRecord {
                id: experiment_id,
                definition_path: definition,
                hyperparams,
                pid: None,
            });

            dlexd::spawner::run(
                SpawnerConfig {
                    experiment_id,
                    socket_path: socket,
                },
                Arc::new(store),
                &ExecSpawner,
            )
            .await
            .context("supervisor failed")?;
        }

        Command::Runner => {
            let env = RunnerProcessEnv::from_env().context("runner environment incomplete")?;
            let mut endpoint = RightEndpoint::from_inherited_fds(env.pipe_read_fd, env.pipe_write_fd)
                .context("failed to adopt the pipe descriptors")?;
            tracing::info!(experiment_id = env.experiment_id, "runner starting");
            dlexd::runner::run(&mut endpoint, &env.config)
                .await
                .context("runner failed")?;
        }
    }

    Ok(())
}
