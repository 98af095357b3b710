//! dlexd: supervision daemon and control plane for dlex training
//! experiments.
//!
//! Three processes cooperate, with no shared memory: the control client
//! (ephemeral), the spawner (a detached supervisor, one per running
//! experiment), and the runner (the spawner's child, driving user training
//! code loaded as a plugin). Coordination is message passing only — a
//! versioned length-prefixed protocol over unix sockets (spawner/client ⇄
//! daemon) and over an anonymous duplex pipe (spawner ⇄ runner).

pub mod bridge;
pub mod client;
pub mod daemon;
pub mod experiment;
pub mod pipe;
pub mod rpc;
pub mod runner;
pub mod spawner;
pub mod store;

pub use bridge::codec::{MessageCodec, PROTOCOL_VERSION, ProtocolError};
pub use bridge::protocol::{ControlMessage, ProgressEvent, RpcMessage, RunStatus};
pub use client::{ControlClient, ExperimentStatus, process_alive};
pub use daemon::{Daemon, DaemonConfig, DetachedLauncher, SpawnerLauncher};
pub use experiment::{
    Experiment, ExperimentDecl, LoadError, LoadedDefinition, StepError, StepOutcome,
};
pub use pipe::{DuplexPipe, LeftEndpoint, PipeEndpoint, PipeError, Polled, RightEndpoint};
pub use rpc::{RpcClient, RpcError, RpcServer};
pub use runner::RunnerConfig;
pub use spawner::{ExecSpawner, RunnerSpawner, SpawnerConfig, SpawnerError, spawn_detached};
pub use store::{ExperimentRecord, ExperimentStore, MemoryStore};
