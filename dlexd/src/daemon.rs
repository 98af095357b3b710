//! The central daemon: RPC peer for spawners and control-plane clients.
//!
//! Keeps a live-status table for every supervised experiment and routes
//! control requests (`pause`, `unpause`, `save`, `terminate`) down the
//! socket of the spawner that announced itself with `running`. Persistent
//! state stays in the experiment store collaborator; the table here is the
//! daemon's in-memory view of what is currently running.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};

use crate::rpc::{ConnId, PeerSender, RpcServer};
use crate::spawner::{DetachedSpawn, spawn_detached};
use crate::store::ExperimentStore;

/// Launches supervisors for `run` requests. Abstracted so tests can record
/// launches instead of detaching real processes.
pub trait SpawnerLauncher: Send + Sync {
    fn launch(&self, request: &DetachedSpawn) -> io::Result<u32>;
}

/// Default launcher: a detached supervisor process per experiment.
pub struct DetachedLauncher;

impl SpawnerLauncher for DetachedLauncher {
    fn launch(&self, request: &DetachedSpawn) -> io::Result<u32> {
        spawn_detached(request)
    }
}

#[derive(Debug, Clone)]
struct LiveExperiment {
    status: String,
    loss: Option<f64>,
    epoch: Option<u64>,
    pid: Option<u32>,
    conn: Option<ConnId>,
}

impl LiveExperiment {
    fn launching() -> Self {
        Self {
            status: "launching".to_string(),
            loss: None,
            epoch: None,
            pid: None,
            conn: None,
        }
    }
}

type LiveTable = Arc<Mutex<HashMap<i64, LiveExperiment>>>;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
}

pub struct Daemon {
    server: RpcServer,
}

impl Daemon {
    /// Binds the daemon socket and wires up the full method surface.
    pub fn build(
        config: &DaemonConfig,
        store: Arc<dyn ExperimentStore>,
        launcher: Arc<dyn SpawnerLauncher>,
    ) -> io::Result<Self> {
        let mut server = RpcServer::bind(&config.socket_path)?;
        let live: LiveTable = Arc::default();
        let peers = server.peer_sender();
        let socket_path = config.socket_path.clone();

        register_handlers(&mut server, store, launcher, live, peers, socket_path);
        Ok(Self { server })
    }

    pub fn path(&self) -> &std::path::Path {
        self.server.path()
    }

    pub async fn serve(self) -> io::Result<()> {
        self.server.serve().await
    }
}

fn arg_i64(args: &[Value], index: usize, name: &str) -> Result<i64, String> {
    args.get(index)
        .and_then(Value::as_i64)
        .ok_or_else(|| format!("argument {index} ({name}) must be an integer"))
}

fn register_handlers(
    server: &mut RpcServer,
    store: Arc<dyn ExperimentStore>,
    launcher: Arc<dyn SpawnerLauncher>,
    live: LiveTable,
    peers: PeerSender,
    socket_path: PathBuf,
) {
    // run(exp_id): look the experiment up and detach a supervisor for it.
    {
        let live = Arc::clone(&live);
        server.register(
            "run",
            Box::new(move |_conn, args, _| {
                let exp_id = arg_i64(args, 0, "exp_id")?;
                let record = store
                    .get_experiment(exp_id)
                    .map_err(|e| e.to_string())?
                    .ok_or_else(|| format!("unknown experiment {exp_id}"))?;

                let pid = launcher
                    .launch(&DetachedSpawn {
                        experiment_id: exp_id,
                        socket_path: socket_path.clone(),
                        definition_path: record.definition_path,
                        hyperparams: record.hyperparams,
                    })
                    .map_err(|e| format!("failed to launch supervisor: {e}"))?;

                live.lock()
                    .expect("live table mutex")
                    .insert(exp_id, LiveExperiment::launching());
                tracing::info!(exp_id, pid, "supervisor launched");
                Ok(json!(pid))
            }),
        );
    }

    // running(exp_id, pid): a spawner announcing itself. The connection it
    // called on is where control requests for this experiment go.
    {
        let live = Arc::clone(&live);
        server.register(
            "running",
            Box::new(move |conn, args, _| {
                let exp_id = arg_i64(args, 0, "exp_id")?;
                let pid = arg_i64(args, 1, "pid")? as u32;
                let mut table = live.lock().expect("live table mutex");
                let entry = table.entry(exp_id).or_insert_with(LiveExperiment::launching);
                entry.status = "running".to_string();
                entry.pid = Some(pid);
                entry.conn = Some(conn);
                tracing::info!(exp_id, pid, conn, "experiment running");
                Ok(Value::Null)
            }),
        );
    }

    {
        let live = Arc::clone(&live);
        server.register(
            "set_loss",
            Box::new(move |_conn, args, _| {
                let exp_id = arg_i64(args, 0, "exp_id")?;
                let loss = args
                    .get(1)
                    .and_then(Value::as_f64)
                    .ok_or("argument 1 (loss) must be a number")?;
                let mut table = live.lock().expect("live table mutex");
                let entry = table
                    .get_mut(&exp_id)
                    .ok_or_else(|| format!("unknown experiment {exp_id}"))?;
                entry.loss = Some(loss);
                Ok(Value::Null)
            }),
        );
    }

    {
        let live = Arc::clone(&live);
        server.register(
            "set_epoch",
            Box::new(move |_conn, args, _| {
                let exp_id = arg_i64(args, 0, "exp_id")?;
                let epoch = args
                    .get(1)
                    .and_then(Value::as_u64)
                    .ok_or("argument 1 (epoch) must be a non-negative integer")?;
                let mut table = live.lock().expect("live table mutex");
                let entry = table
                    .get_mut(&exp_id)
                    .ok_or_else(|| format!("unknown experiment {exp_id}"))?;
                entry.epoch = Some(epoch);
                Ok(Value::Null)
            }),
        );
    }

    // done(exp_id, pid): the spawner's completion round-trip. The reply
    // "terminate" tells it to close its RPC side.
    {
        let live = Arc::clone(&live);
        server.register(
            "done",
            Box::new(move |_conn, args, _| {
                let exp_id = arg_i64(args, 0, "exp_id")?;
                let pid = arg_i64(args, 1, "pid")? as u32;
                let mut table = live.lock().expect("live table mutex");
                if let Some(entry) = table.get_mut(&exp_id) {
                    if entry.pid.is_some_and(|p| p != pid) {
                        tracing::warn!(exp_id, pid, known_pid = ?entry.pid, "done from an unexpected pid");
                    }
                    entry.status = "done".to_string();
                    entry.conn = None;
                } else {
                    tracing::warn!(exp_id, "done for an unknown experiment");
                }
                Ok(json!("terminate"))
            }),
        );
    }

    {
        let live = Arc::clone(&live);
        server.register(
            "get_status",
            Box::new(move |_conn, args, _| {
                let exp_id = arg_i64(args, 0, "exp_id")?;
                let table = live.lock().expect("live table mutex");
                table
                    .get(&exp_id)
                    .map(|entry| json!(entry.status))
                    .ok_or_else(|| format!("unknown experiment {exp_id}"))
            }),
        );
    }

    {
        let live = Arc::clone(&live);
        server.register(
            "get_loss",
            Box::new(move |_conn, args, _| {
                let exp_id = arg_i64(args, 0, "exp_id")?;
                let table = live.lock().expect("live table mutex");
                table
                    .get(&exp_id)
                    .map(|entry| entry.loss.map_or(Value::Null, |l| json!(l)))
                    .ok_or_else(|| format!("unknown experiment {exp_id}"))
            }),
        );
    }

    {
        let live = Arc::clone(&live);
        server.register(
            "get_epoch",
            Box::new(move |_conn, args, _| {
                let exp_id = arg_i64(args, 0, "exp_id")?;
                let table = live.lock().expect("live table mutex");
                table
                    .get(&exp_id)
                    .map(|entry| entry.epoch.map_or(Value::Null, |e| json!(e)))
                    .ok_or_else(|| format!("unknown experiment {exp_id}"))
            }),
        );
    }

    // Control requests from clients are relayed to the spawner connection
    // that owns the experiment. Advisory: the acknowledgment is the runner's
    // own status trail.
    for method in ["pause", "unpause", "save", "terminate"] {
        let live = Arc::clone(&live);
        let peers = peers.clone();
        server.register(
            method,
            Box::new(move |_conn, args, _| {
                let exp_id = arg_i64(args, 0, "exp_id")?;
                let table = live.lock().expect("live table mutex");
                let entry = table
                    .get(&exp_id)
                    .ok_or_else(|| format!("unknown experiment {exp_id}"))?;
                let conn = entry
                    .conn
                    .ok_or_else(|| format!("experiment {exp_id} has no attached supervisor"))?;
                if !peers.call(conn, method, vec![json!(exp_id)]) {
                    return Err("server push channel closed".to_string());
                }
                tracing::debug!(exp_id, conn, method, "control request relayed");
                Ok(json!("relayed"))
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{RpcClient, RpcError};
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::path::Path;
    use tempfile::tempdir;

    struct RecordingLauncher {
        launches: Mutex<Vec<DetachedSpawn>>,
    }

    impl RecordingLauncher {
        fn new() -> Self {
            Self {
                launches: Mutex::new(Vec::new()),
            }
        }
    }

    impl SpawnerLauncher for RecordingLauncher {
        fn launch(&self, request: &DetachedSpawn) -> io::Result<u32> {
            self.launches.lock().unwrap().push(request.clone());
            Ok(7777)
        }
    }

    async fn daemon_fixture(
        dir: &Path,
    ) -> (
        PathBuf,
        Arc<MemoryStore>,
        Arc<RecordingLauncher>,
        tokio::task::JoinHandle<io::Result<()>>,
    ) {
        let socket_path = dir.join("dlexd.sock");
        let store = Arc::new(MemoryStore::new());
        let launcher = Arc::new(RecordingLauncher::new());
        let daemon = Daemon::build(
            &DaemonConfig {
                socket_path: socket_path.clone(),
            },
            Arc::clone(&store) as Arc<dyn ExperimentStore>,
            Arc::clone(&launcher) as Arc<dyn SpawnerLauncher>,
        )
        .unwrap();
        let task = tokio::spawn(daemon.serve());
        (socket_path, store, launcher, task)
    }

    #[tokio::test]
    async fn run_launches_a_supervisor_for_a_stored_experiment() {
        let dir = tempdir().unwrap();
        let (socket_path, store, launcher, task) = daemon_fixture(dir.path()).await;

        let exp_id = store
            .create_experiment(Path::new("defs/mlp.so"), json!({"lr": 0.1}))
            .unwrap();

        let mut client = RpcClient::connect(&socket_path).await.unwrap();
        let pid = client.run(exp_id).await.unwrap();
        assert_eq!(pid, json!(7777));

        let launches = launcher.launches.lock().unwrap();
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].experiment_id, exp_id);
        assert_eq!(launches[0].definition_path, PathBuf::from("defs/mlp.so"));
        assert_eq!(launches[0].hyperparams, json!({"lr": 0.1}));
        assert_eq!(launches[0].socket_path, socket_path);
        drop(launches);

        assert_eq!(client.get_status(exp_id).await.unwrap(), json!("launching"));
        task.abort();
    }

    #[tokio::test]
    async fn run_rejects_an_unknown_experiment() {
        let dir = tempdir().unwrap();
        let (socket_path, _store, _launcher, task) = daemon_fixture(dir.path()).await;

        let mut client = RpcClient::connect(&socket_path).await.unwrap();
        assert!(matches!(client.run(404).await, Err(RpcError::Remote(_))));
        task.abort();
    }

    #[tokio::test]
    async fn live_metrics_flow_from_spawner_to_observer() {
        let dir = tempdir().unwrap();
        let (socket_path, _store, _launcher, task) = daemon_fixture(dir.path()).await;

        let mut spawner = RpcClient::connect(&socket_path).await.unwrap();
        spawner.running(11, 1234).await.unwrap();
        spawner.set_loss(11, 0.75).await.unwrap();
        spawner.set_epoch(11, 3).await.unwrap();

        let mut observer = RpcClient::connect(&socket_path).await.unwrap();
        assert_eq!(observer.get_status(11).await.unwrap(), json!("running"));
        assert_eq!(observer.get_loss(11).await.unwrap(), json!(0.75));
        assert_eq!(observer.get_epoch(11).await.unwrap(), json!(3));

        spawner.done(11, 1234).await.unwrap();
        assert_eq!(observer.get_status(11).await.unwrap(), json!("done"));
        task.abort();
    }

    #[tokio::test]
    async fn metrics_before_running_are_rejected() {
        let dir = tempdir().unwrap();
        let (socket_path, _store, _launcher, task) = daemon_fixture(dir.path()).await;

        let mut client = RpcClient::connect(&socket_path).await.unwrap();
        assert!(matches!(
            client.set_loss(99, 0.5).await,
            Err(RpcError::Remote(_))
        ));
        task.abort();
    }

    #[tokio::test]
    async fn control_requests_are_relayed_to_the_owning_spawner() {
        let dir = tempdir().unwrap();
        let (socket_path, _store, _launcher, task) = daemon_fixture(dir.path()).await;

        let mut spawner = RpcClient::connect(&socket_path).await.unwrap();
        spawner.register("pause", Box::new(|_, _| Ok(json!("ok"))));
        spawner.running(21, 555).await.unwrap();

        let mut controller = RpcClient::connect(&socket_path).await.unwrap();
        assert_eq!(controller.pause(21).await.unwrap(), json!("relayed"));

        let pumped = spawner.pump_one().await.unwrap();
        assert_eq!(pumped.method, "pause");
        assert_eq!(pumped.outcome.unwrap(), json!("ok"));
        task.abort();
    }

    #[tokio::test]
    async fn control_requests_without_a_supervisor_fail() {
        let dir = tempdir().unwrap();
        let (socket_path, _store, _launcher, task) = daemon_fixture(dir.path()).await;

        let mut client = RpcClient::connect(&socket_path).await.unwrap();
        assert!(matches!(
            client.terminate(314).await,
            Err(RpcError::Remote(_))
        ));
        task.abort();
    }

    #[tokio::test]
    async fn done_reply_is_terminate() {
        let dir = tempdir().unwrap();
        let (socket_path, _store, _launcher, task) = daemon_fixture(dir.path()).await;

        let mut spawner = RpcClient::connect(&socket_path).await.unwrap();
        spawner.running(31, 777).await.unwrap();
        assert_eq!(spawner.done(31, 777).await.unwrap(), json!("terminate"));
        task.abort();
    }
}
