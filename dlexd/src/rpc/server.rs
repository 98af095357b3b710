//! Listener side of the RPC protocol.
//!
//! One coordinator loop owns every connection's write half and dispatches
//! handlers synchronously; per-connection reader tasks feed decoded frames
//! into it over an mpsc channel. A slow handler therefore stalls the whole
//! server — cooperative, non-preemptive scheduling with first-ready ordering.
//!
//! Handlers see the id of the connection a call arrived on, and a
//! [`PeerSender`] can push a call *to* a connection — that is how the daemon
//! routes `terminate`/`pause` requests down the right spawner's socket.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::net::{UnixListener, unix::OwnedReadHalf, unix::OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{MessageCodec, ProtocolError};
use crate::bridge::protocol::{RpcMessage, UNKNOWN_RPC_ERROR};

/// Identifies one accepted connection for the lifetime of the server.
pub type ConnId = u64;

/// A registered server handler: connection the call arrived on, positional
/// args, keyword args. Runs synchronously on the serving loop; a returned
/// `Err` becomes an `Error` response, it never kills the loop.
pub type ServerHandlerFn =
    Box<dyn FnMut(ConnId, &[Value], &Map<String, Value>) -> Result<Value, String> + Send>;

enum ConnEvent {
    Message(ConnId, RpcMessage),
    Failed(ConnId, ProtocolError),
    Closed(ConnId),
}

/// Pushes calls to connected peers from outside the serving loop. The
/// peer's response comes back through the normal event path and is logged,
/// not routed — pushed calls are fire-and-forget signals.
#[derive(Clone)]
pub struct PeerSender {
    tx: mpsc::UnboundedSender<(ConnId, RpcMessage)>,
}

impl PeerSender {
    /// Enqueues a call for `conn`. Returns false if the server is gone.
    pub fn call(&self, conn: ConnId, method: &str, args: Vec<Value>) -> bool {
        self.tx
            .send((
                conn,
                RpcMessage::Call {
                    method: method.to_string(),
                    args,
                    kwargs: Map::new(),
                },
            ))
            .is_ok()
    }
}

/// Removes the bound socket file when the server goes away, however it goes
/// away.
struct SocketPathGuard {
    path: PathBuf,
}

impl Drop for SocketPathGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "socket path removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "socket cleanup failed");
            }
        }
    }
}

pub struct RpcServer {
    listener: UnixListener,
    handlers: HashMap<String, ServerHandlerFn>,
    push_tx: mpsc::UnboundedSender<(ConnId, RpcMessage)>,
    push_rx: mpsc::UnboundedReceiver<(ConnId, RpcMessage)>,
    path_guard: SocketPathGuard,
}

impl RpcServer {
    /// Binds the listening socket. A pre-existing file at `path` fails the
    /// bind; clearing stale sockets from a crashed run is the launcher's
    /// responsibility.
    pub fn bind(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let listener = UnixListener::bind(&path)?;
        tracing::info!(path = %path.display(), "rpc server listening");
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        Ok(Self {
            listener,
            handlers: HashMap::new(),
            push_tx,
            push_rx,
            path_guard: SocketPathGuard { path },
        })
    }

    /// Registers a method handler. Last registration for a name wins.
    pub fn register(&mut self, name: impl Into<String>, handler: ServerHandlerFn) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn peer_sender(&self) -> PeerSender {
        PeerSender {
            tx: self.push_tx.clone(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path_guard.path
    }

    /// Accepts and serves connections until the listener itself fails. The
    /// bound path is removed on any exit, normal or not, via the drop guard.
    pub async fn serve(mut self) -> io::Result<()> {
        let (event_tx, mut event_rx) = mpsc::channel::<ConnEvent>(64);
        let mut writers: HashMap<ConnId, FramedWrite<OwnedWriteHalf, MessageCodec<RpcMessage>>> =
            HashMap::new();
        let mut next_id: ConnId = 0;

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, _) = accepted?;
                    next_id += 1;
                    let conn = next_id;
                    let (read_half, write_half) = stream.into_split();
                    writers.insert(conn, FramedWrite::new(write_half, MessageCodec::new()));
                    let tx = event_tx.clone();
                    tokio::spawn(connection_reader(conn, read_half, tx));
                    tracing::debug!(conn, "connection accepted");
                }

                Some(event) = event_rx.recv() => match event {
                    ConnEvent::Message(conn, RpcMessage::Call { method, args, kwargs }) => {
                        let reply = match self.handlers.get_mut(&method) {
                            Some(handler) => match handler(conn, &args, &kwargs) {
                                Ok(value) => RpcMessage::Return(value),
                                Err(message) => {
                                    tracing::debug!(conn, %method, %message, "handler failed");
                                    RpcMessage::Error(message)
                                }
                            },
                            None => {
                                tracing::debug!(conn, %method, "unknown method");
                                RpcMessage::Error(UNKNOWN_RPC_ERROR.to_string())
                            }
                        };
                        if let Some(writer) = writers.get_mut(&conn)
                            && let Err(e) = writer.send(reply).await
                        {
                            tracing::debug!(conn, error = %e, "response write failed");
                            writers.remove(&conn);
                        }
                    }
                    // A Return/Error from a peer answers a pushed call;
                    // pushed calls are fire-and-forget, so just log it.
                    ConnEvent::Message(conn, response) => {
                        tracing::debug!(conn, ?response, "peer answered a pushed call");
                    }
                    ConnEvent::Failed(conn, error) => {
                        tracing::warn!(conn, %error, "connection failed");
                        writers.remove(&conn);
                    }
                    ConnEvent::Closed(conn) => {
                        tracing::debug!(conn, "connection closed");
                        writers.remove(&conn);
                    }
                },

                Some((conn, message)) = self.push_rx.recv() => {
                    match writers.get_mut(&conn) {
                        Some(writer) => {
                            if let Err(e) = writer.send(message).await {
                                tracing::debug!(conn, error = %e, "push write failed");
                                writers.remove(&conn);
                            }
                        }
                        None => tracing::debug!(conn, "push target connection is gone"),
                    }
                }
            }
        }
    }
}

async fn connection_reader(conn: ConnId, read_half: OwnedReadHalf, tx: mpsc::Sender<ConnEvent>) {
    let mut reader = FramedRead::new(read_half, MessageCodec::<RpcMessage>::new());
    loop {
        let event = match reader.next().await {
            Some(Ok(message)) => ConnEvent::Message(conn, message),
            Some(Err(error)) => {
                let _ = tx.send(ConnEvent::Failed(conn, error)).await;
                break;
            }
            None => {
                let _ = tx.send(ConnEvent::Closed(conn)).await;
                break;
            }
        };
        if tx.send(event).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{RpcClient, RpcError};
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    fn sum_handler() -> ServerHandlerFn {
        Box::new(|_conn, args, _| {
            let total: f64 = args.iter().filter_map(serde_json::Value::as_f64).sum();
            Ok(json!(total))
        })
    }

    #[tokio::test]
    async fn call_roundtrip_through_server() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dlexd.sock");
        let mut server = RpcServer::bind(&path).unwrap();
        server.register("sum", sum_handler());
        let server_task = tokio::spawn(server.serve());

        let mut client = RpcClient::connect(&path).await.unwrap();
        let value = client
            .call("sum", vec![json!(1.5), json!(2.5)], serde_json::Map::new())
            .await
            .unwrap();
        assert_eq!(value, json!(4.0));

        server_task.abort();
    }

    #[tokio::test]
    async fn unknown_method_is_distinguished_from_handler_failure() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dlexd.sock");
        let server = RpcServer::bind(&path).unwrap();
        let server_task = tokio::spawn(server.serve());

        let mut client = RpcClient::connect(&path).await.unwrap();
        assert!(matches!(
            client.call("nonesuch", vec![], serde_json::Map::new()).await,
            Err(RpcError::UnknownMethod)
        ));

        server_task.abort();
    }

    #[tokio::test]
    async fn failing_handler_leaves_server_serving() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dlexd.sock");
        let mut server = RpcServer::bind(&path).unwrap();
        server.register("explode", Box::new(|_, _, _| Err("kaboom".to_string())));
        server.register("sum", sum_handler());
        let server_task = tokio::spawn(server.serve());

        let mut first = RpcClient::connect(&path).await.unwrap();
        match first.call("explode", vec![], serde_json::Map::new()).await {
            Err(RpcError::Remote(message)) => assert_eq!(message, "kaboom"),
            other => panic!("expected remote error, got {other:?}"),
        }

        // A fresh connection is still serviced after the failure.
        let mut second = RpcClient::connect(&path).await.unwrap();
        let value = second
            .call("sum", vec![json!(2), json!(3)], serde_json::Map::new())
            .await
            .unwrap();
        assert_eq!(value, json!(5.0));

        // So is the original connection.
        let value = first
            .call("sum", vec![json!(1)], serde_json::Map::new())
            .await
            .unwrap();
        assert_eq!(value, json!(1.0));

        server_task.abort();
    }

    #[tokio::test]
    async fn pushed_call_reaches_the_peer_and_gets_pumped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dlexd.sock");
        let mut server = RpcServer::bind(&path).unwrap();

        let seen_conn = Arc::new(Mutex::new(None::<ConnId>));
        let seen = Arc::clone(&seen_conn);
        server.register(
            "hello",
            Box::new(move |conn, _, _| {
                *seen.lock().unwrap() = Some(conn);
                Ok(json!("hi"))
            }),
        );
        let peers = server.peer_sender();
        let server_task = tokio::spawn(server.serve());

        let mut client = RpcClient::connect(&path).await.unwrap();
        client.register("poke", Box::new(|_, _| Ok(json!("poked"))));
        client.call("hello", vec![], serde_json::Map::new()).await.unwrap();

        let conn = seen_conn.lock().unwrap().expect("handler saw the connection");
        assert!(peers.call(conn, "poke", vec![json!(1)]));

        let pumped = client.pump_one().await.unwrap();
        assert_eq!(pumped.method, "poke");
        assert_eq!(pumped.outcome.unwrap(), json!("poked"));

        server_task.abort();
    }

    #[tokio::test]
    async fn bound_path_is_removed_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dlexd.sock");
        let server = RpcServer::bind(&path).unwrap();
        assert!(path.exists());

        drop(server);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn stale_socket_file_fails_the_bind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dlexd.sock");
        std::fs::write(&path, b"").unwrap();

        assert!(RpcServer::bind(&path).is_err());
    }
}
