//! Caller side of the RPC protocol, with a passive pumping mode.
//!
//! [`RpcClient::call`] is the blocking (one outstanding call per socket)
//! request path. A client sitting inside a multiplexed loop is instead driven
//! one message at a time through [`RpcClient::pump_one`], answering calls the
//! peer pushes at it — symmetric to the server's dispatch.

use std::io;
use std::path::Path;

use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value, json};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

use crate::bridge::codec::MessageCodec;
use crate::bridge::protocol::{RpcMessage, UNKNOWN_RPC_ERROR};
use crate::rpc::{HandlerFn, MethodRegistry, RpcError};

/// Outcome of pumping one incoming call: the method that ran and the
/// response that was written back (or attempted).
#[derive(Debug)]
pub struct PumpedCall {
    pub method: String,
    pub outcome: Result<Value, String>,
}

pub struct RpcClient {
    framed: Framed<UnixStream, MessageCodec<RpcMessage>>,
    handlers: MethodRegistry,
}

impl RpcClient {
    pub async fn connect(path: impl AsRef<Path>) -> io::Result<Self> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        tracing::debug!(path = %path.as_ref().display(), "rpc client connected");
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: UnixStream) -> Self {
        Self {
            framed: Framed::new(stream, MessageCodec::new()),
            handlers: MethodRegistry::new(),
        }
    }

    /// Registers a handler for calls pumped in from the peer. Last
    /// registration for a name wins.
    pub fn register(&mut self, name: impl Into<String>, handler: HandlerFn) {
        self.handlers.register(name, handler);
    }

    /// Sends a call and blocks for its response frame.
    pub async fn call(
        &mut self,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value, RpcError> {
        self.framed
            .send(RpcMessage::Call {
                method: method.to_string(),
                args,
                kwargs,
            })
            .await?;

        match self.framed.next().await {
            None => Err(RpcError::ConnectionClosed),
            Some(Err(e)) => Err(e.into()),
            Some(Ok(RpcMessage::Return(value))) => Ok(value),
            Some(Ok(RpcMessage::Error(message))) if message == UNKNOWN_RPC_ERROR => {
                Err(RpcError::UnknownMethod)
            }
            Some(Ok(RpcMessage::Error(message))) => Err(RpcError::Remote(message)),
            Some(Ok(other)) => Err(RpcError::unexpected(&other, "awaiting a response")),
        }
    }

    /// Reads exactly one incoming call, dispatches it through the local
    /// registry, and answers it. The response write is best-effort: a peer
    /// that vanished mid-exchange is not an error here.
    pub async fn pump_one(&mut self) -> Result<PumpedCall, RpcError> {
        match self.framed.next().await {
            None => Err(RpcError::ConnectionClosed),
            Some(Err(e)) => Err(e.into()),
            Some(Ok(RpcMessage::Call {
                method,
                args,
                kwargs,
            })) => {
                let outcome = self
                    .handlers
                    .dispatch(&method, &args, &kwargs)
                    .unwrap_or_else(|| Err(UNKNOWN_RPC_ERROR.to_string()));

                let reply = match &outcome {
                    Ok(value) => RpcMessage::Return(value.clone()),
                    Err(message) => RpcMessage::Error(message.clone()),
                };
                if let Err(e) = self.framed.send(reply).await {
                    tracing::debug!(%method, error = %e, "response send failed, peer gone");
                }
                Ok(PumpedCall { method, outcome })
            }
            Some(Ok(other)) => Err(RpcError::unexpected(&other, "awaiting a call")),
        }
    }

    /// Flushes and shuts the socket down. Safe to call more than once.
    pub async fn close(&mut self) {
        if let Err(e) = self.framed.close().await {
            tracing::debug!(error = %e, "rpc close");
        }
    }
}

/// The daemon-facing method surface, typed one wrapper per method.
/// [`RpcClient::call`] stays available as the generic escape hatch.
impl RpcClient {
    pub async fn run(&mut self, experiment_id: i64) -> Result<Value, RpcError> {
        self.call("run", vec![json!(experiment_id)], Map::new())
            .await
    }

    pub async fn running(&mut self, experiment_id: i64, pid: u32) -> Result<Value, RpcError> {
        self.call("running", vec![json!(experiment_id), json!(pid)], Map::new())
            .await
    }

    pub async fn set_loss(&mut self, experiment_id: i64, loss: f64) -> Result<Value, RpcError> {
        self.call(
            "set_loss",
            vec![json!(experiment_id), json!(loss)],
            Map::new(),
        )
        .await
    }

    pub async fn set_epoch(&mut self, experiment_id: i64, epoch: u64) -> Result<Value, RpcError> {
        self.call(
            "set_epoch",
            vec![json!(experiment_id), json!(epoch)],
            Map::new(),
        )
        .await
    }

    /// Reports a finished run. The daemon's return value of `"terminate"`
    /// tells the spawner to close its RPC side.
    pub async fn done(&mut self, experiment_id: i64, pid: u32) -> Result<Value, RpcError> {
        self.call("done", vec![json!(experiment_id), json!(pid)], Map::new())
            .await
    }

    pub async fn get_status(&mut self, experiment_id: i64) -> Result<Value, RpcError> {
        self.call("get_status", vec![json!(experiment_id)], Map::new())
            .await
    }

    pub async fn get_loss(&mut self, experiment_id: i64) -> Result<Value, RpcError> {
        self.call("get_loss", vec![json!(experiment_id)], Map::new())
            .await
    }

    pub async fn get_epoch(&mut self, experiment_id: i64) -> Result<Value, RpcError> {
        self.call("get_epoch", vec![json!(experiment_id)], Map::new())
            .await
    }

    pub async fn pause(&mut self, experiment_id: i64) -> Result<Value, RpcError> {
        self.call("pause", vec![json!(experiment_id)], Map::new())
            .await
    }

    pub async fn unpause(&mut self, experiment_id: i64) -> Result<Value, RpcError> {
        self.call("unpause", vec![json!(experiment_id)], Map::new())
            .await
    }

    pub async fn terminate(&mut self, experiment_id: i64) -> Result<Value, RpcError> {
        self.call("terminate", vec![json!(experiment_id)], Map::new())
            .await
    }
}
