//! Request/response RPC over local stream sockets.
//!
//! Both sides speak [`RpcMessage`] frames. The caller side blocks for exactly
//! one response per call; the passive side dispatches incoming calls through
//! an explicit [`MethodRegistry`] (no reflection — unknown names answer with
//! the distinguished `UnknownRPCError` message).

pub mod client;
pub mod server;

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::bridge::codec::ProtocolError;
use crate::bridge::protocol::RpcMessage;

pub use client::{PumpedCall, RpcClient};
pub use server::{ConnId, PeerSender, RpcServer, ServerHandlerFn};

/// A registered RPC handler. Runs synchronously on the dispatching loop; a
/// returned `Err` becomes an `Error` response, it never kills the loop.
pub type HandlerFn = Box<dyn FnMut(&[Value], &Map<String, Value>) -> Result<Value, String> + Send>;

/// Method-name to handler table. Registration is last-wins.
#[derive(Default)]
pub struct MethodRegistry {
    handlers: HashMap<String, HandlerFn>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: HandlerFn) {
        self.handlers.insert(name.into(), handler);
    }

    /// Invokes the handler for `method`. `None` means no handler is
    /// registered under that name.
    pub fn dispatch(
        &mut self,
        method: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Option<Result<Value, String>> {
        self.handlers
            .get_mut(method)
            .map(|handler| handler(args, kwargs))
    }

    pub fn is_registered(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }
}

/// Errors surfaced to RPC callers and pumpers.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The peer has no handler registered under the called name.
    #[error("rpc method not registered on peer")]
    UnknownMethod,

    /// The peer's handler failed; the message is the handler's error text.
    #[error("rpc handler failed: {0}")]
    Remote(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The connection ended before the expected message arrived.
    #[error("rpc connection closed")]
    ConnectionClosed,

    #[error("unexpected {got} message while {expecting}")]
    UnexpectedMessage {
        got: &'static str,
        expecting: &'static str,
    },
}

impl RpcError {
    pub(crate) fn unexpected(msg: &RpcMessage, expecting: &'static str) -> Self {
        let got = match msg {
            RpcMessage::Call { .. } => "call",
            RpcMessage::Return(_) => "return",
            RpcMessage::Error(_) => "error",
        };
        Self::UnexpectedMessage { got, expecting }
    }
}
