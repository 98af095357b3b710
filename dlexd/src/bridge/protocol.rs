//! Wire message types for the two channels of the system.
//!
//! - **RPC channel** (unix socket): positional arrays `["rpc", method, args,
//!   kwargs]`, `["return", value]`, `["error", message]`.
//! - **Experiment pipe** (anonymous pipe pair): progress events as
//!   `[kind, value]` pairs one way, bare control strings the other way.
//!
//! The array shapes are the protocol, so `RpcMessage` and `ProgressEvent`
//! carry hand-written serde impls instead of derived tagged representations.

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Error message distinguishing "method not registered" from a handler
/// failure on the wire.
pub const UNKNOWN_RPC_ERROR: &str = "UnknownRPCError";

/// One message on the RPC channel.
///
/// Exactly one `Return` or `Error` answers each `Call` on the same
/// connection; a caller blocks for its own response before issuing another
/// call.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    Call {
        method: String,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    },
    Return(Value),
    Error(String),
}

impl Serialize for RpcMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Call {
                method,
                args,
                kwargs,
            } => {
                let mut seq = serializer.serialize_seq(Some(4))?;
                seq.serialize_element("rpc")?;
                seq.serialize_element(method)?;
                seq.serialize_element(args)?;
                seq.serialize_element(kwargs)?;
                seq.end()
            }
            Self::Return(value) => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("return")?;
                seq.serialize_element(value)?;
                seq.end()
            }
            Self::Error(message) => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("error")?;
                seq.serialize_element(message)?;
                seq.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for RpcMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut parts = Vec::<Value>::deserialize(deserializer)?;
        let tag = parts
            .first()
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| de::Error::custom("rpc message must start with a string tag"))?;

        match (tag.as_str(), parts.len()) {
            ("rpc", 4) => {
                let kwargs = match parts.pop().expect("length checked") {
                    Value::Object(map) => map,
                    other => {
                        return Err(de::Error::custom(format!(
                            "rpc kwargs must be an object, got {other}"
                        )));
                    }
                };
                let args = match parts.pop().expect("length checked") {
                    Value::Array(items) => items,
                    other => {
                        return Err(de::Error::custom(format!(
                            "rpc args must be an array, got {other}"
                        )));
                    }
                };
                let method = match parts.pop().expect("length checked") {
                    Value::String(name) => name,
                    other => {
                        return Err(de::Error::custom(format!(
                            "rpc method must be a string, got {other}"
                        )));
                    }
                };
                Ok(Self::Call {
                    method,
                    args,
                    kwargs,
                })
            }
            ("return", 2) => Ok(Self::Return(parts.pop().expect("length checked"))),
            ("error", 2) => match parts.pop().expect("length checked") {
                Value::String(message) => Ok(Self::Error(message)),
                other => Err(de::Error::custom(format!(
                    "error message must be a string, got {other}"
                ))),
            },
            (tag, len) => Err(de::Error::custom(format!(
                "unrecognized rpc message: tag {tag:?} with {len} element(s)"
            ))),
        }
    }
}

/// Logical run state of one experiment, as reported by its runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Loading,
    Initializing,
    Running,
    Paused,
    Done,
    Failed,
    Terminated,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        }
    }

    /// Terminal states are never left; exactly one is reported per run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Terminated)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "loading" => Ok(Self::Loading),
            "initializing" => Ok(Self::Initializing),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "terminated" => Ok(Self::Terminated),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown run status {0:?}")]
pub struct UnknownStatus(pub String);

impl Serialize for RunStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RunStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Runner-to-spawner message on the experiment pipe.
///
/// The pipe preserves send order; there is no ordering guarantee between the
/// pipe and the RPC channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Status(RunStatus),
    Loss(f64),
    Epoch(u64),
    Position(Value),
}

impl ProgressEvent {
    fn kind(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::Loss(_) => "loss",
            Self::Epoch(_) => "epoch",
            Self::Position(_) => "position",
        }
    }
}

impl Serialize for ProgressEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(2))?;
        seq.serialize_element(self.kind())?;
        match self {
            Self::Status(status) => seq.serialize_element(status)?,
            Self::Loss(loss) => seq.serialize_element(loss)?,
            Self::Epoch(epoch) => seq.serialize_element(epoch)?,
            Self::Position(position) => seq.serialize_element(position)?,
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for ProgressEvent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (kind, value) = <(String, Value)>::deserialize(deserializer)?;
        match kind.as_str() {
            "status" => {
                let status = value
                    .as_str()
                    .ok_or_else(|| de::Error::custom("status value must be a string"))?
                    .parse()
                    .map_err(de::Error::custom)?;
                Ok(Self::Status(status))
            }
            "loss" => value
                .as_f64()
                .map(Self::Loss)
                .ok_or_else(|| de::Error::custom("loss value must be a number")),
            "epoch" => value
                .as_u64()
                .map(Self::Epoch)
                .ok_or_else(|| de::Error::custom("epoch value must be a non-negative integer")),
            "position" => Ok(Self::Position(value)),
            other => Err(de::Error::custom(format!(
                "unrecognized progress event kind {other:?}"
            ))),
        }
    }
}

/// Spawner-to-runner message on the experiment pipe. Bare strings on the
/// wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMessage {
    Terminate,
    Save,
    Pause,
    Unpause,
}
