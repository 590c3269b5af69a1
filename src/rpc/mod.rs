//! The framed RPC transport: provider (serving side) and consumer
//! channel (calling side), glued together by the registry, the load
//! balancer, and the circuit breaker.

pub mod channel;
pub mod provider;

pub use channel::{ChannelConfig, RpcChannel};
pub use provider::{ProviderError, RpcProvider};

use crate::wire::FrameError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Provider-side dispatch failures. Each one is logged and closes the
/// offending connection without a response.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown service `{0}`")]
    UnknownService(String),
    #[error("unknown method `{0}`")]
    UnknownMethod(String),
    #[error("request parse: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("response serialize: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Consumer-side call failures.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The registry has no (or a malformed) address for the method.
    #[error("service `{service}.{method}` unreachable: {reason}")]
    UnreachableService { service: String, method: String, reason: String },
    /// Socket-level failure: connect, send, receive, or timeout.
    #[error("transport to `{endpoint}`: {reason}")]
    Transport { endpoint: String, reason: String },
    /// The circuit breaker rejected the call outright.
    #[error("circuit breaker open for `{0}`")]
    BreakerOpen(String),
    /// The single-read reply filled the whole read cap; the true reply
    /// may be longer and must not be trusted.
    #[error("reply filled the {0}-byte read cap")]
    OversizeReply(usize),
    #[error("request serialize: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("response parse: {0}")]
    Parse(#[source] serde_json::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl RpcError {
    /// Stable label for the monitor's error tally.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnreachableService { .. } => "UnreachableService",
            Self::Transport { .. } => "TransportError",
            Self::BreakerOpen(_) => "BreakerOpen",
            Self::OversizeReply(_) => "OversizeReply",
            Self::Serialize(_) => "SerializeError",
            Self::Parse(_) => "ParseError",
            Self::Frame(_) => "MalformedFrame",
        }
    }
}

/// A service published over the framed RPC.
///
/// `dispatch` receives the raw args payload for one of the advertised
/// methods and returns the serialized response.
#[async_trait]
pub trait RpcService: Send + Sync {
    fn service_name(&self) -> &'static str;
    fn method_names(&self) -> &'static [&'static str];
    async fn dispatch(&self, method: &str, args: &[u8]) -> Result<Vec<u8>, DispatchError>;
}

/// Parse an args payload into a request type.
pub fn decode_args<T: DeserializeOwned>(args: &[u8]) -> Result<T, DispatchError> {
    serde_json::from_slice(args).map_err(DispatchError::Parse)
}

/// Serialize a response for the wire.
pub fn encode_reply<T: Serialize>(reply: &T) -> Result<Vec<u8>, DispatchError> {
    serde_json::to_vec(reply).map_err(DispatchError::Serialize)
}
