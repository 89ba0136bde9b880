//! Message transport between the dispatcher and the executor.
//!
//! Two primitives: a request/response [`Transport::call`] and a progress
//! event subscription. [`local`] wires both sides inside one process,
//! [`pipe`] speaks newline-delimited JSON over any byte stream.

pub mod local;
pub mod pipe;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::protocol::{ProgressEvent, Reply, Request};

pub use local::LocalTransport;
pub use pipe::{serve, PipeTransport};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The channel closed while the call was outstanding.
    #[error("channel closed while a call was outstanding")]
    Disconnected,
    #[error("malformed frame: {0}")]
    Codec(String),
    /// The transport was shut down deliberately.
    #[error("transport closed")]
    Closed,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one request and wait for its single reply.
    async fn call(&self, request: Request) -> Result<Reply, TransportError>;

    /// Progress events emitted by the executor side.
    fn subscribe(&self) -> broadcast::Receiver<ProgressEvent>;
}
