//! Transport channel to the inference service: connection FSM, reconnect
//! backoff and the concrete connectors.

mod backoff;
mod channel;
mod loopback;
mod websocket;

use async_trait::async_trait;
use iris_types::{IrisError, Result};
use tokio::sync::mpsc;

pub use backoff::{BackoffPolicy, ExponentialBackoff, FixedBackoff};
pub use channel::TransportChannel;
pub use loopback::{LoopbackConnector, LoopbackService};
pub use websocket::WebSocketConnector;

/// An established bidirectional text link. Dropping it closes the connection.
pub struct Link {
    pub outbound: mpsc::Sender<String>,
    /// Yields `None` once the remote side has gone away.
    pub inbound: mpsc::Receiver<String>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Link>;
}

pub fn channel_error(message: impl Into<String>) -> IrisError {
    IrisError::Channel(message.into())
}
