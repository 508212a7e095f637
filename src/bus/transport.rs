//! Live transport connections.

use async_trait::async_trait;

use crate::protocol::Message;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("transport failure: {0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// A live push channel to one connected agent.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Connection identifier, unique per accepted socket.
    fn id(&self) -> &str;

    /// Write one message to the peer.
    async fn push(&self, message: &Message) -> Result<(), TransportError>;

    fn is_live(&self) -> bool;

    /// Tear the connection down. Idempotent.
    fn close(&self);
}
