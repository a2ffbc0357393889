//! Transport layer for agent communication
//!
//! Agents talk in request/reply pairs: the caller sends one [`Message`] to an
//! [`Endpoint`] and waits for one reply under a deadline. The inbound side
//! hands every message to a [`MessageHandler`] and sends back whatever it
//! returns.

use crate::identity::AgentId;
use crate::protocol::messages::{Endpoint, FailureKind, Message};
use std::time::Duration;
use thiserror::Error;

pub mod tcp;

pub use tcp::{serve, TcpTransport};

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("No reply within {0} ms")]
    Timeout(u64),
    #[error("Peer unreachable: {0}")]
    Unreachable(String),
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Invalid frame: {0}")]
    Codec(String),
    #[error("Connection closed before a reply arrived")]
    Closed,
    #[error("Unsupported endpoint scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Wire failure kind for this error
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            TransportError::Timeout(_) => FailureKind::Timeout,
            TransportError::Handshake(_) | TransportError::Codec(_) => FailureKind::Malformed,
            TransportError::Unreachable(_)
            | TransportError::Closed
            | TransportError::UnsupportedScheme(_)
            | TransportError::Io(_) => FailureKind::PeerUnreachable,
        }
    }
}

/// Outbound request/reply delivery
///
/// Implementations enforce `deadline` themselves and report an expired call
/// as [`TransportError::Timeout`].
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn request(
        &self,
        endpoint: &Endpoint,
        message: Message,
        deadline: Duration,
    ) -> Result<Message, TransportError>;
}

/// Inbound message handling
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one message from `peer` (the id it presented in its handshake)
    /// and produce the reply
    async fn handle(&self, peer: Option<&AgentId>, message: Message) -> Message;

    /// Id presented in handshakes
    fn local_id(&self) -> &AgentId;
}

pub(crate) fn deadline_ms(deadline: Duration) -> u64 {
    u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX)
}
