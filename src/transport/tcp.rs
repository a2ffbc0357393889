//! TCP transport: newline-delimited JSON frames over tokio sockets
//!
//! Each outbound request opens a connection, exchanges `Hello` frames, sends
//! one message and reads one reply. The listener side accepts any number of
//! request frames per connection after the handshake.

use super::{deadline_ms, MessageHandler, Transport, TransportError};
use crate::identity::AgentId;
use crate::protocol::messages::{Endpoint, FailureKind, Message, PROTOCOL_VERSION};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Largest accepted frame
pub const MAX_FRAME_BYTES: u64 = 1024 * 1024;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Outbound TCP transport
#[derive(Debug, Clone)]
pub struct TcpTransport {
    local: AgentId,
}

impl TcpTransport {
    pub fn new(local: AgentId) -> Self {
        Self { local }
    }

    async fn exchange(&self, authority: &str, message: Message) -> Result<Message, TransportError> {
        let stream = TcpStream::connect(authority)
            .await
            .map_err(|e| TransportError::Unreachable(format!("{authority}: {e}")))?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_frame(&mut write_half, &hello(&self.local)).await?;
        match read_frame(&mut reader).await? {
            Some(Message::Hello { version, agent_id }) => {
                if version != PROTOCOL_VERSION {
                    return Err(TransportError::Handshake(format!(
                        "peer {agent_id} speaks {version}, expected {PROTOCOL_VERSION}"
                    )));
                }
                trace!(peer = %agent_id, "Handshake complete");
            }
            Some(Message::Rejected { reason, .. }) => return Err(TransportError::Handshake(reason)),
            Some(other) => {
                return Err(TransportError::Handshake(format!(
                    "expected hello, got {}",
                    other.kind()
                )))
            }
            None => return Err(TransportError::Closed),
        }

        write_frame(&mut write_half, &message).await?;
        read_frame(&mut reader).await?.ok_or(TransportError::Closed)
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn request(
        &self,
        endpoint: &Endpoint,
        message: Message,
        deadline: Duration,
    ) -> Result<Message, TransportError> {
        if endpoint.scheme() != "tcp" {
            return Err(TransportError::UnsupportedScheme(endpoint.scheme().to_string()));
        }
        match tokio::time::timeout(deadline, self.exchange(endpoint.authority(), message)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(deadline_ms(deadline))),
        }
    }
}

fn hello(agent_id: &AgentId) -> Message {
    Message::Hello {
        agent_id: agent_id.clone(),
        version: PROTOCOL_VERSION.to_string(),
    }
}

/// Write one message followed by a newline
pub async fn write_frame<W>(writer: &mut W, message: &Message) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let mut bytes =
        serde_json::to_vec(message).map_err(|e| TransportError::Codec(e.to_string()))?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next message, `None` on a clean end of stream. Blank lines are
/// skipped.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Message>, TransportError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let mut line = String::new();
        let read = (&mut *reader)
            .take(MAX_FRAME_BYTES)
            .read_line(&mut line)
            .await?;
        if read == 0 {
            return Ok(None);
        }
        if !line.ends_with('\n') && read as u64 >= MAX_FRAME_BYTES {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame exceeds {MAX_FRAME_BYTES} bytes"),
            )));
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        return serde_json::from_str(trimmed)
            .map(Some)
            .map_err(|e| TransportError::Codec(e.to_string()));
    }
}

/// Accept connections until `shutdown` flips to true
pub async fn serve(
    listener: TcpListener,
    handler: Arc<dyn MessageHandler>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), TransportError> {
    info!(addr = ?listener.local_addr().ok(), "Listening for peers");
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, handler).await {
                            debug!(peer_addr = %addr, error = %e, "Connection closed with error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Failed to accept connection"),
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Listener shutting down");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    handler: Arc<dyn MessageHandler>,
) -> Result<(), TransportError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut reader))
        .await
        .map_err(|_| TransportError::Timeout(deadline_ms(HANDSHAKE_TIMEOUT)))?;
    let peer = match first {
        Ok(Some(Message::Hello { agent_id, version })) if version == PROTOCOL_VERSION => agent_id,
        Ok(Some(Message::Hello { version, .. })) => {
            let reason = format!("unsupported protocol version {version}");
            write_frame(&mut write_half, &rejected(&reason)).await?;
            return Err(TransportError::Handshake(reason));
        }
        Ok(Some(other)) => {
            let reason = format!("expected hello, got {}", other.kind());
            write_frame(&mut write_half, &rejected(&reason)).await?;
            return Err(TransportError::Handshake(reason));
        }
        Ok(None) => return Ok(()),
        Err(TransportError::Codec(reason)) => {
            write_frame(&mut write_half, &rejected(&reason)).await?;
            return Err(TransportError::Codec(reason));
        }
        Err(e) => return Err(e),
    };
    write_frame(&mut write_half, &hello(handler.local_id())).await?;

    loop {
        let next = match tokio::time::timeout(IDLE_TIMEOUT, read_frame(&mut reader)).await {
            Ok(next) => next,
            Err(_) => return Ok(()),
        };
        let reply = match next {
            Ok(Some(message)) => {
                trace!(peer = %peer, kind = message.kind(), "Inbound message");
                handler.handle(Some(&peer), message).await
            }
            Ok(None) => return Ok(()),
            Err(TransportError::Codec(reason)) => rejected(&reason),
            Err(e) => return Err(e),
        };
        write_frame(&mut write_half, &reply).await?;
    }
}

fn rejected(reason: &str) -> Message {
    Message::Rejected {
        kind: FailureKind::Malformed,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeIdentity;

    struct EchoHandler {
        id: AgentId,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl MessageHandler for EchoHandler {
        async fn handle(&self, peer: Option<&AgentId>, message: Message) -> Message {
            tokio::time::sleep(self.delay).await;
            match message {
                Message::GossipAck { seq, .. } => Message::GossipAck {
                    origin: peer.cloned().unwrap_or_else(|| self.id.clone()),
                    seq,
                },
                _ => Message::Ack,
            }
        }

        fn local_id(&self) -> &AgentId {
            &self.id
        }
    }

    fn id(seed: u8) -> AgentId {
        NodeIdentity::from_seed(&[seed; 32]).agent_id().clone()
    }

    async fn start(delay: Duration) -> (Endpoint, watch::Sender<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        let handler = Arc::new(EchoHandler { id: id(1), delay });
        tokio::spawn(serve(listener, handler, rx));
        (Endpoint::parse(&format!("tcp://{addr}")).unwrap(), tx)
    }

    #[tokio::test]
    async fn test_request_reply_after_handshake() {
        let (endpoint, _shutdown) = start(Duration::ZERO).await;
        let transport = TcpTransport::new(id(2));

        let reply = transport
            .request(
                &endpoint,
                Message::GossipAck {
                    origin: id(3),
                    seq: 42,
                },
                Duration::from_secs(2),
            )
            .await
            .unwrap();

        // The handler sees the id the client presented in its hello
        assert_eq!(
            reply,
            Message::GossipAck {
                origin: id(2),
                seq: 42
            }
        );
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let (endpoint, _shutdown) = start(Duration::from_millis(500)).await;
        let transport = TcpTransport::new(id(2));

        let result = transport
            .request(&endpoint, Message::Ack, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(TransportError::Timeout(50))));
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = TcpTransport::new(id(2));
        let endpoint = Endpoint::parse(&format!("tcp://{addr}")).unwrap();
        let err = transport
            .request(&endpoint, Message::Ack, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.failure_kind(), FailureKind::PeerUnreachable);
    }

    #[tokio::test]
    async fn test_mem_endpoint_is_unsupported() {
        let transport = TcpTransport::new(id(2));
        let endpoint = Endpoint::parse("mem://router").unwrap();
        let result = transport
            .request(&endpoint, Message::Ack, Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(TransportError::UnsupportedScheme(_))));
    }

    #[tokio::test]
    async fn test_version_mismatch_is_rejected() {
        let (endpoint, _shutdown) = start(Duration::ZERO).await;
        let stream = TcpStream::connect(endpoint.authority()).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let bad_hello = Message::Hello {
            agent_id: id(2),
            version: "elmnet/0".to_string(),
        };
        write_frame(&mut write_half, &bad_hello).await.unwrap();

        let reply = read_frame(&mut reader).await.unwrap();
        assert!(matches!(
            reply,
            Some(Message::Rejected {
                kind: FailureKind::Malformed,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_garbage_frame_gets_rejection_and_connection_survives() {
        let (endpoint, _shutdown) = start(Duration::ZERO).await;
        let stream = TcpStream::connect(endpoint.authority()).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_frame(&mut write_half, &hello(&id(2))).await.unwrap();
        assert!(matches!(
            read_frame(&mut reader).await.unwrap(),
            Some(Message::Hello { .. })
        ));

        write_half.write_all(b"{not json}\n").await.unwrap();
        assert!(matches!(
            read_frame(&mut reader).await.unwrap(),
            Some(Message::Rejected { .. })
        ));

        write_frame(&mut write_half, &Message::Ack).await.unwrap();
        assert_eq!(read_frame(&mut reader).await.unwrap(), Some(Message::Ack));
    }

    #[tokio::test]
    async fn test_read_frame_skips_blank_lines() {
        let input = b"\n\n{\"type\":\"ack\"}\n".to_vec();
        let mut reader = BufReader::new(&input[..]);
        assert_eq!(read_frame(&mut reader).await.unwrap(), Some(Message::Ack));
        assert_eq!(read_frame(&mut reader).await.unwrap(), None);
    }
}
