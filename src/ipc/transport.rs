//! Request/reply transport to the engine-side server.
//!
//! A [`Transport`] moves opaque strings: it knows nothing about commands or
//! values. Exactly one request is outstanding at a time; a transport that
//! failed or was abandoned halfway through an exchange reconnects before the
//! next one, so a late reply can never be paired with the next request.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, trace};
use zeromq::{ReqSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

use crate::config::Address;

/// Largest message the engine-side receiver accepts (its buffer is 200 MB).
pub const MAX_MESSAGE_SIZE: usize = 200_000_000;

/// Transport-level failures.
///
/// These errors provide actionable messages for common failure modes
/// when talking to the engine-side server.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to connect to the server socket.
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] std::io::Error),

    /// Framing or encoding failure.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),

    /// The address kind cannot be used on this platform.
    #[error("Unsupported address: {0}")]
    Unsupported(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
                TransportError::ConnectionFailed(err)
            }
            _ => TransportError::Io(err),
        }
    }
}

/// A strict request/reply channel.
///
/// Object safe so sessions can hold `Box<dyn Transport>` and tests can swap
/// in an in-process fake.
#[async_trait]
pub trait Transport: Send {
    /// Send one payload and wait for exactly one reply.
    async fn exchange(&mut self, payload: &str) -> Result<String, TransportError>;

    /// Drop any partially used connection; the next exchange starts fresh.
    fn reset(&mut self) {}
}

/// ZeroMQ REQ socket speaking to the engine's REP socket.
///
/// Connects lazily on the first exchange, so it can be created before the
/// engine has bound its endpoint; the session's handshake loop simply retries.
/// One message frame per request and per reply.
pub struct SocketTransport {
    address: Address,
    socket: Option<ReqSocket>,
    /// Set between sending a request and receiving its reply.
    in_flight: bool,
    connect_timeout: Duration,
}

impl SocketTransport {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            socket: None,
            in_flight: false,
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Bound on a single connect attempt.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    fn disconnect(&mut self) {
        self.in_flight = false;
        if self.socket.take().is_some() {
            debug!("Dropped connection to {}", self.address);
        }
    }
}

async fn connect(address: &Address, timeout: Duration) -> Result<ReqSocket, TransportError> {
    if cfg!(not(unix)) && matches!(address, Address::Ipc(_)) {
        return Err(TransportError::Unsupported(format!(
            "{} (use a tcp:// address on this platform)",
            address
        )));
    }

    let endpoint = address.to_string();
    let mut socket = ReqSocket::new();
    match tokio::time::timeout(timeout, socket.connect(&endpoint)).await {
        Ok(Ok(())) => Ok(socket),
        Ok(Err(e)) => Err(TransportError::ConnectionFailed(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            format!("{}: {}", endpoint, e),
        ))),
        Err(_) => Err(TransportError::ConnectionFailed(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("connect to {} timed out", endpoint),
        ))),
    }
}

#[async_trait]
impl Transport for SocketTransport {
    async fn exchange(&mut self, payload: &str) -> Result<String, TransportError> {
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(TransportError::Protocol(format!(
                "Request too large: {} bytes (max {})",
                payload.len(),
                MAX_MESSAGE_SIZE
            )));
        }

        // A previous exchange was dropped before its reply arrived
        if self.in_flight {
            debug!("Discarding unanswered request to {}", self.address);
            self.disconnect();
        }

        if self.socket.is_none() {
            let socket = connect(&self.address, self.connect_timeout).await?;
            debug!("Connected to engine at {}", self.address);
            self.socket = Some(socket);
        }

        let Some(socket) = self.socket.as_mut() else {
            return Err(TransportError::Protocol("Socket not open".to_string()));
        };

        trace!("-> {} bytes", payload.len());
        self.in_flight = true;
        if let Err(e) = socket.send(ZmqMessage::from(payload.to_string())).await {
            self.disconnect();
            return Err(TransportError::Protocol(format!("Failed to send request: {}", e)));
        }

        let reply = match socket.recv().await {
            Ok(reply) => reply,
            Err(e) => {
                self.disconnect();
                return Err(TransportError::Protocol(format!("Failed to read response: {}", e)));
            }
        };
        self.in_flight = false;

        let reply = String::try_from(reply)
            .map_err(|e| TransportError::Protocol(format!("Invalid reply: {}", e)))?;
        trace!("<- {} bytes", reply.len());
        Ok(reply)
    }

    fn reset(&mut self) {
        self.disconnect();
    }
}
