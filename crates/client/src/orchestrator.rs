//! Connection establishment.
//!
//! Dial, then authenticate, then open one stream. Every step is awaited in
//! order and nothing is retried: the first failure is returned to the
//! caller and the transport is dropped with it.

use std::sync::Arc;
use std::time::Duration;

use protocol::{KeyPair, LogicalStream, ProtocolError, Session, SessionProtocol};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::error::{ConnectError, StreamError};

/// Drives a session from TCP dial to an open stream.
#[derive(Debug, Clone)]
pub struct SessionOrchestrator {
    provider: Arc<SessionProtocol>,
    connect_timeout: Option<Duration>,
}

impl SessionOrchestrator {
    /// Creates an orchestrator that authenticates with `provider`.
    pub fn new(provider: Arc<SessionProtocol>) -> Self {
        Self {
            provider,
            connect_timeout: None,
        }
    }

    /// Bounds dial plus handshake. Without it, both may block indefinitely.
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Connects to `host:port` and authenticates with `key_pair`.
    ///
    /// A [`Session`] is returned only once the handshake completed.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        key_pair: &KeyPair,
    ) -> Result<Session, ConnectError> {
        let addr = format_addr(host, port);
        let attempt = self.dial_and_authenticate(host, port, &addr, key_pair);

        match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, attempt)
                .await
                .map_err(|_| ConnectError::Timeout { addr })?,
            None => attempt.await,
        }
    }

    async fn dial_and_authenticate(
        &self,
        host: &str,
        port: u16,
        addr: &str,
        key_pair: &KeyPair,
    ) -> Result<Session, ConnectError> {
        info!("Socket connecting to {}...", addr);
        let socket = TcpStream::connect((host, port))
            .await
            .map_err(|source| ConnectError::Dial {
                addr: addr.to_string(),
                source,
            })?;
        if let Err(e) = socket.set_nodelay(true) {
            debug!(error = %e, "Could not disable Nagle's algorithm");
        }
        info!("Socket connected");

        info!("Session connecting...");
        let session = self
            .provider
            .authenticate(socket, key_pair)
            .await
            .map_err(|source| ConnectError::Handshake {
                addr: addr.to_string(),
                source,
            })?;
        info!(banner = %session.peer_banner(), "Session connected");
        Ok(session)
    }

    /// Opens the stream for `descriptor` on an established session.
    pub async fn open_stream(
        &self,
        session: &Session,
        descriptor: &str,
    ) -> Result<LogicalStream, StreamError> {
        protocol::validate_descriptor(descriptor).map_err(StreamError::Descriptor)?;

        let stream = session
            .open_stream(descriptor)
            .await
            .map_err(|source| match source {
                e @ ProtocolError::InvalidDescriptor { .. } => StreamError::Descriptor(e),
                source => StreamError::Open {
                    descriptor: descriptor.to_string(),
                    source,
                },
            })?;
        debug!(stream = stream.local_id(), "Opened {}", descriptor);
        Ok(stream)
    }
}

/// `host:port`, bracketing bare IPv6 addresses.
fn format_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
