//! Logical streams multiplexed over a [`Session`](crate::Session).
//!
//! A stream carries bytes in both directions between one local handle and
//! one service on the peer. Flow control is one outstanding write per
//! direction: a `Write` packet is only sent once the peer acknowledged the
//! previous one with `Okay`, and a reader acknowledges a chunk when it
//! consumes it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{ProtocolError, Result};
use crate::messages::{Packet, StreamIds, Write};
use crate::session::SessionShared;

/// Longest service descriptor accepted on the wire.
pub const MAX_DESCRIPTOR_LENGTH: usize = 1024;

/// Checks that a service descriptor can be sent on the wire.
///
/// Descriptors are printable ASCII (`0x20..=0x7e`), non-empty, and at most
/// [`MAX_DESCRIPTOR_LENGTH`] bytes.
pub fn validate_descriptor(descriptor: &str) -> Result<()> {
    let invalid = |reason| ProtocolError::InvalidDescriptor {
        descriptor: descriptor.to_string(),
        reason,
    };

    if descriptor.is_empty() {
        return Err(invalid("empty descriptor"));
    }
    if descriptor.len() > MAX_DESCRIPTOR_LENGTH {
        return Err(invalid("descriptor too long"));
    }
    for ch in descriptor.chars() {
        match ch {
            '\0' => return Err(invalid("contains NUL")),
            c if !c.is_ascii() => return Err(invalid("non-ASCII character")),
            c if c.is_ascii_control() => return Err(invalid("control character")),
            _ => {}
        }
    }
    Ok(())
}

/// Shared state of one stream, owned by the session's stream table.
pub(crate) struct StreamState {
    local_id: u32,
    remote_id: u32,
    destination: String,
    closed: CancellationToken,
    close_sent: AtomicBool,
    /// One permit while the peer has acknowledged our last write.
    write_credit: Semaphore,
    inbound_tx: mpsc::UnboundedSender<Bytes>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

impl StreamState {
    pub(crate) fn new(local_id: u32, remote_id: u32, destination: String) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            local_id,
            remote_id,
            destination,
            closed: CancellationToken::new(),
            close_sent: AtomicBool::new(false),
            write_credit: Semaphore::new(1),
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
        })
    }

    /// Queues data received from the peer.
    pub(crate) fn deliver(&self, data: Vec<u8>) {
        if self.closed.is_cancelled() {
            return;
        }
        // The receiver lives as long as `self`.
        let _ = self.inbound_tx.send(Bytes::from(data));
    }

    /// The peer acknowledged our last write.
    pub(crate) fn grant_write_credit(&self) {
        if self.write_credit.available_permits() == 0 {
            self.write_credit.add_permits(1);
        }
    }

    /// Marks the stream closed without sending a close packet.
    pub(crate) fn mark_closed(&self) {
        self.close_sent.store(true, Ordering::SeqCst);
        self.closed.cancel();
    }

    fn ids(&self) -> StreamIds {
        StreamIds {
            sender_id: self.local_id,
            recipient_id: self.remote_id,
        }
    }
}

/// Handle to one logical stream.
///
/// Handles are cheap to clone; every clone refers to the same stream, so one
/// task may read while another writes.
#[derive(Clone)]
pub struct LogicalStream {
    state: Arc<StreamState>,
    session: Arc<SessionShared>,
}

impl LogicalStream {
    pub(crate) fn new(state: Arc<StreamState>, session: Arc<SessionShared>) -> Self {
        Self { state, session }
    }

    /// Our id for this stream.
    pub fn local_id(&self) -> u32 {
        self.state.local_id
    }

    /// The peer's id for this stream.
    pub fn remote_id(&self) -> u32 {
        self.state.remote_id
    }

    /// The service descriptor the stream was opened for.
    pub fn destination(&self) -> &str {
        &self.state.destination
    }

    /// Returns whether the stream was closed by either side.
    pub fn is_closed(&self) -> bool {
        self.state.closed.is_cancelled()
    }

    /// Completes once the stream is closed.
    pub async fn closed(&self) {
        self.state.closed.cancelled().await
    }

    /// Reads the next chunk sent by the peer.
    ///
    /// Blocks until data arrives or the stream closes. Once the stream is
    /// closed this returns [`ProtocolError::StreamClosed`], including for
    /// calls that were already waiting.
    pub async fn read(&self) -> Result<Vec<u8>> {
        let mut inbound = tokio::select! {
            biased;
            _ = self.state.closed.cancelled() => return Err(ProtocolError::StreamClosed),
            guard = self.state.inbound_rx.lock() => guard,
        };

        let chunk = tokio::select! {
            biased;
            _ = self.state.closed.cancelled() => return Err(ProtocolError::StreamClosed),
            chunk = inbound.recv() => chunk.ok_or(ProtocolError::StreamClosed)?,
        };
        drop(inbound);

        if let Err(e) = self.session.send(Packet::Okay(self.state.ids())).await {
            tracing::debug!(stream = self.state.local_id, error = %e, "Could not acknowledge read");
        }
        Ok(chunk.to_vec())
    }

    /// Writes `data` to the peer.
    ///
    /// Data longer than the session's maximum payload is split into several
    /// packets, each sent once the peer acknowledged the previous one.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(self.session.max_payload()) {
            let permit = tokio::select! {
                biased;
                _ = self.state.closed.cancelled() => return Err(ProtocolError::StreamClosed),
                permit = self.state.write_credit.acquire() => {
                    permit.map_err(|_| ProtocolError::StreamClosed)?
                }
            };
            permit.forget();

            let ids = self.state.ids();
            self.session
                .send(Packet::Write(Write {
                    sender_id: ids.sender_id,
                    recipient_id: ids.recipient_id,
                    data: chunk.to_vec(),
                }))
                .await?;
        }
        Ok(())
    }

    /// Waits until the peer acknowledged everything written so far.
    pub async fn flush(&self) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.state.closed.cancelled() => Err(ProtocolError::StreamClosed),
            permit = self.state.write_credit.acquire() => {
                permit.map(drop).map_err(|_| ProtocolError::StreamClosed)
            }
        }
    }

    /// Closes the stream.
    ///
    /// Idempotent: only the first call sends a close packet, and nothing is
    /// sent if the peer closed the stream first.
    pub async fn close(&self) {
        if self.state.close_sent.swap(true, Ordering::SeqCst) {
            self.state.closed.cancel();
            return;
        }
        self.state.closed.cancel();
        self.session.forget_stream(self.state.local_id).await;

        if let Err(e) = self.session.send(Packet::Close(self.state.ids())).await {
            tracing::debug!(stream = self.state.local_id, error = %e, "Could not send close");
        }
        tracing::debug!(
            stream = self.state.local_id,
            destination = %self.state.destination,
            "Stream closed"
        );
    }
}

impl std::fmt::Debug for LogicalStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalStream")
            .field("local_id", &self.state.local_id)
            .field("remote_id", &self.state.remote_id)
            .field("destination", &self.state.destination)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_descriptors_are_valid() {
        assert!(validate_descriptor("shell:").is_ok());
        assert!(validate_descriptor("shell:ls -l /sdcard").is_ok());
        assert!(validate_descriptor("tcp:5555").is_ok());
    }

    #[test]
    fn test_empty_descriptor_is_invalid() {
        assert!(matches!(
            validate_descriptor(""),
            Err(ProtocolError::InvalidDescriptor { reason: "empty descriptor", .. })
        ));
    }

    #[test]
    fn test_nul_is_invalid() {
        assert!(matches!(
            validate_descriptor("shell:\0"),
            Err(ProtocolError::InvalidDescriptor { reason: "contains NUL", .. })
        ));
    }

    #[test]
    fn test_non_ascii_is_invalid() {
        assert!(matches!(
            validate_descriptor("shell:echo café"),
            Err(ProtocolError::InvalidDescriptor { reason: "non-ASCII character", .. })
        ));
    }

    #[test]
    fn test_control_characters_are_invalid() {
        assert!(validate_descriptor("shell:\n").is_err());
        assert!(validate_descriptor("shell:\x1b[0m").is_err());
    }

    #[test]
    fn test_overlong_descriptor_is_invalid() {
        let descriptor = format!("shell:{}", "x".repeat(MAX_DESCRIPTOR_LENGTH));
        assert!(validate_descriptor(&descriptor).is_err());
    }

    #[test]
    fn test_write_credit_never_exceeds_one() {
        let state = StreamState::new(1, 2, "shell:".to_string());
        state.grant_write_credit();
        state.grant_write_credit();
        assert_eq!(state.write_credit.available_permits(), 1);
    }

    #[test]
    fn test_mark_closed_suppresses_close_packet() {
        let state = StreamState::new(1, 2, "shell:".to_string());
        state.mark_closed();
        assert!(state.closed.is_cancelled());
        assert!(state.close_sent.load(Ordering::SeqCst));
    }
}
