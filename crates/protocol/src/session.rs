//! Authenticated sessions.
//!
//! A [`Session`] is created by running the Noise XX handshake over a byte
//! transport, followed by an exchange of `Connect` packets. Only then is the
//! value handed to the caller, so a `Session` is never half connected.
//!
//! Each session runs two background tasks:
//!
//! ```text
//!            ┌──────────────┐  frames   ┌───────────┐
//!  packets ─►│ writer task  │──────────►│           │
//!            └──────────────┘           │ transport │
//!            ┌──────────────┐  frames   │           │
//!  streams ◄─│ reader task  │◄──────────│           │
//!            └──────────────┘           └───────────┘
//! ```
//!
//! The writer owns the encrypting half of the Noise transport and drains a
//! packet queue shared by every stream. The reader owns the decrypting half
//! and dispatches packets to the stream table. When the reader stops, for
//! any reason, the session is torn down and every stream is closed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::crypto::{KeyPair, PublicKey, Signature};
use crate::error::{ProtocolError, Result};
use crate::framing::FrameCodec;
use crate::messages::{
    AuthProof, Connect, Envelope, Open, Packet, StreamIds, Write, PROTOCOL_VERSION,
};
use crate::noise::{NoiseHandshake, NoiseReceiver, NoiseSender, MAX_PLAINTEXT_SIZE};
use crate::provider::ProtocolConfig;
use crate::stream::{validate_descriptor, LogicalStream, StreamState};

/// Packets queued for the writer task before senders wait.
const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// Opened streams waiting for `accept_stream` before new opens are refused.
const INCOMING_QUEUE_DEPTH: usize = 16;

/// Room left in a Noise message for the envelope around a write payload.
const ENVELOPE_ALLOWANCE: usize = 256;

/// Largest write payload either side may negotiate.
pub const MAX_WRITE_PAYLOAD: u32 = (MAX_PLAINTEXT_SIZE - ENVELOPE_ALLOWANCE) as u32;

/// Wraps packets in envelopes and encrypts them.
struct PacketSealer {
    noise: NoiseSender,
    sequence: u64,
}

impl PacketSealer {
    fn seal(&mut self, packet: Packet) -> Result<Vec<u8>> {
        let plaintext = Envelope::new(self.sequence, packet).to_msgpack()?;
        let ciphertext = self.noise.encrypt(&plaintext)?;
        self.sequence += 1;
        Ok(ciphertext)
    }
}

/// Decrypts frames and unwraps their envelopes.
struct PacketOpener {
    noise: NoiseReceiver,
    expected: u64,
}

impl PacketOpener {
    fn open(&mut self, frame: &[u8]) -> Result<Packet> {
        let plaintext = self.noise.decrypt(frame)?;
        let envelope = Envelope::from_msgpack(&plaintext)?;
        if envelope.sequence != self.expected {
            return Err(ProtocolError::Deserialization(format!(
                "out of order packet: expected sequence {}, got {}",
                self.expected, envelope.sequence
            )));
        }
        self.expected += 1;
        Ok(envelope.payload)
    }
}

/// What each side learned about the other while connecting.
#[derive(Debug, Clone)]
struct PeerInfo {
    banner: String,
    static_key: Option<[u8; 32]>,
    public_key: Option<PublicKey>,
}

/// An open request waiting for the peer's answer.
struct PendingOpen {
    destination: String,
    reply: oneshot::Sender<Result<LogicalStream>>,
}

/// State shared by the session handle, its streams and its tasks.
pub(crate) struct SessionShared {
    outbound: mpsc::Sender<Packet>,
    streams: Mutex<HashMap<u32, Arc<StreamState>>>,
    pending_opens: Mutex<HashMap<u32, PendingOpen>>,
    incoming: Option<Mutex<mpsc::Receiver<LogicalStream>>>,
    next_id: AtomicU32,
    connected: AtomicBool,
    shutdown: CancellationToken,
    max_payload: usize,
    services: Vec<String>,
    peer: PeerInfo,
}

impl SessionShared {
    pub(crate) fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Queues a packet for the writer task.
    pub(crate) async fn send(&self, packet: Packet) -> Result<()> {
        self.outbound
            .send(packet)
            .await
            .map_err(|_| ProtocolError::NotConnected)
    }

    pub(crate) async fn forget_stream(&self, local_id: u32) {
        self.streams.lock().await.remove(&local_id);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.shutdown.is_cancelled()
    }

    fn allocate_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Services are matched by prefix, so `shell:` also admits `shell:ls`.
    fn offers(&self, destination: &str) -> bool {
        self.services.is_empty() || self.services.iter().any(|s| destination.starts_with(s))
    }

    async fn dispatch(
        self: &Arc<Self>,
        incoming: Option<&mpsc::Sender<LogicalStream>>,
        packet: Packet,
    ) {
        match packet {
            Packet::Open(open) => self.handle_open(incoming, open).await,
            Packet::Okay(ids) => self.handle_okay(ids).await,
            Packet::Write(write) => self.handle_write(write).await,
            Packet::Close(ids) => self.handle_close(ids).await,
            Packet::Connect(_) => {
                tracing::debug!("Ignoring repeated connect packet");
            }
        }
    }

    async fn handle_open(
        self: &Arc<Self>,
        incoming: Option<&mpsc::Sender<LogicalStream>>,
        open: Open,
    ) {
        let refusal = Packet::Close(StreamIds {
            sender_id: 0,
            recipient_id: open.sender_id,
        });

        let Some(incoming) = incoming else {
            tracing::debug!(destination = %open.destination, "Refusing stream opened by peer");
            let _ = self.send(refusal).await;
            return;
        };
        if validate_descriptor(&open.destination).is_err() || !self.offers(&open.destination) {
            tracing::info!(destination = %open.destination, "Refusing unknown service");
            let _ = self.send(refusal).await;
            return;
        }

        let local_id = self.allocate_id();
        let state = StreamState::new(local_id, open.sender_id, open.destination.clone());
        self.streams
            .lock()
            .await
            .insert(local_id, Arc::clone(&state));

        // Accept before handing the stream out, so the peer sees our okay
        // ahead of any data written by the acceptor.
        let _ = self
            .send(Packet::Okay(StreamIds {
                sender_id: local_id,
                recipient_id: open.sender_id,
            }))
            .await;

        let stream = LogicalStream::new(state, Arc::clone(self));
        if let Err(e) = incoming.try_send(stream) {
            tracing::warn!(destination = %open.destination, "Nobody is accepting streams, closing");
            let stream = match e {
                mpsc::error::TrySendError::Full(stream) => stream,
                mpsc::error::TrySendError::Closed(stream) => stream,
            };
            stream.close().await;
            return;
        }
        tracing::debug!(stream = local_id, destination = %open.destination, "Accepted stream");
    }

    async fn handle_okay(self: &Arc<Self>, ids: StreamIds) {
        let pending = self.pending_opens.lock().await.remove(&ids.recipient_id);
        if let Some(pending) = pending {
            let state = StreamState::new(ids.recipient_id, ids.sender_id, pending.destination);
            self.streams
                .lock()
                .await
                .insert(ids.recipient_id, Arc::clone(&state));

            let stream = LogicalStream::new(state, Arc::clone(self));
            if let Err(Ok(stream)) = pending.reply.send(Ok(stream)) {
                // The opener went away while waiting.
                stream.close().await;
            }
            return;
        }

        match self.streams.lock().await.get(&ids.recipient_id) {
            Some(state) => state.grant_write_credit(),
            None => tracing::trace!(stream = ids.recipient_id, "Okay for unknown stream"),
        }
    }

    async fn handle_write(&self, write: Write) {
        match self.streams.lock().await.get(&write.recipient_id) {
            Some(state) => state.deliver(write.data),
            None => tracing::debug!(
                stream = write.recipient_id,
                bytes = write.data.len(),
                "Dropping data for unknown stream"
            ),
        }
    }

    async fn handle_close(&self, ids: StreamIds) {
        let pending = self.pending_opens.lock().await.remove(&ids.recipient_id);
        if let Some(pending) = pending {
            let _ = pending.reply.send(Err(ProtocolError::StreamRejected {
                destination: pending.destination,
            }));
            return;
        }

        let state = self.streams.lock().await.remove(&ids.recipient_id);
        if let Some(state) = state {
            tracing::debug!(stream = ids.recipient_id, "Peer closed stream");
            state.mark_closed();
        }
    }

    /// Marks the session disconnected and closes every stream. Idempotent.
    async fn teardown(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.shutdown.cancel();

        let streams: Vec<_> = self.streams.lock().await.drain().map(|(_, s)| s).collect();
        for state in streams {
            state.mark_closed();
        }
        // Dropping the reply senders fails the waiting opens.
        self.pending_opens.lock().await.clear();

        if let Some(incoming) = &self.incoming {
            let mut queue = incoming.lock().await;
            queue.close();
            while queue.try_recv().is_ok() {}
        }
    }
}

/// One authenticated, encrypted connection to a peer.
///
/// Handles are cheap to clone and all refer to the same connection.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    /// Runs the handshake as the initiator and exchanges connect packets.
    pub(crate) async fn initiate<T>(
        transport: T,
        key_pair: &KeyPair,
        config: &ProtocolConfig,
    ) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        check_config(config)?;
        let mut framed = Framed::new(transport, FrameCodec::new());
        let mut handshake = NoiseHandshake::new_initiator(key_pair)?;

        framed.send(handshake.write_message(&[])?).await?;
        let response = next_frame(&mut framed).await?;
        handshake.read_message(&response)?;

        let proof = AuthProof {
            public_key: key_pair.public_key_bytes(),
            signature: key_pair.sign(&handshake.handshake_hash()).0,
        };
        let payload = rmp_serde::to_vec_named(&proof)?;
        framed.send(handshake.write_message(&payload)?).await?;

        let static_key = handshake.remote_static();
        let (sender, receiver) = handshake.into_transport()?;
        let mut sealer = PacketSealer {
            noise: sender,
            sequence: 0,
        };
        let mut opener = PacketOpener {
            noise: receiver,
            expected: 0,
        };

        // A peer that refuses our key hangs up instead of sending its banner.
        let connect = exchange_connect(&mut framed, &mut sealer, &mut opener, config)
            .await
            .map_err(|e| match e {
                ProtocolError::ConnectionClosed(_) => ProtocolError::AuthenticationRejected,
                other => other,
            })?;

        let peer = PeerInfo {
            banner: connect.banner.clone(),
            static_key,
            public_key: None,
        };
        tracing::debug!(banner = %peer.banner, "Session established");
        Ok(Self::start(framed, sealer, opener, config, &connect, peer, false))
    }

    /// Runs the handshake as the responder, checks the initiator's key with
    /// `authorizer`, and exchanges connect packets.
    pub(crate) async fn respond<T, F>(
        transport: T,
        key_pair: &KeyPair,
        config: &ProtocolConfig,
        authorizer: F,
    ) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        F: FnOnce(&PublicKey) -> bool,
    {
        check_config(config)?;
        let mut framed = Framed::new(transport, FrameCodec::new());
        let mut handshake = NoiseHandshake::new_responder(key_pair)?;

        let hello = next_frame(&mut framed).await?;
        handshake.read_message(&hello)?;
        framed.send(handshake.write_message(&[])?).await?;

        let transcript = handshake.handshake_hash();
        let finish = next_frame(&mut framed).await?;
        let payload = handshake.read_message(&finish)?;

        let proof: AuthProof = rmp_serde::from_slice(&payload)?;
        let client_key = PublicKey::from_bytes(&proof.public_key)?;
        client_key.verify(&transcript, &Signature(proof.signature))?;
        if !authorizer(&client_key) {
            tracing::warn!(key = %client_key.fingerprint(), "Rejected client key");
            return Err(ProtocolError::AuthenticationRejected);
        }

        let static_key = handshake.remote_static();
        let (sender, receiver) = handshake.into_transport()?;
        let mut sealer = PacketSealer {
            noise: sender,
            sequence: 0,
        };
        let mut opener = PacketOpener {
            noise: receiver,
            expected: 0,
        };
        let connect = exchange_connect(&mut framed, &mut sealer, &mut opener, config).await?;

        let peer = PeerInfo {
            banner: connect.banner.clone(),
            static_key,
            public_key: Some(client_key),
        };
        tracing::info!(
            key = %client_key.fingerprint(),
            banner = %peer.banner,
            "Accepted client"
        );
        Ok(Self::start(framed, sealer, opener, config, &connect, peer, true))
    }

    fn start<T>(
        framed: Framed<T, FrameCodec>,
        sealer: PacketSealer,
        opener: PacketOpener,
        config: &ProtocolConfig,
        connect: &Connect,
        peer: PeerInfo,
        accepting: bool,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (sink, frames) = framed.split();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let (incoming_tx, incoming) = if accepting {
            let (tx, rx) = mpsc::channel(INCOMING_QUEUE_DEPTH);
            (Some(tx), Some(Mutex::new(rx)))
        } else {
            (None, None)
        };

        let max_payload = config
            .max_payload
            .min(connect.max_payload)
            .min(MAX_WRITE_PAYLOAD) as usize;

        let shared = Arc::new(SessionShared {
            outbound,
            streams: Mutex::new(HashMap::new()),
            pending_opens: Mutex::new(HashMap::new()),
            incoming,
            next_id: AtomicU32::new(1),
            connected: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
            max_payload,
            services: config.services.clone(),
            peer,
        });

        tokio::spawn(write_loop(sink, sealer, outbound_rx, shared.shutdown.clone()));
        tokio::spawn(read_loop(frames, opener, Arc::clone(&shared), incoming_tx));

        Self { shared }
    }

    /// Opens a stream to `destination` on the peer.
    ///
    /// Fails with [`ProtocolError::InvalidDescriptor`] before anything is sent
    /// if the descriptor cannot go on the wire, with
    /// [`ProtocolError::NotConnected`] if the session is gone, and with
    /// [`ProtocolError::StreamRejected`] if the peer refuses the service.
    pub async fn open_stream(&self, destination: &str) -> Result<LogicalStream> {
        validate_descriptor(destination)?;

        let shared = &self.shared;
        let local_id = shared.allocate_id();
        let (reply, response) = oneshot::channel();
        shared.pending_opens.lock().await.insert(
            local_id,
            PendingOpen {
                destination: destination.to_string(),
                reply,
            },
        );

        // Teardown clears the table after flipping the flag, so either it
        // sees our entry or we see the flag.
        if !shared.is_connected() {
            shared.pending_opens.lock().await.remove(&local_id);
            return Err(ProtocolError::NotConnected);
        }

        let request = Packet::Open(Open {
            sender_id: local_id,
            destination: destination.to_string(),
        });
        if let Err(e) = shared.send(request).await {
            shared.pending_opens.lock().await.remove(&local_id);
            return Err(e);
        }
        tracing::debug!(stream = local_id, destination, "Opening stream");

        response.await.map_err(|_| ProtocolError::NotConnected)?
    }

    /// Waits for the peer to open a stream.
    ///
    /// Only sessions created by accepting a connection receive streams.
    pub async fn accept_stream(&self) -> Result<LogicalStream> {
        let incoming = self
            .shared
            .incoming
            .as_ref()
            .ok_or(ProtocolError::Unsupported("initiating sessions do not accept streams"))?;

        let mut queue = incoming.lock().await;
        tokio::select! {
            biased;
            stream = queue.recv() => stream.ok_or(ProtocolError::NotConnected),
            _ = self.shared.shutdown.cancelled() => Err(ProtocolError::NotConnected),
        }
    }

    /// Returns whether the session is still connected.
    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Closes the connection and every stream on it.
    pub async fn close(&self) {
        self.shared.teardown().await;
    }

    /// Negotiated maximum payload of one write packet.
    pub fn max_payload(&self) -> usize {
        self.shared.max_payload
    }

    /// Banner the peer sent in its connect packet.
    pub fn peer_banner(&self) -> &str {
        &self.shared.peer.banner
    }

    /// The peer's static Noise key.
    pub fn peer_static_key(&self) -> Option<[u8; 32]> {
        self.shared.peer.static_key
    }

    /// The initiator's authenticated key, on accepting sessions.
    pub fn peer_public_key(&self) -> Option<&PublicKey> {
        self.shared.peer.public_key.as_ref()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer_banner", &self.shared.peer.banner)
            .field("max_payload", &self.shared.max_payload)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Rejects settings that would leave the session unable to write.
fn check_config(config: &ProtocolConfig) -> Result<()> {
    if config.max_payload == 0 {
        return Err(ProtocolError::InvalidConfig("max payload must be positive"));
    }
    Ok(())
}

async fn next_frame<T>(framed: &mut Framed<T, FrameCodec>) -> Result<Bytes>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    match framed.next().await {
        Some(frame) => frame,
        None => Err(ProtocolError::ConnectionClosed(
            "peer closed the connection".to_string(),
        )),
    }
}

async fn exchange_connect<T>(
    framed: &mut Framed<T, FrameCodec>,
    sealer: &mut PacketSealer,
    opener: &mut PacketOpener,
    config: &ProtocolConfig,
) -> Result<Connect>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let ours = Connect {
        version: PROTOCOL_VERSION,
        max_payload: config.max_payload,
        banner: config.banner.clone(),
    };
    framed.send(sealer.seal(Packet::Connect(ours))?).await?;

    let frame = next_frame(framed).await?;
    match opener.open(&frame)? {
        Packet::Connect(theirs) if theirs.max_payload > 0 => Ok(theirs),
        Packet::Connect(_) => Err(ProtocolError::HandshakeFailed(
            "peer offered a zero max payload".to_string(),
        )),
        other => Err(ProtocolError::HandshakeFailed(format!(
            "expected connect packet, got {}",
            other.kind()
        ))),
    }
}

async fn send_packet<S>(sink: &mut S, sealer: &mut PacketSealer, packet: Packet) -> Result<()>
where
    S: Sink<Vec<u8>, Error = ProtocolError> + Unpin,
{
    let frame = sealer.seal(packet)?;
    sink.send(frame).await
}

async fn write_loop<S>(
    mut sink: S,
    mut sealer: PacketSealer,
    mut outbound: mpsc::Receiver<Packet>,
    shutdown: CancellationToken,
) where
    S: Sink<Vec<u8>, Error = ProtocolError> + Unpin,
{
    loop {
        let packet = tokio::select! {
            _ = shutdown.cancelled() => break,
            packet = outbound.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };
        if let Err(e) = send_packet(&mut sink, &mut sealer, packet).await {
            tracing::warn!(error = %e, "Session writer failed");
            shutdown.cancel();
            return;
        }
    }

    // Flush what was queued before shutdown, such as a final stream close.
    outbound.close();
    while let Ok(packet) = outbound.try_recv() {
        if send_packet(&mut sink, &mut sealer, packet).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
    tracing::trace!("Session writer stopped");
}

async fn read_loop<S>(
    mut frames: S,
    mut opener: PacketOpener,
    shared: Arc<SessionShared>,
    incoming: Option<mpsc::Sender<LogicalStream>>,
) where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            frame = frames.next() => frame,
        };
        let packet = match frame {
            Some(Ok(frame)) => opener.open(&frame),
            Some(Err(e)) => Err(e),
            None => {
                tracing::debug!("Peer closed the session");
                break;
            }
        };
        match packet {
            Ok(packet) => shared.dispatch(incoming.as_ref(), packet).await,
            Err(e) => {
                tracing::warn!(error = %e, "Session reader failed");
                break;
            }
        }
    }
    shared.teardown().await;
    tracing::trace!("Session reader stopped");
}
