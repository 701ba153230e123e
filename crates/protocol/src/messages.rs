//! Packet definitions for the session layer.
//!
//! Packets travel inside Noise transport messages, MessagePack-encoded and
//! wrapped in an [`Envelope`]. Stream packets carry two ids: the sender's
//! id for the stream and the recipient's id for the same stream (0 while
//! the recipient has not assigned one yet).

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest write payload this implementation offers during connect.
pub const DEFAULT_MAX_PAYLOAD: u32 = 4096;

/// Envelope wrapper for all packets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version for compatibility checking.
    pub version: u8,
    /// Per-direction sequence number.
    pub sequence: u64,
    /// The packet.
    pub payload: Packet,
}

impl Envelope {
    /// Create a new envelope with the current protocol version.
    pub fn new(sequence: u64, payload: Packet) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            sequence,
            payload,
        }
    }

    /// Serialize to MessagePack.
    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Deserialize from MessagePack, rejecting foreign versions.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        let envelope: Envelope = rmp_serde::from_slice(bytes)?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: envelope.version,
            });
        }
        Ok(envelope)
    }
}

/// Session-layer packets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Packet {
    /// First packet on an encrypted session, sent by both sides.
    Connect(Connect),
    /// Request to open a stream to a service.
    Open(Open),
    /// Stream accepted, or previous write consumed.
    Okay(StreamIds),
    /// Stream data.
    Write(Write),
    /// Stream closed, or open refused.
    Close(StreamIds),
}

impl Packet {
    /// Short name of the packet kind, for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "connect",
            Packet::Open(_) => "open",
            Packet::Okay(_) => "okay",
            Packet::Write(_) => "write",
            Packet::Close(_) => "close",
        }
    }
}

/// Connect banner exchanged right after the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connect {
    /// Protocol version of the sender.
    pub version: u8,
    /// Largest `Write` payload the sender is willing to receive.
    pub max_payload: u32,
    /// Free-form identity string, e.g. `host::devshell` or `device::model=x`.
    pub banner: String,
}

/// Request to open a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Open {
    /// Id the opener assigned to the new stream.
    pub sender_id: u32,
    /// Service descriptor, e.g. `shell:`.
    pub destination: String,
}

/// The id pair identifying one stream from the sender's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamIds {
    /// The sender's id for the stream.
    pub sender_id: u32,
    /// The recipient's id for the stream.
    pub recipient_id: u32,
}

/// Stream data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Write {
    /// The sender's id for the stream.
    pub sender_id: u32,
    /// The recipient's id for the stream.
    pub recipient_id: u32,
    /// Payload bytes.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Authentication proof carried in the final handshake message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthProof {
    /// The initiator's Ed25519 public key.
    #[serde(with = "serde_bytes")]
    pub public_key: [u8; 32],
    /// Signature over the handshake hash observed after the second message.
    #[serde(with = "serde_bytes")]
    pub signature: [u8; 64],
}
