//! Noise protocol handshake and transport encryption.
//!
//! This module implements the Noise XX handshake pattern, followed by
//! encrypted transport. After the handshake the transport is split into a
//! [`NoiseSender`] and a [`NoiseReceiver`] so the two directions of a
//! session can be driven by separate tasks without a lock.
//!
//! ## Noise XX Pattern
//! ```text
//! -> e
//! <- e, ee, s, es
//! -> s, se
//! ```

use std::sync::Arc;

use snow::{Builder, HandshakeState, StatelessTransportState};

use crate::crypto::KeyPair;
use crate::error::{ProtocolError, Result};

/// Noise_XX_25519_ChaChaPoly_BLAKE2s: mutual static keys, Curve25519 DH,
/// ChaCha20-Poly1305 AEAD, BLAKE2s hashing.
const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2s";

/// Mixed into the handshake so transcripts from other protocols never verify.
const NOISE_PROLOGUE: &[u8] = b"devshell/1";

/// Maximum size for a Noise protocol message.
pub const MAX_NOISE_MESSAGE_SIZE: usize = 65535;

/// Overhead added by Noise encryption (Poly1305 tag).
pub const NOISE_OVERHEAD: usize = 16;

/// Largest plaintext that fits in one transport message.
pub const MAX_PLAINTEXT_SIZE: usize = MAX_NOISE_MESSAGE_SIZE - NOISE_OVERHEAD;

/// State of the Noise handshake process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandshakePhase {
    /// Initiator: Ready to send first message (-> e)
    InitiatorStart,
    /// Initiator: Waiting for response (<- e, ee, s, es)
    InitiatorWaitingForResponse,
    /// Initiator: Ready to send final message (-> s, se)
    InitiatorSendFinal,
    /// Responder: Waiting for first message (-> e)
    ResponderStart,
    /// Responder: Ready to send response (<- e, ee, s, es)
    ResponderSendResponse,
    /// Responder: Waiting for final message (-> s, se)
    ResponderWaitingForFinal,
    /// Handshake complete, ready for transport
    Complete,
}

/// Role in the Noise handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// Dials and authenticates (the client).
    Initiator,
    /// Accepts and verifies (the device daemon).
    Responder,
}

/// Handshake half of a Noise session.
pub struct NoiseHandshake {
    state: HandshakeState,
    phase: HandshakePhase,
    role: Role,
    buffer: Vec<u8>,
}

impl NoiseHandshake {
    /// Starts a handshake as the initiator.
    pub fn new_initiator(key_pair: &KeyPair) -> Result<Self> {
        let state = build_state(key_pair, Role::Initiator)?;
        Ok(Self::with_state(state, Role::Initiator))
    }

    /// Starts a handshake as the responder.
    pub fn new_responder(key_pair: &KeyPair) -> Result<Self> {
        let state = build_state(key_pair, Role::Responder)?;
        Ok(Self::with_state(state, Role::Responder))
    }

    fn with_state(state: HandshakeState, role: Role) -> Self {
        let phase = match role {
            Role::Initiator => HandshakePhase::InitiatorStart,
            Role::Responder => HandshakePhase::ResponderStart,
        };
        Self {
            state,
            phase,
            role,
            buffer: vec![0u8; MAX_NOISE_MESSAGE_SIZE],
        }
    }

    /// The running handshake hash.
    ///
    /// Both sides observe the same value after the second message, which is
    /// what the initiator signs to prove ownership of its key pair.
    pub fn handshake_hash(&self) -> Vec<u8> {
        self.state.get_handshake_hash().to_vec()
    }

    /// Writes the next handshake message carrying `payload`.
    pub fn write_message(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let next = match (self.role, self.phase) {
            (Role::Initiator, HandshakePhase::InitiatorStart) => {
                HandshakePhase::InitiatorWaitingForResponse
            }
            (Role::Initiator, HandshakePhase::InitiatorSendFinal) => HandshakePhase::Complete,
            (Role::Responder, HandshakePhase::ResponderSendResponse) => {
                HandshakePhase::ResponderWaitingForFinal
            }
            _ => {
                return Err(ProtocolError::HandshakeFailed(format!(
                    "cannot write in current phase: {:?}",
                    self.phase
                )))
            }
        };

        let len = self.state.write_message(payload, &mut self.buffer)?;
        self.phase = next;
        Ok(self.buffer[..len].to_vec())
    }

    /// Reads a handshake message from the peer and returns its payload.
    pub fn read_message(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        let next = match (self.role, self.phase) {
            (Role::Initiator, HandshakePhase::InitiatorWaitingForResponse) => {
                HandshakePhase::InitiatorSendFinal
            }
            (Role::Responder, HandshakePhase::ResponderStart) => {
                HandshakePhase::ResponderSendResponse
            }
            (Role::Responder, HandshakePhase::ResponderWaitingForFinal) => HandshakePhase::Complete,
            _ => {
                return Err(ProtocolError::HandshakeFailed(format!(
                    "cannot read in current phase: {:?}",
                    self.phase
                )))
            }
        };

        let len = self.state.read_message(message, &mut self.buffer)?;
        self.phase = next;
        Ok(self.buffer[..len].to_vec())
    }

    /// Returns the peer's static X25519 public key once it has been received.
    pub fn remote_static(&self) -> Option<[u8; 32]> {
        let remote = self.state.get_remote_static()?;
        remote.try_into().ok()
    }

    /// Finishes the handshake and splits the transport into its two directions.
    pub fn into_transport(self) -> Result<(NoiseSender, NoiseReceiver)> {
        if self.phase != HandshakePhase::Complete {
            return Err(ProtocolError::HandshakeIncomplete);
        }
        let remote_static = self.remote_static();
        let transport = Arc::new(self.state.into_stateless_transport_mode()?);
        Ok((
            NoiseSender {
                transport: Arc::clone(&transport),
                nonce: 0,
                buffer: vec![0u8; MAX_NOISE_MESSAGE_SIZE],
            },
            NoiseReceiver {
                transport,
                nonce: 0,
                remote_static,
                buffer: vec![0u8; MAX_NOISE_MESSAGE_SIZE],
            },
        ))
    }
}

impl std::fmt::Debug for NoiseHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseHandshake")
            .field("phase", &self.phase)
            .field("role", &self.role)
            .finish()
    }
}

/// Encrypting half of a finished Noise session.
pub struct NoiseSender {
    transport: Arc<StatelessTransportState>,
    nonce: u64,
    buffer: Vec<u8>,
}

impl NoiseSender {
    /// Encrypts one message; the ciphertext includes the authentication tag.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        if plaintext.len() > MAX_PLAINTEXT_SIZE {
            return Err(ProtocolError::Encryption(format!(
                "plaintext too large: {} bytes exceeds maximum of {} bytes",
                plaintext.len(),
                MAX_PLAINTEXT_SIZE
            )));
        }
        let len = self
            .transport
            .write_message(self.nonce, plaintext, &mut self.buffer)?;
        self.nonce += 1;
        Ok(self.buffer[..len].to_vec())
    }
}

/// Decrypting half of a finished Noise session.
pub struct NoiseReceiver {
    transport: Arc<StatelessTransportState>,
    nonce: u64,
    remote_static: Option<[u8; 32]>,
    buffer: Vec<u8>,
}

impl NoiseReceiver {
    /// Decrypts one message. Messages must arrive in the order they were sent.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() > MAX_NOISE_MESSAGE_SIZE {
            return Err(ProtocolError::Decryption(format!(
                "ciphertext too large: {} bytes exceeds maximum of {} bytes",
                ciphertext.len(),
                MAX_NOISE_MESSAGE_SIZE
            )));
        }
        let len = self
            .transport
            .read_message(self.nonce, ciphertext, &mut self.buffer)?;
        self.nonce += 1;
        Ok(self.buffer[..len].to_vec())
    }

    /// The peer's static X25519 public key.
    pub fn remote_static(&self) -> Option<[u8; 32]> {
        self.remote_static
    }
}

/// Builds the snow handshake state for `role`.
///
/// The builder borrows the static key, so both live in this scope.
fn build_state(key_pair: &KeyPair, role: Role) -> Result<HandshakeState> {
    let params = NOISE_PATTERN
        .parse()
        .map_err(|e| ProtocolError::HandshakeFailed(format!("invalid noise pattern: {}", e)))?;
    let static_key = static_key_for(key_pair);
    let builder = Builder::new(params)
        .prologue(NOISE_PROLOGUE)
        .local_private_key(&static_key);

    let state = match role {
        Role::Initiator => builder.build_initiator(),
        Role::Responder => builder.build_responder(),
    };
    state.map_err(|e| ProtocolError::HandshakeFailed(format!("failed to build {:?}: {}", role, e)))
}

/// Derives the X25519 static key used by Noise from an Ed25519 seed.
///
/// SHA-256 of the seed, clamped per RFC 7748.
fn static_key_for(key_pair: &KeyPair) -> [u8; 32] {
    use sha2::{Digest, Sha256};

    let hash = Sha256::digest(key_pair.secret_key_bytes());
    let mut x25519_private = [0u8; 32];
    x25519_private.copy_from_slice(&hash);

    x25519_private[0] &= 248;
    x25519_private[31] &= 127;
    x25519_private[31] |= 64;

    x25519_private
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_pair() -> (NoiseHandshake, NoiseHandshake) {
        let mut initiator = NoiseHandshake::new_initiator(&KeyPair::generate()).unwrap();
        let mut responder = NoiseHandshake::new_responder(&KeyPair::generate()).unwrap();

        let msg1 = initiator.write_message(&[]).unwrap();
        responder.read_message(&msg1).unwrap();
        let msg2 = responder.write_message(&[]).unwrap();
        initiator.read_message(&msg2).unwrap();
        let msg3 = initiator.write_message(b"proof").unwrap();
        assert_eq!(responder.read_message(&msg3).unwrap(), b"proof");

        (initiator, responder)
    }

    #[test]
    fn test_initial_phases() {
        let pair = KeyPair::generate();
        let initiator = NoiseHandshake::new_initiator(&pair).unwrap();
        let responder = NoiseHandshake::new_responder(&pair).unwrap();

        assert_eq!(initiator.phase, HandshakePhase::InitiatorStart);
        assert_eq!(initiator.role, Role::Initiator);
        assert_eq!(responder.phase, HandshakePhase::ResponderStart);
        assert_eq!(responder.role, Role::Responder);
    }

    #[test]
    fn test_handshake_outlives_key_pair() {
        let (mut initiator, mut responder) = {
            let client = KeyPair::generate();
            let device = KeyPair::generate();
            (
                NoiseHandshake::new_initiator(&client).unwrap(),
                NoiseHandshake::new_responder(&device).unwrap(),
            )
        };

        let msg1 = initiator.write_message(&[]).unwrap();
        responder.read_message(&msg1).unwrap();
        let msg2 = responder.write_message(&[]).unwrap();
        initiator.read_message(&msg2).unwrap();
        assert_eq!(initiator.handshake_hash(), responder.handshake_hash());
    }

    #[test]
    fn test_full_handshake_and_transport() {
        let (initiator, responder) = complete_pair();
        assert_eq!(initiator.phase, HandshakePhase::Complete);
        assert_eq!(responder.phase, HandshakePhase::Complete);
        assert!(responder.remote_static().is_some());

        let (mut i_send, mut i_recv) = initiator.into_transport().unwrap();
        let (mut r_send, mut r_recv) = responder.into_transport().unwrap();

        let c1 = i_send.encrypt(b"echo hi\n").unwrap();
        let c2 = i_send.encrypt(b"exit\n").unwrap();
        assert_eq!(r_recv.decrypt(&c1).unwrap(), b"echo hi\n");
        assert_eq!(r_recv.decrypt(&c2).unwrap(), b"exit\n");

        let reply = r_send.encrypt(b"hi\n").unwrap();
        assert_eq!(i_recv.decrypt(&reply).unwrap(), b"hi\n");
    }

    #[test]
    fn test_handshake_hash_agrees_after_second_message() {
        let mut initiator = NoiseHandshake::new_initiator(&KeyPair::generate()).unwrap();
        let mut responder = NoiseHandshake::new_responder(&KeyPair::generate()).unwrap();

        let msg1 = initiator.write_message(&[]).unwrap();
        responder.read_message(&msg1).unwrap();
        let msg2 = responder.write_message(&[]).unwrap();
        initiator.read_message(&msg2).unwrap();

        assert_eq!(initiator.handshake_hash(), responder.handshake_hash());
    }

    #[test]
    fn test_out_of_turn_write_fails() {
        let mut responder = NoiseHandshake::new_responder(&KeyPair::generate()).unwrap();
        assert!(matches!(
            responder.write_message(&[]),
            Err(ProtocolError::HandshakeFailed(_))
        ));
    }

    #[test]
    fn test_transport_before_completion_fails() {
        let initiator = NoiseHandshake::new_initiator(&KeyPair::generate()).unwrap();
        assert!(matches!(
            initiator.into_transport(),
            Err(ProtocolError::HandshakeIncomplete)
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let (initiator, responder) = complete_pair();
        let (mut send, _) = initiator.into_transport().unwrap();
        let (_, mut recv) = responder.into_transport().unwrap();

        let mut ciphertext = send.encrypt(b"ls\n").unwrap();
        ciphertext[0] ^= 0xFF;
        assert!(recv.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn test_static_key_is_stable_per_key_pair() {
        let pair = KeyPair::generate();
        assert_eq!(static_key_for(&pair), static_key_for(&pair.clone()));
        assert_ne!(static_key_for(&pair), static_key_for(&KeyPair::generate()));
    }
}
