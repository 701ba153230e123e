//! Key material for authenticating a client to a device daemon.
//!
//! A [`KeyPair`] is an Ed25519 signing key together with its derived public
//! half. The public half is never stored independently of the private half
//! in memory, so the two are always consistent.

use ed25519_dalek::{
    Signature as Ed25519Signature, Signer, SigningKey, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH,
    SECRET_KEY_LENGTH, SIGNATURE_LENGTH,
};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Length of a key id in bytes (SHA-256 output truncated to 16 bytes).
pub const KEY_ID_LENGTH: usize = 16;

/// A short identifier derived from a public key.
///
/// Used for log lines and for authorizers on the accepting side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyId(#[serde(with = "serde_bytes")] pub [u8; KEY_ID_LENGTH]);

impl KeyId {
    /// Returns the raw bytes of this key id.
    pub fn as_bytes(&self) -> &[u8; KEY_ID_LENGTH] {
        &self.0
    }

    /// Colon separated groups of four hex digits,
    /// e.g. `a1b2:c3d4:e5f6:7890:1234:5678:9abc:def0`.
    pub fn fingerprint(&self) -> String {
        self.0
            .chunks(2)
            .map(|chunk| format!("{:02x}{:02x}", chunk[0], chunk[1]))
            .collect::<Vec<_>>()
            .join(":")
    }

    fn from_public_key(public_key: &VerifyingKey) -> Self {
        use sha2::{Digest, Sha256};
        let hash = Sha256::digest(public_key.as_bytes());
        let mut id = [0u8; KEY_ID_LENGTH];
        id.copy_from_slice(&hash[..KEY_ID_LENGTH]);
        Self(id)
    }
}

impl std::fmt::Display for KeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.fingerprint())
    }
}

/// A 64-byte Ed25519 signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "serde_bytes")] pub [u8; SIGNATURE_LENGTH]);

impl Signature {
    /// Returns the raw bytes of this signature.
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.0
    }
}

/// The client's authentication key pair.
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    key_id: KeyId,
}

impl KeyPair {
    /// Generates a new random key pair from the OS random number generator.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Like [`KeyPair::generate`], but reports an unavailable entropy source
    /// instead of panicking.
    pub fn try_generate() -> Result<Self> {
        let mut seed = [0u8; SECRET_KEY_LENGTH];
        OsRng
            .try_fill_bytes(&mut seed)
            .map_err(|e| ProtocolError::KeyGeneration(e.to_string()))?;
        Ok(Self::from_secret_key_bytes(&seed))
    }

    /// Rebuilds a key pair from its 32-byte private seed.
    pub fn from_secret_key_bytes(bytes: &[u8; SECRET_KEY_LENGTH]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(bytes))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();
        let key_id = KeyId::from_public_key(&verifying_key);
        Self {
            signing_key,
            verifying_key,
            key_id,
        }
    }

    /// Returns the private seed.
    ///
    /// Only for persisting the key; never log it.
    pub fn secret_key_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.signing_key.to_bytes()
    }

    /// Returns the public key bytes.
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.verifying_key.to_bytes()
    }

    /// Returns the key id.
    pub fn key_id(&self) -> &KeyId {
        &self.key_id
    }

    /// Returns the public half as a [`PublicKey`].
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            verifying_key: self.verifying_key,
            key_id: self.key_id,
        }
    }

    /// Signs a message with the private key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing_key.sign(message).to_bytes())
    }

    /// Human-readable fingerprint of the public key.
    pub fn fingerprint(&self) -> String {
        self.key_id.fingerprint()
    }
}

impl PartialEq for KeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.secret_key_bytes() == other.secret_key_bytes()
    }
}

impl Eq for KeyPair {}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("key_id", &self.key_id)
            .field("public_key", &"[REDACTED]")
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

/// The public half of someone's key pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKey {
    verifying_key: VerifyingKey,
    key_id: KeyId,
}

impl PublicKey {
    /// Parses raw public key bytes.
    pub fn from_bytes(bytes: &[u8; PUBLIC_KEY_LENGTH]) -> Result<Self> {
        let verifying_key = VerifyingKey::from_bytes(bytes)
            .map_err(|e| ProtocolError::InvalidPublicKey(e.to_string()))?;
        let key_id = KeyId::from_public_key(&verifying_key);
        Ok(Self {
            verifying_key,
            key_id,
        })
    }

    /// Returns the public key bytes.
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.verifying_key.to_bytes()
    }

    /// Returns the key id.
    pub fn key_id(&self) -> &KeyId {
        &self.key_id
    }

    /// Verifies `signature` over `message`.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        let sig = Ed25519Signature::from_bytes(&signature.0);
        self.verifying_key
            .verify(message, &sig)
            .map_err(ProtocolError::from)
    }

    /// Human-readable fingerprint of this key.
    pub fn fingerprint(&self) -> String {
        self.key_id.fingerprint()
    }
}
