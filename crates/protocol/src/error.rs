//! Error types for the protocol crate.

use std::path::PathBuf;

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Key material errors
    /// The system random number generator could not produce a key.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// A persisted key could not be decoded.
    #[error("invalid key encoding: {0}")]
    KeyDecode(String),

    /// A persisted key uses an algorithm this library does not implement.
    #[error("unsupported key algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The public and private key files do not belong to the same pair.
    #[error("public key does not match private key")]
    KeyMismatch,

    /// Reading or writing a key file failed.
    #[error("key storage failed for {}: {source}", path.display())]
    KeyStorage {
        /// File that could not be accessed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    // Cryptographic errors
    /// Encryption operation failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption operation failed.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Signature verification failed.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Invalid or malformed public key.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    // Handshake errors
    /// Noise protocol handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Attempted to use transport before handshake completion.
    #[error("handshake incomplete: cannot perform operation before handshake is finished")]
    HandshakeIncomplete,

    /// The peer refused the presented key.
    #[error("authentication rejected by peer")]
    AuthenticationRejected,

    // Frame errors
    /// Frame exceeds maximum allowed size.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Frame has invalid magic bytes.
    #[error("invalid frame magic: expected {expected:#010x}, got {got:#010x}")]
    InvalidFrameMagic {
        /// Expected magic value.
        expected: u32,
        /// Actual magic value received.
        got: u32,
    },

    /// Peer speaks a different envelope version.
    #[error("unsupported protocol version {got} (expected {expected})")]
    VersionMismatch {
        /// Version this library speaks.
        expected: u8,
        /// Version the peer sent.
        got: u8,
    },

    // Connection errors
    /// Connection was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// The session is not (or no longer) connected.
    #[error("session is not connected")]
    NotConnected,

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Other I/O failure on the transport.
    #[error("transport error: {0}")]
    Transport(String),

    // Stream errors
    /// Service descriptor cannot be sent on the wire.
    #[error("invalid service descriptor {descriptor:?}: {reason}")]
    InvalidDescriptor {
        /// The offending descriptor.
        descriptor: String,
        /// Why it was refused.
        reason: &'static str,
    },

    /// The peer refused to open the requested service.
    #[error("stream rejected by peer: {destination}")]
    StreamRejected {
        /// Descriptor that was refused.
        destination: String,
    },

    /// The stream has been closed by either side.
    #[error("stream closed")]
    StreamClosed,

    /// The operation is not available on this side of the session.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// A protocol setting cannot be used.
    #[error("invalid protocol configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ProtocolError::Deserialization(err.to_string())
    }
}

impl From<snow::Error> for ProtocolError {
    fn from(err: snow::Error) -> Self {
        let msg = err.to_string();
        // Map snow errors to more specific protocol errors
        if msg.contains("decrypt") {
            ProtocolError::Decryption(msg)
        } else if msg.contains("encrypt") {
            ProtocolError::Encryption(msg)
        } else if msg.contains("handshake") || msg.contains("state") {
            ProtocolError::HandshakeFailed(msg)
        } else {
            ProtocolError::Encryption(msg)
        }
    }
}

impl From<ed25519_dalek::SignatureError> for ProtocolError {
    fn from(err: ed25519_dalek::SignatureError) -> Self {
        ProtocolError::InvalidSignature(err.to_string())
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed(err.to_string()),
            _ => ProtocolError::Transport(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_storage_error_names_path() {
        let err = ProtocolError::KeyStorage {
            path: PathBuf::from("/keys/priv.key"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert_eq!(err.to_string(), "key storage failed for /keys/priv.key: denied");
    }

    #[test]
    fn test_invalid_frame_magic_error_display() {
        let err = ProtocolError::InvalidFrameMagic {
            expected: 0x4456_5348,
            got: 0xDEAD_BEEF,
        };
        assert_eq!(
            err.to_string(),
            "invalid frame magic: expected 0x44565348, got 0xdeadbeef"
        );
    }

    #[test]
    fn test_invalid_descriptor_display() {
        let err = ProtocolError::InvalidDescriptor {
            descriptor: "shell:é".to_string(),
            reason: "non-ASCII character",
        };
        assert!(err.to_string().contains("non-ASCII character"));
    }

    #[test]
    fn test_from_rmp_serde_decode_error() {
        #[derive(Debug, serde::Deserialize)]
        #[allow(dead_code)]
        struct TestStruct {
            field: String,
        }
        let msgpack_err = rmp_serde::from_slice::<TestStruct>(&[0x00]).unwrap_err();
        let protocol_err: ProtocolError = msgpack_err.into();
        assert!(matches!(protocol_err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_from_io_error_timeout() {
        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let protocol_err: ProtocolError = io_err.into();
        assert!(matches!(protocol_err, ProtocolError::Timeout(_)));
    }

    #[test]
    fn test_from_io_error_connection_closed() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let protocol_err: ProtocolError = io_err.into();
        assert!(matches!(protocol_err, ProtocolError::ConnectionClosed(_)));
    }

    #[test]
    fn test_from_io_error_other() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let protocol_err: ProtocolError = io_err.into();
        assert!(matches!(protocol_err, ProtocolError::Transport(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolError>();
    }
}
