//! Error types for the client, one per phase.

use std::path::PathBuf;

use protocol::ProtocolError;
use thiserror::Error;

use crate::config::ConfigError;

/// Key pair provisioning failed.
///
/// Unusable key files are not an error: they are replaced.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// No key pair could be generated.
    #[error("could not generate a key pair: {0}")]
    Generate(#[source] ProtocolError),

    /// The new key pair could not be written.
    #[error("could not save key pair to {}: {source}", public_path.display())]
    Persist {
        /// Public key file that was being written.
        public_path: PathBuf,
        /// Underlying failure.
        #[source]
        source: ProtocolError,
    },
}

/// Establishing the session failed.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The TCP connection could not be opened.
    #[error("could not reach {addr}: {source}")]
    Dial {
        /// Address that was dialled.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The transport connected but the handshake failed.
    #[error("handshake with {addr} failed: {source}")]
    Handshake {
        /// Address of the peer.
        addr: String,
        /// Underlying protocol error.
        #[source]
        source: ProtocolError,
    },

    /// Dial and handshake did not finish within the configured timeout.
    #[error("connecting to {addr} timed out")]
    Timeout {
        /// Address of the peer.
        addr: String,
    },
}

/// Opening the logical stream failed.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The service descriptor cannot be sent on the wire.
    #[error("invalid service descriptor: {0}")]
    Descriptor(#[source] ProtocolError),

    /// The session could not open the stream.
    #[error("could not open {descriptor}: {source}")]
    Open {
        /// Requested service.
        descriptor: String,
        /// Underlying protocol error.
        #[source]
        source: ProtocolError,
    },
}

/// One relay direction stopped on an error.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Reading from the stream failed.
    #[error("stream read failed: {0}")]
    Read(#[source] ProtocolError),

    /// Writing to the stream failed.
    #[error("stream write failed: {0}")]
    Write(#[source] ProtocolError),

    /// Received a byte outside the text encoding.
    #[error("cannot decode byte {byte:#04x} at offset {offset}")]
    Decode {
        /// The offending byte.
        byte: u8,
        /// Its position in the chunk.
        offset: usize,
    },

    /// Local input contains a character outside the text encoding.
    #[error("cannot encode character {ch:?}")]
    Encode {
        /// The offending character.
        ch: char,
    },

    /// Writing to local output failed.
    #[error("local output failed: {0}")]
    Output(#[source] std::io::Error),

    /// Reading local input failed.
    #[error("local input failed: {0}")]
    Input(#[source] std::io::Error),

    /// The inbound relay task panicked or was cancelled.
    #[error("inbound relay task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// A fatal setup error, tagged with the phase that failed.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Key pair provisioning failed.
    #[error("identity setup failed: {0}")]
    Identity(#[from] IdentityError),

    /// Connecting to the device failed.
    #[error("connection failed: {0}")]
    Connect(#[from] ConnectError),

    /// Opening the stream failed.
    #[error("stream open failed: {0}")]
    Stream(#[from] StreamError),
}
