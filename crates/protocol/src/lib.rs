//! # devshell Protocol Library
//!
//! Authenticated, encrypted sessions between a devshell client and a device
//! daemon, carrying multiplexed logical streams.
//!
//! ## Overview
//!
//! - **Key Material**: Ed25519 key pairs and their on-disk encoding
//! - **Noise Protocol**: Noise XX handshake with an Ed25519 proof of identity
//! - **Frame Codec**: Magic plus length-prefixed framing of Noise messages
//! - **Sessions**: Connect banners, stream open/accept, flow-controlled writes
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │     LogicalStream (shell:, tcp:, …)     │  Open / Okay / Write / Close
//! ├─────────────────────────────────────────┤
//! │          Session packets                │  MessagePack envelopes
//! ├─────────────────────────────────────────┤
//! │           Noise Encryption              │  ChaCha20-Poly1305
//! ├─────────────────────────────────────────┤
//! │              Framing                    │  "DVSH" + u32 length
//! ├─────────────────────────────────────────┤
//! │            Transport (TCP)              │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```no_run
//! use protocol::{ProtocolConfig, SessionProtocol};
//! use tokio::net::TcpStream;
//!
//! # async fn run() -> protocol::Result<()> {
//! let provider = SessionProtocol::new(ProtocolConfig::default());
//! let key_pair = provider.generate_key_pair()?;
//!
//! let transport = TcpStream::connect("127.0.0.1:5555").await?;
//! let session = provider.authenticate(transport, &key_pair).await?;
//!
//! let stream = session.open_stream("shell:").await?;
//! stream.write(b"echo hi\n").await?;
//! let output = stream.read().await?;
//! # let _ = output;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`crypto`]: Key pairs, key ids and signatures
//! - [`keys`]: Key file encoding
//! - [`messages`]: Packet definitions
//! - [`framing`]: Frame codec
//! - [`noise`]: Noise XX handshake and encryption
//! - [`session`]: Session establishment and the reader/writer tasks
//! - [`stream`]: Logical streams
//! - [`provider`]: The [`SessionProtocol`] entry point
//! - [`error`]: Error types

pub mod crypto;
pub mod error;
pub mod framing;
pub mod keys;
pub mod messages;
pub mod noise;
pub mod provider;
pub mod session;
pub mod stream;

pub use crypto::{KeyId, KeyPair, PublicKey, Signature, KEY_ID_LENGTH};
pub use error::{ProtocolError, Result};
pub use framing::{FrameCodec, FRAME_HEADER_SIZE, FRAME_MAGIC, MAX_FRAME_BODY};
pub use keys::KEY_ALGORITHM;
pub use messages::{Envelope, Packet, DEFAULT_MAX_PAYLOAD, PROTOCOL_VERSION};
pub use noise::{MAX_NOISE_MESSAGE_SIZE, NOISE_OVERHEAD};
pub use provider::{ProtocolConfig, SessionProtocol, DEFAULT_HOST_BANNER};
pub use session::{Session, MAX_WRITE_PAYLOAD};
pub use stream::{validate_descriptor, LogicalStream, MAX_DESCRIPTOR_LENGTH};
