//! The protocol provider.
//!
//! [`SessionProtocol`] bundles every operation a client or device needs:
//! key generation and persistence, and establishing sessions on either side
//! of a transport. It is constructed once and shared by reference.

use std::path::Path;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::crypto::{KeyPair, PublicKey};
use crate::error::Result;
use crate::keys;
use crate::messages::DEFAULT_MAX_PAYLOAD;
use crate::session::Session;

/// Banner sent by initiating clients.
pub const DEFAULT_HOST_BANNER: &str = "host::devshell";

/// Comment written after the public key.
pub const DEFAULT_KEY_COMMENT: &str = "devshell";

/// Settings for sessions established by a [`SessionProtocol`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolConfig {
    /// Largest write payload we accept from the peer.
    pub max_payload: u32,
    /// Banner sent in our connect packet.
    pub banner: String,
    /// Services accepted on incoming streams, matched by prefix.
    /// Empty accepts any service. Only used when accepting sessions.
    pub services: Vec<String>,
    /// Comment written into saved public key files.
    pub key_comment: String,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            banner: DEFAULT_HOST_BANNER.to_string(),
            services: Vec::new(),
            key_comment: DEFAULT_KEY_COMMENT.to_string(),
        }
    }
}

impl ProtocolConfig {
    /// Settings for the accepting side, announcing `banner`.
    pub fn device(banner: impl Into<String>) -> Self {
        Self {
            banner: banner.into(),
            ..Self::default()
        }
    }

    /// Restricts the services accepted on incoming streams.
    pub fn with_services<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.services = services.into_iter().map(Into::into).collect();
        self
    }
}

/// Entry point to the session protocol.
#[derive(Debug, Clone, Default)]
pub struct SessionProtocol {
    config: ProtocolConfig,
}

impl SessionProtocol {
    /// Creates a provider with the given settings.
    pub fn new(config: ProtocolConfig) -> Self {
        Self { config }
    }

    /// Returns the provider's settings.
    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Generates a fresh key pair.
    pub fn generate_key_pair(&self) -> Result<KeyPair> {
        KeyPair::try_generate()
    }

    /// Loads a key pair from its two files.
    ///
    /// Fails if either file is unreadable, malformed, uses another
    /// algorithm, or if the halves do not belong together.
    pub fn load_key_pair(&self, public_path: &Path, private_path: &Path) -> Result<KeyPair> {
        keys::load_key_pair(public_path, private_path)
    }

    /// Writes a key pair to its two files, replacing existing ones.
    pub fn save_key_pair(
        &self,
        key_pair: &KeyPair,
        public_path: &Path,
        private_path: &Path,
    ) -> Result<()> {
        keys::save_key_pair(key_pair, public_path, private_path, &self.config.key_comment)
    }

    /// Authenticates to the peer at the other end of `transport`.
    ///
    /// Resolves only once the handshake and connect exchange completed.
    /// A peer that refuses the key yields
    /// [`ProtocolError::AuthenticationRejected`](crate::ProtocolError::AuthenticationRejected).
    pub async fn authenticate<T>(&self, transport: T, key_pair: &KeyPair) -> Result<Session>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Session::initiate(transport, key_pair, &self.config).await
    }

    /// Accepts a session from the initiator at the other end of `transport`.
    ///
    /// `authorizer` decides whether the initiator's verified key may connect.
    pub async fn accept<T, F>(
        &self,
        transport: T,
        key_pair: &KeyPair,
        authorizer: F,
    ) -> Result<Session>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        F: FnOnce(&PublicKey) -> bool,
    {
        Session::respond(transport, key_pair, &self.config, authorizer).await
    }
}
