//! # devshell Client Library
//!
//! Connects to a device daemon, authenticates with a persistent key pair,
//! opens one shell stream and relays it to the local terminal.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                        Driver                          │
//! ├──────────────────┬───────────────────┬─────────────────┤
//! │  IdentityStore   │ SessionOrchestrator│   StreamPump    │
//! │  load / generate │ dial → handshake  │ inbound task    │
//! │  key files       │ → open stream     │ outbound loop   │
//! ├──────────────────┴───────────────────┴─────────────────┤
//! │              protocol::SessionProtocol                 │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`]: TOML configuration with environment overrides
//! - [`identity`]: Key pair provisioning
//! - [`orchestrator`]: Connection establishment
//! - [`pump`]: Full-duplex relay
//! - [`encoding`]: Single-byte text encodings
//! - [`driver`]: Sequencing and exit codes
//! - [`error`]: Error types

pub mod config;
pub mod driver;
pub mod encoding;
pub mod error;
pub mod identity;
pub mod orchestrator;
pub mod pump;

pub use config::Config;
pub use encoding::TextEncoding;
pub use error::{ClientError, ConnectError, IdentityError, RelayError, StreamError};
pub use identity::{IdentityStore, LoadOutcome};
pub use orchestrator::SessionOrchestrator;
pub use pump::{OutboundEnd, RelayOutcome, StreamPump};
