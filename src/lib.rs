//! # sockstun
//!
//! An encrypted SOCKS5 tunnel with two roles sharing one binary:
//!
//! - **client**: a local SOCKS5 endpoint. Applications connect to it,
//!   complete a no-auth SOCKS5 handshake, and their traffic is framed,
//!   encrypted and sent to the tunnel server.
//! - **server**: terminates the tunnel, decrypts frames and relays their
//!   payloads to the destinations they name.
//!
//! Every application payload travels as a frame
//! `[LEN][ATYP][DST.ADDR][DST.PORT][DATA]` inside an AEAD record. With IV
//! mode on, the client appends a fresh IV to the first frame of each
//! connection and both ends switch to a key derived from it right after
//! that frame; the server strips the IV and fixes the length field before
//! relaying.
//!
//! ## Feature Flags
//!
//! - `client` (default): the SOCKS5 listener ([`client::TunnelClient`])
//! - `server` (default): the tunnel listeners ([`server::TunnelServer`])
//!
//! ## Modules
//!
//! - [`core`]: addresses, configuration, constants and error types
//! - [`crypto`]: key derivation and the record cipher
//! - [`transport`]: tunnel frame codec
//! - [`socks5`]: SOCKS5 handshake messages and UDP envelopes
//! - [`relay`]: outbound legs towards the tunnel peer or destinations
//! - [`connection`]: per-connection coordinators and their driver
//!
//! ## Example Usage
//!
//! ```rust
//! use sockstun::prelude::*;
//!
//! let config = TunnelConfig::builder(Role::Client)
//!     .server_addr("203.0.113.7:1081".parse().unwrap())
//!     .secret("correct horse")
//!     .build()
//!     .unwrap();
//!
//! assert!(config.use_iv);
//! assert_eq!(config.effective_hops().len(), 1);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod connection;
pub mod core;
pub mod crypto;
pub mod relay;
pub mod socks5;
pub mod transport;

// Client API (feature-gated)
#[cfg(feature = "client")]
#[cfg_attr(docsrs, doc(cfg(feature = "client")))]
pub mod client;

// Server API (feature-gated)
#[cfg(feature = "server")]
#[cfg_attr(docsrs, doc(cfg(feature = "server")))]
pub mod server;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::{Address, ConfigError, Role, TunnelConfig, TunnelError};

    pub use crate::connection::{Connection, ConnectionId, ConnectionState, RelayMode};

    #[cfg(feature = "client")]
    pub use crate::client::{ClientError, TunnelClient};

    #[cfg(feature = "server")]
    pub use crate::server::{ServerError, TunnelServer};
}

pub use crate::core::{Address, Role, TunnelConfig, TunnelError};
