//! sockstun - SOCKS5 adapter
//!
//! Parses and builds the handful of RFC 1928 messages the client-side
//! coordinator needs. Only the "no authentication" method is served, and
//! only CONNECT and UDP ASSOCIATE are accepted.

mod message;
mod udp;

pub use message::*;
pub use udp::*;

use thiserror::Error;

use crate::core::AddressError;

/// Protocol version byte.
pub const SOCKS_VERSION: u8 = 0x05;

/// Method: no authentication required.
pub const METHOD_NO_AUTH: u8 = 0x00;
/// Method: no acceptable methods.
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

/// Command: CONNECT.
pub const CMD_CONNECT: u8 = 0x01;
/// Command: BIND.
pub const CMD_BIND: u8 = 0x02;
/// Command: UDP ASSOCIATE.
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

/// Reply: succeeded.
pub const REPLY_SUCCEEDED: u8 = 0x00;
/// Reply: command not supported.
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// Malformed SOCKS5 input.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Socks5Error {
    /// Not enough bytes.
    #[error("message truncated: expected at least {expected} bytes, got {actual}")]
    Truncated {
        /// Minimum expected size.
        expected: usize,
        /// Actual size received.
        actual: usize,
    },

    /// Reserved field not zero.
    #[error("reserved bytes must be zero")]
    Reserved,

    /// Fragmented UDP datagram.
    #[error("fragmented datagram (FRAG = {0}) not supported")]
    Fragmented(u8),

    /// Embedded address could not be decoded.
    #[error("bad address: {0}")]
    Address(#[from] AddressError),
}
