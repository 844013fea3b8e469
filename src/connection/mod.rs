//! sockstun - Connection coordinators
//!
//! One coordinator per inbound transport socket (or per UDP association on
//! the server). Coordinators are synchronous state machines: a single
//! driver task feeds them ordered [`Event`]s and they answer by writing to
//! their [`Downstream`] and their relay. Because cipher output is returned
//! to the coordinator rather than delivered by callback, the record that
//! carries a bootstrap IV is always sealed or opened before the rebind.
//!
//! ```text
//!   app/tunnel socket ──Data──►┌──────────────┐──forward──► Relay ──► far leg
//!                              │ Coordinator  │
//!   Relay ──────RelayData─────►└──────────────┘──send─────► Downstream
//! ```

mod client;
mod downstream;
mod driver;
mod server;

pub use client::*;
pub use downstream::*;
pub use driver::*;
pub use server::*;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::sync::mpsc;

use crate::core::{Address, CryptoError};
use crate::relay::RelayError;
use crate::transport::FrameError;

/// Per-process connection identifier used in log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
    /// Wrap a raw id.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Allocate the next process-wide id.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Coordinator lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Waiting for a usable SOCKS5 request (client only).
    AwaitingHandshake,
    /// Framing and relaying payload.
    Streaming,
    /// Torn down; no further events are processed.
    Closed,
}

/// Relay mode chosen by the SOCKS5 command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    /// CONNECT.
    Tcp,
    /// UDP ASSOCIATE.
    Udp,
}

/// Ordered input to a coordinator.
#[derive(Debug)]
pub enum Event {
    /// Bytes read from the connection's own stream socket.
    Data(Vec<u8>),
    /// One datagram received from `from` for this association.
    Datagram {
        /// Current peer address.
        from: SocketAddr,
        /// Raw datagram.
        bytes: Vec<u8>,
    },
    /// Bytes delivered by the relay from its far leg.
    RelayData {
        /// Sender on the far leg.
        from: Address,
        /// Received bytes.
        payload: Vec<u8>,
    },
    /// The relay's far leg finished or failed.
    RelayClosed(Option<io::Error>),
    /// The connection's own transport failed.
    Error(io::Error),
    /// The connection's own transport reached end of stream.
    Closed,
}

/// Sending half of a coordinator's event channel.
pub type EventSender = mpsc::Sender<Event>;

/// Receiving half of a coordinator's event channel.
pub type EventReceiver = mpsc::Receiver<Event>;

/// Capacity of each per-connection event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Create a per-connection event channel.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::channel(EVENT_CHANNEL_CAPACITY)
}

/// Errors raised while a coordinator handles an event.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Frame could not be built or parsed.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Cipher failure.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Relay failure.
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    /// First decrypted buffer cannot hold a frame header plus IV.
    #[error("bootstrap buffer too short: {0} bytes")]
    BootstrapTooShort(usize),

    /// Bootstrap length field smaller than the IV it claims to cover.
    #[error("bootstrap length field {0} cannot carry an IV")]
    BootstrapLength(u16),

    /// The first datagram of an association did not authenticate.
    #[error("association did not authenticate")]
    Unauthenticated,

    /// The downstream writer is gone.
    #[error("downstream closed")]
    DownstreamClosed,

    /// Transport I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl ConnectionError {
    /// Whether the connection must be destroyed.
    ///
    /// Non-fatal errors drop the offending buffer and keep the connection.
    pub fn is_fatal(&self) -> bool {
        match self {
            ConnectionError::Frame(_) => false,
            ConnectionError::Crypto(err) => !matches!(err, CryptoError::RecordTooLarge(_)),
            ConnectionError::Relay(err) => err.is_fatal(),
            _ => true,
        }
    }
}

/// Whether an I/O error is an ordinary peer disconnect.
pub fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
    )
}

/// The interface shared by client and server coordinators.
pub trait Connection: Send {
    /// Identifier for logs.
    fn id(&self) -> ConnectionId;

    /// Current lifecycle state.
    fn state(&self) -> ConnectionState;

    /// Handle bytes read from the connection's own stream.
    fn on_data(&mut self, bytes: &[u8]) -> Result<(), ConnectionError>;

    /// Handle one datagram from `from`. Stream coordinators treat it as data.
    fn on_datagram(&mut self, from: SocketAddr, bytes: &[u8]) -> Result<(), ConnectionError> {
        let _ = from;
        self.on_data(bytes)
    }

    /// Handle bytes delivered by the relay.
    fn on_relay_data(&mut self, from: &Address, payload: &[u8]) -> Result<(), ConnectionError>;

    /// Tear down relays and downstream. Idempotent.
    fn on_close(&mut self);
}
