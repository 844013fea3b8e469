//! sockstun - Relays
//!
//! A relay owns the second leg of one connection: the tunnel peer on the
//! client, the real destination on the server. Relays are plain handles
//! over background tasks; forwarding only queues bytes and never blocks the
//! coordinator. Whatever the far leg sends back is delivered to the
//! coordinator as [`Event::RelayData`](crate::connection::Event::RelayData).

mod tcp;
mod udp;

pub use tcp::*;
pub use udp::*;

use std::net::SocketAddr;

use thiserror::Error;

use crate::connection::{ConnectionId, EventSender};
use crate::core::{ConfigError, TunnelConfig};
use crate::crypto::Iv;
use crate::transport::FrameError;

/// Relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Frame handed to a server relay could not be parsed.
    #[error("unparseable frame: {0}")]
    Frame(#[from] FrameError),

    /// IV mode is on but no IV was set before the first datagram.
    #[error("datagram relay used before its IV was set")]
    MissingIv,

    /// Entry point not served by this side of the tunnel.
    #[error("{0} is not supported by this relay")]
    Unsupported(&'static str),

    /// Relay task has stopped.
    #[error("relay closed")]
    Closed,
}

impl RelayError {
    /// Whether the owning connection must be destroyed.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RelayError::Frame(_))
    }
}

/// Second-leg forwarder bound to one connection.
pub trait Relay: Send {
    /// Server side: deliver one decrypted frame to its destination.
    fn forward_to_destination(&mut self, frame: &[u8]) -> Result<(), RelayError>;

    /// Client side: deliver one encrypted record to the tunnel peer.
    fn forward_to_server(&mut self, record: &[u8]) -> Result<(), RelayError>;

    /// Record the connection's IV for datagram framing.
    fn set_iv(&mut self, iv: Iv) {
        let _ = iv;
    }

    /// Stop the relay; no events are emitted afterwards.
    fn close(&mut self);
}

/// Creates relays on first need.
pub trait RelayFactory: Send + Sync {
    /// Stream relay for `id`, reporting to `events`.
    fn tcp(&self, id: ConnectionId, events: EventSender) -> Box<dyn Relay>;

    /// Datagram relay for `id`, reporting to `events`.
    fn udp(&self, id: ConnectionId, events: EventSender) -> Box<dyn Relay>;
}

/// Client relays: everything goes to the first hop.
#[derive(Debug, Clone)]
pub struct ClientRelays {
    first_hop: SocketAddr,
    use_iv: bool,
}

impl ClientRelays {
    /// Relays towards the first of the configured hops.
    pub fn new(config: &TunnelConfig) -> Result<Self, ConfigError> {
        let first_hop = config
            .effective_hops()
            .first()
            .copied()
            .ok_or_else(|| ConfigError::Invalid("client role requires a server address".into()))?;
        Ok(Self {
            first_hop,
            use_iv: config.use_iv,
        })
    }

    /// Tunnel peer all relays connect to.
    pub fn first_hop(&self) -> SocketAddr {
        self.first_hop
    }
}

impl RelayFactory for ClientRelays {
    fn tcp(&self, id: ConnectionId, events: EventSender) -> Box<dyn Relay> {
        Box::new(ClientTcpRelay::spawn(id, self.first_hop, events))
    }

    fn udp(&self, id: ConnectionId, events: EventSender) -> Box<dyn Relay> {
        Box::new(ClientUdpRelay::spawn(id, self.first_hop, self.use_iv, events))
    }
}

/// Server relays: connect to whatever each frame names.
#[derive(Debug, Clone, Default)]
pub struct ServerRelays;

impl RelayFactory for ServerRelays {
    fn tcp(&self, id: ConnectionId, events: EventSender) -> Box<dyn Relay> {
        Box::new(ServerTcpRelay::new(id, events))
    }

    fn udp(&self, id: ConnectionId, events: EventSender) -> Box<dyn Relay> {
        Box::new(ServerUdpRelay::spawn(id, events))
    }
}
