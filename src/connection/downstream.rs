//! Where a coordinator writes its output.

use std::net::SocketAddr;

use tokio::sync::mpsc;

use super::ConnectionError;

/// Output side of a coordinator.
///
/// Sends never block: they hand bytes to a writer task.
pub trait Downstream: Send {
    /// Queue bytes for the peer.
    fn send(&mut self, bytes: Vec<u8>) -> Result<(), ConnectionError>;

    /// Follow a peer that moved to a new address. Only datagram outputs care.
    fn retarget(&mut self, peer: SocketAddr) {
        let _ = peer;
    }

    /// Stop accepting output; the writer flushes and shuts down.
    fn close(&mut self);
}

/// Output to a stream socket through its writer task.
pub struct StreamDownstream {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl StreamDownstream {
    /// Wrap the writer task's queue.
    pub fn new(tx: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self { tx: Some(tx) }
    }
}

impl Downstream for StreamDownstream {
    fn send(&mut self, bytes: Vec<u8>) -> Result<(), ConnectionError> {
        let tx = self.tx.as_ref().ok_or(ConnectionError::DownstreamClosed)?;
        tx.send(bytes).map_err(|_| ConnectionError::DownstreamClosed)
    }

    fn close(&mut self) {
        self.tx = None;
    }
}

/// Output to the latest address of a UDP association's peer.
pub struct DatagramDownstream {
    tx: mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>,
    peer: SocketAddr,
    closed: bool,
}

impl DatagramDownstream {
    /// Send through the listener's shared queue, initially to `peer`.
    pub fn new(tx: mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>, peer: SocketAddr) -> Self {
        Self {
            tx,
            peer,
            closed: false,
        }
    }
}

impl Downstream for DatagramDownstream {
    fn send(&mut self, bytes: Vec<u8>) -> Result<(), ConnectionError> {
        if self.closed {
            return Err(ConnectionError::DownstreamClosed);
        }
        self.tx
            .send((self.peer, bytes))
            .map_err(|_| ConnectionError::DownstreamClosed)
    }

    fn retarget(&mut self, peer: SocketAddr) {
        self.peer = peer;
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
