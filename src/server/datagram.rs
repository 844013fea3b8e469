//! Datagram demultiplexer for the tunnel's UDP port.
//!
//! Every association is a [`ServerConnection`] over
//! [`Transport::Datagram`], keyed by the IV prefix in IV mode and by the
//! peer address otherwise. Associations end on their idle timeout.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinSet;

use crate::connection::{
    ConnectionId, DatagramDownstream, Event, EventSender, ServerConnection, Transport, drive,
    event_channel,
};
use crate::core::{DATAGRAM_BUFFER_SIZE, IV_LEN, TunnelConfig};
use crate::crypto::Iv;
use crate::relay::RelayFactory;

/// What identifies an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum AssocKey {
    /// Connection IV carried as the datagram prefix.
    Iv(Iv),
    /// Peer address (IV mode off).
    Peer(SocketAddr),
}

impl AssocKey {
    /// Key for a datagram, or `None` if it cannot belong to any association.
    pub(crate) fn of(datagram: &[u8], peer: SocketAddr, use_iv: bool) -> Option<Self> {
        if !use_iv {
            return Some(AssocKey::Peer(peer));
        }
        datagram.get(..IV_LEN).and_then(Iv::from_slice).map(AssocKey::Iv)
    }
}

struct Association {
    id: ConnectionId,
    events: EventSender,
}

pub(crate) struct DatagramDemux {
    socket: Arc<UdpSocket>,
    config: Arc<TunnelConfig>,
    relays: Arc<dyn RelayFactory>,
    associations: HashMap<AssocKey, Association>,
    tasks: JoinSet<(AssocKey, ConnectionId)>,
    out_tx: mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>,
    out_rx: Option<mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)>>,
}

impl DatagramDemux {
    pub(crate) fn new(
        socket: UdpSocket,
        config: Arc<TunnelConfig>,
        relays: Arc<dyn RelayFactory>,
    ) -> Self {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        Self {
            socket: Arc::new(socket),
            config,
            relays,
            associations: HashMap::new(),
            tasks: JoinSet::new(),
            out_tx,
            out_rx: Some(out_rx),
        }
    }

    /// Receive and dispatch until the socket fails.
    ///
    /// Dropping the future aborts every association.
    pub(crate) async fn run(mut self) -> io::Result<()> {
        let mut writer = JoinSet::new();
        if let Some(out_rx) = self.out_rx.take() {
            writer.spawn(send_loop(Arc::clone(&self.socket), out_rx));
        }
        let mut buf = vec![0u8; DATAGRAM_BUFFER_SIZE];

        loop {
            tokio::select! {
                Some(finished) = self.tasks.join_next() => {
                    if let Ok((key, id)) = finished {
                        self.forget(key, id);
                    }
                }
                received = self.socket.recv_from(&mut buf) => {
                    let (n, peer) = match received {
                        Ok(received) => received,
                        Err(err) if err.kind() == io::ErrorKind::ConnectionReset => continue,
                        Err(err) => return Err(err),
                    };
                    self.dispatch(peer, buf[..n].to_vec());
                }
            }
        }
    }

    fn dispatch(&mut self, peer: SocketAddr, bytes: Vec<u8>) {
        let Some(key) = AssocKey::of(&bytes, peer, self.config.use_iv) else {
            tracing::trace!(%peer, len = bytes.len(), "dropped runt datagram");
            return;
        };

        let mut event = Event::Datagram { from: peer, bytes };
        if let Some(assoc) = self.associations.get(&key) {
            match assoc.events.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Full(_)) => {
                    tracing::debug!(conn = %assoc.id, "association backlogged, dropped datagram");
                    return;
                }
                // Association ended between timeout and reaping.
                Err(TrySendError::Closed(returned)) => {
                    self.associations.remove(&key);
                    event = returned;
                }
            }
        }

        let Some(events) = self.open(key, peer) else {
            return;
        };
        if events.try_send(event).is_err() {
            tracing::debug!(?key, "new association refused its first datagram");
        }
    }

    fn open(&mut self, key: AssocKey, peer: SocketAddr) -> Option<EventSender> {
        let id = ConnectionId::next();
        let (events_tx, mut events_rx) = event_channel();
        let downstream = DatagramDownstream::new(self.out_tx.clone(), peer);

        let mut conn = match ServerConnection::new(
            id,
            Arc::clone(&self.config),
            Transport::Datagram,
            Box::new(downstream),
            Arc::clone(&self.relays),
            events_tx.clone(),
        ) {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!(conn = %id, error = %err, "cannot open association");
                return None;
            }
        };

        tracing::debug!(conn = %id, %peer, ?key, "association opened");
        let config = Arc::clone(&self.config);
        self.tasks.spawn(async move {
            let reason = drive(&mut conn, &mut events_rx, &config).await;
            tracing::debug!(conn = %id, ?reason, "association finished");
            (key, id)
        });

        self.associations.insert(
            key,
            Association {
                id,
                events: events_tx.clone(),
            },
        );
        Some(events_tx)
    }

    fn forget(&mut self, key: AssocKey, id: ConnectionId) {
        // The key may already belong to a newer association.
        if self.associations.get(&key).is_some_and(|assoc| assoc.id == id) {
            self.associations.remove(&key);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.associations.len()
    }
}

async fn send_loop(
    socket: Arc<UdpSocket>,
    mut out: mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)>,
) {
    while let Some((peer, datagram)) = out.recv().await {
        if let Err(err) = socket.send_to(&datagram, peer).await {
            tracing::debug!(%peer, error = %err, "datagram send failed");
        }
    }
}
