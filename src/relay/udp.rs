//! Datagram relays.
//!
//! Tunnel datagrams are self-contained: each carries one encrypted record,
//! prefixed by the connection IV when IV mode is on so the server can tell
//! associations apart without any stream state.
//!
//! ```text
//! +----------------+------------------------+
//! | IV (optional)  | RECORD                 |
//! | 16             | see crypto::stream     |
//! +----------------+------------------------+
//! ```

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::connection::{ConnectionId, Event, EventSender};
use crate::core::{Address, DATAGRAM_BUFFER_SIZE, IV_LEN};
use crate::crypto::Iv;
use crate::transport::Frame;

use super::{Relay, RelayError};

/// Client datagram relay: one ephemeral socket towards the tunnel peer.
pub struct ClientUdpRelay {
    use_iv: bool,
    iv: Option<Iv>,
    tx: Option<mpsc::UnboundedSender<(Option<Iv>, Vec<u8>)>>,
    task: Option<JoinHandle<()>>,
}

impl ClientUdpRelay {
    /// Bind an ephemeral socket connected to `server`.
    pub fn spawn(id: ConnectionId, server: SocketAddr, use_iv: bool, events: EventSender) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let result = client_datagrams(id, server, use_iv, rx, &events).await;
            let _ = events.send(Event::RelayClosed(result.err())).await;
        });

        Self {
            use_iv,
            iv: None,
            tx: Some(tx),
            task: Some(task),
        }
    }
}

impl Relay for ClientUdpRelay {
    fn forward_to_destination(&mut self, _frame: &[u8]) -> Result<(), RelayError> {
        Err(RelayError::Unsupported("forward_to_destination"))
    }

    fn forward_to_server(&mut self, record: &[u8]) -> Result<(), RelayError> {
        if self.use_iv && self.iv.is_none() {
            return Err(RelayError::MissingIv);
        }
        let tx = self.tx.as_ref().ok_or(RelayError::Closed)?;
        tx.send((self.iv, record.to_vec()))
            .map_err(|_| RelayError::Closed)
    }

    fn set_iv(&mut self, iv: Iv) {
        self.iv = Some(iv);
    }

    fn close(&mut self) {
        self.tx = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ClientUdpRelay {
    fn drop(&mut self) {
        self.close();
    }
}

async fn client_datagrams(
    id: ConnectionId,
    server: SocketAddr,
    use_iv: bool,
    mut rx: mpsc::UnboundedReceiver<(Option<Iv>, Vec<u8>)>,
    events: &EventSender,
) -> io::Result<()> {
    let socket = UdpSocket::bind(unspecified_for(server)).await?;
    socket.connect(server).await?;
    tracing::debug!(conn = %id, %server, "datagram leg bound");

    let from = Address::from(server);
    let mut expected: Option<Iv> = None;
    let mut buf = vec![0u8; DATAGRAM_BUFFER_SIZE];

    loop {
        tokio::select! {
            queued = rx.recv() => {
                let Some((iv, record)) = queued else {
                    return Ok(());
                };
                let mut datagram = Vec::with_capacity(IV_LEN + record.len());
                if let Some(iv) = iv {
                    datagram.extend_from_slice(iv.as_bytes());
                    expected = Some(iv);
                }
                datagram.extend_from_slice(&record);
                socket.send(&datagram).await?;
            }
            received = socket.recv(&mut buf) => {
                let n = match received {
                    Ok(n) => n,
                    // ICMP unreachable from an earlier send; the socket stays usable.
                    Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => continue,
                    Err(err) => return Err(err),
                };
                let record = match strip_iv(&buf[..n], use_iv, expected.as_ref()) {
                    Some(record) => record.to_vec(),
                    None => {
                        tracing::debug!(conn = %id, len = n, "dropped datagram with foreign IV");
                        continue;
                    }
                };
                let event = Event::RelayData { from: from.clone(), payload: record };
                if events.send(event).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

/// Record part of a tunnel datagram, checking its IV prefix in IV mode.
fn strip_iv<'a>(datagram: &'a [u8], use_iv: bool, expected: Option<&Iv>) -> Option<&'a [u8]> {
    if !use_iv {
        return Some(datagram);
    }
    let expected = expected?;
    let (prefix, record) = datagram.split_at_checked(IV_LEN)?;
    (prefix == expected.as_bytes()).then_some(record)
}

/// Server datagram relay: one ephemeral socket per association.
pub struct ServerUdpRelay {
    tx: Option<mpsc::UnboundedSender<(Address, Vec<u8>)>>,
    task: Option<JoinHandle<()>>,
}

impl ServerUdpRelay {
    /// Start the relay task; its socket is bound on the first datagram.
    pub fn spawn(id: ConnectionId, events: EventSender) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let result = destination_datagrams(id, rx, &events).await;
            let _ = events.send(Event::RelayClosed(result.err())).await;
        });

        Self {
            tx: Some(tx),
            task: Some(task),
        }
    }
}

impl Relay for ServerUdpRelay {
    fn forward_to_destination(&mut self, frame: &[u8]) -> Result<(), RelayError> {
        let frame = Frame::decode(frame)?;
        let tx = self.tx.as_ref().ok_or(RelayError::Closed)?;
        tx.send((frame.address, frame.payload))
            .map_err(|_| RelayError::Closed)
    }

    fn forward_to_server(&mut self, _record: &[u8]) -> Result<(), RelayError> {
        Err(RelayError::Unsupported("forward_to_server"))
    }

    fn close(&mut self) {
        self.tx = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ServerUdpRelay {
    fn drop(&mut self) {
        self.close();
    }
}

async fn destination_datagrams(
    id: ConnectionId,
    mut rx: mpsc::UnboundedReceiver<(Address, Vec<u8>)>,
    events: &EventSender,
) -> io::Result<()> {
    let mut socket: Option<UdpSocket> = None;
    let mut buf = vec![0u8; DATAGRAM_BUFFER_SIZE];

    loop {
        let recv = async {
            match &socket {
                Some(socket) => socket.recv_from(&mut buf).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            queued = rx.recv() => {
                let Some((target, payload)) = queued else {
                    return Ok(());
                };
                let dest = match target.resolve().await {
                    Ok(dest) => dest,
                    Err(err) => {
                        tracing::debug!(conn = %id, %target, error = %err, "dropped datagram");
                        continue;
                    }
                };
                if socket.is_none() {
                    let bound = UdpSocket::bind(unspecified_for(dest)).await?;
                    tracing::debug!(conn = %id, local = ?bound.local_addr().ok(), "destination socket bound");
                    socket = Some(bound);
                }
                if let Some(socket) = &socket {
                    if let Err(err) = socket.send_to(&payload, dest).await {
                        tracing::debug!(conn = %id, %dest, error = %err, "datagram send failed");
                    }
                }
            }
            received = recv => {
                let (n, src) = match received {
                    Ok(received) => received,
                    Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => continue,
                    Err(err) => return Err(err),
                };
                let event = Event::RelayData {
                    from: Address::from(src),
                    payload: buf[..n].to_vec(),
                };
                if events.send(event).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

fn unspecified_for(peer: SocketAddr) -> SocketAddr {
    match peer {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::event_channel;
    use crate::transport::pack;

    #[test]
    fn test_strip_iv() {
        let iv = Iv::from_bytes([5u8; IV_LEN]);
        let mut datagram = iv.as_bytes().to_vec();
        datagram.extend_from_slice(b"record");

        assert_eq!(strip_iv(&datagram, true, Some(&iv)), Some(&b"record"[..]));
        assert_eq!(strip_iv(&datagram, false, None), Some(&datagram[..]));

        let other = Iv::from_bytes([6u8; IV_LEN]);
        assert_eq!(strip_iv(&datagram, true, Some(&other)), None);
        assert_eq!(strip_iv(&datagram, true, None), None);
        assert_eq!(strip_iv(&datagram[..4], true, Some(&iv)), None);
    }

    #[tokio::test]
    async fn test_client_relay_requires_iv() {
        let (events, _rx) = event_channel();
        let server = SocketAddr::from(([127, 0, 0, 1], 9));
        let mut relay = ClientUdpRelay::spawn(ConnectionId::new(1), server, true, events);

        assert!(matches!(
            relay.forward_to_server(b"record"),
            Err(RelayError::MissingIv)
        ));
        relay.set_iv(Iv::from_bytes([1u8; IV_LEN]));
        assert!(relay.forward_to_server(b"record").is_ok());
    }

    #[tokio::test]
    async fn test_client_relay_prefixes_and_strips_iv() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let (events, mut rx) = event_channel();
        let mut relay = ClientUdpRelay::spawn(ConnectionId::new(2), server_addr, true, events);
        let iv = Iv::from_bytes([7u8; IV_LEN]);

        relay.set_iv(iv);
        relay.forward_to_server(b"up").unwrap();

        let mut buf = [0u8; 64];
        let (n, client) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..IV_LEN], iv.as_bytes());
        assert_eq!(&buf[IV_LEN..n], b"up");

        // Foreign prefix is dropped, matching prefix is delivered.
        let mut foreign = [9u8; IV_LEN].to_vec();
        foreign.extend_from_slice(b"nope");
        server.send_to(&foreign, client).await.unwrap();
        let mut reply = iv.as_bytes().to_vec();
        reply.extend_from_slice(b"down");
        server.send_to(&reply, client).await.unwrap();

        match rx.recv().await.unwrap() {
            Event::RelayData { payload, from } => {
                assert_eq!(payload, b"down");
                assert_eq!(from, Address::from(server_addr));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_server_relay_round_trip() {
        let dest = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest_addr = dest.local_addr().unwrap();
        let (events, mut rx) = event_channel();
        let mut relay = ServerUdpRelay::spawn(ConnectionId::new(3), events);

        relay
            .forward_to_destination(&pack(&Address::from(dest_addr), b"query").unwrap())
            .unwrap();

        let mut buf = [0u8; 64];
        let (n, src) = dest.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"query");
        dest.send_to(b"answer", src).await.unwrap();

        match rx.recv().await.unwrap() {
            Event::RelayData { from, payload } => {
                assert_eq!(from, Address::from(dest_addr));
                assert_eq!(payload, b"answer");
            }
            other => panic!("unexpected event {other:?}"),
        }
        relay.close();
    }
}
