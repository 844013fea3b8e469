//! The per-connection task.
//!
//! A driver owns one coordinator and consumes its event channel in order,
//! so every callback for one connection runs sequentially. Stream sockets
//! get a reader task (producing [`Event::Data`]) and a writer task
//! (draining the coordinator's [`StreamDownstream`]).

use std::io;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;

use crate::core::{READ_BUFFER_SIZE, TunnelConfig};

use super::{
    Connection, ConnectionError, ConnectionState, Event, EventReceiver, EventSender,
    StreamDownstream, event_channel, is_disconnect,
};

/// Why a driver stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Transport reached end of stream.
    Eof,
    /// Transport was reset or the pipe broke.
    Disconnect,
    /// Any other transport failure.
    TransportError,
    /// The relay's far leg went away.
    RelayClosed,
    /// The coordinator hit a fatal error.
    Fatal,
    /// No event within the state's timeout.
    Timeout,
    /// Every event sender was dropped.
    Detached,
}

/// Timeout for the coordinator's current state, if any.
pub fn state_timeout(state: ConnectionState, config: &TunnelConfig) -> Option<Duration> {
    match state {
        ConnectionState::AwaitingHandshake => Some(config.handshake_timeout),
        ConnectionState::Streaming => Some(config.idle_timeout),
        ConnectionState::Closed => None,
    }
}

/// Feed events to `conn` until it closes, then tear it down.
pub async fn drive<C>(conn: &mut C, events: &mut EventReceiver, config: &TunnelConfig) -> CloseReason
where
    C: Connection + ?Sized,
{
    let id = conn.id();
    let reason = loop {
        let Some(limit) = state_timeout(conn.state(), config) else {
            break CloseReason::Eof;
        };
        let event = match tokio::time::timeout(limit, events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => break CloseReason::Detached,
            Err(_) => {
                tracing::info!(conn = %id, state = ?conn.state(), ?limit, "timed out");
                break CloseReason::Timeout;
            }
        };

        let result = match event {
            Event::Data(bytes) => conn.on_data(&bytes),
            Event::Datagram { from, bytes } => conn.on_datagram(from, &bytes),
            Event::RelayData { from, payload } => conn.on_relay_data(&from, &payload),
            Event::RelayClosed(None) => {
                tracing::debug!(conn = %id, "relay closed");
                break CloseReason::RelayClosed;
            }
            Event::RelayClosed(Some(err)) => {
                log_io_error(id, "relay", &err);
                break CloseReason::RelayClosed;
            }
            Event::Error(err) => {
                log_io_error(id, "transport", &err);
                break if is_disconnect(&err) {
                    CloseReason::Disconnect
                } else {
                    CloseReason::TransportError
                };
            }
            Event::Closed => {
                tracing::info!(conn = %id, "closed normally");
                break CloseReason::Eof;
            }
        };

        if let Err(err) = result {
            if err.is_fatal() {
                log_fatal(id, &err);
                break CloseReason::Fatal;
            }
            tracing::debug!(conn = %id, error = %err, "dropped buffer");
        }
    };

    conn.on_close();
    reason
}

fn log_io_error(id: super::ConnectionId, leg: &str, err: &io::Error) {
    if is_disconnect(err) {
        tracing::warn!(conn = %id, leg, error = %err, "peer went away");
    } else {
        tracing::error!(conn = %id, leg, error = %err, "i/o error");
    }
}

fn log_fatal(id: super::ConnectionId, err: &ConnectionError) {
    match err {
        ConnectionError::Io(io_err) if is_disconnect(io_err) => {
            tracing::warn!(conn = %id, error = %err, "closing");
        }
        ConnectionError::Unauthenticated => {
            tracing::debug!(conn = %id, error = %err, "closing");
        }
        _ => tracing::error!(conn = %id, error = %err, "closing"),
    }
}

/// Run a coordinator over an accepted stream socket.
///
/// `make` receives the socket's downstream and the event sender relays
/// should report to.
pub async fn serve_stream<C, F>(stream: TcpStream, config: &TunnelConfig, make: F) -> Result<CloseReason, ConnectionError>
where
    C: Connection,
    F: FnOnce(StreamDownstream, EventSender) -> Result<C, ConnectionError>,
{
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    let (events_tx, mut events_rx) = event_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();

    let mut conn = make(StreamDownstream::new(out_tx), events_tx.clone())?;
    let reader_task = tokio::spawn(read_socket(reader, events_tx));
    let writer_task = tokio::spawn(write_socket(writer, out_rx));

    let reason = drive(&mut conn, &mut events_rx, config).await;

    // No callback may fire after close: stop reading, let queued output drain.
    reader_task.abort();
    drop(conn);
    if let Ok(Err(err)) = writer_task.await {
        if !is_disconnect(&err) {
            tracing::debug!(error = %err, "writer stopped");
        }
    }
    Ok(reason)
}

async fn read_socket(mut reader: OwnedReadHalf, events: EventSender) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let event = match reader.read(&mut buf).await {
            Ok(0) => Event::Closed,
            Ok(n) => Event::Data(buf[..n].to_vec()),
            Err(err) => Event::Error(err),
        };
        let last = !matches!(event, Event::Data(_));
        if events.send(event).await.is_err() || last {
            return;
        }
    }
}

async fn write_socket(
    mut writer: OwnedWriteHalf,
    mut out: mpsc::UnboundedReceiver<Vec<u8>>,
) -> io::Result<()> {
    while let Some(buf) = out.recv().await {
        writer.write_all(&buf).await?;
    }
    writer.shutdown().await
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use super::*;
    use crate::connection::testing::{FakeDownstream, FakeRelays, RelayCall};
    use crate::connection::{ClientConnection, ConnectionId, ServerConnection, Transport};
    use crate::core::{Address, Role};
    use crate::crypto::{Secret, StreamCipherPair};
    use crate::transport::pack;

    fn client_config() -> TunnelConfig {
        TunnelConfig::builder(Role::Client)
            .server_addr(SocketAddr::from(([127, 0, 0, 1], 1081)))
            .secret("K")
            .handshake_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(60))
            .build()
            .unwrap()
    }

    fn client(config: &TunnelConfig, events: EventSender) -> (ClientConnection, FakeRelays, FakeDownstream) {
        let relays = FakeRelays::default();
        let downstream = FakeDownstream::default();
        let conn = ClientConnection::new(
            ConnectionId::new(1),
            Arc::new(config.clone()),
            Box::new(downstream.clone()),
            Arc::new(relays.clone()),
            events,
        )
        .unwrap();
        (conn, relays, downstream)
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_closes() {
        let config = client_config();
        let (tx, mut rx) = event_channel();
        let (mut conn, _relays, downstream) = client(&config, tx.clone());

        tx.send(Event::Data(vec![0x05, 0x01, 0x00])).await.unwrap();
        let reason = drive(&mut conn, &mut rx, &config).await;

        assert_eq!(reason, CloseReason::Timeout);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(downstream.sent(), vec![vec![0x05, 0x00]]);
        assert!(downstream.is_closed());
    }

    #[tokio::test]
    async fn test_events_processed_in_order_until_close() {
        let config = client_config();
        let (tx, mut rx) = event_channel();
        let (mut conn, relays, _downstream) = client(&config, tx.clone());
        let target = Address::from(SocketAddr::from(([93, 184, 216, 34], 80)));
        let request = crate::socks5::Request {
            command: crate::socks5::Command::Connect,
            address: target,
        };

        tx.send(Event::Data(vec![0x05, 0x01, 0x00])).await.unwrap();
        tx.send(Event::Data(request.to_bytes())).await.unwrap();
        tx.send(Event::Data(b"GET /".to_vec())).await.unwrap();
        tx.send(Event::Data(b"more".to_vec())).await.unwrap();
        tx.send(Event::Closed).await.unwrap();
        tx.send(Event::Data(b"after close".to_vec())).await.unwrap();

        let reason = drive(&mut conn, &mut rx, &config).await;
        assert_eq!(reason, CloseReason::Eof);

        let calls = relays.calls();
        let sent = calls
            .iter()
            .filter(|call| matches!(call, RelayCall::ToServer(_)))
            .count();
        assert_eq!(sent, 2);
        assert_eq!(calls.last(), Some(&RelayCall::Close));
    }

    #[tokio::test]
    async fn test_short_bootstrap_destroys_connection() {
        let config = TunnelConfig::builder(Role::Server)
            .secret("K")
            .build()
            .unwrap();
        let (tx, mut rx) = event_channel();
        let relays = FakeRelays::default();
        let downstream = FakeDownstream::default();
        let mut conn = ServerConnection::new(
            ConnectionId::new(2),
            Arc::new(config.clone()),
            Transport::Stream,
            Box::new(downstream.clone()),
            Arc::new(relays.clone()),
            tx.clone(),
        )
        .unwrap();
        let mut client = StreamCipherPair::create(&Secret::from("K"), Role::Client, None).unwrap();

        tx.send(Event::Data(client.encrypt(b"tiny").unwrap())).await.unwrap();
        let reason = drive(&mut conn, &mut rx, &config).await;

        assert_eq!(reason, CloseReason::Fatal);
        assert!(relays
            .calls()
            .iter()
            .all(|call| !matches!(call, RelayCall::ToDestination(_))));
        assert!(downstream.is_closed());
    }

    #[tokio::test]
    async fn test_reset_classified_as_disconnect() {
        let config = client_config();
        let (tx, mut rx) = event_channel();
        let (mut conn, _relays, _downstream) = client(&config, tx.clone());

        tx.send(Event::Error(io::Error::from(io::ErrorKind::ConnectionReset)))
            .await
            .unwrap();
        assert_eq!(drive(&mut conn, &mut rx, &config).await, CloseReason::Disconnect);

        let (tx, mut rx) = event_channel();
        let (mut conn, _relays, _downstream) = client(&config, tx.clone());
        tx.send(Event::Error(io::Error::from(io::ErrorKind::PermissionDenied)))
            .await
            .unwrap();
        assert_eq!(
            drive(&mut conn, &mut rx, &config).await,
            CloseReason::TransportError
        );
    }

    #[tokio::test]
    async fn test_nonfatal_errors_keep_connection() {
        let config = TunnelConfig::builder(Role::Server)
            .secret("K")
            .use_iv(false)
            .build()
            .unwrap();
        let (tx, mut rx) = event_channel();
        let relays = FakeRelays::default();
        let downstream = FakeDownstream::default();
        let mut conn = ServerConnection::new(
            ConnectionId::new(3),
            Arc::new(config.clone()),
            Transport::Stream,
            Box::new(downstream.clone()),
            Arc::new(relays.clone()),
            tx.clone(),
        )
        .unwrap();
        let target = Address::from(SocketAddr::from(([10, 0, 0, 1], 80)));

        // Oversized relay payload cannot be framed; it is dropped.
        tx.send(Event::RelayData {
            from: target.clone(),
            payload: vec![0u8; u16::MAX as usize],
        })
        .await
        .unwrap();
        tx.send(Event::RelayData {
            from: target.clone(),
            payload: b"ok".to_vec(),
        })
        .await
        .unwrap();
        tx.send(Event::Closed).await.unwrap();

        assert_eq!(drive(&mut conn, &mut rx, &config).await, CloseReason::Eof);
        let sent = downstream.sent();
        assert_eq!(sent.len(), 1);

        let mut client = StreamCipherPair::create(&Secret::from("K"), Role::Client, None).unwrap();
        client.feed(&sent[0]);
        assert_eq!(
            client.next_decrypted().unwrap().unwrap(),
            pack(&target, b"ok").unwrap()
        );
    }
}
