//! Stream relays.

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::connection::{ConnectionId, Event, EventSender};
use crate::core::{Address, CONNECT_TIMEOUT, READ_BUFFER_SIZE};
use crate::transport::Frame;

use super::{Relay, RelayError};

/// Client stream relay: encrypted records to the tunnel peer.
pub struct ClientTcpRelay {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
}

impl ClientTcpRelay {
    /// Start connecting to `peer`; records queue until connected.
    pub fn spawn(id: ConnectionId, peer: SocketAddr, events: EventSender) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let result = match connect(peer).await {
                Ok(stream) => {
                    tracing::debug!(conn = %id, %peer, "tunnel leg connected");
                    pump(stream, rx, Address::from(peer), &events).await
                }
                Err(err) => Err(err),
            };
            let _ = events.send(Event::RelayClosed(result.err())).await;
        });

        Self {
            tx: Some(tx),
            task: Some(task),
        }
    }
}

impl Relay for ClientTcpRelay {
    fn forward_to_destination(&mut self, _frame: &[u8]) -> Result<(), RelayError> {
        Err(RelayError::Unsupported("forward_to_destination"))
    }

    fn forward_to_server(&mut self, record: &[u8]) -> Result<(), RelayError> {
        let tx = self.tx.as_ref().ok_or(RelayError::Closed)?;
        tx.send(record.to_vec()).map_err(|_| RelayError::Closed)
    }

    fn close(&mut self) {
        self.tx = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ClientTcpRelay {
    fn drop(&mut self) {
        self.close();
    }
}

/// Server stream relay: payloads to the destination named by the first frame.
pub struct ServerTcpRelay {
    id: ConnectionId,
    events: EventSender,
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
    closed: bool,
}

impl ServerTcpRelay {
    /// Create an unconnected relay; the first frame decides the destination.
    pub fn new(id: ConnectionId, events: EventSender) -> Self {
        Self {
            id,
            events,
            tx: None,
            task: None,
            closed: false,
        }
    }

    fn open(&mut self, target: Address) -> mpsc::UnboundedSender<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.id;
        let events = self.events.clone();

        self.task = Some(tokio::spawn(async move {
            let result = match target.resolve().await {
                Ok(addr) => match connect(addr).await {
                    Ok(stream) => {
                        tracing::info!(conn = %id, %target, "destination connected");
                        pump(stream, rx, target, &events).await
                    }
                    Err(err) => Err(err),
                },
                Err(err) => Err(err),
            };
            let _ = events.send(Event::RelayClosed(result.err())).await;
        }));

        self.tx = Some(tx.clone());
        tx
    }
}

impl Relay for ServerTcpRelay {
    fn forward_to_destination(&mut self, frame: &[u8]) -> Result<(), RelayError> {
        if self.closed {
            return Err(RelayError::Closed);
        }
        let frame = Frame::decode(frame)?;

        // The destination is fixed by the first frame of the connection.
        let tx = match &self.tx {
            Some(tx) => tx.clone(),
            None => self.open(frame.address),
        };
        if frame.payload.is_empty() {
            return Ok(());
        }
        tx.send(frame.payload).map_err(|_| RelayError::Closed)
    }

    fn forward_to_server(&mut self, _record: &[u8]) -> Result<(), RelayError> {
        Err(RelayError::Unsupported("forward_to_server"))
    }

    fn close(&mut self) {
        self.closed = true;
        self.tx = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ServerTcpRelay {
    fn drop(&mut self) {
        self.close();
    }
}

async fn connect(addr: SocketAddr) -> io::Result<TcpStream> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {addr} timed out"),
            )
        })??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Copy queued bytes to `stream` and report what it sends back as coming from `from`.
///
/// Returns when the far end closes or fails. Running out of queued bytes
/// half-closes the write side and keeps reading.
async fn pump(
    stream: TcpStream,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    from: Address,
    events: &EventSender,
) -> io::Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    let write_loop = async {
        while let Some(buf) = rx.recv().await {
            writer.write_all(&buf).await?;
        }
        writer.shutdown().await?;
        std::future::pending::<io::Result<()>>().await
    };

    let read_loop = async {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok::<(), io::Error>(());
            }
            let event = Event::RelayData {
                from: from.clone(),
                payload: buf[..n].to_vec(),
            };
            if events.send(event).await.is_err() {
                return Ok(());
            }
        }
    };

    tokio::select! {
        result = write_loop => result,
        result = read_loop => result,
    }
}
