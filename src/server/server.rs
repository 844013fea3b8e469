//! Tunnel server endpoint.
//!
//! Listens for tunnel streams on TCP and tunnel datagrams on UDP, both on
//! the configured bind address.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};

use super::datagram::DatagramDemux;
use crate::connection::{ConnectionId, ServerConnection, Transport, serve_stream};
use crate::core::{ConfigError, Role, TunnelConfig};
use crate::relay::{RelayFactory, ServerRelays};

/// Errors that can occur in the tunnel server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Configuration is unusable for the server role.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Failed to bind a listener.
    #[error("bind {addr} failed: {source}")]
    BindFailed {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A running tunnel server.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use sockstun::prelude::*;
///
/// let config = TunnelConfig::builder(Role::Server)
///     .bind_addr("0.0.0.0:1081".parse()?)
///     .secret("correct horse")
///     .build()?;
///
/// let server = TunnelServer::bind(Arc::new(config)).await?;
/// tokio::signal::ctrl_c().await?;
/// server.shutdown().await;
/// ```
pub struct TunnelServer {
    config: Arc<TunnelConfig>,
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl TunnelServer {
    /// Bind the stream and datagram listeners and start serving.
    ///
    /// The datagram socket takes the stream listener's port, so binding
    /// port 0 yields one shared ephemeral port.
    pub async fn bind(config: Arc<TunnelConfig>) -> Result<Self, ServerError> {
        if config.role != Role::Server {
            return Err(ConfigError::Invalid("TunnelServer needs the server role".into()).into());
        }
        config.validate()?;

        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| ServerError::BindFailed {
                addr: config.bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;
        let socket = UdpSocket::bind(local_addr)
            .await
            .map_err(|source| ServerError::BindFailed {
                addr: local_addr,
                source,
            })?;
        tracing::info!(%local_addr, use_iv = config.use_iv, "tunnel server up");

        let relays: Arc<dyn RelayFactory> = Arc::new(ServerRelays);
        let datagrams = DatagramDemux::new(socket, Arc::clone(&config), Arc::clone(&relays));

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(serve(
            listener,
            datagrams,
            Arc::clone(&config),
            relays,
            shutdown_rx,
        ));

        Ok(Self {
            config,
            local_addr,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    /// Address both listeners are bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Configuration in use.
    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Gracefully shut down the server.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for TunnelServer {
    fn drop(&mut self) {
        // Send shutdown signal if not already sent
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn serve(
    listener: TcpListener,
    datagrams: DatagramDemux,
    config: Arc<TunnelConfig>,
    relays: Arc<dyn RelayFactory>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut streams = JoinSet::new();
    let datagrams = datagrams.run();
    tokio::pin!(datagrams);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!(open = streams.len(), "server shutting down");
                break;
            }
            result = &mut datagrams => {
                if let Err(err) = result {
                    tracing::error!(error = %err, "datagram listener failed");
                }
                break;
            }
            Some(_) = streams.join_next() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    streams.spawn(serve_tunnel(
                        stream,
                        peer,
                        Arc::clone(&config),
                        Arc::clone(&relays),
                    ));
                }
                Err(err) => tracing::warn!(error = %err, "accept failed"),
            },
        }
    }

    streams.shutdown().await;
}

async fn serve_tunnel(
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<TunnelConfig>,
    relays: Arc<dyn RelayFactory>,
) {
    let id = ConnectionId::next();
    tracing::debug!(conn = %id, %peer, "tunnel accepted");

    let conn_config = Arc::clone(&config);
    let result = serve_stream(stream, &config, move |downstream, events| {
        ServerConnection::new(
            id,
            conn_config,
            Transport::Stream,
            Box::new(downstream),
            relays,
            events,
        )
    })
    .await;

    match result {
        Ok(reason) => tracing::debug!(conn = %id, ?reason, "tunnel finished"),
        Err(err) => tracing::warn!(conn = %id, error = %err, "tunnel failed to start"),
    }
}
