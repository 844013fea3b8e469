//! Local SOCKS5 listener.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};

use crate::connection::{ClientConnection, ConnectionId, serve_stream};
use crate::core::{ConfigError, Role, TunnelConfig};
use crate::relay::{ClientRelays, RelayFactory};

/// Errors starting or running the client endpoint.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Configuration is unusable for the client role.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Failed to bind the SOCKS5 listener.
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

/// A running client endpoint.
///
/// Accepts SOCKS5 connections on the configured bind address and tunnels
/// each to the first hop. The accept loop stops when the handle is shut
/// down or dropped; in-flight connections are aborted with it.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use sockstun::prelude::*;
///
/// let config = TunnelConfig::builder(Role::Client)
///     .server_addr("203.0.113.7:1081".parse()?)
///     .secret("correct horse")
///     .build()?;
///
/// let client = TunnelClient::bind(Arc::new(config)).await?;
/// println!("SOCKS5 on {}", client.local_addr());
/// tokio::signal::ctrl_c().await?;
/// client.shutdown().await;
/// ```
pub struct TunnelClient {
    config: Arc<TunnelConfig>,
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl TunnelClient {
    /// Bind the SOCKS5 listener and start accepting.
    pub async fn bind(config: Arc<TunnelConfig>) -> Result<Self, ClientError> {
        if config.role != Role::Client {
            return Err(ConfigError::Invalid("TunnelClient needs the client role".into()).into());
        }
        config.validate()?;
        let relays: Arc<dyn RelayFactory> = Arc::new(ClientRelays::new(&config)?);

        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| ClientError::BindFailed {
                addr: config.bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, use_iv = config.use_iv, "SOCKS5 listener up");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(
            listener,
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

    /// Address the SOCKS5 listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Configuration in use.
    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Stop accepting and abort every open connection.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for TunnelClient {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<TunnelConfig>,
    relays: Arc<dyn RelayFactory>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!(open = connections.len(), "client shutting down");
                break;
            }
            Some(_) = connections.join_next() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(serve_socks(
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

    connections.shutdown().await;
}

async fn serve_socks(
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<TunnelConfig>,
    relays: Arc<dyn RelayFactory>,
) {
    let id = ConnectionId::next();
    tracing::debug!(conn = %id, %peer, "accepted");

    let conn_config = Arc::clone(&config);
    let result = serve_stream(stream, &config, move |downstream, events| {
        ClientConnection::new(id, conn_config, Box::new(downstream), relays, events)
    })
    .await;

    match result {
        Ok(reason) => tracing::debug!(conn = %id, ?reason, "connection finished"),
        Err(err) => tracing::warn!(conn = %id, error = %err, "connection failed to start"),
    }
}
