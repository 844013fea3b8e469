//! Client-side coordinator: SOCKS5 handshake, then framing and encryption.

use std::sync::Arc;

use crate::core::{Address, Role, TunnelConfig};
use crate::crypto::{Iv, StreamCipherPair};
use crate::relay::{Relay, RelayError, RelayFactory};
use crate::socks5::{self, Command, Message, UdpEnvelope};
use crate::transport::{self, pack};

use super::{
    Connection, ConnectionError, ConnectionId, ConnectionState, Downstream, EventSender, RelayMode,
};

/// One local application connection.
pub struct ClientConnection {
    id: ConnectionId,
    config: Arc<TunnelConfig>,
    state: ConnectionState,
    mode: RelayMode,
    target: Option<Address>,
    cipher: StreamCipherPair,
    downstream: Box<dyn Downstream>,
    relays: Arc<dyn RelayFactory>,
    events: EventSender,
    relay: Option<Box<dyn Relay>>,
}

impl ClientConnection {
    /// Create a coordinator awaiting the SOCKS5 handshake.
    pub fn new(
        id: ConnectionId,
        config: Arc<TunnelConfig>,
        downstream: Box<dyn Downstream>,
        relays: Arc<dyn RelayFactory>,
        events: EventSender,
    ) -> Result<Self, ConnectionError> {
        let cipher = StreamCipherPair::create(&config.secret, Role::Client, None)?;
        Ok(Self {
            id,
            config,
            state: ConnectionState::AwaitingHandshake,
            mode: RelayMode::Tcp,
            target: None,
            cipher,
            downstream,
            relays,
            events,
            relay: None,
        })
    }

    /// Destination fixed by the handshake.
    pub fn target(&self) -> Option<&Address> {
        self.target.as_ref()
    }

    /// Relay mode fixed by the handshake.
    pub fn mode(&self) -> RelayMode {
        self.mode
    }

    /// IV in use, once bootstrapped.
    pub fn iv(&self) -> Option<&Iv> {
        self.cipher.iv()
    }

    fn ensure_relay(&mut self) {
        if self.relay.is_some() {
            return;
        }
        let relay = match self.mode {
            RelayMode::Tcp => self.relays.tcp(self.id, self.events.clone()),
            RelayMode::Udp => self.relays.udp(self.id, self.events.clone()),
        };
        self.relay = Some(relay);
    }

    fn relay_mut(&mut self) -> Result<&mut Box<dyn Relay>, ConnectionError> {
        self.relay
            .as_mut()
            .ok_or(ConnectionError::Relay(RelayError::Closed))
    }

    fn on_handshake(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        match socks5::parse(bytes) {
            Some(Message::Identify(identify)) => {
                self.downstream
                    .send(socks5::build_select(identify.select_method()))?;
            }
            Some(Message::Request(request)) => {
                let mode = match request.command {
                    Command::Connect => RelayMode::Tcp,
                    Command::UdpAssociate => RelayMode::Udp,
                    other => {
                        tracing::warn!(conn = %self.id, command = ?other, "unsupported command");
                        self.downstream
                            .send(socks5::build_reply(socks5::REPLY_COMMAND_NOT_SUPPORTED))?;
                        return Ok(());
                    }
                };
                tracing::info!(conn = %self.id, target = %request.address, ?mode, "request accepted");
                self.target = Some(request.address);
                self.mode = mode;
                self.downstream
                    .send(socks5::build_reply(socks5::REPLY_SUCCEEDED))?;
                self.state = ConnectionState::Streaming;
            }
            None => {
                tracing::trace!(conn = %self.id, len = bytes.len(), "ignored unrecognized handshake bytes");
            }
        }
        Ok(())
    }

    fn on_application(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        let payload = match self.mode {
            RelayMode::Tcp => bytes,
            RelayMode::Udp => match UdpEnvelope::parse(bytes) {
                Ok(envelope) => envelope.data,
                Err(err) => {
                    tracing::warn!(conn = %self.id, len = bytes.len(), error = %err, "dropped malformed udp envelope");
                    return Ok(());
                }
            },
        };
        let Some(target) = self.target.clone() else {
            return Ok(());
        };

        let record = if self.cipher.iv().is_none() && self.config.use_iv {
            // The bootstrap record is sealed under the secret-only key and
            // carries the new IV behind the payload.
            let iv = Iv::generate();
            let mut body = Vec::with_capacity(payload.len() + iv.as_bytes().len());
            body.extend_from_slice(payload);
            body.extend_from_slice(iv.as_bytes());

            let record = self.cipher.encrypt(&pack(&target, &body)?)?;
            self.cipher.rebind(iv)?;
            self.ensure_relay();
            self.relay_mut()?.set_iv(iv);
            tracing::debug!(conn = %self.id, ?iv, "iv bootstrapped");
            record
        } else {
            self.cipher.encrypt(&pack(&target, payload)?)?
        };

        self.ensure_relay();
        self.relay_mut()?.forward_to_server(&record)?;
        Ok(())
    }

    fn deliver(&mut self, plaintext: &[u8]) -> Result<(), ConnectionError> {
        let Some(frame) = transport::parse(plaintext) else {
            tracing::debug!(conn = %self.id, len = plaintext.len(), "dropped unparseable frame");
            return Ok(());
        };
        let out = match self.mode {
            RelayMode::Tcp => frame.payload,
            RelayMode::Udp => UdpEnvelope::encode(&frame.address, &frame.payload),
        };
        self.downstream.send(out)
    }
}

impl Connection for ClientConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn on_data(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        match self.state {
            ConnectionState::AwaitingHandshake => self.on_handshake(bytes),
            ConnectionState::Streaming => self.on_application(bytes),
            ConnectionState::Closed => Ok(()),
        }
    }

    fn on_relay_data(&mut self, _from: &Address, payload: &[u8]) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::Streaming {
            return Ok(());
        }
        match self.mode {
            RelayMode::Tcp => {
                self.cipher.feed(payload);
                while let Some(plaintext) = self.cipher.next_decrypted()? {
                    self.deliver(&plaintext)?;
                }
                Ok(())
            }
            RelayMode::Udp => match self.cipher.decrypt_datagram(payload) {
                Ok(plaintext) => self.deliver(&plaintext),
                Err(err) => {
                    tracing::debug!(conn = %self.id, error = %err, "dropped undecryptable datagram");
                    Ok(())
                }
            },
        }
    }

    fn on_close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        if let Some(mut relay) = self.relay.take() {
            relay.close();
        }
        self.downstream.close();
        self.state = ConnectionState::Closed;
    }
}
