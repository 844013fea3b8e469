//! Server-side coordinator: decrypt, recover the bootstrap IV, relay.
//!
//! A server coordinator starts in [`ConnectionState::Streaming`]. In IV mode
//! the first decrypted frame ends with the client's IV:
//!
//! ```text
//! received:  [LEN0][ATYP][DST.ADDR][DST.PORT][DATA][IV]
//! forwarded: [LEN0 - IV_LEN][ATYP][DST.ADDR][DST.PORT][DATA]
//! ```
//! after which both cipher directions rotate to that IV.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::core::{Address, IV_LEN, Role, TunnelConfig};
use crate::crypto::{Iv, StreamCipherPair};
use crate::relay::{Relay, RelayError, RelayFactory};
use crate::transport::{can_carry_iv, pack, read_length, write_length, Frame};

use super::{
    Connection, ConnectionError, ConnectionId, ConnectionState, Downstream, EventSender, RelayMode,
};

/// How the tunnel peer reaches this coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// One TCP connection; records arrive as a byte stream.
    Stream,
    /// One UDP association; each datagram holds one record.
    Datagram,
}

/// One tunnel connection or UDP association.
pub struct ServerConnection {
    id: ConnectionId,
    config: Arc<TunnelConfig>,
    state: ConnectionState,
    transport: Transport,
    iv: Option<Iv>,
    cipher: StreamCipherPair,
    downstream: Box<dyn Downstream>,
    relays: Arc<dyn RelayFactory>,
    events: EventSender,
    relay: Option<Box<dyn Relay>>,
    authenticated: bool,
}

impl ServerConnection {
    /// Create a coordinator for a tunnel stream or datagram association.
    pub fn new(
        id: ConnectionId,
        config: Arc<TunnelConfig>,
        transport: Transport,
        downstream: Box<dyn Downstream>,
        relays: Arc<dyn RelayFactory>,
        events: EventSender,
    ) -> Result<Self, ConnectionError> {
        let cipher = StreamCipherPair::create(&config.secret, Role::Server, None)?;
        Ok(Self {
            id,
            config,
            state: ConnectionState::Streaming,
            transport,
            iv: None,
            cipher,
            downstream,
            relays,
            events,
            relay: None,
            authenticated: false,
        })
    }

    /// IV recovered from the bootstrap frame.
    pub fn iv(&self) -> Option<&Iv> {
        self.iv.as_ref()
    }

    fn needs_bootstrap(&self) -> bool {
        self.iv.is_none() && self.config.use_iv
    }

    fn ensure_relay(&mut self) {
        if self.relay.is_some() {
            return;
        }
        let relay = match self.transport {
            Transport::Stream => self.relays.tcp(self.id, self.events.clone()),
            Transport::Datagram => self.relays.udp(self.id, self.events.clone()),
        };
        self.relay = Some(relay);
    }

    fn relay_mut(&mut self) -> Result<&mut Box<dyn Relay>, ConnectionError> {
        self.relay
            .as_mut()
            .ok_or(ConnectionError::Relay(RelayError::Closed))
    }

    fn forward(&mut self, frame: &[u8]) -> Result<(), ConnectionError> {
        self.ensure_relay();
        self.relay_mut()?.forward_to_destination(frame)?;
        Ok(())
    }

    fn adopt_iv(&mut self, iv: Iv) -> Result<(), ConnectionError> {
        self.iv = Some(iv);
        self.ensure_relay();
        self.relay_mut()?.set_iv(iv);
        Ok(())
    }

    /// Strip the IV from a bootstrap frame and restore its length field.
    ///
    /// The patched frame must still parse, otherwise nothing is adopted.
    fn split_bootstrap(frame: &mut Vec<u8>) -> Result<Iv, ConnectionError> {
        if !can_carry_iv(frame, IV_LEN) {
            return Err(ConnectionError::BootstrapTooShort(frame.len()));
        }
        let split = frame.len() - IV_LEN;
        let iv = Iv::from_slice(&frame[split..]).ok_or(ConnectionError::BootstrapTooShort(split))?;
        frame.truncate(split);

        let len0 = read_length(frame).ok_or(ConnectionError::BootstrapTooShort(split))?;
        let len = len0
            .checked_sub(IV_LEN as u16)
            .ok_or(ConnectionError::BootstrapLength(len0))?;
        write_length(frame, len);
        Frame::decode(frame).map_err(|_| ConnectionError::BootstrapLength(len0))?;
        Ok(iv)
    }

    fn on_decrypted(&mut self, mut frame: Vec<u8>) -> Result<(), ConnectionError> {
        if !self.needs_bootstrap() {
            return self.forward(&frame);
        }

        let iv = Self::split_bootstrap(&mut frame)?;
        self.adopt_iv(iv)?;
        tracing::debug!(conn = %self.id, ?iv, "iv recovered");
        let forwarded = self.forward(&frame);
        self.cipher.rebind(iv)?;
        forwarded
    }

    fn on_record_stream(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        self.cipher.feed(bytes);
        while let Some(plaintext) = self.cipher.next_decrypted()? {
            self.on_decrypted(plaintext)?;
        }
        Ok(())
    }

    /// Handle one datagram record. The peer is retargeted only once the
    /// record has authenticated.
    fn on_record_datagram(
        &mut self,
        from: Option<SocketAddr>,
        bytes: &[u8],
    ) -> Result<(), ConnectionError> {
        let (prefix, record) = if self.config.use_iv {
            match bytes.split_at_checked(IV_LEN) {
                Some((prefix, record)) => (Iv::from_slice(prefix), record),
                None => return self.reject_datagram(bytes.len(), "runt datagram"),
            }
        } else {
            (None, bytes)
        };

        let plaintext = match self.cipher.decrypt_datagram(record) {
            Ok(plaintext) => plaintext,
            Err(err) if self.needs_bootstrap() => match prefix {
                // The bootstrap datagram was lost or reordered; the prefix
                // may still name the IV the client rotated to.
                Some(iv) => match self.open_under_prefix(iv, record) {
                    Some(plaintext) => {
                        self.authenticate(from);
                        return self.forward(&plaintext);
                    }
                    None => return self.reject_datagram(bytes.len(), &err.to_string()),
                },
                None => return self.reject_datagram(bytes.len(), &err.to_string()),
            },
            Err(err) => return self.reject_datagram(bytes.len(), &err.to_string()),
        };

        self.authenticate(from);
        self.on_decrypted(plaintext)
    }

    /// Try `record` under a key salted by the prefix IV. The pair, IV and
    /// relay change only if the record opens.
    fn open_under_prefix(&mut self, iv: Iv, record: &[u8]) -> Option<Vec<u8>> {
        let mut candidate =
            StreamCipherPair::create(&self.config.secret, Role::Server, Some(iv)).ok()?;
        let plaintext = candidate.decrypt_datagram(record).ok()?;

        self.cipher = candidate;
        if let Err(err) = self.adopt_iv(iv) {
            tracing::debug!(conn = %self.id, error = %err, "iv not passed to relay");
        }
        tracing::debug!(conn = %self.id, ?iv, "iv recovered from datagram prefix");
        Some(plaintext)
    }

    fn authenticate(&mut self, from: Option<SocketAddr>) {
        self.authenticated = true;
        if let Some(from) = from {
            self.downstream.retarget(from);
        }
    }

    /// Drop a datagram that did not open. An association that never
    /// authenticated is torn down instead.
    fn reject_datagram(&self, len: usize, reason: &str) -> Result<(), ConnectionError> {
        if !self.authenticated {
            tracing::debug!(conn = %self.id, len, reason, "unauthenticated association");
            return Err(ConnectionError::Unauthenticated);
        }
        tracing::debug!(conn = %self.id, len, reason, "dropped datagram");
        Ok(())
    }
}

impl Connection for ServerConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn on_data(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        match self.transport {
            Transport::Stream => self.on_record_stream(bytes),
            Transport::Datagram => self.on_record_datagram(None, bytes),
        }
    }

    fn on_datagram(&mut self, from: SocketAddr, bytes: &[u8]) -> Result<(), ConnectionError> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        match self.transport {
            Transport::Stream => self.on_record_stream(bytes),
            Transport::Datagram => self.on_record_datagram(Some(from), bytes),
        }
    }

    fn on_relay_data(&mut self, from: &Address, payload: &[u8]) -> Result<(), ConnectionError> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        let record = self.cipher.encrypt(&pack(from, payload)?)?;
        let out = match (self.transport, self.iv) {
            (Transport::Datagram, Some(iv)) => {
                let mut datagram = Vec::with_capacity(IV_LEN + record.len());
                datagram.extend_from_slice(iv.as_bytes());
                datagram.extend_from_slice(&record);
                datagram
            }
            _ => record,
        };
        self.downstream.send(out)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::event_channel;
    use crate::connection::testing::{FakeDownstream, FakeRelays, RelayCall};
    use crate::core::MIN_FRAME_HEADER_SIZE;
    use crate::crypto::Secret;
    use crate::transport;

    struct Harness {
        conn: ServerConnection,
        relays: FakeRelays,
        downstream: FakeDownstream,
        client: StreamCipherPair,
    }

    fn harness(use_iv: bool, transport: Transport) -> Harness {
        let config = TunnelConfig::builder(Role::Server)
            .secret("K")
            .use_iv(use_iv)
            .build()
            .unwrap();
        let relays = FakeRelays::default();
        let downstream = FakeDownstream::default();
        let (events, _rx) = event_channel();
        let conn = ServerConnection::new(
            ConnectionId::new(9),
            Arc::new(config),
            transport,
            Box::new(downstream.clone()),
            Arc::new(relays.clone()),
            events,
        )
        .unwrap();
        let client = StreamCipherPair::create(&Secret::from("K"), Role::Client, None).unwrap();

        Harness {
            conn,
            relays,
            downstream,
            client,
        }
    }

    fn target() -> Address {
        Address::from(SocketAddr::from(([93, 184, 216, 34], 80)))
    }

    fn bootstrap_frame(payload: &[u8], iv: &Iv) -> Vec<u8> {
        let mut body = payload.to_vec();
        body.extend_from_slice(iv.as_bytes());
        pack(&target(), &body).unwrap()
    }

    fn forwarded(calls: &[RelayCall]) -> Vec<Vec<u8>> {
        calls
            .iter()
            .filter_map(|call| match call {
                RelayCall::ToDestination(frame) => Some(frame.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_bootstrap_fixup() {
        let mut h = harness(true, Transport::Stream);
        let iv = Iv::from_bytes([0x11; IV_LEN]);
        let received = bootstrap_frame(b"GET /", &iv);
        assert_eq!(read_length(&received), Some(25));

        h.conn.on_data(&h.client.encrypt(&received).unwrap()).unwrap();

        let calls = h.relays.calls();
        assert_eq!(calls[0], RelayCall::Created(RelayMode::Tcp));
        assert_eq!(calls[1], RelayCall::SetIv(iv));
        let frames = forwarded(&calls);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), received.len() - IV_LEN);
        assert_eq!(read_length(&frames[0]), Some(9));
        assert_eq!(frames[0], pack(&target(), b"GET /").unwrap());
        assert_eq!(h.conn.iv(), Some(&iv));
    }

    #[test]
    fn test_writes_after_bootstrap_use_rotated_key() {
        let mut h = harness(true, Transport::Stream);
        let iv = Iv::from_bytes([0x22; IV_LEN]);

        // Bootstrap and the next write arrive in one read.
        let mut wire = h.client.encrypt(&bootstrap_frame(b"GET /", &iv)).unwrap();
        h.client.rebind(iv).unwrap();
        wire.extend(h.client.encrypt(&pack(&target(), b"more").unwrap()).unwrap());
        h.conn.on_data(&wire).unwrap();

        let frames = forwarded(&h.relays.calls());
        assert_eq!(frames.len(), 2);
        assert_eq!(read_length(&frames[1]), Some(8));
        assert_eq!(transport::parse(&frames[1]).unwrap().payload, b"more");
    }

    #[test]
    fn test_short_bootstrap_destroys_without_forward() {
        let mut h = harness(true, Transport::Stream);
        let short = vec![0u8; IV_LEN + MIN_FRAME_HEADER_SIZE - 1];

        let err = h.conn.on_data(&h.client.encrypt(&short).unwrap()).unwrap_err();

        assert!(matches!(err, ConnectionError::BootstrapTooShort(_)));
        assert!(err.is_fatal());
        assert!(forwarded(&h.relays.calls()).is_empty());
        assert!(h.conn.iv().is_none());
    }

    #[test]
    fn test_bootstrap_length_underflow_is_fatal() {
        let mut h = harness(true, Transport::Stream);
        let mut frame = bootstrap_frame(b"GET /", &Iv::from_bytes([3; IV_LEN]));
        write_length(&mut frame, 4);

        let err = h.conn.on_data(&h.client.encrypt(&frame).unwrap()).unwrap_err();
        assert!(matches!(err, ConnectionError::BootstrapLength(4)));
        assert!(forwarded(&h.relays.calls()).is_empty());
    }

    #[test]
    fn test_bootstrap_length_must_cover_patched_frame() {
        let iv = Iv::from_bytes([4; IV_LEN]);
        // 18 - 16 leaves less than the 4-byte IPv4 host; 40 - 16 claims more
        // bytes than the frame holds.
        for len0 in [18u16, 40] {
            let mut h = harness(true, Transport::Stream);
            let mut frame = bootstrap_frame(b"GET /", &iv);
            write_length(&mut frame, len0);

            let err = h.conn.on_data(&h.client.encrypt(&frame).unwrap()).unwrap_err();
            assert!(matches!(err, ConnectionError::BootstrapLength(len) if len == len0));
            assert!(err.is_fatal());
            assert!(h.relays.calls().is_empty());
            assert!(h.conn.iv().is_none());
        }
    }

    #[test]
    fn test_without_iv_mode_forwards_unchanged() {
        let mut h = harness(false, Transport::Stream);
        let frame = pack(&target(), b"GET /").unwrap();

        h.conn.on_data(&h.client.encrypt(&frame).unwrap()).unwrap();

        assert_eq!(forwarded(&h.relays.calls()), vec![frame]);
        assert!(h.conn.iv().is_none());
    }

    #[test]
    fn test_records_split_across_reads() {
        let mut h = harness(false, Transport::Stream);
        let wire = h
            .client
            .encrypt(&pack(&target(), b"payload").unwrap())
            .unwrap();

        for byte in &wire {
            h.conn.on_data(std::slice::from_ref(byte)).unwrap();
        }
        assert_eq!(forwarded(&h.relays.calls()).len(), 1);
    }

    #[test]
    fn test_corrupt_stream_is_fatal() {
        let mut h = harness(false, Transport::Stream);
        let mut wire = h.client.encrypt(&pack(&target(), b"x").unwrap()).unwrap();
        wire[12] ^= 0xFF;

        let err = h.conn.on_data(&wire).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_responses_encrypted_under_rotated_key() {
        let mut h = harness(true, Transport::Stream);
        let iv = Iv::from_bytes([0x33; IV_LEN]);
        h.conn
            .on_data(&h.client.encrypt(&bootstrap_frame(b"GET /", &iv)).unwrap())
            .unwrap();
        h.client.rebind(iv).unwrap();

        h.conn.on_relay_data(&target(), b"HTTP/1.1 200 OK").unwrap();

        let sent = h.downstream.sent();
        h.client.feed(&sent[0]);
        let frame = transport::parse(&h.client.next_decrypted().unwrap().unwrap()).unwrap();
        assert_eq!(frame.address, target());
        assert_eq!(frame.payload, b"HTTP/1.1 200 OK");
    }

    #[test]
    fn test_datagram_bootstrap_and_reply_prefix() {
        let mut h = harness(true, Transport::Datagram);
        let iv = Iv::from_bytes([0x44; IV_LEN]);
        let peer = SocketAddr::from(([198, 51, 100, 7], 5353));

        let mut datagram = iv.as_bytes().to_vec();
        datagram.extend(h.client.encrypt(&bootstrap_frame(b"query", &iv)).unwrap());
        h.conn.on_datagram(peer, &datagram).unwrap();
        h.client.rebind(iv).unwrap();

        let calls = h.relays.calls();
        assert_eq!(calls[0], RelayCall::Created(RelayMode::Udp));
        assert_eq!(forwarded(&calls), vec![pack(&target(), b"query").unwrap()]);
        assert_eq!(*h.downstream.peers.lock().unwrap(), vec![peer]);

        h.conn.on_relay_data(&target(), b"answer").unwrap();
        let reply = h.downstream.sent().pop().unwrap();
        assert_eq!(&reply[..IV_LEN], iv.as_bytes());
        let frame = transport::parse(&h.client.decrypt_datagram(&reply[IV_LEN..]).unwrap()).unwrap();
        assert_eq!(frame.payload, b"answer");
    }

    #[test]
    fn test_datagram_lost_bootstrap_recovers_from_prefix() {
        let mut h = harness(true, Transport::Datagram);
        let iv = Iv::from_bytes([0x55; IV_LEN]);
        let peer = SocketAddr::from(([198, 51, 100, 7], 5353));

        // Bootstrap sealed but never delivered.
        let _lost = h.client.encrypt(&bootstrap_frame(b"first", &iv)).unwrap();
        h.client.rebind(iv).unwrap();

        let mut datagram = iv.as_bytes().to_vec();
        datagram.extend(h.client.encrypt(&pack(&target(), b"second").unwrap()).unwrap());
        h.conn.on_datagram(peer, &datagram).unwrap();

        assert_eq!(h.conn.iv(), Some(&iv));
        assert_eq!(*h.downstream.peers.lock().unwrap(), vec![peer]);
        assert_eq!(forwarded(&h.relays.calls()), vec![pack(&target(), b"second").unwrap()]);
    }

    #[test]
    fn test_datagram_garbage_tears_down_fresh_association() {
        let mut h = harness(true, Transport::Datagram);
        let peer = SocketAddr::from(([198, 51, 100, 7], 5353));

        let err = h.conn.on_datagram(peer, &[7u8; 64]).unwrap_err();
        assert!(matches!(err, ConnectionError::Unauthenticated));
        assert!(err.is_fatal());

        let err = h.conn.on_datagram(peer, &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, ConnectionError::Unauthenticated));

        assert!(h.conn.iv().is_none());
        assert!(h.relays.calls().is_empty());
        assert!(h.downstream.peers.lock().unwrap().is_empty());
    }

    #[test]
    fn test_datagram_garbage_dropped_after_authentication() {
        let mut h = harness(true, Transport::Datagram);
        let iv = Iv::from_bytes([0x66; IV_LEN]);
        let peer = SocketAddr::from(([198, 51, 100, 7], 5353));

        let mut datagram = iv.as_bytes().to_vec();
        datagram.extend(h.client.encrypt(&bootstrap_frame(b"query", &iv)).unwrap());
        h.conn.on_datagram(peer, &datagram).unwrap();

        h.conn.on_datagram(peer, &[1, 2, 3]).unwrap();
        h.conn.on_datagram(peer, &[7u8; 64]).unwrap();

        assert_eq!(forwarded(&h.relays.calls()).len(), 1);
        assert_eq!(h.conn.state(), ConnectionState::Streaming);
    }

    #[test]
    fn test_forged_prefix_does_not_adopt_iv() {
        let mut h = harness(true, Transport::Datagram);
        let peer = SocketAddr::from(([203, 0, 113, 66], 4444));
        let iv = Iv::from_bytes([0x77; IV_LEN]);

        // Sealed under a different secret: neither the base key nor the
        // prefix key opens it.
        let mut stranger =
            StreamCipherPair::create(&Secret::from("other"), Role::Client, Some(iv)).unwrap();
        let mut datagram = iv.as_bytes().to_vec();
        datagram.extend(stranger.encrypt(&pack(&target(), b"x").unwrap()).unwrap());

        let err = h.conn.on_datagram(peer, &datagram).unwrap_err();
        assert!(matches!(err, ConnectionError::Unauthenticated));
        assert!(h.conn.iv().is_none());
        assert!(h.relays.calls().is_empty());
        assert!(h.downstream.peers.lock().unwrap().is_empty());
    }

    #[test]
    fn test_forged_datagram_does_not_retarget() {
        let mut h = harness(true, Transport::Datagram);
        let iv = Iv::from_bytes([0x88; IV_LEN]);
        let peer = SocketAddr::from(([198, 51, 100, 7], 5353));
        let attacker = SocketAddr::from(([203, 0, 113, 66], 4444));

        let mut datagram = iv.as_bytes().to_vec();
        datagram.extend(h.client.encrypt(&bootstrap_frame(b"query", &iv)).unwrap());
        h.conn.on_datagram(peer, &datagram).unwrap();
        h.client.rebind(iv).unwrap();

        let mut forged = iv.as_bytes().to_vec();
        forged.extend([0u8; 40]);
        h.conn.on_datagram(attacker, &forged).unwrap();

        let mut tampered = iv.as_bytes().to_vec();
        tampered.extend(h.client.encrypt(&pack(&target(), b"y").unwrap()).unwrap());
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        h.conn.on_datagram(attacker, &tampered).unwrap();

        assert_eq!(*h.downstream.peers.lock().unwrap(), vec![peer]);
        assert_eq!(forwarded(&h.relays.calls()).len(), 1);
    }

    #[test]
    fn test_close_stops_processing() {
        let mut h = harness(false, Transport::Stream);
        h.conn
            .on_data(&h.client.encrypt(&pack(&target(), b"a").unwrap()).unwrap())
            .unwrap();
        h.conn.on_close();

        h.conn
            .on_data(&h.client.encrypt(&pack(&target(), b"b").unwrap()).unwrap())
            .unwrap();
        h.conn.on_relay_data(&target(), b"late").unwrap();

        assert_eq!(forwarded(&h.relays.calls()).len(), 1);
        assert!(h.relays.calls().contains(&RelayCall::Close));
        assert!(h.downstream.sent().is_empty());
        assert!(h.downstream.is_closed());
    }
}
