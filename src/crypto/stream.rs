//! Self-framing encrypt and decrypt sinks.
//!
//! Each `seal` call produces exactly one record; the decrypt sink
//! reassembles records from an arbitrary byte stream and yields exactly one
//! plaintext per record, so decrypted buffers line up one-to-one with the
//! peer's writes no matter how TCP re-chunks them.
//!
//! Record wire format:
//! ```text
//! +-----------+-------------+-------------+---------------------------+
//! | BODY_LEN  | COUNTER     | SALT        | CIPHERTEXT || TAG         |
//! | 2 (BE16)  | 8 (LE64)    | 15          | BODY_LEN - 23             |
//! +-----------+-------------+-------------+---------------------------+
//! ```
//! The 25-byte header is the AAD. On a stream, counters must arrive in
//! sequence; datagrams may reorder within the replay window.

use bytes::{Buf, BytesMut};

use crate::core::{
    CryptoError, MAX_RECORD_PLAINTEXT, MIN_RECORD_BODY, RECORD_COUNTER_SIZE, RECORD_HEADER_SIZE,
    RECORD_LEN_SIZE,
};

use super::{
    construct_nonce, generate_salt, Direction, NonceSalt, ReplayWindow, Sealer, StreamKey,
};

/// Encrypting half of a cipher pair.
pub struct Encryptor {
    sealer: Sealer,
    direction: Direction,
    salt: NonceSalt,
    counter: u64,
}

impl Encryptor {
    /// Create an encryptor for records travelling in `direction`.
    ///
    /// Draws a fresh nonce salt, so two sinks on the same key never share
    /// a nonce.
    pub fn new(key: &StreamKey, direction: Direction) -> Self {
        Self {
            sealer: Sealer::new(key),
            direction,
            salt: generate_salt(),
            counter: 0,
        }
    }

    /// Number of records sealed so far.
    pub fn records_sealed(&self) -> u64 {
        self.counter
    }

    /// Seal one plaintext into one record.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if plaintext.len() > MAX_RECORD_PLAINTEXT {
            return Err(CryptoError::RecordTooLarge(plaintext.len()));
        }
        if self.counter == u64::MAX {
            return Err(CryptoError::CounterExhaustion);
        }

        let body_len = (MIN_RECORD_BODY + plaintext.len()) as u16;
        let mut header = [0u8; RECORD_HEADER_SIZE];
        header[..RECORD_LEN_SIZE].copy_from_slice(&body_len.to_be_bytes());
        header[RECORD_LEN_SIZE..RECORD_LEN_SIZE + RECORD_COUNTER_SIZE]
            .copy_from_slice(&self.counter.to_le_bytes());
        header[RECORD_LEN_SIZE + RECORD_COUNTER_SIZE..].copy_from_slice(&self.salt);

        let nonce = construct_nonce(self.direction, &self.salt, self.counter);
        let ciphertext = self.sealer.seal(&nonce, &header, plaintext)?;
        self.counter += 1;

        let mut record = Vec::with_capacity(RECORD_HEADER_SIZE + ciphertext.len());
        record.extend_from_slice(&header);
        record.extend_from_slice(&ciphertext);
        Ok(record)
    }
}

/// Decrypting half of a cipher pair.
pub struct Decryptor {
    sealer: Sealer,
    direction: Direction,
    next_counter: u64,
    window: ReplayWindow,
    pending: BytesMut,
}

impl Decryptor {
    /// Create a decryptor for records travelling in `direction`.
    pub fn new(key: &StreamKey, direction: Direction) -> Self {
        Self {
            sealer: Sealer::new(key),
            direction,
            next_counter: 0,
            window: ReplayWindow::new(),
            pending: BytesMut::new(),
        }
    }

    /// Append stream bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet decrypted.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Hand over buffered bytes, leaving this sink empty.
    pub(crate) fn take_pending(&mut self) -> BytesMut {
        std::mem::take(&mut self.pending)
    }

    /// Decrypt the next complete record, if one is buffered.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A record whose
    /// counter is not the next in sequence is an error, so dropped or
    /// reordered records break the stream.
    pub fn next_plaintext(&mut self) -> Result<Option<Vec<u8>>, CryptoError> {
        let Some(total) = record_len(&self.pending)? else {
            return Ok(None);
        };
        if self.pending.len() < total {
            return Ok(None);
        }

        let record = self.pending.split_to(total);
        let counter = record_counter(&record);
        if counter != self.next_counter {
            return Err(CryptoError::UnexpectedCounter {
                expected: self.next_counter,
                actual: counter,
            });
        }

        let plaintext = self.open_record(&record, counter)?;
        self.next_counter += 1;
        Ok(Some(plaintext))
    }

    /// Decrypt a datagram holding exactly one record.
    ///
    /// Datagrams may be lost or reordered; only replays are rejected.
    pub fn open_datagram(&mut self, datagram: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match record_len(datagram)? {
            Some(total) if total == datagram.len() => {}
            _ => return Err(CryptoError::MalformedRecord),
        }

        let counter = record_counter(datagram);
        if self.window.is_replay(counter) {
            return Err(CryptoError::ReplayDetected);
        }
        let plaintext = self.open_record(datagram, counter)?;
        self.window.check_and_update(counter)?;
        Ok(plaintext)
    }

    fn open_record(&self, record: &[u8], counter: u64) -> Result<Vec<u8>, CryptoError> {
        let (header, ciphertext) = record.split_at(RECORD_HEADER_SIZE);
        let mut salt = NonceSalt::default();
        salt.copy_from_slice(&header[RECORD_LEN_SIZE + RECORD_COUNTER_SIZE..]);

        let nonce = construct_nonce(self.direction, &salt, counter);
        self.sealer.open(&nonce, header, ciphertext)
    }
}

/// Counter carried by a complete record.
fn record_counter(record: &[u8]) -> u64 {
    let mut counter_bytes = &record[RECORD_LEN_SIZE..RECORD_LEN_SIZE + RECORD_COUNTER_SIZE];
    counter_bytes.get_u64_le()
}

/// Total record size declared by the header at the start of `buf`.
fn record_len(buf: &[u8]) -> Result<Option<usize>, CryptoError> {
    if buf.len() < RECORD_LEN_SIZE {
        return Ok(None);
    }
    let body_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if body_len < MIN_RECORD_BODY {
        return Err(CryptoError::MalformedRecord);
    }
    Ok(Some(RECORD_LEN_SIZE + body_len))
}
