//! Per-connection encrypt/decrypt pair with mid-stream IV rotation.
//!
//! A pair starts keyed on the shared secret alone (or secret + IV when one
//! is already known) and is rebound exactly once per connection, right after
//! the IV-bearing bootstrap record has been sealed or opened.

use crate::core::{CryptoError, Role};

use super::{Decryptor, Direction, Encryptor, Iv, Secret, StreamKey};

/// Encrypt and decrypt sinks for one connection.
pub struct StreamCipherPair {
    secret: Secret,
    outbound: Direction,
    iv: Option<Iv>,
    encryptor: Encryptor,
    decryptor: Decryptor,
}

impl StreamCipherPair {
    /// Create both sinks for `role`, keyed on `secret` and optionally `iv`.
    pub fn create(secret: &Secret, role: Role, iv: Option<Iv>) -> Result<Self, CryptoError> {
        let outbound = match role {
            Role::Client => Direction::ClientToServer,
            Role::Server => Direction::ServerToClient,
        };
        let key = StreamKey::derive(secret, iv.as_ref())?;

        Ok(Self {
            secret: secret.clone(),
            outbound,
            iv,
            encryptor: Encryptor::new(&key, outbound),
            decryptor: Decryptor::new(&key, outbound.opposite()),
        })
    }

    /// The IV the sinks are currently keyed on.
    pub fn iv(&self) -> Option<&Iv> {
        self.iv.as_ref()
    }

    /// Seal one plaintext write into one record.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.encryptor.seal(plaintext)
    }

    /// Append inbound stream bytes to the decrypt sink.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.decryptor.feed(bytes);
    }

    /// Decrypt the next complete inbound record, if buffered.
    pub fn next_decrypted(&mut self) -> Result<Option<Vec<u8>>, CryptoError> {
        self.decryptor.next_plaintext()
    }

    /// Decrypt one self-contained datagram record.
    pub fn decrypt_datagram(&mut self, datagram: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.decryptor.open_datagram(datagram)
    }

    /// Replace both sinks with ones keyed on `iv`.
    ///
    /// Inbound bytes already buffered but not yet decrypted move to the new
    /// decrypt sink: they were written by the peer after its own rotation.
    pub fn rebind(&mut self, iv: Iv) -> Result<(), CryptoError> {
        let key = StreamKey::derive(&self.secret, Some(&iv))?;
        let pending = self.decryptor.take_pending();

        self.encryptor = Encryptor::new(&key, self.outbound);
        self.decryptor = Decryptor::new(&key, self.outbound.opposite());
        self.decryptor.feed(&pending);
        self.iv = Some(iv);
        Ok(())
    }
}
