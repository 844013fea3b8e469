//! XChaCha20-Poly1305 AEAD encryption
//!
//! Every tunnel record is sealed with XChaCha20-Poly1305. The AAD is the
//! 25-byte record header, so its length, counter and nonce salt cannot be
//! altered without failing authentication.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};

use crate::core::{CryptoError, AEAD_NONCE_SIZE, AEAD_TAG_SIZE};

use super::StreamKey;

/// A keyed AEAD instance.
///
/// Built once per key; the underlying cipher state is reused for every record.
pub struct Sealer {
    cipher: XChaCha20Poly1305,
}

impl Sealer {
    /// Key a new AEAD instance.
    pub fn new(key: &StreamKey) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(key.as_bytes().into()),
        }
    }

    /// Encrypt plaintext.
    ///
    /// # Returns
    /// Ciphertext with appended 16-byte Poly1305 tag
    pub fn seal(
        &self,
        nonce: &[u8; AEAD_NONCE_SIZE],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.cipher
            .encrypt(XNonce::from_slice(nonce), Payload { msg: plaintext, aad })
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Decrypt ciphertext.
    ///
    /// # Returns
    /// Decrypted plaintext, or error if authentication fails
    pub fn open(
        &self,
        nonce: &[u8; AEAD_NONCE_SIZE],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < AEAD_TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }

        self.cipher
            .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}
