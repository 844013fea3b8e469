//! Shared secret, per-connection IV, and stream key derivation.

use std::fmt;

use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::core::{CryptoError, IV_LEN, STREAM_KEY_INFO, STREAM_KEY_SIZE};

/// The pre-shared tunnel secret.
///
/// Zeroized on drop; never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Secret(Vec<u8>);

impl Secret {
    /// Wrap secret bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Raw secret bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether the secret is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([REDACTED])")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value.as_bytes().to_vec())
    }
}

/// Per-connection initialization vector.
///
/// Generated once by the client, carried in-band on the first frame, then
/// immutable for the life of the connection.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Iv([u8; IV_LEN]);

impl Iv {
    /// Generate a fresh random IV.
    pub fn generate() -> Self {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);
        Self(iv)
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; IV_LEN]) -> Self {
        Self(bytes)
    }

    /// Create from a slice of exactly `IV_LEN` bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; IV_LEN] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; IV_LEN] {
        &self.0
    }
}

impl AsRef<[u8]> for Iv {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Iv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Iv(")?;
        for b in &self.0[..4] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "...)")
    }
}

/// A derived 32-byte AEAD key.
///
/// Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct StreamKey([u8; STREAM_KEY_SIZE]);

impl StreamKey {
    /// Create from raw bytes.
    pub fn from_bytes(key: [u8; STREAM_KEY_SIZE]) -> Self {
        Self(key)
    }

    /// Derive the key for `secret`, optionally salted with a connection IV.
    ///
    /// `HKDF-SHA256(salt = iv, ikm = secret, info = "sockstun stream key")`.
    pub fn derive(secret: &Secret, iv: Option<&Iv>) -> Result<Self, CryptoError> {
        let hk = Hkdf::<Sha256>::new(iv.map(|iv| iv.as_ref()), secret.as_bytes());
        let mut okm = [0u8; STREAM_KEY_SIZE];
        hk.expand(STREAM_KEY_INFO, &mut okm)
            .map_err(|_| CryptoError::KeyDerivationFailed)?;
        Ok(Self(okm))
    }

    /// Get the raw key bytes.
    ///
    /// # Security
    /// Handle with care - this exposes sensitive key material.
    pub fn as_bytes(&self) -> &[u8; STREAM_KEY_SIZE] {
        &self.0
    }
}
