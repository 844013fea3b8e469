//! Error types shared across sockstun layers.

use thiserror::Error;

/// Errors decoding an `ATYP | DST.ADDR | DST.PORT` field.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// Not enough bytes for the declared address type.
    #[error("address too short: expected {expected} bytes, got {actual}")]
    TooShort {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Unrecognized ATYP tag.
    #[error("unknown address type: 0x{0:02x}")]
    UnknownType(u8),

    /// Domain name empty or not valid UTF-8.
    #[error("invalid domain name")]
    InvalidDomain,

    /// Domain name longer than 255 bytes.
    #[error("domain name too long: {0} bytes")]
    DomainTooLong(usize),
}

/// Errors in the crypto layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// AEAD encryption failed.
    #[error("AEAD encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (invalid tag or corrupted).
    #[error("AEAD decryption failed (invalid tag or corrupted)")]
    DecryptionFailed,

    /// Replayed or too-old record counter.
    #[error("replay detected")]
    ReplayDetected,

    /// Stream record out of sequence (dropped, reordered or replayed).
    #[error("unexpected record counter: expected {expected}, got {actual}")]
    UnexpectedCounter {
        /// Next counter the stream should carry.
        expected: u64,
        /// Counter found in the record.
        actual: u64,
    },

    /// Key derivation failed.
    #[error("key derivation failed")]
    KeyDerivationFailed,

    /// Plaintext does not fit in one record.
    #[error("record too large: {0} bytes")]
    RecordTooLarge(usize),

    /// Record header is inconsistent with its body.
    #[error("malformed record")]
    MalformedRecord,

    /// Nonce counter exhausted - connection must terminate.
    #[error("nonce counter exhausted - connection must terminate")]
    CounterExhaustion,
}

/// Errors loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field failed validation.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// An address could not be parsed.
    #[error("invalid address {value:?}: {reason}")]
    Address {
        /// Offending input.
        value: String,
        /// Parser message.
        reason: String,
    },

    /// TOML parse failure.
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// I/O error reading the config file.
    #[error("config i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level sockstun errors.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Crypto error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Connection error.
    #[error("connection error: {0}")]
    Connection(#[from] crate::connection::ConnectionError),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
