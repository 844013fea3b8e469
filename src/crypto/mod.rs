//! sockstun - Security Layer
//!
//! Implements the per-connection cipher machinery:
//! - Secret and IV handling, HKDF-SHA256 key derivation
//! - XChaCha20-Poly1305 AEAD
//! - Direction-separated nonce construction
//! - Anti-replay window
//! - Self-framing encrypt/decrypt sinks and the rebindable [`StreamCipherPair`]

mod aead;
mod keys;
mod nonce;
mod pair;
mod replay;
mod stream;

pub use aead::*;
pub use keys::*;
pub use nonce::*;
pub use pair::*;
pub use replay::*;
pub use stream::*;
