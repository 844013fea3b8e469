//! Nonce construction for XChaCha20-Poly1305
//!
//! Nonces are 24 bytes:
//! - Direction (1 byte): 0x00 = client→server, 0x01 = server→client
//! - Salt (15 bytes): random per encrypt sink, carried in each record
//! - Counter (8 bytes, LE)
//!
//! Every connection starts on the same secret-only key, so the salt is what
//! keeps nonces unique across connections. The direction byte keeps the two
//! directions of one connection apart.

use rand::{rngs::OsRng, RngCore};

use crate::core::{AEAD_NONCE_SIZE, NONCE_DIR_CLIENT, NONCE_DIR_SERVER, RECORD_SALT_SIZE};

/// Random nonce salt of one encrypt sink.
pub type NonceSalt = [u8; RECORD_SALT_SIZE];

/// Draw a fresh salt from the OS RNG.
pub fn generate_salt() -> NonceSalt {
    let mut salt = [0u8; RECORD_SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Direction of travel for nonce construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Client → server (0x00)
    ClientToServer,
    /// Server → client (0x01)
    ServerToClient,
}

impl Direction {
    /// Get the byte representation.
    pub fn as_byte(self) -> u8 {
        match self {
            Direction::ClientToServer => NONCE_DIR_CLIENT,
            Direction::ServerToClient => NONCE_DIR_SERVER,
        }
    }

    /// Get the opposite direction.
    pub fn opposite(self) -> Self {
        match self {
            Direction::ClientToServer => Direction::ServerToClient,
            Direction::ServerToClient => Direction::ClientToServer,
        }
    }
}

/// Construct a 24-byte XChaCha20-Poly1305 nonce.
///
/// Layout:
/// ```text
/// [ direction (1) | salt (15) | counter (8) ]
/// ```
pub fn construct_nonce(
    direction: Direction,
    salt: &NonceSalt,
    counter: u64,
) -> [u8; AEAD_NONCE_SIZE] {
    let mut nonce = [0u8; AEAD_NONCE_SIZE];
    nonce[0] = direction.as_byte();
    nonce[1..16].copy_from_slice(salt);
    nonce[16..24].copy_from_slice(&counter.to_le_bytes());
    nonce
}
