//! Protocol constants.
//!
//! These values are fixed by the wire format and MUST NOT be changed
//! without breaking compatibility between client and server.

use std::time::Duration;

// =============================================================================
// CRYPTOGRAPHIC CONSTANTS
// =============================================================================

/// Length of the per-connection initialization vector.
pub const IV_LEN: usize = 16;

/// Poly1305 authentication tag size.
pub const AEAD_TAG_SIZE: usize = 16;

/// XChaCha20 nonce size.
pub const AEAD_NONCE_SIZE: usize = 24;

/// Derived stream key size.
pub const STREAM_KEY_SIZE: usize = 32;

/// HKDF info label for stream keys.
pub const STREAM_KEY_INFO: &[u8] = b"sockstun stream key";

/// Nonce direction: client -> server.
pub const NONCE_DIR_CLIENT: u8 = 0x00;

/// Nonce direction: server -> client.
pub const NONCE_DIR_SERVER: u8 = 0x01;

/// Minimum replay window size in bits.
pub const REPLAY_WINDOW_SIZE: usize = 2048;

// =============================================================================
// RECORD SIZES (encrypted layer)
// =============================================================================

/// Record length prefix (2 bytes, big-endian).
pub const RECORD_LEN_SIZE: usize = 2;

/// Record counter (8 bytes, little-endian).
pub const RECORD_COUNTER_SIZE: usize = 8;

/// Random nonce salt drawn per encrypt sink and carried in every record.
pub const RECORD_SALT_SIZE: usize = 15;

/// Record header size (length + counter + salt), also the AAD.
pub const RECORD_HEADER_SIZE: usize = RECORD_LEN_SIZE + RECORD_COUNTER_SIZE + RECORD_SALT_SIZE;

/// Smallest legal record body (counter + salt + tag).
pub const MIN_RECORD_BODY: usize = RECORD_COUNTER_SIZE + RECORD_SALT_SIZE + AEAD_TAG_SIZE;

/// Largest plaintext that fits into one record.
pub const MAX_RECORD_PLAINTEXT: usize = u16::MAX as usize - MIN_RECORD_BODY;

// =============================================================================
// FRAME SIZES (plaintext layer)
// =============================================================================

/// Frame length field size.
pub const FRAME_LEN_SIZE: usize = 2;

/// ATYP + port: the fixed-width part of a frame not counted by the length field.
pub const FRAME_FIXED_OVERHEAD: usize = FRAME_LEN_SIZE + 1 + 2;

/// Smallest frame header accepted for IV bootstrap (length + ATYP + IPv4 + port).
pub const MIN_FRAME_HEADER_SIZE: usize = FRAME_LEN_SIZE + 1 + 4 + 2;

/// Read size for inbound transport and relay sockets.
pub const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Receive buffer for datagrams.
pub const DATAGRAM_BUFFER_SIZE: usize = 65535;

// =============================================================================
// ADDRESS TYPES (RFC 1928)
// =============================================================================

/// ATYP: IPv4 address.
pub const ATYP_IPV4: u8 = 0x01;

/// ATYP: fully-qualified domain name.
pub const ATYP_DOMAIN: u8 = 0x03;

/// ATYP: IPv6 address.
pub const ATYP_IPV6: u8 = 0x04;

// =============================================================================
// TIMING
// =============================================================================

/// Default bound on the SOCKS5 handshake phase.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on inactivity once streaming.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default timeout for outbound connects.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
