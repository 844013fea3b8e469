//! Tunnel frame encoding and decoding.
//!
//! Every plaintext handed to the cipher is one frame:
//! ```text
//! +--------+------+----------+----------+---------+
//! | LEN    | ATYP | DST.ADDR | DST.PORT | DATA    |
//! | 2 (BE) | 1    | Variable | 2 (BE)   | LEN - A |
//! +--------+------+----------+----------+---------+
//! ```
//! `LEN` counts `DST.ADDR` (A bytes) and `DATA` only. ATYP and port are
//! fixed-width, so a frame occupies `LEN + 5` bytes in total.

use thiserror::Error;

use crate::core::{Address, AddressError, FRAME_FIXED_OVERHEAD, FRAME_LEN_SIZE, MIN_FRAME_HEADER_SIZE};

/// Frame encoding errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Frame is too short.
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum expected size.
        expected: usize,
        /// Actual size received.
        actual: usize,
    },

    /// Address field could not be decoded.
    #[error("bad frame address: {0}")]
    Address(#[from] AddressError),

    /// Length field smaller than the address it must cover.
    #[error("length field {len} smaller than address encoding {host_len}")]
    LengthUnderflow {
        /// Declared length.
        len: usize,
        /// Host encoding length.
        host_len: usize,
    },

    /// Address + payload do not fit the 16-bit length field.
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Destination (client to server) or source (server to client).
    pub address: Address,
    /// Application bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Decode the frame at the start of `bytes`; trailing bytes are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let len = read_length(bytes).ok_or(FrameError::TooShort {
            expected: FRAME_LEN_SIZE,
            actual: bytes.len(),
        })? as usize;

        let (address, consumed) = Address::decode(&bytes[FRAME_LEN_SIZE..])?;
        let host_len = address.host_len();
        if len < host_len {
            return Err(FrameError::LengthUnderflow { len, host_len });
        }

        let total = len + FRAME_FIXED_OVERHEAD;
        if bytes.len() < total {
            return Err(FrameError::TooShort {
                expected: total,
                actual: bytes.len(),
            });
        }

        let payload_at = FRAME_LEN_SIZE + consumed;
        Ok(Self {
            address,
            payload: bytes[payload_at..total].to_vec(),
        })
    }

    /// Encode this frame.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        pack(&self.address, &self.payload)
    }
}

/// Build `[LEN][ATYP][DST.ADDR][DST.PORT][payload]`.
pub fn pack(address: &Address, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let len = address.host_len() + payload.len();
    let len = u16::try_from(len).map_err(|_| FrameError::TooLarge(len))?;

    let mut buf = Vec::with_capacity(len as usize + FRAME_FIXED_OVERHEAD);
    buf.extend_from_slice(&len.to_be_bytes());
    address.write_to(&mut buf);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decode a frame, or `None` if it is truncated or malformed.
pub fn parse(bytes: &[u8]) -> Option<Frame> {
    Frame::decode(bytes).ok()
}

/// Read the raw length field in place.
pub fn read_length(bytes: &[u8]) -> Option<u16> {
    match bytes {
        [hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}

/// Overwrite the raw length field in place.
///
/// Returns `false` if `bytes` cannot hold a length field.
pub fn write_length(bytes: &mut [u8], len: u16) -> bool {
    match bytes.get_mut(..FRAME_LEN_SIZE) {
        Some(field) => {
            field.copy_from_slice(&len.to_be_bytes());
            true
        }
        None => false,
    }
}

/// Whether `bytes` is long enough to hold a trailing IV behind a frame header.
pub fn can_carry_iv(bytes: &[u8], iv_len: usize) -> bool {
    bytes.len() >= iv_len + MIN_FRAME_HEADER_SIZE
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

    use super::*;
    use crate::core::{Host, IV_LEN};

    fn target() -> Address {
        Address::from(SocketAddr::from(([93, 184, 216, 34], 80)))
    }

    #[test]
    fn test_pack_ipv4_layout() {
        let frame = pack(&target(), b"GET /").unwrap();

        assert_eq!(hex::encode(&frame[..9]), "0009015db8d8220050");
        assert_eq!(&frame[9..], b"GET /");
        assert_eq!(read_length(&frame), Some(9));
    }

    #[test]
    fn test_bootstrap_and_steady_lengths() {
        let mut first = b"GET /".to_vec();
        first.extend_from_slice(&[0xAA; IV_LEN]);

        let bootstrap = pack(&target(), &first).unwrap();
        assert_eq!(read_length(&bootstrap), Some(25));

        let steady = pack(&target(), b"more").unwrap();
        assert_eq!(read_length(&steady), Some(8));
    }

    #[test]
    fn test_round_trip_each_address_type() {
        let addresses = [
            target(),
            Address::new(Host::Ipv6(Ipv6Addr::LOCALHOST), 443),
            Address::domain("example.com", 8080).unwrap(),
        ];
        for address in addresses {
            for payload in [&b""[..], b"x", &[7u8; 300][..]] {
                let frame = parse(&pack(&address, payload).unwrap()).unwrap();
                assert_eq!(frame.address, address);
                assert_eq!(frame.payload, payload);
            }
        }
    }

    #[test]
    fn test_domain_length_counts_name_prefix() {
        let address = Address::domain("example.com", 80).unwrap();
        let frame = pack(&address, b"hi").unwrap();
        assert_eq!(read_length(&frame), Some(1 + 11 + 2));
        assert_eq!(frame.len(), 14 + FRAME_FIXED_OVERHEAD);
    }

    #[test]
    fn test_parse_ignores_trailing_bytes() {
        let mut bytes = pack(&target(), b"abc").unwrap();
        bytes.extend_from_slice(b"junk");
        assert_eq!(parse(&bytes).unwrap().payload, b"abc");
    }

    #[test]
    fn test_parse_rejects_truncated() {
        let bytes = pack(&target(), b"abcdef").unwrap();
        assert!(parse(&bytes[..bytes.len() - 1]).is_none());
        assert!(parse(&bytes[..1]).is_none());
        assert!(parse(&[]).is_none());
    }

    #[test]
    fn test_parse_rejects_unknown_atyp() {
        let mut bytes = pack(&target(), b"abc").unwrap();
        bytes[2] = 0x09;
        assert_eq!(
            Frame::decode(&bytes),
            Err(FrameError::Address(AddressError::UnknownType(0x09)))
        );
    }

    #[test]
    fn test_parse_rejects_length_underflow() {
        let mut bytes = pack(&target(), b"").unwrap();
        write_length(&mut bytes, 3);
        assert_eq!(
            Frame::decode(&bytes),
            Err(FrameError::LengthUnderflow { len: 3, host_len: 4 })
        );
    }

    #[test]
    fn test_write_length_in_place() {
        let mut bytes = pack(&target(), b"GET /").unwrap();
        assert!(write_length(&mut bytes, 0x0102));
        assert_eq!(&bytes[..2], &[0x01, 0x02]);
        assert!(!write_length(&mut [0u8; 1], 1));
    }

    #[test]
    fn test_pack_too_large() {
        let address = Address::from(SocketAddr::from((Ipv4Addr::LOCALHOST, 1)));
        let payload = vec![0u8; u16::MAX as usize];
        assert_eq!(
            pack(&address, &payload),
            Err(FrameError::TooLarge(u16::MAX as usize + 4))
        );
    }

    #[test]
    fn test_can_carry_iv() {
        assert!(!can_carry_iv(&[0u8; IV_LEN + MIN_FRAME_HEADER_SIZE - 1], IV_LEN));
        assert!(can_carry_iv(&[0u8; IV_LEN + MIN_FRAME_HEADER_SIZE], IV_LEN));
    }
}
