//! SOCKS5 UDP request envelope (RFC 1928 §7).
//!
//! ```text
//! +-----+------+------+----------+----------+----------+
//! | RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
//! +-----+------+------+----------+----------+----------+
//! |  2  |  1   |  1   | Variable |    2     | Variable |
//! +-----+------+------+----------+----------+----------+
//! ```
//! Fragment reassembly is not supported: any `FRAG` other than zero is
//! rejected like any other malformed envelope.

use crate::core::Address;

use super::Socks5Error;

const UDP_HEADER_PREFIX: usize = 3;

/// A parsed UDP envelope borrowing its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpEnvelope<'a> {
    /// Embedded destination (or source, on replies).
    pub address: Address,
    /// Datagram body.
    pub data: &'a [u8],
}

impl<'a> UdpEnvelope<'a> {
    /// Unwrap an envelope.
    pub fn parse(buf: &'a [u8]) -> Result<Self, Socks5Error> {
        let [rsv0, rsv1, frag, rest @ ..] = buf else {
            return Err(Socks5Error::Truncated {
                expected: UDP_HEADER_PREFIX,
                actual: buf.len(),
            });
        };
        if *rsv0 != 0 || *rsv1 != 0 {
            return Err(Socks5Error::Reserved);
        }
        if *frag != 0 {
            return Err(Socks5Error::Fragmented(*frag));
        }

        let (address, consumed) = Address::decode(rest)?;
        Ok(Self {
            address,
            data: &rest[consumed..],
        })
    }

    /// Wrap `data` for delivery to the application.
    pub fn encode(address: &Address, data: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(UDP_HEADER_PREFIX + address.encoded_len() + data.len());
        buf.extend_from_slice(&[0, 0, 0]);
        address.write_to(&mut buf);
        buf.extend_from_slice(data);
        buf
    }
}
