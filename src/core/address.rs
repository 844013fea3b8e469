//! Destination addresses as carried by SOCKS5 requests and tunnel frames.
//!
//! Wire format (RFC 1928 §5), shared by both encodings:
//! ```text
//! +------+----------+----------+
//! | ATYP | DST.ADDR | DST.PORT |
//! +------+----------+----------+
//! |  1   | Variable |    2     |
//! +------+----------+----------+
//! ```
//! `DST.ADDR` is 4 bytes (IPv4), 16 bytes (IPv6), or a length byte followed
//! by the name (domain).

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use super::constants::{ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};
use super::error::AddressError;

/// A domain name that fits the one-byte SOCKS5 length prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DomainName(String);

impl DomainName {
    /// Validate and wrap a domain name.
    pub fn new(name: impl Into<String>) -> Result<Self, AddressError> {
        let name = name.into();
        if name.is_empty() {
            return Err(AddressError::InvalidDomain);
        }
        if name.len() > u8::MAX as usize {
            return Err(AddressError::DomainTooLong(name.len()));
        }
        Ok(Self(name))
    }

    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Host part of an [`Address`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    /// IPv4 literal.
    Ipv4(Ipv4Addr),
    /// IPv6 literal.
    Ipv6(Ipv6Addr),
    /// Domain name, resolved by whoever connects.
    Domain(DomainName),
}

/// An immutable destination: host plus port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    host: Host,
    port: u16,
}

impl Address {
    /// Create an address from host and port.
    pub fn new(host: Host, port: u16) -> Self {
        Self { host, port }
    }

    /// Create a domain-name address.
    pub fn domain(name: impl Into<String>, port: u16) -> Result<Self, AddressError> {
        Ok(Self::new(Host::Domain(DomainName::new(name)?), port))
    }

    /// Get the host.
    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Get the port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// ATYP tag for this address.
    pub fn atyp(&self) -> u8 {
        match self.host {
            Host::Ipv4(_) => ATYP_IPV4,
            Host::Ipv6(_) => ATYP_IPV6,
            Host::Domain(_) => ATYP_DOMAIN,
        }
    }

    /// Length of the `DST.ADDR` field alone.
    pub fn host_len(&self) -> usize {
        match &self.host {
            Host::Ipv4(_) => 4,
            Host::Ipv6(_) => 16,
            Host::Domain(name) => 1 + name.as_str().len(),
        }
    }

    /// Length of the full `ATYP | DST.ADDR | DST.PORT` encoding.
    pub fn encoded_len(&self) -> usize {
        1 + self.host_len() + 2
    }

    /// Append `DST.ADDR` to `buf`.
    pub fn write_host(&self, buf: &mut Vec<u8>) {
        match &self.host {
            Host::Ipv4(ip) => buf.extend_from_slice(&ip.octets()),
            Host::Ipv6(ip) => buf.extend_from_slice(&ip.octets()),
            Host::Domain(name) => {
                // DomainName guarantees the length fits in a byte.
                buf.push(name.as_str().len() as u8);
                buf.extend_from_slice(name.as_str().as_bytes());
            }
        }
    }

    /// Append `ATYP | DST.ADDR | DST.PORT` to `buf`.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.atyp());
        self.write_host(buf);
        buf.extend_from_slice(&self.port.to_be_bytes());
    }

    /// Encode as `ATYP | DST.ADDR | DST.PORT`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.write_to(&mut buf);
        buf
    }

    /// Decode `ATYP | DST.ADDR | DST.PORT` from the start of `bytes`.
    ///
    /// Returns the address and the number of bytes consumed.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), AddressError> {
        let atyp = *bytes.first().ok_or(AddressError::TooShort {
            expected: 1,
            actual: 0,
        })?;

        let (host, host_len) = match atyp {
            ATYP_IPV4 => {
                let raw = take(bytes, 1, 4)?;
                (Host::Ipv4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3])), 4)
            }
            ATYP_IPV6 => {
                let raw = take(bytes, 1, 16)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(raw);
                (Host::Ipv6(Ipv6Addr::from(octets)), 16)
            }
            ATYP_DOMAIN => {
                let len = *take(bytes, 1, 1)?.first().ok_or(AddressError::InvalidDomain)? as usize;
                let raw = take(bytes, 2, len)?;
                let name = std::str::from_utf8(raw).map_err(|_| AddressError::InvalidDomain)?;
                (Host::Domain(DomainName::new(name)?), 1 + len)
            }
            other => return Err(AddressError::UnknownType(other)),
        };

        let port_at = 1 + host_len;
        let port = take(bytes, port_at, 2)?;
        let port = u16::from_be_bytes([port[0], port[1]]);

        Ok((Self { host, port }, port_at + 2))
    }

    /// Resolve to a socket address, performing DNS for domain names.
    pub async fn resolve(&self) -> io::Result<SocketAddr> {
        match &self.host {
            Host::Ipv4(ip) => Ok(SocketAddr::new(IpAddr::V4(*ip), self.port)),
            Host::Ipv6(ip) => Ok(SocketAddr::new(IpAddr::V6(*ip), self.port)),
            Host::Domain(name) => tokio::net::lookup_host((name.as_str(), self.port))
                .await?
                .next()
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("no addresses for {}", name.as_str()),
                    )
                }),
        }
    }
}

fn take(bytes: &[u8], at: usize, len: usize) -> Result<&[u8], AddressError> {
    bytes.get(at..at + len).ok_or(AddressError::TooShort {
        expected: at + len,
        actual: bytes.len(),
    })
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        let host = match addr.ip() {
            IpAddr::V4(ip) => Host::Ipv4(ip),
            IpAddr::V6(ip) => Host::Ipv6(ip),
        };
        Self::new(host, addr.port())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::Ipv4(ip) => write!(f, "{}:{}", ip, self.port),
            Host::Ipv6(ip) => write!(f, "[{}]:{}", ip, self.port),
            Host::Domain(name) => write!(f, "{}:{}", name.as_str(), self.port),
        }
    }
}
