//! SOCKS5 handshake messages (RFC 1928 §3, §4, §6).

use crate::core::Address;

use super::{
    CMD_BIND, CMD_CONNECT, CMD_UDP_ASSOCIATE, METHOD_NO_ACCEPTABLE, METHOD_NO_AUTH, SOCKS_VERSION,
};

/// Requested command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// TCP CONNECT.
    Connect,
    /// BIND (never served).
    Bind,
    /// UDP ASSOCIATE.
    UdpAssociate,
    /// Anything else.
    Unknown(u8),
}

impl Command {
    /// Parse command from its byte.
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            CMD_CONNECT => Self::Connect,
            CMD_BIND => Self::Bind,
            CMD_UDP_ASSOCIATE => Self::UdpAssociate,
            other => Self::Unknown(other),
        }
    }

    /// Convert command to its byte.
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Connect => CMD_CONNECT,
            Self::Bind => CMD_BIND,
            Self::UdpAssociate => CMD_UDP_ASSOCIATE,
            Self::Unknown(byte) => byte,
        }
    }
}

/// Method-selection message sent first by the application.
///
/// ```text
/// +-----+----------+----------+
/// | VER | NMETHODS | METHODS  |
/// +-----+----------+----------+
/// |  1  |    1     | 1 to 255 |
/// +-----+----------+----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identify {
    /// Offered authentication methods.
    pub methods: Vec<u8>,
}

impl Identify {
    /// Recognize an identify message filling exactly `buf`.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        match buf {
            [SOCKS_VERSION, n, methods @ ..] if *n > 0 && methods.len() == *n as usize => {
                Some(Self {
                    methods: methods.to_vec(),
                })
            }
            _ => None,
        }
    }

    /// Method to answer with: no-auth when offered, otherwise none acceptable.
    pub fn select_method(&self) -> u8 {
        if self.methods.contains(&METHOD_NO_AUTH) {
            METHOD_NO_AUTH
        } else {
            METHOD_NO_ACCEPTABLE
        }
    }
}

/// Connection request.
///
/// ```text
/// +-----+-----+-------+------+----------+----------+
/// | VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +-----+-----+-------+------+----------+----------+
/// |  1  |  1  | X'00' |  1   | Variable |    2     |
/// +-----+-----+-------+------+----------+----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Requested command.
    pub command: Command,
    /// Requested destination.
    pub address: Address,
}

impl Request {
    /// Recognize a request filling exactly `buf`.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let [SOCKS_VERSION, cmd, 0x00, rest @ ..] = buf else {
            return None;
        };
        let (address, consumed) = Address::decode(rest).ok()?;
        if consumed != rest.len() {
            return None;
        }
        Some(Self {
            command: Command::from_byte(*cmd),
            address,
        })
    }

    /// Encode this request.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![SOCKS_VERSION, self.command.as_byte(), 0x00];
        self.address.write_to(&mut buf);
        buf
    }
}

/// A recognized handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Method selection.
    Identify(Identify),
    /// Connection request.
    Request(Request),
}

/// Recognize a handshake message; identify is tried first.
pub fn parse(buf: &[u8]) -> Option<Message> {
    if let Some(identify) = Identify::parse(buf) {
        return Some(Message::Identify(identify));
    }
    Request::parse(buf).map(Message::Request)
}

/// Build the method-selection answer `[VER, METHOD]`.
pub fn build_select(method: u8) -> Vec<u8> {
    vec![SOCKS_VERSION, method]
}

/// Build a reply with an unspecified IPv4 bound address.
pub fn build_reply(code: u8) -> Vec<u8> {
    vec![SOCKS_VERSION, code, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::socks5::{REPLY_COMMAND_NOT_SUPPORTED, REPLY_SUCCEEDED};

    #[test]
    fn test_identify() {
        let Some(Message::Identify(identify)) = parse(&[0x05, 0x02, 0x00, 0x02]) else {
            panic!("identify not recognized");
        };
        assert_eq!(identify.methods, vec![0x00, 0x02]);
        assert_eq!(identify.select_method(), METHOD_NO_AUTH);

        let gssapi_only = Identify::parse(&[0x05, 0x01, 0x01]).unwrap();
        assert_eq!(gssapi_only.select_method(), METHOD_NO_ACCEPTABLE);
    }

    #[test]
    fn test_identify_rejects_bad_lengths() {
        assert!(Identify::parse(&[0x05, 0x00]).is_none());
        assert!(Identify::parse(&[0x05, 0x02, 0x00]).is_none());
        assert!(Identify::parse(&[0x04, 0x01, 0x00]).is_none());
        assert!(Identify::parse(&[]).is_none());
    }

    #[test]
    fn test_connect_request_ipv4() {
        let buf = hex::decode("050100015db8d8220050").unwrap();
        let Some(Message::Request(request)) = parse(&buf) else {
            panic!("request not recognized");
        };
        assert_eq!(request.command, Command::Connect);
        assert_eq!(
            request.address,
            Address::from(SocketAddr::from(([93, 184, 216, 34], 80)))
        );
        assert_eq!(request.to_bytes(), buf);
    }

    #[test]
    fn test_request_domain_and_udp() {
        let request = Request {
            command: Command::UdpAssociate,
            address: Address::domain("example.com", 53).unwrap(),
        };
        assert_eq!(parse(&request.to_bytes()), Some(Message::Request(request)));
    }

    #[test]
    fn test_request_rejects_trailing_and_truncated() {
        let mut buf = hex::decode("050100015db8d8220050").unwrap();
        assert!(Request::parse(&buf[..buf.len() - 1]).is_none());
        buf.push(0);
        assert!(Request::parse(&buf).is_none());
    }

    #[test]
    fn test_unknown_command_is_still_a_request() {
        let request = Request::parse(&hex::decode("050900017f0000010050").unwrap()).unwrap();
        assert_eq!(request.command, Command::Unknown(0x09));
    }

    #[test]
    fn test_unrecognized_buffer() {
        assert_eq!(parse(b"GET / HTTP/1.1\r\n"), None);
    }

    #[test]
    fn test_build_messages() {
        assert_eq!(build_select(METHOD_NO_AUTH), vec![0x05, 0x00]);
        assert_eq!(build_reply(REPLY_SUCCEEDED)[..2], [0x05, 0x00]);
        assert_eq!(build_reply(REPLY_COMMAND_NOT_SUPPORTED).len(), 10);
        assert_eq!(build_reply(REPLY_COMMAND_NOT_SUPPORTED)[1], 0x07);
    }
}
