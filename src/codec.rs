//! Wire codec for the SOCKS5 handshake.
//!
//! Every message has an `encode` that appends to a caller-owned buffer and a
//! `decode` that parses from the front of a byte slice. Decoders never
//! conflate truncation with corruption: a message still arriving in pieces is
//! [`Decoded::Incomplete`], a protocol violation is a [`CodecError`].

use crate::address::{TargetAddr, parse_address};
use crate::protocol::{
    AddressType, AuthMethod, Command, MAX_CREDENTIAL_LEN, RSV, ReplyCode, USERPASS_VERSION,
    Version,
};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use thiserror::Error;

/// Decoded is the outcome of a decode attempt that did not violate the protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded<T> {
    /// A full message and the number of bytes it occupied
    Complete { message: T, consumed: usize },
    /// At least `needed` more bytes must arrive before decoding can finish
    Incomplete { needed: usize },
}

/// Decoded implementation block
impl<T> Decoded<T> {
    /// require returns Incomplete when data is shorter than total
    pub(crate) fn require(data: &[u8], total: usize) -> Option<Self> {
        (data.len() < total).then(|| Decoded::Incomplete {
            needed: total - data.len(),
        })
    }
}

/// CodecError is a fatal protocol violation found while decoding or encoding
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("not SOCKS5: version byte {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("invalid username/password sub-negotiation version {0:#04x}")]
    UnsupportedAuthVersion(u8),

    #[error("greeting carries no authentication methods")]
    NoMethods,

    #[error("command {0:#04x} not supported")]
    CommandNotSupported(u8),

    #[error("address type {0:#04x} not supported")]
    AddressTypeNotSupported(u8),

    #[error("{field} is {len} bytes, at most 255 allowed")]
    FieldTooLong { field: &'static str, len: usize },

    #[error("malformed {0}")]
    Malformed(&'static str),
}

/// CodecError implementation block
impl CodecError {
    /// reply_code maps a request decode failure to the REP a server sends back
    pub fn reply_code(&self) -> ReplyCode {
        match self {
            CodecError::CommandNotSupported(_) => ReplyCode::CommandNotSupported,
            CodecError::AddressTypeNotSupported(_) => ReplyCode::AddrTypeUnsupported,
            _ => ReplyCode::ServerFailure,
        }
    }
}

/// check_version fails unless byte is the SOCKS5 version
fn check_version(byte: u8) -> Result<(), CodecError> {
    if byte != Version::SOCKS5 as u8 {
        return Err(CodecError::UnsupportedVersion(byte));
    }
    Ok(())
}

/// push_field appends a one-byte length prefix followed by the field bytes
fn push_field(buf: &mut Vec<u8>, field: &'static str, bytes: &[u8]) -> Result<(), CodecError> {
    let len = u8::try_from(bytes.len()).map_err(|_| CodecError::FieldTooLong {
        field,
        len: bytes.len(),
    })?;
    buf.push(len);
    buf.extend_from_slice(bytes);
    Ok(())
}

// ==========
// GREETING
// ==========

/// Greeting is the client hello
///
/// ```text
/// +----+----------+----------+
/// |VER | NMETHODS | METHODS  |
/// +----+----------+----------+
/// | 1  |    1     | 1 to 255 |
/// +----+----------+----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub methods: Vec<u8>,
}

/// Greeting implementation block
impl Greeting {
    /// for_credentials advertises no-auth alone, or no-auth and
    /// username/password when credentials are configured
    pub fn for_credentials(has_credentials: bool) -> Self {
        let methods = if has_credentials {
            vec![AuthMethod::NoAuth as u8, AuthMethod::UserPass as u8]
        } else {
            vec![AuthMethod::NoAuth as u8]
        };
        Self { methods }
    }

    /// encode appends the greeting to buf
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        if self.methods.is_empty() {
            return Err(CodecError::NoMethods);
        }
        buf.push(Version::SOCKS5 as u8);
        push_field(buf, "method list", &self.methods)
    }

    /// decode parses a greeting from the front of data
    pub fn decode(data: &[u8]) -> Result<Decoded<Self>, CodecError> {
        if let Some(incomplete) = Decoded::require(data, 2) {
            return Ok(incomplete);
        }
        check_version(data[0])?;

        let n_methods = data[1] as usize;
        if n_methods == 0 {
            return Err(CodecError::NoMethods);
        }

        let total = 2 + n_methods;
        if let Some(incomplete) = Decoded::require(data, total) {
            return Ok(incomplete);
        }

        Ok(Decoded::Complete {
            message: Self {
                methods: data[2..total].to_vec(),
            },
            consumed: total,
        })
    }
}

/// MethodSelection is the server's pick from the greeting
///
/// ```text
/// +----+--------+
/// |VER | METHOD |
/// +----+--------+
/// | 1  |   1    |
/// +----+--------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSelection {
    pub method: u8,
}

/// MethodSelection implementation block
impl MethodSelection {
    /// encode appends the method selection to buf
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&[Version::SOCKS5 as u8, self.method]);
    }

    /// decode parses a method selection from the front of data
    pub fn decode(data: &[u8]) -> Result<Decoded<Self>, CodecError> {
        if let Some(incomplete) = Decoded::require(data, 2) {
            return Ok(incomplete);
        }
        check_version(data[0])?;

        Ok(Decoded::Complete {
            message: Self { method: data[1] },
            consumed: 2,
        })
    }
}

// =========================
// USERNAME/PASSWORD (1929)
// =========================

/// UserPassRequest carries the client's credentials
///
/// ```text
/// +----+------+----------+------+----------+
/// |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
/// +----+------+----------+------+----------+
/// | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
/// +----+------+----------+------+----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPassRequest {
    pub username: Vec<u8>,
    pub password: Vec<u8>,
}

/// UserPassRequest implementation block
impl UserPassRequest {
    /// encode appends the request to buf, refusing fields over 255 bytes
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        if self.username.len() > MAX_CREDENTIAL_LEN {
            return Err(CodecError::FieldTooLong {
                field: "username",
                len: self.username.len(),
            });
        }
        if self.password.len() > MAX_CREDENTIAL_LEN {
            return Err(CodecError::FieldTooLong {
                field: "password",
                len: self.password.len(),
            });
        }

        buf.push(USERPASS_VERSION);
        push_field(buf, "username", &self.username)?;
        push_field(buf, "password", &self.password)
    }

    /// decode parses the request, checking both length prefixes against the
    /// bytes actually present
    pub fn decode(data: &[u8]) -> Result<Decoded<Self>, CodecError> {
        if let Some(incomplete) = Decoded::require(data, 2) {
            return Ok(incomplete);
        }
        if data[0] != USERPASS_VERSION {
            return Err(CodecError::UnsupportedAuthVersion(data[0]));
        }

        // VER + ULEN + UNAME + PLEN
        let ulen = data[1] as usize;
        if let Some(incomplete) = Decoded::require(data, 2 + ulen + 1) {
            return Ok(incomplete);
        }

        let plen = data[2 + ulen] as usize;
        let total = 2 + ulen + 1 + plen;
        if let Some(incomplete) = Decoded::require(data, total) {
            return Ok(incomplete);
        }

        Ok(Decoded::Complete {
            message: Self {
                username: data[2..2 + ulen].to_vec(),
                password: data[3 + ulen..total].to_vec(),
            },
            consumed: total,
        })
    }
}

/// UserPassResponse is the server's verdict on the credentials
///
/// ```text
/// +----+--------+
/// |VER | STATUS |
/// +----+--------+
/// | 1  |   1    |
/// +----+--------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserPassResponse {
    pub status: u8,
}

/// UserPassResponse implementation block
impl UserPassResponse {
    /// encode appends the response to buf
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&[USERPASS_VERSION, self.status]);
    }

    /// decode parses the response from the front of data
    pub fn decode(data: &[u8]) -> Result<Decoded<Self>, CodecError> {
        if let Some(incomplete) = Decoded::require(data, 2) {
            return Ok(incomplete);
        }
        if data[0] != USERPASS_VERSION {
            return Err(CodecError::UnsupportedAuthVersion(data[0]));
        }

        Ok(Decoded::Complete {
            message: Self { status: data[1] },
            consumed: 2,
        })
    }
}

// =========
// CONNECT
// =========

/// ConnectRequest asks the server to open a TCP connection to destination
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub destination: TargetAddr,
}

/// ConnectRequest implementation block
impl ConnectRequest {
    /// encode appends a CONNECT request; only IPv4 destinations are encodable
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        let start = buf.len();
        buf.extend_from_slice(&[Version::SOCKS5 as u8, Command::Connect as u8, RSV]);

        if let Err(e) = self.destination.write_ipv4(buf) {
            buf.truncate(start);
            return Err(e);
        }
        Ok(())
    }

    /// decode parses a CONNECT request. The command is checked before the
    /// address type, and domain/IPv6 destinations are refused as soon as the
    /// ATYP byte is visible, without reading or resolving the address
    pub fn decode(data: &[u8]) -> Result<Decoded<Self>, CodecError> {
        if let Some(incomplete) = Decoded::require(data, 4) {
            return Ok(incomplete);
        }
        check_version(data[0])?;

        match Command::from_byte(data[1]) {
            Some(Command::Connect) => (),
            _ => return Err(CodecError::CommandNotSupported(data[1])),
        }

        // Not checking RSV (RESERVED) -> 0x00
        let atyp = data[3];
        if atyp != AddressType::IPv4 as u8 {
            return Err(CodecError::AddressTypeNotSupported(atyp));
        }

        let mut offset = 3;
        match parse_address(data, &mut offset)? {
            Decoded::Complete { message, .. } => Ok(Decoded::Complete {
                message: Self {
                    destination: message,
                },
                consumed: offset,
            }),
            Decoded::Incomplete { needed } => Ok(Decoded::Incomplete { needed }),
        }
    }
}

/// ConnectResponse is the server's reply to a request
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    pub reply: u8,
    pub bound: TargetAddr,
}

/// ConnectResponse implementation block
impl ConnectResponse {
    /// new builds a response with an unspecified 0.0.0.0:0 bound address
    pub fn new(reply: ReplyCode) -> Self {
        Self {
            reply: reply as u8,
            bound: TargetAddr::Ip(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))),
        }
    }

    /// reply_code returns the REP field when it is an assigned code
    pub fn reply_code(&self) -> Option<ReplyCode> {
        ReplyCode::from_byte(self.reply)
    }

    /// encode appends the response to buf
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        let start = buf.len();
        buf.extend_from_slice(&[Version::SOCKS5 as u8, self.reply, RSV]);

        if let Err(e) = self.bound.write_ipv4(buf) {
            buf.truncate(start);
            return Err(e);
        }
        Ok(())
    }

    /// decode_header reads VER and REP, letting a client act on a failure
    /// code before the bound address has arrived
    pub fn decode_header(data: &[u8]) -> Result<Option<u8>, CodecError> {
        if data.len() < 2 {
            return Ok(None);
        }
        check_version(data[0])?;
        Ok(Some(data[1]))
    }

    /// decode parses a full response. Bound addresses of any type are framed
    /// so that trailing payload can be found
    pub fn decode(data: &[u8]) -> Result<Decoded<Self>, CodecError> {
        if let Some(incomplete) = Decoded::require(data, 4) {
            return Ok(incomplete);
        }
        check_version(data[0])?;
        let reply = data[1];

        let mut offset = 3;
        match parse_address(data, &mut offset)? {
            Decoded::Complete { message, .. } => Ok(Decoded::Complete {
                message: Self {
                    reply,
                    bound: message,
                },
                consumed: offset,
            }),
            Decoded::Incomplete { needed } => Ok(Decoded::Incomplete { needed }),
        }
    }
}
