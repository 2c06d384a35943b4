use crate::codec::{CodecError, Decoded};
use crate::protocol::AddressType;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// TargetAddr is a SOCKS5 address as it appears on the wire: an IP socket
/// address or an unresolved domain name with a port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

/// TargetAddr implementation block
impl TargetAddr {
    /// address_type returns the ATYP byte for this address
    pub fn address_type(&self) -> AddressType {
        match self {
            TargetAddr::Ip(SocketAddr::V4(_)) => AddressType::IPv4,
            TargetAddr::Ip(SocketAddr::V6(_)) => AddressType::IPv6,
            TargetAddr::Domain(..) => AddressType::DomainName,
        }
    }

    /// as_ipv4 returns the address when it is an IPv4 socket address
    pub fn as_ipv4(&self) -> Option<SocketAddrV4> {
        match self {
            TargetAddr::Ip(SocketAddr::V4(addr)) => Some(*addr),
            _ => None,
        }
    }

    /// write_ipv4 appends ATYP, DST.ADDR and DST.PORT to buf. Requests only
    /// carry IPv4 destinations, anything else is refused without touching buf
    pub fn write_ipv4(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        let addr = self
            .as_ipv4()
            .ok_or(CodecError::AddressTypeNotSupported(self.address_type() as u8))?;

        buf.push(AddressType::IPv4 as u8);
        buf.extend_from_slice(&addr.ip().octets());
        buf.extend_from_slice(&addr.port().to_be_bytes());
        Ok(())
    }
}

impl From<SocketAddrV4> for TargetAddr {
    fn from(addr: SocketAddrV4) -> Self {
        TargetAddr::Ip(SocketAddr::V4(addr))
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{addr}"),
            TargetAddr::Domain(domain, port) => write!(f, "{domain}:{port}"),
        }
    }
}

/// parse_address parses ATYP, address and port starting at *offset. All three
/// address types are framed so that the caller knows where the message ends;
/// the offset only moves when a complete address was read
pub fn parse_address(data: &[u8], offset: &mut usize) -> Result<Decoded<TargetAddr>, CodecError> {
    // Need at least the ATYP byte
    let Some(&atyp) = data.get(*offset) else {
        return Ok(Decoded::Incomplete { needed: 1 });
    };

    match AddressType::from_byte(atyp) {
        Some(AddressType::IPv4) => parse_ipv4_address(data, offset),
        Some(AddressType::DomainName) => parse_domain_address(data, offset),
        Some(AddressType::IPv6) => parse_ipv6_address(data, offset),
        None => Err(CodecError::AddressTypeNotSupported(atyp)),
    }
}

/// parse_ipv4_address parses an IPv4 address and port, *offset pointing at ATYP
pub fn parse_ipv4_address(
    data: &[u8],
    offset: &mut usize,
) -> Result<Decoded<TargetAddr>, CodecError> {
    // ATYP + 4 address bytes + 2 port bytes
    let start = *offset;
    if let Some(incomplete) = Decoded::require(data, start + 7) {
        return Ok(incomplete);
    }

    let octets: [u8; 4] = data[start + 1..start + 5]
        .try_into()
        .map_err(|_| CodecError::Malformed("IPv4 address"))?;
    let port = u16::from_be_bytes([data[start + 5], data[start + 6]]);

    *offset = start + 7;

    Ok(Decoded::Complete {
        message: TargetAddr::Ip(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(octets), port))),
        consumed: 7,
    })
}

/// parse_ipv6_address parses an IPv6 address and port, *offset pointing at ATYP
pub fn parse_ipv6_address(
    data: &[u8],
    offset: &mut usize,
) -> Result<Decoded<TargetAddr>, CodecError> {
    // ATYP + 16 address bytes + 2 port bytes
    let start = *offset;
    if let Some(incomplete) = Decoded::require(data, start + 19) {
        return Ok(incomplete);
    }

    let octets: [u8; 16] = data[start + 1..start + 17]
        .try_into()
        .map_err(|_| CodecError::Malformed("IPv6 address"))?;
    let port = u16::from_be_bytes([data[start + 17], data[start + 18]]);

    *offset = start + 19;

    Ok(Decoded::Complete {
        message: TargetAddr::Ip(SocketAddr::V6(SocketAddrV6::new(
            Ipv6Addr::from(octets),
            port,
            0,
            0,
        ))),
        consumed: 19,
    })
}

/// parse_domain_address parses a length-prefixed domain and port, *offset
/// pointing at ATYP. The domain is kept as-is, never resolved
pub fn parse_domain_address(
    data: &[u8],
    offset: &mut usize,
) -> Result<Decoded<TargetAddr>, CodecError> {
    let start = *offset;

    // ATYP + length octet
    if let Some(incomplete) = Decoded::require(data, start + 2) {
        return Ok(incomplete);
    }

    let domain_len = data[start + 1] as usize;
    if domain_len == 0 {
        return Err(CodecError::Malformed("empty domain name"));
    }

    let total = 2 + domain_len + 2;
    if let Some(incomplete) = Decoded::require(data, start + total) {
        return Ok(incomplete);
    }

    let domain = std::str::from_utf8(&data[start + 2..start + 2 + domain_len])
        .map_err(|_| CodecError::Malformed("domain name"))?
        .to_string();
    let port_at = start + 2 + domain_len;
    let port = u16::from_be_bytes([data[port_at], data[port_at + 1]]);

    *offset = start + total;

    Ok(Decoded::Complete {
        message: TargetAddr::Domain(domain, port),
        consumed: total,
    })
}
