use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6},
};

use tokio::io::AsyncRead;

use crate::framed::read_full;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    Ipv4 = 0x01,
    DomainName = 0x03,
    Ipv6 = 0x04,
}

impl AddressType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(AddressType::Ipv4),
            0x03 => Some(AddressType::DomainName),
            0x04 => Some(AddressType::Ipv6),
            _ => None,
        }
    }

    pub fn to_u8(&self) -> u8 {
        *self as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addr {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

impl Addr {
    pub fn addr_type(&self) -> AddressType {
        match self {
            Addr::Ipv4(_) => AddressType::Ipv4,
            Addr::Ipv6(_) => AddressType::Ipv6,
            Addr::Domain(_) => AddressType::DomainName,
        }
    }
}

/// Destination (or bound) address as carried on the wire: ATYP + ADDR + PORT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksSocketAddr {
    pub port: u16,
    pub addr: Addr,
}

impl Default for SocksSocketAddr {
    /// `0.0.0.0:0`, the placeholder bound address sent with every reply.
    fn default() -> Self {
        SocksSocketAddr {
            port: 0,
            addr: Addr::Ipv4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

impl SocksSocketAddr {
    /// Reads ADDR + PORT for an address type byte that has already been consumed.
    pub async fn read<R>(reader: &mut R, address_type: u8) -> crate::Result<Self>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let address_type = AddressType::from_u8(address_type)
            .ok_or(crate::Error::UnsupportedAddressType(address_type))?;

        let mut buf = [0u8; u8::MAX as usize];
        let addr = match address_type {
            AddressType::Ipv4 => {
                let octets = read_full(reader, &mut buf, 4)
                    .await
                    .map_err(crate::Error::from_read)?;
                let octets: [u8; 4] = [octets[0], octets[1], octets[2], octets[3]];
                Addr::Ipv4(Ipv4Addr::from(octets))
            }
            AddressType::Ipv6 => {
                let octets = read_full(reader, &mut buf, 16)
                    .await
                    .map_err(crate::Error::from_read)?;
                let mut segments = [0u8; 16];
                segments.copy_from_slice(octets);
                Addr::Ipv6(Ipv6Addr::from(segments))
            }
            AddressType::DomainName => {
                let len = read_full(reader, &mut buf, 1)
                    .await
                    .map_err(crate::Error::from_read)?[0] as usize;
                let domain = read_full(reader, &mut buf, len)
                    .await
                    .map_err(crate::Error::from_read)?;
                Addr::Domain(String::from_utf8_lossy(domain).into_owned())
            }
        };

        let port = read_full(reader, &mut buf, 2)
            .await
            .map_err(crate::Error::from_read)?;
        let port = u16::from_be_bytes([port[0], port[1]]);

        Ok(SocksSocketAddr { port, addr })
    }

    /// Turns `Self` into: AddrType+ADDR+PORT
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(18);

        bytes.push(self.addr.addr_type().to_u8());

        match &self.addr {
            Addr::Ipv4(addr) => bytes.extend_from_slice(&addr.octets()[..]),
            Addr::Ipv6(addr) => bytes.extend_from_slice(&addr.octets()[..]),
            Addr::Domain(domain) => {
                let domain = &domain.as_bytes()[..domain.len().min(u8::MAX as usize)];
                bytes.push(domain.len() as u8);
                bytes.extend_from_slice(domain)
            }
        }
        bytes.extend_from_slice(&self.port.to_be_bytes());

        bytes
    }
}

/// Renders the destination key used for routing and dialing. IPv6 literals are
/// bracketed so the key stays dialable.
impl fmt::Display for SocksSocketAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.addr {
            Addr::Ipv4(addr) => write!(f, "{}", SocketAddrV4::new(*addr, self.port)),
            Addr::Ipv6(addr) => write!(f, "{}", SocketAddrV6::new(*addr, self.port, 0, 0)),
            Addr::Domain(domain) => write!(f, "{}:{}", domain, self.port),
        }
    }
}
