use std::{fmt, io};

/// Status byte of a SOCKS5 reply (RFC 1928 section 6).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Success = 0x00,
    GeneralFailure = 0x01,
    ConnectionNotAllowedByRuleset = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TTLExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

const REPLIES: [Reply; 9] = [
    Reply::Success,
    Reply::GeneralFailure,
    Reply::ConnectionNotAllowedByRuleset,
    Reply::NetworkUnreachable,
    Reply::HostUnreachable,
    Reply::ConnectionRefused,
    Reply::TTLExpired,
    Reply::CommandNotSupported,
    Reply::AddressTypeNotSupported,
];

impl Reply {
    pub fn from_u8(value: u8) -> Option<Self> {
        REPLIES.get(value as usize).copied()
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Reply::Success => "succeeded",
            Reply::GeneralFailure => "general SOCKS server failure",
            Reply::ConnectionNotAllowedByRuleset => "connection not allowed by ruleset",
            Reply::NetworkUnreachable => "network unreachable",
            Reply::HostUnreachable => "host unreachable",
            Reply::ConnectionRefused => "connection refused",
            Reply::TTLExpired => "TTL expired",
            Reply::CommandNotSupported => "command not supported",
            Reply::AddressTypeNotSupported => "address type not supported",
        })
    }
}

impl std::error::Error for Reply {}

/// Status for a failed dial. Kinds without a SOCKS5 counterpart are general failures.
impl From<io::ErrorKind> for Reply {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::PermissionDenied => Reply::ConnectionNotAllowedByRuleset,
            io::ErrorKind::ConnectionRefused => Reply::ConnectionRefused,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::TimedOut => Reply::TTLExpired,
            io::ErrorKind::NotConnected => Reply::NetworkUnreachable,
            io::ErrorKind::NotFound | io::ErrorKind::AddrNotAvailable => Reply::HostUnreachable,
            io::ErrorKind::Unsupported => Reply::CommandNotSupported,
            _ => Reply::GeneralFailure,
        }
    }
}
