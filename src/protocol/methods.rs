use std::fmt;

/// Authentication method byte from the greeting.
///
/// The gateway always selects [`AuthMethod::NoAuthRequired`]. The offered list is only
/// parsed for logging.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum AuthMethod {
    NoAuthRequired,
    Gssapi,
    UsernamePassword,
    /// IANA assigned (0x03-0x7F) or private (0x80-0xFE) methods.
    Other(u8),
    NoAcceptableMethods,
}

impl AuthMethod {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => AuthMethod::NoAuthRequired,
            0x01 => AuthMethod::Gssapi,
            0x02 => AuthMethod::UsernamePassword,
            0xFF => AuthMethod::NoAcceptableMethods,
            other => AuthMethod::Other(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            AuthMethod::NoAuthRequired => 0x00,
            AuthMethod::Gssapi => 0x01,
            AuthMethod::UsernamePassword => 0x02,
            AuthMethod::Other(value) => value,
            AuthMethod::NoAcceptableMethods => 0xFF,
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::NoAuthRequired => f.write_str("no authentication"),
            AuthMethod::Gssapi => f.write_str("GSSAPI"),
            AuthMethod::UsernamePassword => f.write_str("username/password"),
            AuthMethod::Other(value) => write!(f, "method {:#04x}", value),
            AuthMethod::NoAcceptableMethods => f.write_str("no acceptable methods"),
        }
    }
}
