//! Client key normalization.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::LimiterError;

/// The canonical identity of a client, used as the bucket key.
///
/// IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) collapse onto their IPv4
/// form, so a client cannot get a second bucket by switching notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientKey(IpAddr);

impl ClientKey {
    /// The canonical address behind this key.
    pub fn addr(&self) -> IpAddr {
        self.0
    }
}

impl From<IpAddr> for ClientKey {
    fn from(addr: IpAddr) -> Self {
        Self(addr.to_canonical())
    }
}

impl FromStr for ClientKey {
    type Err = LimiterError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        normalize(raw)
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parse a raw client identifier into its canonical key.
///
/// Accepts bare IPv4 and IPv6 literals only; ports, zone ids and
/// surrounding whitespace are rejected.
pub fn normalize(raw: &str) -> Result<ClientKey, LimiterError> {
    raw.parse::<IpAddr>()
        .map(ClientKey::from)
        .map_err(|_| LimiterError::InvalidKey(raw.to_string()))
}
