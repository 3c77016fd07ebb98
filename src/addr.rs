//! Address family tagging and integer arithmetic over IP addresses.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

/// IP address family of a pool or lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddrFamily {
    V4,
    V6,
}

impl AddrFamily {
    pub fn of(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }
}

impl fmt::Display for AddrFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::V4 => "ipv4",
            Self::V6 => "ipv6",
        })
    }
}

pub fn to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// Inverse of [`to_u128`]. `None` when a V4 value does not fit in 32 bits.
pub fn from_u128(family: AddrFamily, value: u128) -> Option<IpAddr> {
    match family {
        AddrFamily::V4 => u32::try_from(value)
            .ok()
            .map(|v| IpAddr::V4(Ipv4Addr::from(v))),
        AddrFamily::V6 => Some(IpAddr::V6(Ipv6Addr::from(value))),
    }
}

/// Number of addresses in the inclusive range, or `None` when the range is
/// inverted or mixes families.
pub fn range_len(start: IpAddr, end: IpAddr) -> Option<u128> {
    if AddrFamily::of(start) != AddrFamily::of(end) {
        return None;
    }
    let (start, end) = (to_u128(start), to_u128(end));
    (start <= end).then(|| (end - start).saturating_add(1))
}
