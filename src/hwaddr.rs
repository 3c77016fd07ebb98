//! Ethernet hardware addresses.
//!
//! [`HwAddr`] is the client key throughout the lease store. It parses from
//! and prints as the usual colon-separated form and serializes as a string,
//! which keeps config and lease files readable.

use std::fmt::{self, Debug, Display};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// A 48-bit Ethernet hardware address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct HwAddr {
    addr: [u8; 6],
}

/// The all-ones broadcast address.
pub const BROADCAST: HwAddr = HwAddr::new([0xff; 6]);

impl HwAddr {
    pub const fn new(addr: [u8; 6]) -> Self {
        Self { addr }
    }

    /// Builds an address from the first six bytes of a DHCP `chaddr` field.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHwAddr`] if fewer than six bytes are given.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let addr: [u8; 6] = bytes
            .get(..6)
            .and_then(|head| head.try_into().ok())
            .ok_or_else(|| Error::InvalidHwAddr(format!("{} bytes", bytes.len())))?;
        Ok(Self { addr })
    }

    pub const fn octets(&self) -> [u8; 6] {
        self.addr
    }

    pub fn is_broadcast(&self) -> bool {
        self == &BROADCAST
    }

    pub const fn is_multicast(&self) -> bool {
        (self.addr[0] & 1) != 0
    }
}

impl Debug for HwAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.addr;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl Display for HwAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl FromStr for HwAddr {
    type Err = Error;

    /// Accepts `aa:bb:cc:dd:ee:ff` and `AA-BB-CC-DD-EE-FF`.
    fn from_str(s: &str) -> Result<Self> {
        let mut addr = [0u8; 6];
        let mut parts = s.trim().split([':', '-']);
        for byte in &mut addr {
            let part = parts
                .next()
                .filter(|part| part.len() == 2)
                .ok_or_else(|| Error::InvalidHwAddr(s.to_string()))?;
            *byte =
                u8::from_str_radix(part, 16).map_err(|_| Error::InvalidHwAddr(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(Error::InvalidHwAddr(s.to_string()));
        }
        Ok(Self { addr })
    }
}

impl From<[u8; 6]> for HwAddr {
    fn from(addr: [u8; 6]) -> Self {
        Self::new(addr)
    }
}

impl Serialize for HwAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HwAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_colon_and_dash_forms() {
        let colon: HwAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        let dash: HwAddr = "AA-BB-CC-DD-EE-FF".parse().unwrap();
        assert_eq!(colon, dash);
        assert_eq!(colon.octets(), [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("aa:bb:cc:dd:ee".parse::<HwAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:ff:00".parse::<HwAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:zz".parse::<HwAddr>().is_err());
        assert!("aabbccddeeff".parse::<HwAddr>().is_err());
        assert!("a:bb:cc:dd:ee:ff".parse::<HwAddr>().is_err());
    }

    #[test]
    fn test_display_is_lowercase_colon() {
        let mac = HwAddr::new([0x00, 0x1A, 0x2B, 0x3C, 0x4D, 0x5E]);
        assert_eq!(mac.to_string(), "00:1a:2b:3c:4d:5e");
    }

    #[test]
    fn test_from_slice_uses_first_six_bytes() {
        let chaddr = [1, 2, 3, 4, 5, 6, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            HwAddr::from_slice(&chaddr).unwrap(),
            HwAddr::new([1, 2, 3, 4, 5, 6])
        );
        assert!(HwAddr::from_slice(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let mac = HwAddr::new([0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]);
        let json = serde_json::to_string(&mac).unwrap();
        assert_eq!(json, "\"de:ad:be:ef:00:01\"");
        let back: HwAddr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mac);
    }

    #[test]
    fn test_broadcast() {
        assert!(BROADCAST.is_broadcast());
        assert!(BROADCAST.is_multicast());
        assert!(!HwAddr::new([0, 1, 2, 3, 4, 5]).is_broadcast());
    }
}
