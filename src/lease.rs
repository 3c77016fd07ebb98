//! Leases and the in-memory lease tables.
//!
//! [`LeaseStore`] keeps two indexes per interface: hardware address (per
//! family) to lease, and IP address to hardware address. Every write goes
//! through [`LeaseStore::put`], which keeps them consistent:
//!
//! - one lease per (interface, family, hardware address)
//! - one hardware address per (interface, IP address)
//! - a static lease is never replaced by a dynamic one and never expires
//!
//! The store itself is not synchronized; [`LeaseDb`](crate::db::LeaseDb)
//! wraps it together with the address pools behind one lock.

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};

use crate::addr::AddrFamily;
use crate::error::{Error, Result};
use crate::hwaddr::HwAddr;

/// A binding between a hardware address and an IP address on one interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub interface: String,
    pub hw_addr: HwAddr,
    pub ip_address: IpAddr,
    /// Client-provided (Option 12) or configured hostname, sanitized.
    pub hostname: Option<String>,
    /// When the lease ends. `None` for static leases.
    pub expires_at: Option<DateTime<Utc>>,
    pub is_static: bool,
}

impl Lease {
    pub fn new_static(
        interface: impl Into<String>,
        hw_addr: HwAddr,
        ip_address: IpAddr,
        hostname: Option<String>,
    ) -> Self {
        Self {
            interface: interface.into(),
            hw_addr,
            ip_address,
            hostname,
            expires_at: None,
            is_static: true,
        }
    }

    pub fn new_dynamic(
        interface: impl Into<String>,
        hw_addr: HwAddr,
        ip_address: IpAddr,
        hostname: Option<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            interface: interface.into(),
            hw_addr,
            ip_address,
            hostname,
            expires_at: Some(expires_at),
            is_static: false,
        }
    }

    pub fn family(&self) -> AddrFamily {
        AddrFamily::of(self.ip_address)
    }

    /// Static leases never expire.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// Seconds left on a dynamic lease, clamped at zero. `None` for static leases.
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> Option<i64> {
        self.expires_at
            .map(|expires_at| (expires_at - now).num_seconds().max(0))
    }
}

#[derive(Debug, Default, Clone)]
struct InterfaceLeases {
    by_hw: HashMap<(AddrFamily, HwAddr), Lease>,
    by_ip: HashMap<IpAddr, HwAddr>,
}

/// In-memory lease tables, partitioned by interface.
#[derive(Debug, Default, Clone)]
pub struct LeaseStore {
    interfaces: HashMap<String, InterfaceLeases>,
}

impl LeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find_by_hw_addr(
        &self,
        interface: &str,
        family: AddrFamily,
        hw_addr: HwAddr,
    ) -> Option<&Lease> {
        self.interfaces
            .get(interface)
            .and_then(|table| table.by_hw.get(&(family, hw_addr)))
    }

    pub fn find_by_ip(&self, interface: &str, ip: IpAddr) -> Option<&Lease> {
        let table = self.interfaces.get(interface)?;
        let hw_addr = table.by_ip.get(&ip)?;
        table.by_hw.get(&(AddrFamily::of(ip), *hw_addr))
    }

    /// Looks `ip` up on every interface.
    pub fn find_by_ip_any(&self, ip: IpAddr) -> Option<&Lease> {
        let mut names: Vec<&String> = self.interfaces.keys().collect();
        names.sort();
        names
            .into_iter()
            .find_map(|interface| self.find_by_ip(interface, ip))
    }

    /// Finds an unexpired lease by hostname, ignoring ASCII case.
    pub fn find_by_hostname(&self, hostname: &str, now: DateTime<Utc>) -> Option<&Lease> {
        self.sorted()
            .into_iter()
            .find(|lease| {
                !lease.is_expired(now)
                    && lease
                        .hostname
                        .as_deref()
                        .is_some_and(|name| name.eq_ignore_ascii_case(hostname))
            })
    }

    /// Inserts or replaces the lease for its (interface, family, hardware address).
    ///
    /// Returns the lease it replaced.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LeaseConflict`] if the address is leased to another
    /// hardware address on the interface, if a dynamic lease would replace a
    /// static one, or if the expiry does not match the static flag.
    pub fn put(&mut self, lease: Lease) -> Result<Option<Lease>> {
        if lease.is_static == lease.expires_at.is_some() {
            return Err(Error::LeaseConflict(format!(
                "lease for {} must have an expiry exactly when it is dynamic",
                lease.hw_addr
            )));
        }

        let table = self.interfaces.entry(lease.interface.clone()).or_default();
        let key = (lease.family(), lease.hw_addr);

        if let Some(holder) = table.by_ip.get(&lease.ip_address)
            && *holder != lease.hw_addr
        {
            return Err(Error::LeaseConflict(format!(
                "{} is leased to {} on {}",
                lease.ip_address, holder, lease.interface
            )));
        }

        if let Some(existing) = table.by_hw.get(&key)
            && existing.is_static
            && !lease.is_static
        {
            return Err(Error::LeaseConflict(format!(
                "{} has a static lease on {}",
                lease.hw_addr, lease.interface
            )));
        }

        let ip = lease.ip_address;
        let previous = table.by_hw.insert(key, lease);
        if let Some(previous) = &previous
            && previous.ip_address != ip
        {
            table.by_ip.remove(&previous.ip_address);
        }
        table.by_ip.insert(ip, key.1);

        Ok(previous)
    }

    pub fn delete_by_hw_addr(
        &mut self,
        interface: &str,
        family: AddrFamily,
        hw_addr: HwAddr,
    ) -> Option<Lease> {
        let table = self.interfaces.get_mut(interface)?;
        let lease = table.by_hw.remove(&(family, hw_addr))?;
        table.by_ip.remove(&lease.ip_address);
        Some(lease)
    }

    pub fn delete_by_ip(&mut self, interface: &str, ip: IpAddr) -> Option<Lease> {
        let table = self.interfaces.get_mut(interface)?;
        let hw_addr = table.by_ip.remove(&ip)?;
        table.by_hw.remove(&(AddrFamily::of(ip), hw_addr))
    }

    /// Removes every dynamic lease whose expiry is at or before `now`.
    pub fn sweep_expired(&mut self, now: DateTime<Utc>) -> Vec<Lease> {
        self.remove_where(|lease| lease.is_expired(now))
    }

    /// Removes every dynamic lease, expired or not.
    pub fn remove_dynamic(&mut self) -> Vec<Lease> {
        self.remove_where(|lease| !lease.is_static)
    }

    fn remove_where(&mut self, predicate: impl Fn(&Lease) -> bool) -> Vec<Lease> {
        let mut removed = Vec::new();
        for table in self.interfaces.values_mut() {
            let keys: Vec<(AddrFamily, HwAddr)> = table
                .by_hw
                .iter()
                .filter(|(_, lease)| predicate(lease))
                .map(|(key, _)| *key)
                .collect();
            for key in keys {
                if let Some(lease) = table.by_hw.remove(&key) {
                    table.by_ip.remove(&lease.ip_address);
                    removed.push(lease);
                }
            }
        }
        removed.sort_by(|a, b| {
            (&a.interface, a.ip_address).cmp(&(&b.interface, b.ip_address))
        });
        removed
    }

    /// Returns the lowest-addressed expired dynamic lease on an interface.
    pub fn lowest_expired(
        &self,
        interface: &str,
        family: AddrFamily,
        now: DateTime<Utc>,
    ) -> Option<&Lease> {
        self.interfaces
            .get(interface)?
            .by_hw
            .values()
            .filter(|lease| lease.family() == family && lease.is_expired(now))
            .min_by_key(|lease| lease.ip_address)
    }

    /// All leases ordered by interface, then address.
    pub fn sorted(&self) -> Vec<&Lease> {
        let mut leases: Vec<&Lease> = self
            .interfaces
            .values()
            .flat_map(|table| table.by_hw.values())
            .collect();
        leases.sort_by(|a, b| {
            (&a.interface, a.ip_address).cmp(&(&b.interface, b.ip_address))
        });
        leases
    }

    pub fn len(&self) -> usize {
        self.interfaces.values().map(|table| table.by_hw.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn ip(text: &str) -> IpAddr {
        text.parse().unwrap()
    }

    fn mac(last: u8) -> HwAddr {
        HwAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, last])
    }

    fn dynamic(last: u8, addr: &str, expires_at: DateTime<Utc>) -> Lease {
        Lease::new_dynamic("br0", mac(last), ip(addr), None, expires_at)
    }

    #[test]
    fn test_put_and_find() {
        let now = Utc::now();
        let mut store = LeaseStore::new();
        let lease = dynamic(1, "192.168.0.100", now + TimeDelta::hours(1));
        assert!(store.put(lease.clone()).unwrap().is_none());

        assert_eq!(
            store.find_by_hw_addr("br0", AddrFamily::V4, mac(1)),
            Some(&lease)
        );
        assert_eq!(store.find_by_ip("br0", ip("192.168.0.100")), Some(&lease));
        assert_eq!(store.find_by_ip("wlan0", ip("192.168.0.100")), None);
        assert_eq!(store.find_by_hw_addr("br0", AddrFamily::V6, mac(1)), None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_ip_uniqueness() {
        let now = Utc::now();
        let mut store = LeaseStore::new();
        store
            .put(dynamic(1, "192.168.0.100", now + TimeDelta::hours(1)))
            .unwrap();

        let err = store
            .put(dynamic(2, "192.168.0.100", now + TimeDelta::hours(1)))
            .unwrap_err();
        assert!(matches!(err, Error::LeaseConflict(_)));

        let other_interface =
            Lease::new_dynamic("wlan0", mac(2), ip("192.168.0.100"), None, now);
        assert!(store.put(other_interface).is_ok());
    }

    #[test]
    fn test_moving_lease_frees_old_address() {
        let now = Utc::now();
        let mut store = LeaseStore::new();
        store
            .put(dynamic(1, "192.168.0.100", now + TimeDelta::hours(1)))
            .unwrap();
        let previous = store
            .put(dynamic(1, "192.168.0.101", now + TimeDelta::hours(1)))
            .unwrap();

        assert_eq!(previous.unwrap().ip_address, ip("192.168.0.100"));
        assert!(store.find_by_ip("br0", ip("192.168.0.100")).is_none());
        assert!(
            store
                .put(dynamic(2, "192.168.0.100", now + TimeDelta::hours(1)))
                .is_ok()
        );
    }

    #[test]
    fn test_static_not_replaced_by_dynamic() {
        let now = Utc::now();
        let mut store = LeaseStore::new();
        store
            .put(Lease::new_static("br0", mac(1), ip("192.168.0.50"), None))
            .unwrap();
        assert!(
            store
                .put(dynamic(1, "192.168.0.100", now + TimeDelta::hours(1)))
                .is_err()
        );
        assert!(
            store
                .put(Lease::new_static(
                    "br0",
                    mac(1),
                    ip("192.168.0.51"),
                    Some("nas".to_string())
                ))
                .is_ok()
        );
    }

    #[test]
    fn test_expiry_must_match_static_flag() {
        let now = Utc::now();
        let mut store = LeaseStore::new();
        let mut lease = dynamic(1, "192.168.0.100", now);
        lease.expires_at = None;
        assert!(store.put(lease).is_err());

        let mut lease = Lease::new_static("br0", mac(1), ip("192.168.0.50"), None);
        lease.expires_at = Some(now);
        assert!(store.put(lease).is_err());
    }

    #[test]
    fn test_delete() {
        let now = Utc::now();
        let mut store = LeaseStore::new();
        store
            .put(dynamic(1, "192.168.0.100", now + TimeDelta::hours(1)))
            .unwrap();
        store
            .put(dynamic(2, "192.168.0.101", now + TimeDelta::hours(1)))
            .unwrap();

        assert!(
            store
                .delete_by_hw_addr("br0", AddrFamily::V4, mac(1))
                .is_some()
        );
        assert!(store.find_by_ip("br0", ip("192.168.0.100")).is_none());
        assert!(
            store
                .delete_by_hw_addr("br0", AddrFamily::V4, mac(1))
                .is_none()
        );

        let removed = store.delete_by_ip("br0", ip("192.168.0.101")).unwrap();
        assert_eq!(removed.hw_addr, mac(2));
        assert!(store.is_empty());
    }

    #[test]
    fn test_sweep_spares_static_and_live() {
        let now = Utc::now();
        let mut store = LeaseStore::new();
        store
            .put(Lease::new_static("br0", mac(1), ip("192.168.0.50"), None))
            .unwrap();
        store.put(dynamic(2, "192.168.0.100", now)).unwrap();
        store
            .put(dynamic(3, "192.168.0.101", now - TimeDelta::seconds(1)))
            .unwrap();
        store
            .put(dynamic(4, "192.168.0.102", now + TimeDelta::seconds(1)))
            .unwrap();

        let removed = store.sweep_expired(now);
        let addresses: Vec<IpAddr> = removed.iter().map(|lease| lease.ip_address).collect();
        assert_eq!(addresses, vec![ip("192.168.0.100"), ip("192.168.0.101")]);
        assert_eq!(store.len(), 2);
        assert!(store.find_by_ip("br0", ip("192.168.0.50")).is_some());

        let far_future = now + TimeDelta::days(10_000);
        store.sweep_expired(far_future);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_lowest_expired() {
        let now = Utc::now();
        let mut store = LeaseStore::new();
        store
            .put(dynamic(1, "192.168.0.150", now - TimeDelta::seconds(5)))
            .unwrap();
        store
            .put(dynamic(2, "192.168.0.120", now - TimeDelta::seconds(1)))
            .unwrap();
        store
            .put(dynamic(3, "192.168.0.110", now + TimeDelta::hours(1)))
            .unwrap();

        let lease = store.lowest_expired("br0", AddrFamily::V4, now).unwrap();
        assert_eq!(lease.ip_address, ip("192.168.0.120"));
        assert!(store.lowest_expired("br0", AddrFamily::V6, now).is_none());
    }

    #[test]
    fn test_find_by_hostname() {
        let now = Utc::now();
        let mut store = LeaseStore::new();
        store
            .put(Lease::new_static(
                "br0",
                mac(1),
                ip("192.168.0.50"),
                Some("printer".to_string()),
            ))
            .unwrap();
        let mut stale = dynamic(2, "192.168.0.100", now - TimeDelta::seconds(1));
        stale.hostname = Some("laptop".to_string());
        store.put(stale).unwrap();

        assert_eq!(
            store.find_by_hostname("PRINTER", now).unwrap().ip_address,
            ip("192.168.0.50")
        );
        assert!(store.find_by_hostname("laptop", now).is_none());
    }

    #[test]
    fn test_remove_dynamic() {
        let now = Utc::now();
        let mut store = LeaseStore::new();
        store
            .put(Lease::new_static("br0", mac(1), ip("192.168.0.50"), None))
            .unwrap();
        store
            .put(dynamic(2, "192.168.0.100", now + TimeDelta::hours(1)))
            .unwrap();
        assert_eq!(store.remove_dynamic().len(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_lease_remaining_seconds() {
        let now = Utc::now();
        let lease = dynamic(1, "192.168.0.100", now + TimeDelta::minutes(30));
        assert_eq!(lease.remaining_seconds(now), Some(1800));
        assert!(!lease.is_expired(now));
        assert_eq!(lease.remaining_seconds(now + TimeDelta::hours(1)), Some(0));
        assert!(lease.is_expired(now + TimeDelta::minutes(30)));

        let fixed = Lease::new_static("br0", mac(1), ip("192.168.0.50"), None);
        assert_eq!(fixed.remaining_seconds(now), None);
        assert!(!fixed.is_expired(now + TimeDelta::days(10_000)));
    }
}
