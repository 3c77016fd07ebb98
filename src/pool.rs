//! Address pools.
//!
//! An [`AddressPool`] owns one contiguous range for one interface and
//! family and tracks which addresses in it are taken. Three kinds of
//! record can block an address:
//!
//! - a committed allocation (a lease, static or dynamic, lives on it)
//! - a tentative reservation made when the address was offered, which
//!   lapses on its own after the offer grace window
//! - a decline hold, which keeps a conflicting address out of allocation
//!   until it expires
//!
//! Allocation always scans upward from the range start, so identical
//! state yields the identical candidate.

use std::collections::BTreeMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};

use crate::addr::{self, AddrFamily};
use crate::config::MAX_RANGE_LEN;
use crate::error::{Error, Result};
use crate::hwaddr::HwAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Allocation {
    holder: HwAddr,
    /// `None` for committed allocations.
    tentative_until: Option<DateTime<Utc>>,
}

impl Allocation {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.tentative_until.is_none_or(|until| until > now)
    }
}

#[derive(Debug, Clone)]
pub struct AddressPool {
    family: AddrFamily,
    start: u128,
    end: u128,
    allocations: BTreeMap<u128, Allocation>,
    declined: BTreeMap<u128, DateTime<Utc>>,
}

impl AddressPool {
    /// Creates an empty pool over `start..=end`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the bounds mix families, are
    /// inverted, or span more than [`MAX_RANGE_LEN`] addresses.
    pub fn new(start: IpAddr, end: IpAddr) -> Result<Self> {
        let len = addr::range_len(start, end).ok_or_else(|| {
            Error::InvalidConfig(format!("invalid address range {}-{}", start, end))
        })?;
        if len > MAX_RANGE_LEN {
            return Err(Error::InvalidConfig(format!(
                "address range {}-{} is too large",
                start, end
            )));
        }

        Ok(Self {
            family: AddrFamily::of(start),
            start: addr::to_u128(start),
            end: addr::to_u128(end),
            allocations: BTreeMap::new(),
            declined: BTreeMap::new(),
        })
    }

    pub fn family(&self) -> AddrFamily {
        self.family
    }

    pub fn size(&self) -> u128 {
        self.end - self.start + 1
    }

    fn offset(&self, ip: IpAddr) -> Option<u128> {
        let value = addr::to_u128(ip);
        (AddrFamily::of(ip) == self.family && (self.start..=self.end).contains(&value))
            .then_some(value)
    }

    fn checked_offset(&self, ip: IpAddr) -> Result<u128> {
        self.offset(ip).ok_or(Error::AddressOutOfRange(ip))
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.offset(ip).is_some()
    }

    fn is_declined(&self, value: u128, now: DateTime<Utc>) -> bool {
        self.declined.get(&value).is_some_and(|until| *until > now)
    }

    fn live_holder(&self, value: u128, now: DateTime<Utc>) -> Option<HwAddr> {
        self.allocations
            .get(&value)
            .filter(|allocation| allocation.is_live(now))
            .map(|allocation| allocation.holder)
    }

    /// Returns the lowest address that is neither allocated, tentatively
    /// reserved, nor held after a decline. Does not mark it.
    pub fn allocate(&self, now: DateTime<Utc>) -> Option<IpAddr> {
        (self.start..=self.end)
            .find(|value| {
                self.live_holder(*value, now).is_none() && !self.is_declined(*value, now)
            })
            .and_then(|value| addr::from_u128(self.family, value))
    }

    /// Commits `ip` to `holder`.
    ///
    /// Turns a tentative reservation by the same holder into a committed
    /// allocation and lifts any decline hold on the address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AddressOutOfRange`] outside the range and
    /// [`Error::LeaseConflict`] if another holder has the address.
    pub fn reserve(&mut self, ip: IpAddr, holder: HwAddr, now: DateTime<Utc>) -> Result<()> {
        let value = self.checked_offset(ip)?;
        if let Some(current) = self.live_holder(value, now)
            && current != holder
        {
            return Err(Error::LeaseConflict(format!(
                "{} is allocated to {}",
                ip, current
            )));
        }

        self.declined.remove(&value);
        self.allocations.insert(
            value,
            Allocation {
                holder,
                tentative_until: None,
            },
        );
        Ok(())
    }

    /// Holds `ip` for `holder` until `until` while an offer is outstanding.
    ///
    /// A committed allocation for the same holder is left as is.
    ///
    /// # Errors
    ///
    /// Same as [`reserve`](Self::reserve), plus [`Error::LeaseConflict`]
    /// for an address under a decline hold.
    pub fn reserve_tentative(
        &mut self,
        ip: IpAddr,
        holder: HwAddr,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let value = self.checked_offset(ip)?;
        if self.is_declined(value, now) {
            return Err(Error::LeaseConflict(format!("{} is declined", ip)));
        }

        match self.allocations.get(&value) {
            Some(current) if current.is_live(now) && current.holder != holder => {
                Err(Error::LeaseConflict(format!(
                    "{} is allocated to {}",
                    ip, current.holder
                )))
            }
            Some(current) if current.is_live(now) && current.tentative_until.is_none() => Ok(()),
            _ => {
                self.allocations.insert(
                    value,
                    Allocation {
                        holder,
                        tentative_until: Some(until),
                    },
                );
                Ok(())
            }
        }
    }

    /// Frees `ip`. Returns false if nothing was recorded for it.
    pub fn release(&mut self, ip: IpAddr) -> bool {
        self.offset(ip)
            .is_some_and(|value| self.allocations.remove(&value).is_some())
    }

    /// Drops the tentative reservation held by `holder`, if any.
    pub fn release_tentative(&mut self, holder: HwAddr) -> Option<IpAddr> {
        let value = self
            .allocations
            .iter()
            .find(|(_, allocation)| {
                allocation.holder == holder && allocation.tentative_until.is_some()
            })
            .map(|(value, _)| *value)?;
        self.allocations.remove(&value);
        addr::from_u128(self.family, value)
    }

    /// Drops every tentative reservation.
    pub fn clear_tentative(&mut self) {
        self.allocations
            .retain(|_, allocation| allocation.tentative_until.is_none());
    }

    /// Keeps `ip` out of allocation until `until`, independent of any lease.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AddressOutOfRange`] outside the range.
    pub fn decline(&mut self, ip: IpAddr, until: DateTime<Utc>) -> Result<()> {
        let value = self.checked_offset(ip)?;
        self.allocations.remove(&value);
        self.declined.insert(value, until);
        Ok(())
    }

    /// Returns the live holder of `ip`, tentative or committed.
    pub fn holder(&self, ip: IpAddr, now: DateTime<Utc>) -> Option<HwAddr> {
        self.offset(ip)
            .and_then(|value| self.live_holder(value, now))
    }

    /// Returns the address tentatively reserved for `holder`, if still live.
    pub fn tentative_for(&self, holder: HwAddr, now: DateTime<Utc>) -> Option<IpAddr> {
        self.allocations
            .iter()
            .find(|(_, allocation)| {
                allocation.holder == holder
                    && allocation.tentative_until.is_some()
                    && allocation.is_live(now)
            })
            .and_then(|(value, _)| addr::from_u128(self.family, *value))
    }

    /// Returns true if `ip` is under an unexpired decline hold.
    pub fn is_held(&self, ip: IpAddr, now: DateTime<Utc>) -> bool {
        self.offset(ip)
            .is_some_and(|value| self.is_declined(value, now))
    }

    /// Drops lapsed tentative reservations and decline holds.
    ///
    /// Returns the number of records removed.
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.allocations.len() + self.declined.len();
        self.allocations.retain(|_, allocation| allocation.is_live(now));
        self.declined.retain(|_, until| *until > now);
        before - self.allocations.len() - self.declined.len()
    }

    /// Number of addresses with a live allocation, tentative or committed.
    pub fn allocated_count(&self, now: DateTime<Utc>) -> usize {
        self.allocations
            .values()
            .filter(|allocation| allocation.is_live(now))
            .count()
    }

    /// Number of addresses [`allocate`](Self::allocate) could still return.
    pub fn free_count(&self, now: DateTime<Utc>) -> u128 {
        (self.start..=self.end)
            .filter(|value| {
                self.live_holder(*value, now).is_none() && !self.is_declined(*value, now)
            })
            .count() as u128
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

    fn home_pool() -> AddressPool {
        AddressPool::new(ip("192.168.0.100"), ip("192.168.0.200")).unwrap()
    }

    #[test]
    fn test_new_rejects_bad_ranges() {
        assert!(AddressPool::new(ip("192.168.0.200"), ip("192.168.0.100")).is_err());
        assert!(AddressPool::new(ip("192.168.0.1"), ip("fd00::1")).is_err());
        assert!(AddressPool::new(ip("10.0.0.0"), ip("10.255.255.255")).is_err());
    }

    #[test]
    fn test_allocate_is_lowest_free() {
        let now = Utc::now();
        let mut pool = home_pool();
        assert_eq!(pool.size(), 101);
        assert_eq!(pool.allocate(now), Some(ip("192.168.0.100")));
        assert_eq!(pool.allocate(now), Some(ip("192.168.0.100")));

        pool.reserve(ip("192.168.0.100"), mac(1), now).unwrap();
        pool.reserve(ip("192.168.0.102"), mac(2), now).unwrap();
        assert_eq!(pool.allocate(now), Some(ip("192.168.0.101")));
    }

    #[test]
    fn test_reserve_out_of_range() {
        let now = Utc::now();
        let mut pool = home_pool();
        let err = pool.reserve(ip("192.168.0.50"), mac(1), now).unwrap_err();
        assert!(matches!(err, Error::AddressOutOfRange(_)));
        assert!(pool.reserve(ip("fd00::100"), mac(1), now).is_err());
    }

    #[test]
    fn test_reserve_conflict_and_same_holder() {
        let now = Utc::now();
        let mut pool = home_pool();
        pool.reserve(ip("192.168.0.150"), mac(1), now).unwrap();
        pool.reserve(ip("192.168.0.150"), mac(1), now).unwrap();

        let err = pool.reserve(ip("192.168.0.150"), mac(2), now).unwrap_err();
        assert!(matches!(err, Error::LeaseConflict(_)));
        assert_eq!(pool.holder(ip("192.168.0.150"), now), Some(mac(1)));
    }

    #[test]
    fn test_tentative_reservation_expires() {
        let now = Utc::now();
        let grace = now + TimeDelta::seconds(60);
        let mut pool = home_pool();

        pool.reserve_tentative(ip("192.168.0.100"), mac(1), grace, now)
            .unwrap();
        assert_eq!(pool.allocate(now), Some(ip("192.168.0.101")));
        assert_eq!(pool.tentative_for(mac(1), now), Some(ip("192.168.0.100")));
        assert!(
            pool.reserve_tentative(ip("192.168.0.100"), mac(2), grace, now)
                .is_err()
        );

        let later = now + TimeDelta::seconds(61);
        assert_eq!(pool.allocate(later), Some(ip("192.168.0.100")));
        assert_eq!(pool.tentative_for(mac(1), later), None);
        assert!(pool.reserve(ip("192.168.0.100"), mac(2), later).is_ok());
    }

    #[test]
    fn test_commit_tentative() {
        let now = Utc::now();
        let mut pool = home_pool();
        pool.reserve_tentative(ip("192.168.0.100"), mac(1), now + TimeDelta::seconds(60), now)
            .unwrap();
        pool.reserve(ip("192.168.0.100"), mac(1), now).unwrap();

        let much_later = now + TimeDelta::days(1);
        assert_eq!(pool.holder(ip("192.168.0.100"), much_later), Some(mac(1)));
        assert_eq!(pool.tentative_for(mac(1), now), None);
    }

    #[test]
    fn test_tentative_does_not_downgrade_commit() {
        let now = Utc::now();
        let mut pool = home_pool();
        pool.reserve(ip("192.168.0.100"), mac(1), now).unwrap();
        pool.reserve_tentative(ip("192.168.0.100"), mac(1), now + TimeDelta::seconds(1), now)
            .unwrap();
        assert_eq!(
            pool.holder(ip("192.168.0.100"), now + TimeDelta::seconds(5)),
            Some(mac(1))
        );
    }

    #[test]
    fn test_release() {
        let now = Utc::now();
        let mut pool = home_pool();
        pool.reserve(ip("192.168.0.100"), mac(1), now).unwrap();
        assert!(pool.release(ip("192.168.0.100")));
        assert!(!pool.release(ip("192.168.0.100")));
        assert!(!pool.release(ip("192.168.0.50")));
        assert_eq!(pool.allocated_count(now), 0);
    }

    #[test]
    fn test_release_tentative() {
        let now = Utc::now();
        let mut pool = home_pool();
        pool.reserve_tentative(ip("192.168.0.100"), mac(1), now + TimeDelta::seconds(60), now)
            .unwrap();
        pool.reserve(ip("192.168.0.101"), mac(1), now).unwrap();

        assert_eq!(pool.release_tentative(mac(1)), Some(ip("192.168.0.100")));
        assert_eq!(pool.release_tentative(mac(1)), None);
        assert_eq!(pool.holder(ip("192.168.0.101"), now), Some(mac(1)));
    }

    #[test]
    fn test_decline_hold() {
        let now = Utc::now();
        let mut pool = home_pool();
        pool.reserve(ip("192.168.0.100"), mac(1), now).unwrap();
        pool.decline(ip("192.168.0.100"), now + TimeDelta::hours(1))
            .unwrap();

        assert_eq!(pool.holder(ip("192.168.0.100"), now), None);
        assert!(pool.is_held(ip("192.168.0.100"), now));
        assert_eq!(pool.allocate(now), Some(ip("192.168.0.101")));
        assert!(
            pool.reserve_tentative(ip("192.168.0.100"), mac(2), now + TimeDelta::seconds(60), now)
                .is_err()
        );

        let later = now + TimeDelta::hours(1) + TimeDelta::seconds(1);
        assert_eq!(pool.allocate(later), Some(ip("192.168.0.100")));
    }

    #[test]
    fn test_exhaustion() {
        let now = Utc::now();
        let mut pool = AddressPool::new(ip("192.168.0.100"), ip("192.168.0.102")).unwrap();
        for last in 0..3u8 {
            let next = pool.allocate(now).unwrap();
            pool.reserve(next, mac(last), now).unwrap();
        }
        assert_eq!(pool.allocate(now), None);
        assert_eq!(pool.free_count(now), 0);
        assert_eq!(pool.allocated_count(now), 3);
    }

    #[test]
    fn test_purge_expired() {
        let now = Utc::now();
        let mut pool = home_pool();
        pool.reserve(ip("192.168.0.100"), mac(1), now).unwrap();
        pool.reserve_tentative(ip("192.168.0.101"), mac(2), now + TimeDelta::seconds(60), now)
            .unwrap();
        pool.decline(ip("192.168.0.102"), now + TimeDelta::seconds(30))
            .unwrap();

        assert_eq!(pool.purge_expired(now), 0);
        assert_eq!(pool.purge_expired(now + TimeDelta::seconds(120)), 2);
        assert_eq!(pool.allocated_count(now), 1);
        assert_eq!(pool.free_count(now), 100);
    }

    #[test]
    fn test_clear_tentative_keeps_commits() {
        let now = Utc::now();
        let mut pool = home_pool();
        pool.reserve(ip("192.168.0.100"), mac(1), now).unwrap();
        pool.reserve_tentative(ip("192.168.0.101"), mac(2), now + TimeDelta::seconds(60), now)
            .unwrap();
        pool.clear_tentative();
        assert_eq!(pool.allocated_count(now), 1);
    }

    #[test]
    fn test_ipv6_pool() {
        let now = Utc::now();
        let mut pool = AddressPool::new(ip("fd00::100"), ip("fd00::1ff")).unwrap();
        assert_eq!(pool.family(), AddrFamily::V6);
        assert_eq!(pool.size(), 256);
        assert_eq!(pool.allocate(now), Some(ip("fd00::100")));

        pool.reserve(ip("fd00::100"), mac(1), now).unwrap();
        assert_eq!(pool.allocate(now), Some(ip("fd00::101")));
        assert!(!pool.contains(ip("192.168.0.100")));
    }
}
