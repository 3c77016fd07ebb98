//! Durable lease database.
//!
//! [`LeaseDb`] owns the lease tables and every address pool of the service
//! behind one [`RwLock`], so an allocation decision sees the store and the
//! pool in the same state. Lookups take the read side; every mutation takes
//! the write side and marks the tables dirty.
//!
//! Persistence is a snapshot of the store written as a versioned JSON
//! document ([`LeaseFile`]). Writes go to `<file>.tmp` first and are renamed
//! over the real file, and a separate [`Mutex`] keeps one writer at a time.
//! A failed write leaves the tables dirty so the next persist retries.
//!
//! # Thread Safety
//!
//! All operations are thread-safe. The [`LeaseDb`] struct uses:
//! - [`RwLock`] for the tables (allows concurrent reads)
//! - [`Mutex`] for file writes (one snapshot on disk at a time)

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::addr::AddrFamily;
use crate::clock::Clock;
use crate::config::{ServerConfig, StaticLease, sanitize_hostname};
use crate::error::{Error, Result};
use crate::hwaddr::HwAddr;
use crate::lease::{Lease, LeaseStore};
use crate::pool::AddressPool;

/// Version written to and expected from the lease file.
pub const DATA_VERSION: u32 = 1;

/// One lease as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub interface: String,
    pub family: AddrFamily,
    pub mac: HwAddr,
    pub ip: IpAddr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Absent for static leases.
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
    #[serde(rename = "static", default)]
    pub is_static: bool,
}

impl From<&Lease> for LeaseRecord {
    fn from(lease: &Lease) -> Self {
        Self {
            interface: lease.interface.clone(),
            family: lease.family(),
            mac: lease.hw_addr,
            ip: lease.ip_address,
            hostname: lease.hostname.clone(),
            expires: lease.expires_at,
            is_static: lease.is_static,
        }
    }
}

impl TryFrom<LeaseRecord> for Lease {
    type Error = Error;

    fn try_from(record: LeaseRecord) -> Result<Self> {
        if record.interface.is_empty() {
            return Err(Error::LeaseConflict(format!(
                "record for {} has no interface",
                record.mac
            )));
        }
        if AddrFamily::of(record.ip) != record.family {
            return Err(Error::LeaseConflict(format!(
                "record for {} has family {} but address {}",
                record.mac, record.family, record.ip
            )));
        }

        let hostname = record.hostname.as_deref().map(sanitize_hostname);
        let hostname = hostname.filter(|name| !name.is_empty());

        match (record.is_static, record.expires) {
            (true, None) => Ok(Lease::new_static(
                record.interface,
                record.mac,
                record.ip,
                hostname,
            )),
            (false, Some(expires)) => Ok(Lease::new_dynamic(
                record.interface,
                record.mac,
                record.ip,
                hostname,
                expires,
            )),
            _ => Err(Error::LeaseConflict(format!(
                "record for {} has inconsistent expiry",
                record.mac
            ))),
        }
    }
}

/// The on-disk lease document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseFile {
    pub version: u32,
    pub leases: Vec<LeaseRecord>,
}

/// Same document with records left undecoded, so one bad record can be
/// skipped without losing the rest.
#[derive(Debug, Deserialize)]
struct RawLeaseFile {
    version: u32,
    #[serde(default)]
    leases: Vec<serde_json::Value>,
}

impl LeaseFile {
    pub fn from_leases<'a>(leases: impl IntoIterator<Item = &'a Lease>) -> Self {
        Self {
            version: DATA_VERSION,
            leases: leases.into_iter().map(LeaseRecord::from).collect(),
        }
    }

    /// Reads leases from `path`. A missing file reads as empty.
    ///
    /// Records that fail to decode or validate are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a lease
    /// document at all.
    pub async fn read(path: &Path) -> Result<Vec<Lease>> {
        let content = match tokio::fs::read(path).await {
            Ok(content) => content,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                debug!("No lease file at {}", path.display());
                return Ok(Vec::new());
            }
            Err(error) => return Err(error.into()),
        };

        let raw: RawLeaseFile = serde_json::from_slice(&content)?;
        if raw.version != DATA_VERSION {
            warn!(
                "Lease file {} has version {}, expected {}",
                path.display(),
                raw.version,
                DATA_VERSION
            );
        }

        let mut leases = Vec::with_capacity(raw.leases.len());
        for (index, value) in raw.leases.into_iter().enumerate() {
            let decoded = serde_json::from_value::<LeaseRecord>(value)
                .map_err(Error::from)
                .and_then(Lease::try_from);
            match decoded {
                Ok(lease) => leases.push(lease),
                Err(error) => warn!("Skipping lease record {}: {}", index, error),
            }
        }

        Ok(leases)
    }

    /// Writes the document to `<path>.tmp`, then renames it over `path`.
    pub async fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_vec_pretty(self)?;
        let tmp = tmp_path_next_to(path);
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

fn tmp_path_next_to(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Lease tables and address pools, guarded together by [`LeaseDb`].
#[derive(Debug, Default)]
pub struct Tables {
    pub(crate) store: LeaseStore,
    pub(crate) pools: HashMap<(String, AddrFamily), AddressPool>,
    pub(crate) dirty: bool,
}

impl Tables {
    pub fn store(&self) -> &LeaseStore {
        &self.store
    }

    pub fn pool(&self, interface: &str, family: AddrFamily) -> Option<&AddressPool> {
        self.pools.get(&(interface.to_string(), family))
    }

    pub(crate) fn pool_mut(
        &mut self,
        interface: &str,
        family: AddrFamily,
    ) -> Option<&mut AddressPool> {
        self.pools.get_mut(&(interface.to_string(), family))
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Gives the lease's address back to its pool, if the pool covers it.
    pub(crate) fn release_address(&mut self, lease: &Lease) {
        if let Some(pool) = self.pool_mut(&lease.interface, lease.family()) {
            pool.release(lease.ip_address);
        }
    }

    /// Deletes a lease and frees its address.
    pub(crate) fn remove_lease(
        &mut self,
        interface: &str,
        family: AddrFamily,
        hw_addr: HwAddr,
    ) -> Option<Lease> {
        let lease = self.store.delete_by_hw_addr(interface, family, hw_addr)?;
        self.release_address(&lease);
        self.dirty = true;
        Some(lease)
    }

    fn install_static(
        &mut self,
        interface: &str,
        lease: &StaticLease,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let family = AddrFamily::of(lease.ip_address);
        if !self.pools.contains_key(&(interface.to_string(), family)) {
            return Err(Error::InvalidConfig(format!(
                "interface {} does not serve {}",
                interface, family
            )));
        }

        self.check_static_target(interface, lease, now)?;

        if let Some(existing) = self.store.find_by_hw_addr(interface, family, lease.mac_address)
            && !existing.is_static
        {
            self.remove_lease(interface, family, lease.mac_address);
        }

        let in_range = match self.pool_mut(interface, family) {
            Some(pool) if pool.contains(lease.ip_address) => {
                pool.reserve(lease.ip_address, lease.mac_address, now)?;
                true
            }
            _ => false,
        };

        let hostname = lease
            .hostname
            .as_deref()
            .map(sanitize_hostname)
            .filter(|name| !name.is_empty());
        let fixed = Lease::new_static(interface, lease.mac_address, lease.ip_address, hostname);

        let previous = match self.store.put(fixed) {
            Ok(previous) => previous,
            Err(error) => {
                if in_range && let Some(pool) = self.pool_mut(interface, family) {
                    pool.release(lease.ip_address);
                }
                return Err(error);
            }
        };

        if let Some(previous) = previous
            && previous.ip_address != lease.ip_address
        {
            self.release_address(&previous);
        }

        self.dirty = true;
        Ok(())
    }

    /// Fails if the static address is held by anyone but `lease`'s hardware
    /// address, in the pool or in the store. Changes nothing.
    fn check_static_target(
        &self,
        interface: &str,
        lease: &StaticLease,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let (ip, hw_addr) = (lease.ip_address, lease.mac_address);

        let pool_holder = self
            .pool(interface, AddrFamily::of(ip))
            .and_then(|pool| pool.holder(ip, now));
        if let Some(holder) = pool_holder
            && holder != hw_addr
        {
            return Err(Error::LeaseConflict(format!(
                "{} is allocated to {}",
                ip, holder
            )));
        }

        if let Some(owner) = self.store.find_by_ip(interface, ip)
            && owner.hw_addr != hw_addr
        {
            return Err(Error::LeaseConflict(format!(
                "{} is leased to {} on {}",
                ip, owner.hw_addr, interface
            )));
        }

        Ok(())
    }

    fn restore_dynamic(&mut self, lease: Lease, now: DateTime<Utc>) -> Result<()> {
        let family = lease.family();
        if self
            .store
            .find_by_hw_addr(&lease.interface, family, lease.hw_addr)
            .is_some_and(|existing| existing.is_static)
        {
            return Err(Error::LeaseConflict(format!(
                "{} has a static lease on {}",
                lease.hw_addr, lease.interface
            )));
        }

        let Some(pool) = self.pool_mut(&lease.interface, family) else {
            return Err(Error::LeaseConflict(format!(
                "interface {} does not serve {}",
                lease.interface, family
            )));
        };
        if !pool.contains(lease.ip_address) {
            return Err(Error::AddressOutOfRange(lease.ip_address));
        }
        pool.reserve(lease.ip_address, lease.hw_addr, now)?;

        let ip = lease.ip_address;
        let interface = lease.interface.clone();
        if let Err(error) = self.store.put(lease) {
            if let Some(pool) = self.pool_mut(&interface, family) {
                pool.release(ip);
            }
            return Err(error);
        }
        Ok(())
    }
}

/// Thread-safe lease tables, address pools and their persistence.
#[derive(Debug)]
pub struct LeaseDb {
    tables: RwLock<Tables>,
    path: PathBuf,
    clock: Arc<dyn Clock>,
    save_lock: Mutex<()>,
}

impl LeaseDb {
    /// Builds pools and static leases from `config`, then restores
    /// unexpired dynamic leases from its lease file.
    ///
    /// An unreadable lease file is logged and treated as empty. Individual
    /// persisted leases that no longer fit the configuration are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] or [`Error::LeaseConflict`] when the
    /// configuration's pools or static leases cannot be installed.
    pub async fn open(config: &ServerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let now = clock.now();
        let mut tables = Tables::default();

        for (name, interface) in &config.interfaces {
            if let Some(v4) = interface.ipv4_enabled() {
                let pool = AddressPool::new(v4.range_start.into(), v4.range_end.into())?;
                tables.pools.insert((name.clone(), AddrFamily::V4), pool);
            }
            if let Some(v6) = interface.ipv6_enabled() {
                let pool = AddressPool::new(v6.range_start.into(), v6.range_end.into())?;
                tables.pools.insert((name.clone(), AddrFamily::V6), pool);
            }
            for lease in &interface.static_leases {
                tables.install_static(name, lease, now)?;
            }
        }

        let persisted = match LeaseFile::read(&config.leases_file).await {
            Ok(leases) => leases,
            Err(error) => {
                warn!(
                    "Ignoring unreadable lease file {}: {}",
                    config.leases_file.display(),
                    error
                );
                Vec::new()
            }
        };

        let mut restored = 0;
        for lease in persisted {
            if lease.is_static {
                continue;
            }
            if lease.is_expired(now) {
                debug!(
                    "Dropping expired lease {} for {} on {}",
                    lease.ip_address, lease.hw_addr, lease.interface
                );
                continue;
            }
            let (hw_addr, ip) = (lease.hw_addr, lease.ip_address);
            match tables.restore_dynamic(lease, now) {
                Ok(()) => restored += 1,
                Err(error) => warn!("Skipping persisted lease {} for {}: {}", ip, hw_addr, error),
            }
        }

        info!(
            "Lease database ready: {} leases ({} restored from {})",
            tables.store.len(),
            restored,
            config.leases_file.display()
        );

        tables.dirty = false;
        Ok(Self {
            tables: RwLock::new(tables),
            path: config.leases_file.clone(),
            clock,
            save_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Shared access to the tables.
    pub async fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().await
    }

    /// Exclusive access to the tables. Callers set `dirty` when they mutate.
    pub(crate) async fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().await
    }

    /// Writes a snapshot of the store to disk.
    ///
    /// # Errors
    ///
    /// Returns the I/O or serialization error. The tables stay dirty so a
    /// later call retries.
    pub async fn persist(&self) -> Result<()> {
        let _guard = self.save_lock.lock().await;

        let file = {
            let mut tables = self.tables.write().await;
            tables.dirty = false;
            LeaseFile::from_leases(tables.store.sorted())
        };

        if let Err(error) = file.write(&self.path).await {
            self.tables.write().await.dirty = true;
            return Err(error);
        }

        debug!("Saved {} leases to {}", file.leases.len(), self.path.display());
        Ok(())
    }

    /// Persists only if something changed since the last successful write.
    pub async fn persist_if_dirty(&self) -> Result<bool> {
        if !self.tables.read().await.dirty {
            return Ok(false);
        }
        self.persist().await.map(|()| true)
    }

    /// Removes expired dynamic leases, returns their addresses to the pools
    /// and drops lapsed offers and decline holds.
    ///
    /// Returns the number of leases removed.
    pub async fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut tables = self.tables.write().await;

        let removed = tables.store.sweep_expired(now);
        for lease in &removed {
            tables.release_address(lease);
            info!(
                "Lease {} for {} on {} expired",
                lease.ip_address, lease.hw_addr, lease.interface
            );
        }

        for pool in tables.pools.values_mut() {
            pool.purge_expired(now);
        }

        if !removed.is_empty() {
            tables.dirty = true;
        }
        removed.len()
    }

    /// All leases, static and dynamic, ordered by interface then address.
    pub async fn leases(&self) -> Vec<Lease> {
        let tables = self.tables.read().await;
        tables.store.sorted().into_iter().cloned().collect()
    }

    async fn live_lease_by_ip(&self, ip: IpAddr) -> Option<Lease> {
        let now = self.clock.now();
        let tables = self.tables.read().await;
        tables
            .store
            .find_by_ip_any(ip)
            .filter(|lease| !lease.is_expired(now))
            .cloned()
    }

    /// Hostname of the live lease on `ip`.
    pub async fn host_by_ip(&self, ip: IpAddr) -> Option<String> {
        self.live_lease_by_ip(ip).await?.hostname
    }

    /// Hardware address of the live lease on `ip`.
    pub async fn mac_by_ip(&self, ip: IpAddr) -> Option<HwAddr> {
        self.live_lease_by_ip(ip).await.map(|lease| lease.hw_addr)
    }

    /// Address of the live lease named `hostname`, ignoring ASCII case.
    pub async fn ip_by_host(&self, hostname: &str) -> Option<IpAddr> {
        let now = self.clock.now();
        let tables = self.tables.read().await;
        tables
            .store
            .find_by_hostname(hostname, now)
            .map(|lease| lease.ip_address)
    }

    /// Adds or replaces a static lease at runtime.
    ///
    /// A dynamic lease held by the same hardware address is replaced, but
    /// only once the new address is known to be free; a failed add leaves
    /// the tables untouched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the interface does not serve the
    /// address family, or [`Error::LeaseConflict`] if the address belongs to
    /// another hardware address.
    pub async fn add_static_lease(&self, interface: &str, lease: &StaticLease) -> Result<()> {
        let now = self.clock.now();
        let mut tables = self.tables.write().await;
        tables.install_static(interface, lease, now)?;
        info!(
            "Static lease {} for {} added on {}",
            lease.ip_address, lease.mac_address, interface
        );
        Ok(())
    }

    /// Removes a static lease and frees its address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LeaseNotFound`] if no static lease matches.
    pub async fn remove_static_lease(
        &self,
        interface: &str,
        family: AddrFamily,
        hw_addr: HwAddr,
    ) -> Result<Lease> {
        let mut tables = self.tables.write().await;
        let is_static = tables
            .store
            .find_by_hw_addr(interface, family, hw_addr)
            .is_some_and(|lease| lease.is_static);
        if !is_static {
            return Err(Error::LeaseNotFound(format!("{} on {}", hw_addr, interface)));
        }

        tables
            .remove_lease(interface, family, hw_addr)
            .ok_or_else(|| Error::LeaseNotFound(format!("{} on {}", hw_addr, interface)))
    }

    /// Drops every dynamic lease and outstanding offer. Static leases stay.
    pub async fn reset(&self) -> usize {
        let mut tables = self.tables.write().await;
        let removed = tables.store.remove_dynamic();
        for lease in &removed {
            tables.release_address(lease);
        }
        for pool in tables.pools.values_mut() {
            pool.clear_tentative();
        }
        tables.dirty = true;
        info!("Reset lease database: {} dynamic leases removed", removed.len());
        removed.len()
    }
}
