//! DHCPv4 allocation state machine.
//!
//! An [`Allocator`] answers the messages of one interface. It keeps no
//! per-client state of its own: everything it decides is read from and
//! written to the shared [`LeaseDb`], under its write lock, so each message
//! is handled against one consistent view of leases and pool.
//!
//! - DISCOVER offers, in order of preference, the client's static lease,
//!   its unexpired dynamic lease (with the remaining time), an address
//!   still tentatively reserved for it, or the lowest free address, which
//!   is then reserved tentatively for the offer grace window.
//! - REQUEST commits the tentative reservation or renews the lease the
//!   client already holds. Anything else is NAKed without touching state.
//! - RELEASE and DECLINE never get a reply.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, warn};

use crate::addr::AddrFamily;
use crate::clock::Clock;
use crate::config::{Ipv4Config, ServerConfig, sanitize_hostname};
use crate::db::{LeaseDb, Tables};
use crate::error::{Error, Result};
use crate::hwaddr::HwAddr;
use crate::lease::Lease;
use crate::options::{DhcpOption, MessageType, OptionCode};
use crate::packet::DhcpPacket;
use crate::pool::AddressPool;

/// Minimum time between two warnings about the same exhausted pool.
const EXHAUSTION_LOG_INTERVAL_SECS: i64 = 60;

/// Options sent whether or not the client asked for them.
const ALWAYS_SENT: [u8; 6] = [
    OptionCode::MessageType as u8,
    OptionCode::ServerIdentifier as u8,
    OptionCode::LeaseTime as u8,
    OptionCode::RenewalTime as u8,
    OptionCode::RebindingTime as u8,
    OptionCode::Hostname as u8,
];

/// An address the client may use, and for how long.
#[derive(Debug)]
pub(crate) struct Binding {
    pub ip: IpAddr,
    pub lease_time: u32,
    pub hostname: Option<String>,
}

/// The client a message is about: whose lease, in which pool.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Client<'a> {
    pub interface: &'a str,
    pub family: AddrFamily,
    pub hw_addr: HwAddr,
}

pub(crate) fn seconds(value: u32) -> TimeDelta {
    TimeDelta::seconds(i64::from(value))
}

pub(crate) fn pool_for<'t>(
    tables: &'t mut Tables,
    interface: &str,
    family: AddrFamily,
) -> Result<&'t mut AddressPool> {
    tables
        .pool_mut(interface, family)
        .ok_or_else(|| Error::InvalidConfig(format!("{} has no {} pool", interface, family)))
}

/// Picks the address to offer `client`.
///
/// In order of preference: its static lease, its unexpired dynamic lease
/// (with the remaining time), an address still tentatively reserved for it,
/// the lowest free address, or the lowest expired dynamic lease. The last
/// two are reserved tentatively until `now + offer_timeout`.
pub(crate) fn select_offer(
    tables: &mut Tables,
    client: Client<'_>,
    lease_time: u32,
    offer_timeout: TimeDelta,
    now: DateTime<Utc>,
) -> Result<Binding> {
    let Client {
        interface,
        family,
        hw_addr,
    } = client;

    if let Some(lease) = tables
        .store
        .find_by_hw_addr(interface, family, hw_addr)
        .cloned()
    {
        if lease.is_static {
            return Ok(Binding {
                ip: lease.ip_address,
                lease_time,
                hostname: lease.hostname,
            });
        }

        if let Some(remaining) = lease.remaining_seconds(now)
            && !lease.is_expired(now)
        {
            return Ok(Binding {
                ip: lease.ip_address,
                lease_time: u32::try_from(remaining.max(1)).unwrap_or(u32::MAX),
                hostname: lease.hostname,
            });
        }

        tables.remove_lease(interface, family, hw_addr);
    }

    let until = now + offer_timeout;
    let pool = pool_for(tables, interface, family)?;
    if let Some(ip) = pool.tentative_for(hw_addr, now) {
        pool.reserve_tentative(ip, hw_addr, until, now)?;
        return Ok(Binding {
            ip,
            lease_time,
            hostname: None,
        });
    }

    let ip = match pool.allocate(now) {
        Some(ip) => ip,
        None => reclaim_expired(tables, client, now)?,
    };
    pool_for(tables, interface, family)?.reserve_tentative(ip, hw_addr, until, now)?;

    Ok(Binding {
        ip,
        lease_time,
        hostname: None,
    })
}

/// Frees the lowest expired dynamic lease and allocates again.
fn reclaim_expired(tables: &mut Tables, client: Client<'_>, now: DateTime<Utc>) -> Result<IpAddr> {
    let expired = tables
        .store
        .lowest_expired(client.interface, client.family, now)
        .map(|lease| lease.hw_addr)
        .ok_or(Error::PoolExhausted)?;

    if let Some(lease) = tables.remove_lease(client.interface, client.family, expired) {
        info!(
            interface = %client.interface,
            "Reclaimed expired lease {} from {}",
            lease.ip_address,
            lease.hw_addr
        );
    }

    pool_for(tables, client.interface, client.family)?
        .allocate(now)
        .ok_or(Error::PoolExhausted)
}

/// Binds `ip` to `client` for `lease_time` seconds.
///
/// A static client gets its fixed address back unchanged. A client renewing
/// the unexpired lease it holds gets it extended. Anything else must match
/// a live tentative reservation for the client, which is then made
/// permanent and recorded as a dynamic lease.
pub(crate) fn commit(
    tables: &mut Tables,
    client: Client<'_>,
    ip: IpAddr,
    client_hostname: Option<String>,
    lease_time: u32,
    now: DateTime<Utc>,
) -> Result<Binding> {
    let Client {
        interface,
        family,
        hw_addr,
    } = client;

    let existing = tables
        .store
        .find_by_hw_addr(interface, family, hw_addr)
        .cloned();

    if let Some(lease) = &existing {
        if lease.is_static {
            if lease.ip_address != ip {
                return Err(Error::LeaseConflict(format!(
                    "{} is fixed to {}",
                    hw_addr, lease.ip_address
                )));
            }
            return Ok(Binding {
                ip,
                lease_time,
                hostname: lease.hostname.clone(),
            });
        }

        if lease.ip_address == ip && !lease.is_expired(now) {
            let hostname = client_hostname.or_else(|| lease.hostname.clone());
            let renewed = Lease::new_dynamic(
                interface,
                hw_addr,
                ip,
                hostname.clone(),
                now + seconds(lease_time),
            );
            tables.store.put(renewed)?;
            tables.dirty = true;
            return Ok(Binding {
                ip,
                lease_time,
                hostname,
            });
        }
    }

    let pool = pool_for(tables, interface, family)?;
    if !pool.contains(ip) {
        return Err(Error::AddressOutOfRange(ip));
    }
    if pool.tentative_for(hw_addr, now) != Some(ip) {
        return Err(Error::LeaseNotFound(format!("offer of {} to {}", ip, hw_addr)));
    }
    pool.reserve(ip, hw_addr, now)?;

    if existing.is_some() {
        tables.remove_lease(interface, family, hw_addr);
    }

    let lease = Lease::new_dynamic(
        interface,
        hw_addr,
        ip,
        client_hostname.clone(),
        now + seconds(lease_time),
    );
    if let Err(error) = tables.store.put(lease) {
        pool_for(tables, interface, family)?.release(ip);
        return Err(error);
    }
    tables.dirty = true;

    Ok(Binding {
        ip,
        lease_time,
        hostname: client_hostname,
    })
}

/// Rate limits the pool-exhausted warning.
#[derive(Debug, Default)]
pub(crate) struct ExhaustionLog {
    last: Option<DateTime<Utc>>,
}

impl ExhaustionLog {
    pub fn record(&mut self, interface: &str, hw_addr: HwAddr, now: DateTime<Utc>) {
        let interval = TimeDelta::seconds(EXHAUSTION_LOG_INTERVAL_SECS);
        let due = self.last.is_none_or(|last| now - last >= interval);

        if due {
            warn!(
                interface = %interface,
                "Pool exhausted, cannot offer an address to {}",
                hw_addr
            );
            self.last = Some(now);
        } else {
            debug!(interface = %interface, "Pool exhausted, no offer for {}", hw_addr);
        }
    }
}

pub struct Allocator {
    interface: String,
    config: Ipv4Config,
    offer_timeout: TimeDelta,
    decline_hold: TimeDelta,
    db: Arc<LeaseDb>,
    clock: Arc<dyn Clock>,
    exhaustion: ExhaustionLog,
}

impl Allocator {
    pub fn new(
        interface: impl Into<String>,
        config: Ipv4Config,
        server: &ServerConfig,
        db: Arc<LeaseDb>,
    ) -> Self {
        let clock = Arc::clone(db.clock());
        Self {
            interface: interface.into(),
            config,
            offer_timeout: seconds(server.offer_timeout_seconds),
            decline_hold: seconds(server.decline_hold_seconds),
            db,
            clock,
            exhaustion: ExhaustionLog::default(),
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.config.gateway
    }

    /// Handles one client message and returns the reply to send, if any.
    pub async fn handle(&mut self, request: &DhcpPacket) -> Option<DhcpPacket> {
        let message_type = request.message_type()?;
        debug!(
            interface = %self.interface,
            xid = request.xid,
            "{} from {}",
            message_type,
            request.hw_addr()
        );

        match message_type {
            MessageType::Discover => self.handle_discover(request).await,
            MessageType::Request => self.handle_request(request).await,
            MessageType::Release => {
                self.handle_release(request).await;
                None
            }
            MessageType::Decline => {
                self.handle_decline(request).await;
                None
            }
            MessageType::Inform => Some(self.handle_inform(request)),
            other => {
                debug!(interface = %self.interface, "Ignoring {} message", other);
                None
            }
        }
    }

    fn client(&self, hw_addr: HwAddr) -> Client<'_> {
        Client {
            interface: &self.interface,
            family: AddrFamily::V4,
            hw_addr,
        }
    }

    fn pool<'t>(&self, tables: &'t mut Tables) -> Result<&'t mut AddressPool> {
        pool_for(tables, &self.interface, AddrFamily::V4)
    }

    async fn handle_discover(&mut self, request: &DhcpPacket) -> Option<DhcpPacket> {
        let hw_addr = request.hw_addr();
        let now = self.clock.now();

        let selected = {
            let mut tables = self.db.write().await;
            select_offer(
                &mut tables,
                self.client(hw_addr),
                self.config.lease_duration_seconds,
                self.offer_timeout,
                now,
            )
        };

        let binding = match selected {
            Ok(binding) => binding,
            Err(Error::PoolExhausted) => {
                self.exhaustion.record(&self.interface, hw_addr, now);
                return None;
            }
            Err(error) => {
                warn!(interface = %self.interface, "Cannot offer to {}: {}", hw_addr, error);
                return None;
            }
        };

        info!(
            interface = %self.interface,
            "OFFER {} to {} ({} seconds)",
            binding.ip,
            hw_addr,
            binding.lease_time
        );
        Some(self.reply(request, MessageType::Offer, &binding))
    }

    async fn handle_request(&mut self, request: &DhcpPacket) -> Option<DhcpPacket> {
        let hw_addr = request.hw_addr();
        let now = self.clock.now();

        if let Some(server_id) = request.server_identifier()
            && server_id != self.config.gateway
        {
            let mut tables = self.db.write().await;
            if let Ok(pool) = self.pool(&mut tables)
                && let Some(ip) = pool.release_tentative(hw_addr)
            {
                debug!(interface = %self.interface, "Dropped offer of {} to {}", ip, hw_addr);
            }
            info!(
                interface = %self.interface,
                "REQUEST from {} is for different server {}",
                hw_addr,
                server_id
            );
            return None;
        }

        let requested = request
            .requested_ip()
            .or((!request.ciaddr.is_unspecified()).then_some(request.ciaddr));
        let Some(requested) = requested else {
            debug!(interface = %self.interface, "REQUEST from {} names no address", hw_addr);
            return None;
        };

        let client_hostname = request
            .hostname()
            .map(sanitize_hostname)
            .filter(|name| !name.is_empty());
        let committed = {
            let mut tables = self.db.write().await;
            commit(
                &mut tables,
                self.client(hw_addr),
                IpAddr::V4(requested),
                client_hostname,
                self.config.lease_duration_seconds,
                now,
            )
        };

        match committed {
            Ok(binding) => {
                info!(
                    interface = %self.interface,
                    "ACK {} to {} ({} seconds)",
                    binding.ip,
                    hw_addr,
                    binding.lease_time
                );
                Some(self.reply(request, MessageType::Ack, &binding))
            }
            Err(error) => {
                warn!(interface = %self.interface, "NAK {} to {}: {}", requested, hw_addr, error);
                Some(self.nak(request, &error.to_string()))
            }
        }
    }

    async fn handle_release(&mut self, request: &DhcpPacket) {
        let hw_addr = request.hw_addr();
        if request.ciaddr.is_unspecified() {
            debug!(interface = %self.interface, "RELEASE from {} with no ciaddr", hw_addr);
            return;
        }

        let mut tables = self.db.write().await;
        let matches = tables
            .store
            .find_by_hw_addr(&self.interface, AddrFamily::V4, hw_addr)
            .is_some_and(|lease| {
                !lease.is_static && lease.ip_address == IpAddr::V4(request.ciaddr)
            });

        if matches {
            tables.remove_lease(&self.interface, AddrFamily::V4, hw_addr);
            info!(interface = %self.interface, "RELEASE from {} for {}", hw_addr, request.ciaddr);
        } else {
            debug!(
                interface = %self.interface,
                "RELEASE from {} for {} matches no dynamic lease",
                hw_addr,
                request.ciaddr
            );
        }
    }

    async fn handle_decline(&mut self, request: &DhcpPacket) {
        let hw_addr = request.hw_addr();
        let Some(declined) = request.requested_ip() else {
            debug!(interface = %self.interface, "DECLINE from {} names no address", hw_addr);
            return;
        };
        let ip = IpAddr::V4(declined);
        let now = self.clock.now();

        let mut tables = self.db.write().await;
        let lease = tables
            .store
            .find_by_hw_addr(&self.interface, AddrFamily::V4, hw_addr)
            .cloned();

        if lease.as_ref().is_some_and(|lease| lease.is_static) {
            warn!(
                interface = %self.interface,
                "DECLINE from {} for {} ignored, address is static",
                hw_addr,
                declined
            );
            return;
        }

        let leased = lease.is_some_and(|lease| lease.ip_address == ip);
        let offered = self
            .pool(&mut tables)
            .is_ok_and(|pool| pool.tentative_for(hw_addr, now) == Some(ip));
        if !leased && !offered {
            warn!(
                interface = %self.interface,
                "DECLINE from {} for {} rejected, address not associated with client",
                hw_addr,
                declined
            );
            return;
        }

        if leased {
            tables.remove_lease(&self.interface, AddrFamily::V4, hw_addr);
        }

        let until = now + self.decline_hold;
        match self.pool(&mut tables).and_then(|pool| pool.decline(ip, until)) {
            Ok(()) => warn!(
                interface = %self.interface,
                "DECLINE from {} for {}, held until {}",
                hw_addr,
                declined,
                until
            ),
            Err(error) => warn!(interface = %self.interface, "Cannot hold {}: {}", declined, error),
        }
        tables.dirty = true;
    }

    fn handle_inform(&self, request: &DhcpPacket) -> DhcpPacket {
        let options = self.build_options(None, None);
        let options = filter_options_by_prl(options, request.parameter_request_list());

        info!(interface = %self.interface, "INFORM response to {}", request.hw_addr());
        DhcpPacket::create_reply(
            request,
            MessageType::Ack,
            Ipv4Addr::UNSPECIFIED,
            self.config.gateway,
            options,
        )
    }

    fn reply(&self, request: &DhcpPacket, message_type: MessageType, binding: &Binding) -> DhcpPacket {
        let options = self.build_options(Some(binding.lease_time), binding.hostname.as_deref());
        let options = filter_options_by_prl(options, request.parameter_request_list());
        let yiaddr = match binding.ip {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        };
        DhcpPacket::create_reply(request, message_type, yiaddr, self.config.gateway, options)
    }

    fn nak(&self, request: &DhcpPacket, reason: &str) -> DhcpPacket {
        let options = vec![
            DhcpOption::ServerIdentifier(self.config.gateway),
            DhcpOption::Message(reason.to_string()),
        ];
        DhcpPacket::create_reply(
            request,
            MessageType::Nak,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            options,
        )
    }

    /// Options for an OFFER or ACK. Without a lease time (INFORM) the
    /// lease, renewal and rebinding options are left out.
    fn build_options(&self, lease_time: Option<u32>, hostname: Option<&str>) -> Vec<DhcpOption> {
        let config = &self.config;
        let mut options = vec![DhcpOption::ServerIdentifier(config.gateway)];

        if let Some(lease_time) = lease_time {
            options.push(DhcpOption::LeaseTime(lease_time));
        }

        options.push(DhcpOption::SubnetMask(config.subnet_mask));
        options.push(DhcpOption::Router(vec![config.gateway]));
        if !config.dns_servers.is_empty() {
            options.push(DhcpOption::DnsServer(config.dns_servers.clone()));
        }
        if let Some(ref domain) = config.domain_name {
            options.push(DhcpOption::DomainName(domain.clone()));
        }
        options.push(DhcpOption::BroadcastAddress(config.broadcast()));

        if let Some(lease_time) = lease_time {
            let default_rebinding = (u64::from(lease_time) * 7 / 8) as u32;
            let rebinding = config
                .rebinding_time_seconds
                .unwrap_or(default_rebinding)
                .min(lease_time);
            let renewal = config
                .renewal_time_seconds
                .unwrap_or(lease_time / 2)
                .min(rebinding);
            options.push(DhcpOption::RenewalTime(renewal));
            options.push(DhcpOption::RebindingTime(rebinding));
        }

        if let Some(mtu) = config.mtu {
            options.push(DhcpOption::InterfaceMtu(mtu));
        }
        if let Some(hostname) = hostname {
            options.push(DhcpOption::Hostname(hostname.to_string()));
        }

        options
    }
}

fn filter_options_by_prl(
    options: Vec<DhcpOption>,
    parameter_request_list: Option<&[u8]>,
) -> Vec<DhcpOption> {
    let Some(prl) = parameter_request_list else {
        return options;
    };

    options
        .into_iter()
        .filter(|opt| {
            let code = opt.option_code();
            ALWAYS_SENT.contains(&code) || prl.contains(&code)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{InterfaceConfig, StaticLease};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    const GATEWAY: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 1);
    const PRINTER: HwAddr = HwAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x50]);

    fn mac(last: u8) -> HwAddr {
        HwAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, last])
    }

    fn v4(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(192, 168, 0, last)
    }

    struct Fixture {
        allocator: Allocator,
        db: Arc<LeaseDb>,
        clock: Arc<ManualClock>,
        _dir: TempDir,
    }

    impl Fixture {
        async fn new(range_end: u8) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let v4_config = Ipv4Config {
                gateway: GATEWAY,
                range_start: v4(100),
                range_end: v4(range_end),
                dns_servers: vec![GATEWAY],
                ..Default::default()
            };
            let config = ServerConfig {
                leases_file: dir.path().join("leases.json"),
                interfaces: BTreeMap::from([(
                    "br0".to_string(),
                    InterfaceConfig {
                        ipv4: Some(v4_config.clone()),
                        ipv6: None,
                        static_leases: vec![StaticLease {
                            mac_address: PRINTER,
                            ip_address: IpAddr::V4(v4(50)),
                            hostname: Some("printer".to_string()),
                        }],
                    },
                )]),
                ..Default::default()
            };

            let clock = Arc::new(ManualClock::default());
            let db = Arc::new(
                LeaseDb::open(&config, Arc::clone(&clock) as Arc<dyn Clock>)
                    .await
                    .unwrap(),
            );
            let allocator = Allocator::new("br0", v4_config, &config, Arc::clone(&db));

            Self {
                allocator,
                db,
                clock,
                _dir: dir,
            }
        }

        async fn send(&mut self, packet: DhcpPacket) -> Option<DhcpPacket> {
            self.allocator.handle(&packet).await
        }

        async fn discover(&mut self, hw_addr: HwAddr) -> Option<DhcpPacket> {
            self.send(DhcpPacket::new_request(MessageType::Discover, hw_addr, 1, vec![]))
                .await
        }

        async fn request(&mut self, hw_addr: HwAddr, ip: Ipv4Addr) -> Option<DhcpPacket> {
            let options = vec![
                DhcpOption::RequestedIpAddress(ip),
                DhcpOption::ServerIdentifier(GATEWAY),
            ];
            self.send(DhcpPacket::new_request(MessageType::Request, hw_addr, 2, options))
                .await
        }

        async fn release(&mut self, hw_addr: HwAddr, ip: Ipv4Addr) -> Option<DhcpPacket> {
            let mut packet = DhcpPacket::new_request(MessageType::Release, hw_addr, 3, vec![]);
            packet.ciaddr = ip;
            self.send(packet).await
        }

        async fn lease_for(&mut self, hw_addr: HwAddr) -> Ipv4Addr {
            let offer = self.discover(hw_addr).await.unwrap();
            let ack = self.request(hw_addr, offer.yiaddr).await.unwrap();
            assert_eq!(ack.message_type(), Some(MessageType::Ack));
            ack.yiaddr
        }

        async fn allocated(&self) -> usize {
            let tables = self.db.read().await;
            tables
                .pool("br0", AddrFamily::V4)
                .unwrap()
                .allocated_count(self.clock.now())
        }

        async fn lease(&self, hw_addr: HwAddr) -> Option<Lease> {
            let tables = self.db.read().await;
            tables
                .store()
                .find_by_hw_addr("br0", AddrFamily::V4, hw_addr)
                .cloned()
        }
    }

    #[tokio::test]
    async fn test_discover_offers_first_free_address() {
        let mut fixture = Fixture::new(200).await;

        let offer = fixture.discover(mac(1)).await.unwrap();
        assert_eq!(offer.message_type(), Some(MessageType::Offer));
        assert_eq!(offer.yiaddr, v4(100));
        assert_eq!(offer.lease_time(), Some(86400));
        assert_eq!(offer.server_identifier(), Some(GATEWAY));
        assert_eq!(offer.xid, 1);

        assert!(fixture.lease(mac(1)).await.is_none());
        assert_eq!(fixture.allocated().await, 1);
    }

    #[tokio::test]
    async fn test_static_lease_offered_with_hostname() {
        let mut fixture = Fixture::new(200).await;

        let offer = fixture.discover(PRINTER).await.unwrap();
        assert_eq!(offer.yiaddr, v4(50));
        assert_eq!(offer.hostname(), Some("printer"));
        assert_eq!(offer.lease_time(), Some(86400));

        let ack = fixture.request(PRINTER, v4(50)).await.unwrap();
        assert_eq!(ack.message_type(), Some(MessageType::Ack));
        assert!(fixture.lease(PRINTER).await.unwrap().is_static);
    }

    #[tokio::test]
    async fn test_static_lease_rejects_other_address() {
        let mut fixture = Fixture::new(200).await;

        let reply = fixture.request(PRINTER, v4(100)).await.unwrap();
        assert_eq!(reply.message_type(), Some(MessageType::Nak));
        assert_eq!(fixture.lease(PRINTER).await.unwrap().ip_address, IpAddr::V4(v4(50)));
    }

    #[tokio::test]
    async fn test_existing_lease_offers_remaining_time() {
        let mut fixture = Fixture::new(200).await;
        let ip = fixture.lease_for(mac(1)).await;

        fixture.clock.advance(TimeDelta::seconds(86400 - 1800));
        let offer = fixture.discover(mac(1)).await.unwrap();
        assert_eq!(offer.yiaddr, ip);
        let lease_time = offer.lease_time().unwrap();
        assert!(lease_time > 0 && lease_time <= 1800);
    }

    #[tokio::test]
    async fn test_request_never_offered_naks() {
        let mut fixture = Fixture::new(200).await;

        let reply = fixture.request(mac(1), v4(150)).await.unwrap();
        assert_eq!(reply.message_type(), Some(MessageType::Nak));
        assert_eq!(reply.yiaddr, Ipv4Addr::UNSPECIFIED);
        assert!(reply.options.iter().any(|opt| matches!(opt, DhcpOption::Message(_))));
        assert!(fixture.lease(mac(1)).await.is_none());
        assert_eq!(fixture.allocated().await, 0);
    }

    #[tokio::test]
    async fn test_request_outside_range_naks() {
        let mut fixture = Fixture::new(200).await;
        fixture.discover(mac(1)).await.unwrap();

        let reply = fixture.request(mac(1), v4(20)).await.unwrap();
        assert_eq!(reply.message_type(), Some(MessageType::Nak));
        assert!(fixture.lease(mac(1)).await.is_none());
    }

    #[tokio::test]
    async fn test_racing_discovers_get_distinct_addresses() {
        let mut fixture = Fixture::new(200).await;

        let first = fixture.discover(mac(1)).await.unwrap();
        let second = fixture.discover(mac(2)).await.unwrap();
        assert_eq!(first.yiaddr, v4(100));
        assert_eq!(second.yiaddr, v4(101));

        let again = fixture.discover(mac(1)).await.unwrap();
        assert_eq!(again.yiaddr, v4(100));

        let stolen = fixture.request(mac(2), v4(100)).await.unwrap();
        assert_eq!(stolen.message_type(), Some(MessageType::Nak));
    }

    #[tokio::test]
    async fn test_lapsed_offer_is_reoffered() {
        let mut fixture = Fixture::new(200).await;
        fixture.discover(mac(1)).await.unwrap();

        fixture.clock.advance(TimeDelta::seconds(61));
        let offer = fixture.discover(mac(2)).await.unwrap();
        assert_eq!(offer.yiaddr, v4(100));

        let late = fixture.request(mac(1), v4(100)).await.unwrap();
        assert_eq!(late.message_type(), Some(MessageType::Nak));
    }

    #[tokio::test]
    async fn test_request_commits_lease() {
        let mut fixture = Fixture::new(200).await;
        let start = fixture.clock.now();

        let offer = fixture.discover(mac(1)).await.unwrap();
        let options = vec![
            DhcpOption::RequestedIpAddress(offer.yiaddr),
            DhcpOption::ServerIdentifier(GATEWAY),
            DhcpOption::Hostname("laptop".to_string()),
        ];
        let ack = fixture
            .send(DhcpPacket::new_request(MessageType::Request, mac(1), 2, options))
            .await
            .unwrap();
        assert_eq!(ack.message_type(), Some(MessageType::Ack));
        assert_eq!(ack.yiaddr, v4(100));
        assert_eq!(ack.lease_time(), Some(86400));
        assert_eq!(ack.hostname(), Some("laptop"));

        let lease = fixture.lease(mac(1)).await.unwrap();
        assert!(!lease.is_static);
        assert_eq!(lease.hostname.as_deref(), Some("laptop"));
        assert_eq!(lease.expires_at, Some(start + TimeDelta::seconds(86400)));
        assert!(fixture.db.read().await.is_dirty());
        assert_eq!(fixture.allocated().await, 1);
    }

    #[tokio::test]
    async fn test_renewal_extends_lease() {
        let mut fixture = Fixture::new(200).await;
        let ip = fixture.lease_for(mac(1)).await;

        fixture.clock.advance(TimeDelta::hours(12));
        let mut renew = DhcpPacket::new_request(MessageType::Request, mac(1), 4, vec![]);
        renew.ciaddr = ip;
        let ack = fixture.send(renew).await.unwrap();
        assert_eq!(ack.message_type(), Some(MessageType::Ack));

        let lease = fixture.lease(mac(1)).await.unwrap();
        assert_eq!(
            lease.expires_at,
            Some(fixture.clock.now() + TimeDelta::seconds(86400))
        );
    }

    #[tokio::test]
    async fn test_request_for_other_server_drops_offer() {
        let mut fixture = Fixture::new(200).await;
        fixture.discover(mac(1)).await.unwrap();
        assert_eq!(fixture.allocated().await, 1);

        let options = vec![
            DhcpOption::RequestedIpAddress(v4(100)),
            DhcpOption::ServerIdentifier(v4(2)),
        ];
        let reply = fixture
            .send(DhcpPacket::new_request(MessageType::Request, mac(1), 2, options))
            .await;
        assert!(reply.is_none());
        assert_eq!(fixture.allocated().await, 0);
    }

    #[tokio::test]
    async fn test_release_twice_is_noop() {
        let mut fixture = Fixture::new(200).await;
        let ip = fixture.lease_for(mac(1)).await;

        assert!(fixture.release(mac(1), ip).await.is_none());
        assert!(fixture.lease(mac(1)).await.is_none());
        assert_eq!(fixture.allocated().await, 0);

        assert!(fixture.release(mac(1), ip).await.is_none());
        assert_eq!(fixture.allocated().await, 0);
    }

    #[tokio::test]
    async fn test_release_ignores_static_lease() {
        let mut fixture = Fixture::new(200).await;
        assert!(fixture.release(PRINTER, v4(50)).await.is_none());
        assert!(fixture.lease(PRINTER).await.is_some());
    }

    #[tokio::test]
    async fn test_decline_holds_address() {
        let mut fixture = Fixture::new(200).await;
        let ip = fixture.lease_for(mac(1)).await;

        let decline = DhcpPacket::new_request(
            MessageType::Decline,
            mac(1),
            5,
            vec![DhcpOption::RequestedIpAddress(ip)],
        );
        assert!(fixture.send(decline).await.is_none());
        assert!(fixture.lease(mac(1)).await.is_none());

        let offer = fixture.discover(mac(2)).await.unwrap();
        assert_eq!(offer.yiaddr, v4(101));

        fixture.clock.advance(TimeDelta::seconds(3601));
        fixture.db.sweep_expired().await;
        let offer = fixture.discover(mac(3)).await.unwrap();
        assert_eq!(offer.yiaddr, v4(100));
    }

    #[tokio::test]
    async fn test_decline_from_stranger_ignored() {
        let mut fixture = Fixture::new(200).await;
        let ip = fixture.lease_for(mac(1)).await;

        let decline = DhcpPacket::new_request(
            MessageType::Decline,
            mac(9),
            5,
            vec![DhcpOption::RequestedIpAddress(ip)],
        );
        assert!(fixture.send(decline).await.is_none());
        assert!(fixture.lease(mac(1)).await.is_some());
    }

    #[tokio::test]
    async fn test_exhausted_pool_sends_nothing() {
        let mut fixture = Fixture::new(101).await;

        assert!(fixture.discover(mac(1)).await.is_some());
        assert!(fixture.discover(mac(2)).await.is_some());
        assert!(fixture.discover(mac(3)).await.is_none());
        assert!(fixture.discover(mac(4)).await.is_none());
    }

    #[tokio::test]
    async fn test_static_offer_with_pool_exhausted() {
        let mut fixture = Fixture::new(101).await;
        assert!(fixture.discover(mac(1)).await.is_some());
        assert!(fixture.discover(mac(2)).await.is_some());
        assert!(fixture.discover(mac(3)).await.is_none());

        let offer = fixture.discover(PRINTER).await.unwrap();
        assert_eq!(offer.message_type(), Some(MessageType::Offer));
        assert_eq!(offer.yiaddr, v4(50));
        assert_eq!(offer.hostname(), Some("printer"));
        assert_eq!(fixture.allocated().await, 2);
    }

    #[tokio::test]
    async fn test_exhausted_pool_reclaims_expired_lease() {
        let mut fixture = Fixture::new(101).await;
        fixture.lease_for(mac(1)).await;
        fixture.lease_for(mac(2)).await;

        fixture.clock.advance(TimeDelta::seconds(86401));
        let offer = fixture.discover(mac(3)).await.unwrap();
        assert_eq!(offer.yiaddr, v4(100));
        assert!(fixture.lease(mac(1)).await.is_none());
        assert!(fixture.lease(mac(2)).await.is_some());
    }

    #[tokio::test]
    async fn test_inform_ack_without_lease_time() {
        let mut fixture = Fixture::new(200).await;

        let mut inform = DhcpPacket::new_request(MessageType::Inform, mac(1), 6, vec![]);
        inform.ciaddr = v4(10);
        let ack = fixture.send(inform).await.unwrap();
        assert_eq!(ack.message_type(), Some(MessageType::Ack));
        assert_eq!(ack.lease_time(), None);
        assert_eq!(ack.yiaddr, Ipv4Addr::UNSPECIFIED);
        assert!(ack.options.contains(&DhcpOption::SubnetMask(Ipv4Addr::new(255, 255, 255, 0))));
        assert!(fixture.lease(mac(1)).await.is_none());
    }

    #[tokio::test]
    async fn test_parameter_request_list_filters_options() {
        let mut fixture = Fixture::new(200).await;

        let prl = DhcpOption::ParameterRequestList(vec![
            OptionCode::SubnetMask as u8,
            OptionCode::Router as u8,
        ]);
        let offer = fixture
            .send(DhcpPacket::new_request(MessageType::Discover, mac(1), 1, vec![prl]))
            .await
            .unwrap();

        let codes: Vec<u8> = offer.options.iter().map(DhcpOption::option_code).collect();
        assert!(codes.contains(&(OptionCode::SubnetMask as u8)));
        assert!(codes.contains(&(OptionCode::Router as u8)));
        assert!(codes.contains(&(OptionCode::ServerIdentifier as u8)));
        assert!(codes.contains(&(OptionCode::LeaseTime as u8)));
        assert!(codes.contains(&(OptionCode::RenewalTime as u8)));
        assert!(!codes.contains(&(OptionCode::DnsServer as u8)));
        assert!(!codes.contains(&(OptionCode::BroadcastAddress as u8)));
    }

    #[tokio::test]
    async fn test_renewal_times_follow_offered_lease() {
        let fixture = Fixture::new(200).await;

        let options = fixture.allocator.build_options(Some(1800), None);
        assert!(options.contains(&DhcpOption::LeaseTime(1800)));
        assert!(options.contains(&DhcpOption::RenewalTime(900)));
        assert!(options.contains(&DhcpOption::RebindingTime(1575)));

        let inform = fixture.allocator.build_options(None, None);
        assert!(!inform.iter().any(|opt| matches!(opt, DhcpOption::RenewalTime(_))));
    }
}
