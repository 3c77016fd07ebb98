//! DHCPv6 allocation state machine.
//!
//! [`Allocator6`] answers the DHCPv6 messages of one interface from its IPv6
//! pool. Clients are keyed by the hardware address in their DUID (or the
//! frame's source MAC when the DUID has none), so static leases and
//! queries work the same way for both families. Offers, commits and
//! renewals go through the same lease database logic as DHCPv4.
//!
//! Every message except Information-Request must carry a Client ID. Solicit,
//! Confirm and Rebind must not carry a Server ID; Request, Renew, Release
//! and Decline must carry ours. Messages failing these checks are dropped.

use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;

use chrono::TimeDelta;
use tracing::{debug, info, warn};

use crate::addr::AddrFamily;
use crate::allocator::{Binding, Client, ExhaustionLog, commit, pool_for, seconds, select_offer};
use crate::clock::Clock;
use crate::config::{Ipv6Config, ServerConfig, sanitize_hostname};
use crate::db::LeaseDb;
use crate::error::Error;
use crate::hwaddr::HwAddr;
use crate::packet6::{
    Dhcp6Message, Dhcp6MessageType, Dhcp6Option, Dhcp6OptionCode, IaAddress, IaNa, StatusCode,
    duid_hw_addr, duid_ll, fqdn_hostname,
};

/// IAID used when the client sent no IA_NA: "ADGH".
const DEFAULT_IAID: u32 = 0x4144_4748;

fn as_v6(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V6(ip) => ip,
        IpAddr::V4(ip) => ip.to_ipv6_mapped(),
    }
}

/// An IA_NA carrying one address, with T1 at half and T2 at two thirds of
/// the lifetime.
fn ia_with_address(iaid: u32, addr: Ipv6Addr, lifetime: u32) -> IaNa {
    IaNa {
        iaid,
        t1: lifetime / 2,
        t2: (u64::from(lifetime) * 2 / 3) as u32,
        options: vec![Dhcp6Option::IaAddr(IaAddress {
            addr,
            preferred_lifetime: lifetime,
            valid_lifetime: lifetime,
            options: Vec::new(),
        })],
    }
}

fn ia_with_status(iaid: u32, status: StatusCode, message: &str) -> IaNa {
    IaNa {
        iaid,
        t1: 0,
        t2: 0,
        options: vec![Dhcp6Option::StatusCode(status, message.to_string())],
    }
}

fn requested_iaid(request: &Dhcp6Message) -> u32 {
    request.ia_na().map_or(DEFAULT_IAID, |ia| ia.iaid)
}

fn requested_address(request: &Dhcp6Message) -> Option<Ipv6Addr> {
    request.ia_na().and_then(IaNa::first_address)
}

pub struct Allocator6 {
    interface: String,
    config: Ipv6Config,
    server_id: Vec<u8>,
    offer_timeout: TimeDelta,
    decline_hold: TimeDelta,
    db: Arc<LeaseDb>,
    clock: Arc<dyn Clock>,
    exhaustion: ExhaustionLog,
}

impl Allocator6 {
    /// `server_hw_addr` is the interface's MAC; the server DUID is the
    /// DUID-LL built from it.
    pub fn new(
        interface: impl Into<String>,
        config: Ipv6Config,
        server: &ServerConfig,
        db: Arc<LeaseDb>,
        server_hw_addr: HwAddr,
    ) -> Self {
        let clock = Arc::clone(db.clock());
        Self {
            interface: interface.into(),
            config,
            server_id: duid_ll(server_hw_addr),
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

    pub fn server_id(&self) -> &[u8] {
        &self.server_id
    }

    /// Handles one client message and returns the reply to send, if any.
    ///
    /// `link_hw_addr` is the frame's source MAC, used when the client DUID
    /// carries no hardware address.
    pub async fn handle(
        &mut self,
        request: &Dhcp6Message,
        link_hw_addr: HwAddr,
    ) -> Option<Dhcp6Message> {
        let message_type = request.message_type;
        let hw_addr = request
            .client_id()
            .and_then(duid_hw_addr)
            .unwrap_or(link_hw_addr);
        debug!(
            interface = %self.interface,
            xid = request.transaction_id,
            "{} from {}",
            message_type,
            hw_addr
        );

        if let Err(reason) = self.check_ids(request) {
            debug!(interface = %self.interface, "Dropping {} from {}: {}", message_type, hw_addr, reason);
            return None;
        }

        match message_type {
            Dhcp6MessageType::Solicit => self.handle_solicit(request, hw_addr).await,
            Dhcp6MessageType::Request => Some(self.handle_request(request, hw_addr).await),
            Dhcp6MessageType::Renew | Dhcp6MessageType::Rebind => {
                Some(self.handle_renew(request, hw_addr).await)
            }
            Dhcp6MessageType::Confirm => self.handle_confirm(request, hw_addr).await,
            Dhcp6MessageType::Release => Some(self.handle_release(request, hw_addr).await),
            Dhcp6MessageType::Decline => Some(self.handle_decline(request, hw_addr).await),
            Dhcp6MessageType::InformationRequest => {
                info!(interface = %self.interface, "INFORMATION-REQUEST from {}", hw_addr);
                Some(self.reply(request, Dhcp6MessageType::Reply))
            }
            other => {
                debug!(interface = %self.interface, "Ignoring {} message", other);
                None
            }
        }
    }

    fn check_ids(&self, request: &Dhcp6Message) -> Result<(), &'static str> {
        use Dhcp6MessageType as M;

        let message_type = request.message_type;
        if message_type != M::InformationRequest && request.client_id().is_none() {
            return Err("no client id");
        }

        match (message_type, request.server_id()) {
            (M::Solicit | M::Confirm | M::Rebind, Some(_)) => Err("unexpected server id"),
            (M::Request | M::Renew | M::Release | M::Decline, None) => Err("no server id"),
            (_, Some(server_id)) if server_id != self.server_id.as_slice() => {
                Err("server id is not ours")
            }
            _ => Ok(()),
        }
    }

    fn client(&self, hw_addr: HwAddr) -> Client<'_> {
        Client {
            interface: &self.interface,
            family: AddrFamily::V6,
            hw_addr,
        }
    }

    /// Starts a reply carrying the client and server DUIDs, the DNS servers
    /// when asked for, and the client's FQDN option echoed back.
    fn reply(&self, request: &Dhcp6Message, message_type: Dhcp6MessageType) -> Dhcp6Message {
        let mut reply = Dhcp6Message::reply_to(request, message_type);
        reply
            .options
            .push(Dhcp6Option::ServerId(self.server_id.clone()));

        if !self.config.dns_servers.is_empty() && request.is_requested(Dhcp6OptionCode::DnsServers)
        {
            reply
                .options
                .push(Dhcp6Option::DnsServers(self.config.dns_servers.clone()));
        }
        if let Some(fqdn) = request.client_fqdn() {
            reply.options.push(Dhcp6Option::ClientFqdn(fqdn.to_vec()));
        }
        reply
    }

    fn reply_with_status(
        &self,
        request: &Dhcp6Message,
        message_type: Dhcp6MessageType,
        status: StatusCode,
        message: &str,
    ) -> Dhcp6Message {
        let mut reply = self.reply(request, message_type);
        reply
            .options
            .push(Dhcp6Option::StatusCode(status, message.to_string()));
        reply
    }

    /// A Reply whose IA_NA carries only a status.
    fn ia_status_reply(
        &self,
        request: &Dhcp6Message,
        status: StatusCode,
        message: &str,
    ) -> Dhcp6Message {
        let mut reply = self.reply(request, Dhcp6MessageType::Reply);
        reply.options.push(Dhcp6Option::IaNa(ia_with_status(
            requested_iaid(request),
            status,
            message,
        )));
        reply
    }

    fn bound_reply(
        &self,
        request: &Dhcp6Message,
        message_type: Dhcp6MessageType,
        binding: &Binding,
    ) -> Dhcp6Message {
        let mut reply = self.reply(request, message_type);
        reply.options.push(Dhcp6Option::IaNa(ia_with_address(
            requested_iaid(request),
            as_v6(binding.ip),
            binding.lease_time,
        )));
        reply
    }

    fn client_hostname(request: &Dhcp6Message) -> Option<String> {
        request
            .client_fqdn()
            .and_then(fqdn_hostname)
            .map(|name| sanitize_hostname(&name))
            .filter(|name| !name.is_empty())
    }

    async fn handle_solicit(
        &mut self,
        request: &Dhcp6Message,
        hw_addr: HwAddr,
    ) -> Option<Dhcp6Message> {
        let now = self.clock.now();
        let lease_time = self.config.lease_duration_seconds;
        let rapid_commit = request.has_rapid_commit();

        let selected = {
            let mut tables = self.db.write().await;
            let client = self.client(hw_addr);
            match select_offer(&mut tables, client, lease_time, self.offer_timeout, now) {
                Ok(binding) if rapid_commit => commit(
                    &mut tables,
                    client,
                    binding.ip,
                    Self::client_hostname(request),
                    lease_time,
                    now,
                ),
                other => other,
            }
        };

        let binding = match selected {
            Ok(binding) => binding,
            Err(Error::PoolExhausted) => {
                self.exhaustion.record(&self.interface, hw_addr, now);
                return Some(self.reply_with_status(
                    request,
                    Dhcp6MessageType::Advertise,
                    StatusCode::NoAddrsAvail,
                    "No addresses available",
                ));
            }
            Err(error) => {
                warn!(interface = %self.interface, "Cannot offer to {}: {}", hw_addr, error);
                return None;
            }
        };

        if rapid_commit {
            info!(
                interface = %self.interface,
                "REPLY {} to {} ({} seconds, rapid commit)",
                binding.ip,
                hw_addr,
                binding.lease_time
            );
            let mut reply = self.bound_reply(request, Dhcp6MessageType::Reply, &binding);
            reply.options.push(Dhcp6Option::RapidCommit);
            return Some(reply);
        }

        info!(
            interface = %self.interface,
            "ADVERTISE {} to {} ({} seconds)",
            binding.ip,
            hw_addr,
            binding.lease_time
        );
        Some(self.bound_reply(request, Dhcp6MessageType::Advertise, &binding))
    }

    async fn handle_request(&mut self, request: &Dhcp6Message, hw_addr: HwAddr) -> Dhcp6Message {
        let Some(requested) = requested_address(request) else {
            debug!(interface = %self.interface, "REQUEST from {} names no address", hw_addr);
            return self.reply_with_status(
                request,
                Dhcp6MessageType::Reply,
                StatusCode::NoAddrsAvail,
                "No address requested",
            );
        };

        let now = self.clock.now();
        let committed = {
            let mut tables = self.db.write().await;
            commit(
                &mut tables,
                self.client(hw_addr),
                IpAddr::V6(requested),
                Self::client_hostname(request),
                self.config.lease_duration_seconds,
                now,
            )
        };

        match committed {
            Ok(binding) => {
                info!(
                    interface = %self.interface,
                    "REPLY {} to {} ({} seconds)",
                    binding.ip,
                    hw_addr,
                    binding.lease_time
                );
                self.bound_reply(request, Dhcp6MessageType::Reply, &binding)
            }
            Err(error) => {
                warn!(interface = %self.interface, "Refusing {} to {}: {}", requested, hw_addr, error);
                self.ia_status_reply(request, StatusCode::NoAddrsAvail, &error.to_string())
            }
        }
    }

    /// Renew and Rebind extend the lease the client holds on the address
    /// it names.
    async fn handle_renew(&mut self, request: &Dhcp6Message, hw_addr: HwAddr) -> Dhcp6Message {
        let message_type = request.message_type;
        let now = self.clock.now();
        let requested = requested_address(request).map(IpAddr::V6);

        let renewed = {
            let mut tables = self.db.write().await;
            let held = tables
                .store
                .find_by_hw_addr(&self.interface, AddrFamily::V6, hw_addr)
                .is_some_and(|lease| Some(lease.ip_address) == requested);

            match requested {
                Some(ip) if held => commit(
                    &mut tables,
                    self.client(hw_addr),
                    ip,
                    Self::client_hostname(request),
                    self.config.lease_duration_seconds,
                    now,
                )
                .ok(),
                _ => None,
            }
        };

        match renewed {
            Some(binding) => {
                info!(
                    interface = %self.interface,
                    "{} of {} by {} ({} seconds)",
                    message_type,
                    binding.ip,
                    hw_addr,
                    binding.lease_time
                );
                self.bound_reply(request, Dhcp6MessageType::Reply, &binding)
            }
            None => {
                debug!(interface = %self.interface, "{} from {} has no binding", message_type, hw_addr);
                self.ia_status_reply(request, StatusCode::NoBinding, "No binding for this client")
            }
        }
    }

    /// Confirm is answered only when the server knows the client.
    async fn handle_confirm(
        &mut self,
        request: &Dhcp6Message,
        hw_addr: HwAddr,
    ) -> Option<Dhcp6Message> {
        let now = self.clock.now();
        let lease = {
            let tables = self.db.read().await;
            tables
                .store
                .find_by_hw_addr(&self.interface, AddrFamily::V6, hw_addr)
                .cloned()
        };
        let Some(lease) = lease else {
            debug!(interface = %self.interface, "CONFIRM from unknown client {}", hw_addr);
            return None;
        };

        let confirmed = !lease.is_expired(now)
            && requested_address(request).map(IpAddr::V6) == Some(lease.ip_address);
        if !confirmed {
            info!(interface = %self.interface, "CONFIRM from {} is not on link", hw_addr);
            return Some(self.reply_with_status(
                request,
                Dhcp6MessageType::Reply,
                StatusCode::NotOnLink,
                "Address is not on link",
            ));
        }

        let lease_time = match lease.remaining_seconds(now) {
            Some(remaining) => u32::try_from(remaining.max(1)).unwrap_or(u32::MAX),
            None => self.config.lease_duration_seconds,
        };
        let binding = Binding {
            ip: lease.ip_address,
            lease_time,
            hostname: lease.hostname,
        };

        info!(interface = %self.interface, "CONFIRM {} for {}", binding.ip, hw_addr);
        let mut reply = self.bound_reply(request, Dhcp6MessageType::Reply, &binding);
        reply.options.push(Dhcp6Option::StatusCode(
            StatusCode::Success,
            "Address confirmed".to_string(),
        ));
        Some(reply)
    }

    async fn handle_release(&mut self, request: &Dhcp6Message, hw_addr: HwAddr) -> Dhcp6Message {
        let released = requested_address(request).map(IpAddr::V6);

        let matched = {
            let mut tables = self.db.write().await;
            let matches = tables
                .store
                .find_by_hw_addr(&self.interface, AddrFamily::V6, hw_addr)
                .is_some_and(|lease| !lease.is_static && Some(lease.ip_address) == released);
            if matches {
                tables.remove_lease(&self.interface, AddrFamily::V6, hw_addr);
            }
            matches
        };

        if matched {
            info!(interface = %self.interface, "RELEASE from {} for {:?}", hw_addr, released);
            return self.reply_with_status(
                request,
                Dhcp6MessageType::Reply,
                StatusCode::Success,
                "Released",
            );
        }

        debug!(
            interface = %self.interface,
            "RELEASE from {} for {:?} matches no dynamic lease",
            hw_addr,
            released
        );
        self.ia_status_reply(request, StatusCode::NoBinding, "No binding for this client")
    }

    /// The declined address is held out of the pool for the decline hold
    /// time. Static addresses are never held.
    async fn handle_decline(&mut self, request: &Dhcp6Message, hw_addr: HwAddr) -> Dhcp6Message {
        const NOT_ASSOCIATED: &str = "Address not associated with client";

        let Some(declined) = requested_address(request) else {
            debug!(interface = %self.interface, "DECLINE from {} names no address", hw_addr);
            return self.ia_status_reply(request, StatusCode::NoBinding, NOT_ASSOCIATED);
        };
        let ip = IpAddr::V6(declined);
        let now = self.clock.now();

        let mut tables = self.db.write().await;
        let lease = tables
            .store
            .find_by_hw_addr(&self.interface, AddrFamily::V6, hw_addr)
            .cloned();

        if lease.as_ref().is_some_and(|lease| lease.is_static) {
            warn!(
                interface = %self.interface,
                "DECLINE from {} for {} ignored, address is static",
                hw_addr,
                declined
            );
            return self.ia_status_reply(request, StatusCode::NoBinding, NOT_ASSOCIATED);
        }

        let leased = lease.is_some_and(|lease| lease.ip_address == ip);
        let offered = pool_for(&mut tables, &self.interface, AddrFamily::V6)
            .is_ok_and(|pool| pool.tentative_for(hw_addr, now) == Some(ip));
        if !leased && !offered {
            warn!(
                interface = %self.interface,
                "DECLINE from {} for {} rejected, address not associated with client",
                hw_addr,
                declined
            );
            return self.ia_status_reply(request, StatusCode::NoBinding, NOT_ASSOCIATED);
        }

        if leased {
            tables.remove_lease(&self.interface, AddrFamily::V6, hw_addr);
        }

        let until = now + self.decline_hold;
        match pool_for(&mut tables, &self.interface, AddrFamily::V6)
            .and_then(|pool| pool.decline(ip, until))
        {
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
        drop(tables);

        self.reply_with_status(
            request,
            Dhcp6MessageType::Reply,
            StatusCode::Success,
            "Declined",
        )
    }
}
