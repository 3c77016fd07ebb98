//! # dhcpsvc
//!
//! A DHCP service engine for home gateways, implementing RFC 2131 (DHCP),
//! RFC 2132 (DHCP Options) and RFC 8415 (DHCPv6) over raw Ethernet frames.
//!
//! ## Features
//!
//! - DISCOVER, OFFER, REQUEST, ACK, NAK, RELEASE, DECLINE and INFORM
//! - DHCPv6 Solicit, Advertise, Request, Confirm, Renew, Rebind, Reply,
//!   Release, Decline and Information-Request, with Rapid Commit
//! - One worker per interface, sharing a single lease database
//! - Static hardware-address-to-IP bindings, changeable at runtime
//! - Tentative reservations for outstanding offers
//! - Lease persistence with atomic file replacement
//! - Per-client rate limiting
//! - Async/await with Tokio
//!
//! ## Quick Start
//!
//! ```no_run
//! # #[cfg(target_os = "linux")]
//! # async fn example() -> dhcpsvc::Result<()> {
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use dhcpsvc::{RawSocketProvider, ServerConfig, Service, SystemClock};
//!
//! let config = ServerConfig::load_or_create("dhcpsvc.json").await?;
//! let service = Service::new(config, Arc::new(SystemClock)).await?;
//! service.start(&RawSocketProvider).await?;
//!
//! tokio::signal::ctrl_c().await?;
//! service.shutdown(Duration::from_secs(5)).await
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`ServerConfig`] - Interfaces, address ranges, lease timings
//! - [`Service`] - Starts and stops the per-interface workers
//! - [`InterfaceServer`] - Receive, handle, reply loop for one interface
//! - [`Allocator`] - Picks addresses and builds DHCPv4 replies
//! - [`Allocator6`] - The same for DHCPv6, clients keyed by DUID hardware address
//! - [`LeaseDb`] - Lease store and address pools behind one lock, with persistence
//! - [`AddressPool`] - Free, leased, offered and declined addresses in a range
//! - [`Transport`] - Frame I/O; [`ChannelTransport`] in memory, `RawSocketTransport` on Linux
//! - [`DhcpFrame`] - Ethernet/IPv4/UDP framing around a [`DhcpPacket`]
//! - [`Dhcp6Frame`] - Ethernet/IPv6/UDP framing around a [`Dhcp6Message`]

pub mod addr;
pub mod allocator;
pub mod allocator6;
pub mod clock;
pub mod codec;
pub mod config;
pub mod db;
pub mod error;
pub mod hwaddr;
pub mod lease;
pub mod options;
pub mod packet;
pub mod packet6;
pub mod pool;
#[cfg(target_os = "linux")]
pub mod raw;
pub mod server;
pub mod service;
pub mod transport;

pub use addr::AddrFamily;
pub use allocator::Allocator;
pub use allocator6::Allocator6;
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{Dhcp6Frame, DhcpFrame, Inbound};
pub use config::{InterfaceConfig, Ipv4Config, Ipv6Config, ServerConfig, StaticLease};
pub use db::LeaseDb;
pub use error::{Error, Result};
pub use hwaddr::HwAddr;
pub use lease::{Lease, LeaseStore};
pub use options::{DhcpOption, MessageType};
pub use packet::DhcpPacket;
pub use packet6::{Dhcp6Message, Dhcp6MessageType, Dhcp6Option};
pub use pool::AddressPool;
#[cfg(target_os = "linux")]
pub use raw::{RawSocketProvider, RawSocketTransport};
pub use server::InterfaceServer;
pub use service::Service;
pub use transport::{ChannelPeer, ChannelProvider, ChannelTransport, Transport, TransportProvider};
