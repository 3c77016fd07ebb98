//! Per-interface DHCP worker.
//!
//! An [`InterfaceServer`] owns one [`Transport`] and up to two allocators,
//! an [`Allocator`] for DHCPv4 and an [`Allocator6`] for DHCPv6. It
//! processes frames strictly one at a time: decode, rate-limit, allocate,
//! encode, send. Nothing read from the link can stop the loop; malformed
//! frames and frames of a family the interface does not serve are logged
//! at debug and dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::allocator::Allocator;
use crate::allocator6::Allocator6;
use crate::clock::Clock;
use crate::codec::{Inbound, decode, encode_reply, encode_reply6};
use crate::error::{Error, Result};
use crate::hwaddr::HwAddr;
use crate::transport::Transport;

const RATE_LIMIT_WINDOW_SECS: i64 = 1;
const RATE_LIMIT_MAX_REQUESTS: usize = 10;
const RATE_LIMIT_CLEANUP_THRESHOLD: usize = 1000;

pub struct InterfaceServer<T> {
    interface: String,
    transport: T,
    v4: Option<Allocator>,
    v6: Option<Allocator6>,
    clock: Arc<dyn Clock>,
    enabled: Arc<AtomicBool>,
    rate_limiter: HashMap<HwAddr, Vec<DateTime<Utc>>>,
}

impl<T: Transport> InterfaceServer<T> {
    /// A server answering nothing until allocators are attached with
    /// [`with_v4`](Self::with_v4) and [`with_v6`](Self::with_v6).
    ///
    /// `enabled` is shared with the owning service; while it is false,
    /// frames are read and dropped.
    pub fn new(
        interface: impl Into<String>,
        transport: T,
        clock: Arc<dyn Clock>,
        enabled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            interface: interface.into(),
            transport,
            v4: None,
            v6: None,
            clock,
            enabled,
            rate_limiter: HashMap::new(),
        }
    }

    pub fn with_v4(mut self, allocator: Allocator) -> Self {
        self.v4 = Some(allocator);
        self
    }

    pub fn with_v6(mut self, allocator: Allocator6) -> Self {
        self.v6 = Some(allocator);
        self
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Serves frames until `shutdown` turns true, its sender is dropped, or
    /// the transport closes.
    ///
    /// A reply that cannot be written when shutdown fires is abandoned.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            interface = %self.interface,
            ipv4 = self.v4.is_some(),
            ipv6 = self.v6.is_some(),
            "DHCP server ready on {}",
            self.transport.hardware_addr()
        );

        loop {
            let received = tokio::select! {
                biased;
                () = stopped(&mut shutdown) => break,
                received = self.transport.receive_frame() => received,
            };

            let frame = match received {
                Ok(frame) => frame,
                Err(Error::TransportClosed) => {
                    info!(interface = %self.interface, "Transport closed");
                    break;
                }
                Err(error) => {
                    error!(interface = %self.interface, "Error receiving frame: {}", error);
                    continue;
                }
            };

            let Some(reply) = self.handle_frame(&frame).await else {
                continue;
            };

            tokio::select! {
                biased;
                sent = self.transport.send_frame(reply) => {
                    if let Err(error) = sent {
                        warn!(interface = %self.interface, "Error sending reply: {}", error);
                    }
                }
                () = stopped(&mut shutdown) => {
                    debug!(interface = %self.interface, "Abandoning reply on shutdown");
                    break;
                }
            }
        }

        info!(interface = %self.interface, "DHCP server stopped");
        Ok(())
    }

    /// Returns the encoded reply frame for `frame`, if one is due.
    async fn handle_frame(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let inbound = match decode(frame) {
            Ok(inbound) => inbound,
            Err(error) => {
                debug!(interface = %self.interface, "Dropping frame: {}", error);
                return None;
            }
        };

        if !self.enabled.load(Ordering::Relaxed) {
            debug!(interface = %self.interface, "Service disabled, ignoring frame");
            return None;
        }

        let served = match &inbound {
            Inbound::V4(_) => self.v4.is_some(),
            Inbound::V6(_) => self.v6.is_some(),
        };
        if !served {
            debug!(interface = %self.interface, "Family not served, dropping frame");
            return None;
        }

        let hw_addr = inbound.client_hw_addr();
        if self.is_rate_limited(hw_addr) {
            warn!(interface = %self.interface, "Rate limited: {}", hw_addr);
            return None;
        }

        let server_mac = self.transport.hardware_addr();
        match inbound {
            Inbound::V4(request) => {
                let allocator = self.v4.as_mut()?;
                let reply = allocator.handle(&request.packet).await?;
                Some(encode_reply(
                    &request.packet,
                    &reply,
                    server_mac,
                    allocator.gateway(),
                ))
            }
            Inbound::V6(request) => {
                let allocator = self.v6.as_mut()?;
                let reply = allocator.handle(&request.message, request.src_mac).await?;
                Some(encode_reply6(&request, &reply, server_mac))
            }
        }
    }

    fn is_rate_limited(&mut self, hw_addr: HwAddr) -> bool {
        let now = self.clock.now();
        let window = TimeDelta::seconds(RATE_LIMIT_WINDOW_SECS);

        if self.rate_limiter.len() > RATE_LIMIT_CLEANUP_THRESHOLD {
            self.rate_limiter.retain(|_, timestamps| {
                timestamps.retain(|t| now - *t < window);
                !timestamps.is_empty()
            });
        }

        let timestamps = self.rate_limiter.entry(hw_addr).or_default();
        timestamps.retain(|t| now - *t < window);

        if timestamps.len() >= RATE_LIMIT_MAX_REQUESTS {
            return true;
        }

        timestamps.push(now);
        false
    }
}

/// Resolves once `shutdown` reads true or its sender is gone.
///
/// The borrow `wait_for` hands back is dropped here, so a `select!` using
/// this keeps the enclosing future `Send`.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
