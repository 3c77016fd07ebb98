//! The DHCP service: one worker per interface plus lease housekeeping.
//!
//! [`Service`] opens every interface's transport before it spawns anything,
//! so a bad interface fails [`start`](Service::start) without leaving half
//! the workers running. A background task sweeps expired leases and
//! persists the lease database on fixed intervals. [`shutdown`](Service::shutdown)
//! signals every task, waits for them within a deadline, and writes the
//! lease file one last time.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::addr::AddrFamily;
use crate::allocator::Allocator;
use crate::allocator6::Allocator6;
use crate::clock::Clock;
use crate::config::{ServerConfig, StaticLease};
use crate::db::LeaseDb;
use crate::error::{Error, Result};
use crate::hwaddr::HwAddr;
use crate::lease::Lease;
use crate::server::{InterfaceServer, stopped};
use crate::transport::{Transport, TransportProvider};

const HOUSEKEEPING_TASK: &str = "housekeeping";

pub struct Service {
    config: ServerConfig,
    db: Arc<LeaseDb>,
    clock: Arc<dyn Clock>,
    enabled: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<(String, JoinHandle<Result<()>>)>>,
}

impl Service {
    /// Validates `config` and opens the lease database.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an invalid configuration, or
    /// the error from [`LeaseDb::open`].
    pub async fn new(config: ServerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let db = Arc::new(LeaseDb::open(&config, Arc::clone(&clock)).await?);
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            enabled: Arc::new(AtomicBool::new(config.enabled)),
            config,
            db,
            clock,
            shutdown,
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn db(&self) -> &Arc<LeaseDb> {
        &self.db
    }

    /// Starts one worker per interface with IPv4 or IPv6 enabled, plus
    /// housekeeping.
    ///
    /// Does nothing when the configuration is disabled or the service is
    /// already running.
    ///
    /// # Errors
    ///
    /// Returns the first transport that fails to open. No worker is
    /// started in that case.
    pub async fn start<P: TransportProvider>(&self, provider: &P) -> Result<()> {
        if !self.config.enabled {
            info!("DHCP service disabled in configuration");
            return Ok(());
        }

        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            debug!("DHCP service already running");
            return Ok(());
        }

        let mut servers = Vec::new();
        for (name, interface) in &self.config.interfaces {
            let v4 = interface.ipv4_enabled();
            let v6 = interface.ipv6_enabled();
            if v4.is_none() && v6.is_none() {
                info!("Interface {} has no DHCP service, not listening", name);
                continue;
            }

            let transport = provider.open(name)?;
            let server_mac = transport.hardware_addr();
            let mut server = InterfaceServer::new(
                name.as_str(),
                transport,
                Arc::clone(&self.clock),
                Arc::clone(&self.enabled),
            );
            if let Some(v4) = v4 {
                server = server.with_v4(Allocator::new(
                    name.as_str(),
                    v4.clone(),
                    &self.config,
                    Arc::clone(&self.db),
                ));
            }
            if let Some(v6) = v6 {
                server = server.with_v6(Allocator6::new(
                    name.as_str(),
                    v6.clone(),
                    &self.config,
                    Arc::clone(&self.db),
                    server_mac,
                ));
            }
            servers.push(server);
        }

        self.shutdown.send_replace(false);

        for server in servers {
            let name = server.interface().to_string();
            info!("Starting DHCP worker for {}", name);
            let handle = tokio::spawn(server.run(self.shutdown.subscribe()));
            workers.push((name, handle));
        }

        let handle = tokio::spawn(housekeeping(
            Arc::clone(&self.db),
            Duration::from_secs(self.config.sweep_interval_seconds),
            Duration::from_secs(self.config.persist_interval_seconds),
            self.shutdown.subscribe(),
        ));
        workers.push((HOUSEKEEPING_TASK.to_string(), handle));

        Ok(())
    }

    /// Names of the interfaces with a running worker.
    pub async fn running_interfaces(&self) -> Vec<String> {
        self.workers
            .lock()
            .await
            .iter()
            .filter(|(name, handle)| name != HOUSEKEEPING_TASK && !handle.is_finished())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Stops every task and saves the lease database, all within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShutdownTimeout`] if the tasks are still running
    /// after `timeout`, in which case they are aborted and the leases are
    /// saved with whatever time is left, or if that save does not finish
    /// before the deadline. Otherwise returns the result of the final save.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        self.shutdown.send_replace(true);

        let workers = std::mem::take(&mut *self.workers.lock().await);
        let aborts: Vec<_> = workers
            .iter()
            .map(|(_, handle)| handle.abort_handle())
            .collect();

        let joined = tokio::time::timeout_at(deadline, async {
            for (name, handle) in workers {
                match handle.await {
                    Ok(Ok(())) => debug!("{} stopped", name),
                    Ok(Err(error)) => warn!("{} stopped with error: {}", name, error),
                    Err(error) => error!("{} failed: {}", name, error),
                }
            }
        })
        .await;

        if joined.is_err() {
            for abort in aborts {
                abort.abort();
            }
        }

        let saved = match tokio::time::timeout_at(deadline, self.db.persist()).await {
            Ok(saved) => saved,
            Err(_) => {
                error!("Final lease save did not finish within {:?}", timeout);
                return Err(Error::ShutdownTimeout(timeout));
            }
        };
        if let Err(error) = &saved {
            error!("Failed to save leases on shutdown: {}", error);
        }

        match joined {
            Ok(()) => {
                info!("DHCP service stopped");
                saved
            }
            Err(_) => Err(Error::ShutdownTimeout(timeout)),
        }
    }

    /// Turns serving on or off without stopping the workers.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        info!("DHCP service {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub async fn leases(&self) -> Vec<Lease> {
        self.db.leases().await
    }

    pub async fn host_by_ip(&self, ip: IpAddr) -> Option<String> {
        self.db.host_by_ip(ip).await
    }

    pub async fn mac_by_ip(&self, ip: IpAddr) -> Option<HwAddr> {
        self.db.mac_by_ip(ip).await
    }

    pub async fn ip_by_host(&self, hostname: &str) -> Option<IpAddr> {
        self.db.ip_by_host(hostname).await
    }

    pub async fn add_static_lease(&self, interface: &str, lease: &StaticLease) -> Result<()> {
        if !self.config.interfaces.contains_key(interface) {
            return Err(Error::InvalidConfig(format!("unknown interface {}", interface)));
        }
        self.db.add_static_lease(interface, lease).await
    }

    pub async fn remove_static_lease(
        &self,
        interface: &str,
        family: AddrFamily,
        hw_addr: HwAddr,
    ) -> Result<Lease> {
        self.db.remove_static_lease(interface, family, hw_addr).await
    }

    /// Drops every dynamic lease and outstanding offer.
    pub async fn reset(&self) -> usize {
        self.db.reset().await
    }

    /// Removes expired leases now instead of waiting for housekeeping.
    pub async fn sweep_expired(&self) -> usize {
        self.db.sweep_expired().await
    }

    pub async fn persist(&self) -> Result<()> {
        self.db.persist().await
    }
}

async fn housekeeping(
    db: Arc<LeaseDb>,
    sweep_every: Duration,
    persist_every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut sweep = tokio::time::interval(sweep_every);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut persist = tokio::time::interval(persist_every);
    persist.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = stopped(&mut shutdown) => break,
            _ = sweep.tick() => {
                let removed = db.sweep_expired().await;
                if removed > 0 {
                    debug!("Swept {} expired lease(s)", removed);
                }
            }
            _ = persist.tick() => {
                if let Err(error) = db.persist_if_dirty().await {
                    warn!("Failed to save leases, will retry: {}", error);
                }
            }
        }
    }

    Ok(())
}
