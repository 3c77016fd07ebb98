//! Service configuration.
//!
//! A [`ServerConfig`] is read from a JSON file, created with defaults when
//! the file is missing, and checked by [`ServerConfig::validate`] before
//! anything starts. Each interface carries optional IPv4 and IPv6 settings
//! plus its static leases.

use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::addr::{self, AddrFamily};
use crate::error::{Error, Result};
use crate::hwaddr::HwAddr;

/// Largest pool a single range may describe.
pub const MAX_RANGE_LEN: u128 = 1 << 16;

const MAX_HOSTNAME_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub enabled: bool,
    pub leases_file: PathBuf,
    #[serde(default)]
    pub interfaces: BTreeMap<String, InterfaceConfig>,
    /// How long an offered address stays reserved without a REQUEST.
    #[serde(default = "default_offer_timeout")]
    pub offer_timeout_seconds: u32,
    /// How long a declined address is kept out of allocation.
    #[serde(default = "default_decline_hold")]
    pub decline_hold_seconds: u32,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
    #[serde(default = "default_persist_interval")]
    pub persist_interval_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    #[serde(default)]
    pub ipv4: Option<Ipv4Config>,
    #[serde(default)]
    pub ipv6: Option<Ipv6Config>,
    #[serde(default)]
    pub static_leases: Vec<StaticLease>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ipv4Config {
    pub enabled: bool,
    /// Server address on the interface; also sent as router and server identifier.
    pub gateway: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
    pub lease_duration_seconds: u32,
    #[serde(default)]
    pub dns_servers: Vec<Ipv4Addr>,
    #[serde(default)]
    pub domain_name: Option<String>,
    #[serde(default)]
    pub renewal_time_seconds: Option<u32>,
    #[serde(default)]
    pub rebinding_time_seconds: Option<u32>,
    #[serde(default)]
    pub mtu: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ipv6Config {
    pub enabled: bool,
    pub range_start: Ipv6Addr,
    pub range_end: Ipv6Addr,
    /// Valid and preferred lifetime of an assigned address.
    pub lease_duration_seconds: u32,
    /// Recursive DNS servers, sent to clients that ask for option 23.
    #[serde(default)]
    pub dns_servers: Vec<Ipv6Addr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticLease {
    pub mac_address: HwAddr,
    pub ip_address: IpAddr,
    #[serde(default)]
    pub hostname: Option<String>,
}

fn default_offer_timeout() -> u32 {
    60
}

fn default_decline_hold() -> u32 {
    3600
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_persist_interval() -> u64 {
    5
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            leases_file: PathBuf::from("leases.json"),
            interfaces: BTreeMap::from([("eth0".to_string(), InterfaceConfig::default())]),
            offer_timeout_seconds: default_offer_timeout(),
            decline_hold_seconds: default_decline_hold(),
            sweep_interval_seconds: default_sweep_interval(),
            persist_interval_seconds: default_persist_interval(),
        }
    }
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            ipv4: Some(Ipv4Config::default()),
            ipv6: None,
            static_leases: Vec::new(),
        }
    }
}

impl Default for Ipv4Config {
    fn default() -> Self {
        Self {
            enabled: true,
            gateway: Ipv4Addr::new(192, 168, 1, 1),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            range_start: Ipv4Addr::new(192, 168, 1, 100),
            range_end: Ipv4Addr::new(192, 168, 1, 200),
            lease_duration_seconds: 86400,
            dns_servers: vec![Ipv4Addr::new(192, 168, 1, 1)],
            domain_name: None,
            renewal_time_seconds: None,
            rebinding_time_seconds: None,
            mtu: None,
        }
    }
}

impl Default for Ipv6Config {
    fn default() -> Self {
        Self {
            enabled: false,
            range_start: Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 0x100),
            range_end: Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 0x1ff),
            lease_duration_seconds: 86400,
            dns_servers: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Reads the config file, writing a default one first if it doesn't exist.
    pub async fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if tokio::fs::try_exists(path).await? {
            let content = tokio::fs::read_to_string(path).await?;
            let config: ServerConfig = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = ServerConfig::default();
            config.save(path).await?;
            Ok(config)
        }
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    /// Checks everything the service relies on at startup.
    ///
    /// A disabled configuration is not checked.
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        if self.leases_file.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(
                "leases_file must not be empty".to_string(),
            ));
        }

        if self.interfaces.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one interface must be configured".to_string(),
            ));
        }

        if self.offer_timeout_seconds == 0 || self.decline_hold_seconds == 0 {
            return Err(Error::InvalidConfig(
                "offer_timeout_seconds and decline_hold_seconds must be greater than 0"
                    .to_string(),
            ));
        }

        if self.sweep_interval_seconds == 0 || self.persist_interval_seconds == 0 {
            return Err(Error::InvalidConfig(
                "sweep_interval_seconds and persist_interval_seconds must be greater than 0"
                    .to_string(),
            ));
        }

        for (name, interface) in &self.interfaces {
            if name.is_empty() {
                return Err(Error::InvalidConfig(
                    "interface name must not be empty".to_string(),
                ));
            }
            interface
                .validate()
                .map_err(|message| Error::InvalidConfig(format!("interface {}: {}", name, message)))?;
        }

        Ok(())
    }
}

impl InterfaceConfig {
    /// Returns the IPv4 settings when present and enabled.
    pub fn ipv4_enabled(&self) -> Option<&Ipv4Config> {
        self.ipv4.as_ref().filter(|v4| v4.enabled)
    }

    /// Returns the IPv6 settings when present and enabled.
    pub fn ipv6_enabled(&self) -> Option<&Ipv6Config> {
        self.ipv6.as_ref().filter(|v6| v6.enabled)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if let Some(v4) = self.ipv4_enabled() {
            v4.validate()?;
        }
        if let Some(v6) = self.ipv6_enabled() {
            v6.validate()?;
        }

        let mut hardware = HashSet::new();
        let mut addresses = HashSet::new();
        let mut hostnames = HashSet::new();

        for lease in &self.static_leases {
            let family = AddrFamily::of(lease.ip_address);
            match lease.ip_address {
                IpAddr::V4(ip) => {
                    let Some(v4) = self.ipv4_enabled() else {
                        return Err(format!(
                            "static lease {} needs ipv4 to be enabled",
                            lease.ip_address
                        ));
                    };
                    if ip == v4.gateway {
                        return Err(format!("static lease {} is the gateway address", ip));
                    }
                }
                IpAddr::V6(_) => {
                    if self.ipv6_enabled().is_none() {
                        return Err(format!(
                            "static lease {} needs ipv6 to be enabled",
                            lease.ip_address
                        ));
                    }
                }
            }

            if !hardware.insert((family, lease.mac_address)) {
                return Err(format!(
                    "duplicate {} static lease for {}",
                    family, lease.mac_address
                ));
            }

            if !addresses.insert(lease.ip_address) {
                return Err(format!("static leases overlap at {}", lease.ip_address));
            }

            if let Some(hostname) = &lease.hostname {
                let sanitized = sanitize_hostname(hostname);
                if sanitized.is_empty() {
                    return Err(format!("static lease {} has an invalid hostname", lease.ip_address));
                }
                if !hostnames.insert(sanitized.to_ascii_lowercase()) {
                    return Err(format!("duplicate static hostname {}", sanitized));
                }
            }
        }

        Ok(())
    }
}

impl Ipv4Config {
    fn validate(&self) -> std::result::Result<(), String> {
        let len = addr::range_len(self.range_start.into(), self.range_end.into())
            .ok_or("range_start must be less than or equal to range_end")?;
        if len > MAX_RANGE_LEN {
            return Err(format!("range of {} addresses exceeds {}", len, MAX_RANGE_LEN));
        }

        let mask = u32::from(self.subnet_mask);
        if mask == 0 || mask.leading_ones() + mask.trailing_zeros() != 32 {
            return Err(format!("subnet_mask {} is not contiguous", self.subnet_mask));
        }

        if !self.in_subnet(self.range_start) || !self.in_subnet(self.range_end) {
            return Err(format!(
                "range {}-{} is outside the subnet of {}",
                self.range_start, self.range_end, self.gateway
            ));
        }

        let network = Ipv4Addr::from(u32::from(self.gateway) & mask);
        if self.contains(network) || self.contains(self.broadcast()) {
            return Err("range must not include the network or broadcast address".to_string());
        }

        if self.contains(self.gateway) {
            return Err("gateway must not be within the range".to_string());
        }

        if self.lease_duration_seconds == 0 {
            return Err("lease_duration_seconds must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Returns true if `ip` is inside `range_start..=range_end`.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        (self.range_start..=self.range_end).contains(&ip)
    }

    /// Returns true if `ip` shares the gateway's subnet.
    pub fn in_subnet(&self, ip: Ipv4Addr) -> bool {
        let mask = u32::from(self.subnet_mask);
        u32::from(ip) & mask == u32::from(self.gateway) & mask
    }

    pub fn pool_size(&self) -> u32 {
        u32::from(self.range_end)
            .saturating_sub(u32::from(self.range_start))
            .saturating_add(1)
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.gateway) | !u32::from(self.subnet_mask))
    }
}

impl Ipv6Config {
    fn validate(&self) -> std::result::Result<(), String> {
        let len = addr::range_len(self.range_start.into(), self.range_end.into())
            .ok_or("ipv6 range_start must be less than or equal to range_end")?;
        if len > MAX_RANGE_LEN {
            return Err(format!("ipv6 range of {} addresses exceeds {}", len, MAX_RANGE_LEN));
        }
        if self.lease_duration_seconds == 0 {
            return Err("ipv6 lease_duration_seconds must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Reduces a client-supplied hostname to a DNS-safe label sequence.
///
/// Keeps ASCII letters, digits, `-` and `.`, strips leading and trailing
/// separators, and caps the result at 63 characters.
pub fn sanitize_hostname(name: &str) -> String {
    let kept: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '.')
        .take(MAX_HOSTNAME_LEN)
        .collect();
    kept.trim_matches(|c| c == '-' || c == '.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn home_v4() -> Ipv4Config {
        Ipv4Config {
            gateway: Ipv4Addr::new(192, 168, 0, 1),
            range_start: Ipv4Addr::new(192, 168, 0, 100),
            range_end: Ipv4Addr::new(192, 168, 0, 200),
            ..Default::default()
        }
    }

    fn with_interface(interface: InterfaceConfig) -> ServerConfig {
        ServerConfig {
            interfaces: BTreeMap::from([("br0".to_string(), interface)]),
            ..Default::default()
        }
    }

    fn static_lease(mac: &str, ip: &str, hostname: Option<&str>) -> StaticLease {
        StaticLease {
            mac_address: mac.parse().unwrap(),
            ip_address: ip.parse().unwrap(),
            hostname: hostname.map(str::to_string),
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_range_start_greater_than_end() {
        let config = with_interface(InterfaceConfig {
            ipv4: Some(Ipv4Config {
                range_start: Ipv4Addr::new(192, 168, 0, 200),
                range_end: Ipv4Addr::new(192, 168, 0, 100),
                ..home_v4()
            }),
            ..Default::default()
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("br0"));
    }

    #[test]
    fn test_gateway_in_range() {
        let config = with_interface(InterfaceConfig {
            ipv4: Some(Ipv4Config {
                gateway: Ipv4Addr::new(192, 168, 0, 150),
                ..home_v4()
            }),
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_range_outside_subnet() {
        let config = with_interface(InterfaceConfig {
            ipv4: Some(Ipv4Config {
                range_end: Ipv4Addr::new(192, 168, 1, 20),
                ..home_v4()
            }),
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_range_covering_broadcast() {
        let config = with_interface(InterfaceConfig {
            ipv4: Some(Ipv4Config {
                range_end: Ipv4Addr::new(192, 168, 0, 255),
                ..home_v4()
            }),
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_non_contiguous_mask() {
        let config = with_interface(InterfaceConfig {
            ipv4: Some(Ipv4Config {
                subnet_mask: Ipv4Addr::new(255, 0, 255, 0),
                ..home_v4()
            }),
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_lease_duration() {
        let config = with_interface(InterfaceConfig {
            ipv4: Some(Ipv4Config {
                lease_duration_seconds: 0,
                ..home_v4()
            }),
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_static_leases_valid_outside_range() {
        let config = with_interface(InterfaceConfig {
            ipv4: Some(home_v4()),
            static_leases: vec![static_lease("aa:bb:cc:dd:ee:01", "192.168.0.50", Some("printer"))],
            ..Default::default()
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overlapping_static_leases() {
        let config = with_interface(InterfaceConfig {
            ipv4: Some(home_v4()),
            static_leases: vec![
                static_lease("aa:bb:cc:dd:ee:01", "192.168.0.50", None),
                static_lease("aa:bb:cc:dd:ee:02", "192.168.0.50", None),
            ],
            ..Default::default()
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn test_duplicate_static_hardware_address() {
        let config = with_interface(InterfaceConfig {
            ipv4: Some(home_v4()),
            static_leases: vec![
                static_lease("aa:bb:cc:dd:ee:01", "192.168.0.50", None),
                static_lease("AA-BB-CC-DD-EE-01", "192.168.0.51", None),
            ],
            ..Default::default()
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_duplicate_static_hostname() {
        let config = with_interface(InterfaceConfig {
            ipv4: Some(home_v4()),
            static_leases: vec![
                static_lease("aa:bb:cc:dd:ee:01", "192.168.0.50", Some("nas")),
                static_lease("aa:bb:cc:dd:ee:02", "192.168.0.51", Some("NAS")),
            ],
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_static_lease_on_gateway() {
        let config = with_interface(InterfaceConfig {
            ipv4: Some(home_v4()),
            static_leases: vec![static_lease("aa:bb:cc:dd:ee:01", "192.168.0.1", None)],
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_static_ipv6_lease_requires_ipv6() {
        let mut interface = InterfaceConfig {
            ipv4: Some(home_v4()),
            static_leases: vec![static_lease("aa:bb:cc:dd:ee:01", "fd00::10", None)],
            ..Default::default()
        };
        assert!(with_interface(interface.clone()).validate().is_err());

        interface.ipv6 = Some(Ipv6Config {
            enabled: true,
            ..Default::default()
        });
        assert!(with_interface(interface).validate().is_ok());
    }

    #[test]
    fn test_same_mac_in_both_families_allowed() {
        let config = with_interface(InterfaceConfig {
            ipv4: Some(home_v4()),
            ipv6: Some(Ipv6Config {
                enabled: true,
                ..Default::default()
            }),
            static_leases: vec![
                static_lease("aa:bb:cc:dd:ee:01", "192.168.0.50", None),
                static_lease("aa:bb:cc:dd:ee:01", "fd00::50", None),
            ],
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ipv6_inverted_range() {
        let config = with_interface(InterfaceConfig {
            ipv4: None,
            ipv6: Some(Ipv6Config {
                enabled: true,
                range_start: "fd00::200".parse().unwrap(),
                range_end: "fd00::100".parse().unwrap(),
                lease_duration_seconds: 3600,
                dns_servers: Vec::new(),
            }),
            static_leases: Vec::new(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_disabled_config_skips_validation() {
        let config = ServerConfig {
            enabled: false,
            interfaces: BTreeMap::new(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_no_interfaces() {
        let config = ServerConfig {
            interfaces: BTreeMap::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_contains_and_pool_size() {
        let v4 = home_v4();
        assert!(v4.contains(Ipv4Addr::new(192, 168, 0, 150)));
        assert!(!v4.contains(Ipv4Addr::new(192, 168, 0, 50)));
        assert!(!v4.contains(Ipv4Addr::new(192, 168, 0, 250)));
        assert_eq!(v4.pool_size(), 101);
        assert_eq!(v4.broadcast(), Ipv4Addr::new(192, 168, 0, 255));
    }

    #[test]
    fn test_sanitize_hostname() {
        assert_eq!(sanitize_hostname("printer"), "printer");
        assert_eq!(sanitize_hostname("  my laptop!  "), "mylaptop");
        assert_eq!(sanitize_hostname("-host.lan."), "host.lan");
        assert_eq!(sanitize_hostname("ünïcode"), "ncode");
        assert_eq!(sanitize_hostname(&"a".repeat(100)).len(), MAX_HOSTNAME_LEN);
        assert_eq!(sanitize_hostname("!!!"), "");
    }

    #[test]
    fn test_serde_defaults() {
        let json = r#"{
            "enabled": true,
            "leases_file": "/tmp/leases.json",
            "interfaces": {
                "br0": {
                    "ipv4": {
                        "enabled": true,
                        "gateway": "192.168.0.1",
                        "subnet_mask": "255.255.255.0",
                        "range_start": "192.168.0.100",
                        "range_end": "192.168.0.200",
                        "lease_duration_seconds": 86400
                    },
                    "static_leases": [
                        { "mac_address": "aa:bb:cc:dd:ee:01", "ip_address": "192.168.0.50", "hostname": "printer" }
                    ]
                }
            }
        }"#;
        let config: ServerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.offer_timeout_seconds, 60);
        assert_eq!(config.decline_hold_seconds, 3600);
        assert!(config.interfaces["br0"].ipv6.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ipv6_only_interface() {
        let json = r#"{
            "enabled": true,
            "leases_file": "/tmp/leases.json",
            "interfaces": {
                "lan6": {
                    "ipv4": null,
                    "ipv6": {
                        "enabled": true,
                        "range_start": "fd00::100",
                        "range_end": "fd00::1ff",
                        "lease_duration_seconds": 3600
                    }
                }
            }
        }"#;
        let config: ServerConfig = serde_json::from_str(json).unwrap();
        let interface = &config.interfaces["lan6"];
        assert!(interface.ipv4_enabled().is_none());
        assert!(interface.ipv6_enabled().unwrap().dns_servers.is_empty());
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_load_or_create_writes_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let created = ServerConfig::load_or_create(&path).await.unwrap();
        assert!(path.exists());

        let loaded = ServerConfig::load_or_create(&path).await.unwrap();
        assert_eq!(created, loaded);
    }
}
