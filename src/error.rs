//! Error types for the DHCP service.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants.

use std::net::IpAddr;
use std::time::Duration;

/// Errors that can occur while running the DHCP service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or socket I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config or lease files).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed frame or DHCP message received.
    ///
    /// This includes frames that are too short, carry the wrong EtherType,
    /// protocol or ports, have an invalid magic cookie, truncated options,
    /// or no message type option.
    #[error("Invalid DHCP packet: {0}")]
    InvalidPacket(String),

    /// The address pool has no free address left.
    ///
    /// Every address in the range is leased, tentatively reserved or
    /// held back after a decline.
    #[error("No available IP addresses in pool")]
    PoolExhausted,

    /// Invalid service configuration.
    ///
    /// Returned by [`ServerConfig::validate`](crate::ServerConfig::validate).
    /// The service refuses to start when this is returned.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Raw socket creation or configuration error.
    #[error("Socket error: {0}")]
    Socket(String),

    /// Address is outside the pool range it was checked against.
    #[error("Address {0} is outside the configured pool range")]
    AddressOutOfRange(IpAddr),

    /// No lease exists for the given key.
    #[error("Lease {0} not found")]
    LeaseNotFound(String),

    /// A write would break lease store uniqueness.
    ///
    /// Raised when an address is already held by another hardware address,
    /// or when a dynamic write targets a static lease.
    #[error("Lease conflict: {0}")]
    LeaseConflict(String),

    /// Hardware address could not be parsed.
    #[error("Invalid hardware address: {0}")]
    InvalidHwAddr(String),

    /// The transport has no more frames to deliver.
    #[error("Transport closed")]
    TransportClosed,

    /// Interface workers did not stop within the shutdown deadline.
    #[error("Shutdown did not complete within {0:?}")]
    ShutdownTimeout(Duration),
}

/// A specialized Result type for DHCP service operations.
pub type Result<T> = std::result::Result<T, Error>;
