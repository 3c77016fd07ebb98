//! RFC 2132 options.
//!
//! On the wire every option except Pad and End is a code byte, a length
//! byte and that many bytes of value. Options the server never reads or
//! writes are kept as
//! [`DhcpOption::Unknown`] so that decoding a message and encoding it again
//! reproduces it.

use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// Maximum number of IPv4 addresses in one Router (3) or DNS Server (6) option.
///
/// The length field is one byte, so at most 63 four-byte addresses fit.
const MAX_ADDRESSES_PER_OPTION: usize = 63;

/// Maximum option payload length.
const MAX_OPTION_LEN: usize = u8::MAX as usize;

/// DHCP option codes used by this implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    Pad = 0,
    SubnetMask = 1,
    Router = 3,
    DnsServer = 6,
    Hostname = 12,
    DomainName = 15,
    InterfaceMtu = 26,
    BroadcastAddress = 28,
    RequestedIpAddress = 50,
    LeaseTime = 51,
    MessageType = 53,
    ServerIdentifier = 54,
    ParameterRequestList = 55,
    /// Error text sent with a NAK (RFC 2132 §9.9).
    Message = 56,
    RenewalTime = 58,
    RebindingTime = 59,
    ClientIdentifier = 61,
    End = 255,
}

impl OptionCode {
    const KNOWN: [Self; 18] = [
        Self::Pad,
        Self::SubnetMask,
        Self::Router,
        Self::DnsServer,
        Self::Hostname,
        Self::DomainName,
        Self::InterfaceMtu,
        Self::BroadcastAddress,
        Self::RequestedIpAddress,
        Self::LeaseTime,
        Self::MessageType,
        Self::ServerIdentifier,
        Self::ParameterRequestList,
        Self::Message,
        Self::RenewalTime,
        Self::RebindingTime,
        Self::ClientIdentifier,
        Self::End,
    ];
}

/// Fails with the raw code for options this crate has no variant for.
impl TryFrom<u8> for OptionCode {
    type Error = u8;

    fn try_from(code: u8) -> std::result::Result<Self, u8> {
        Self::KNOWN
            .into_iter()
            .find(|known| *known as u8 == code)
            .ok_or(code)
    }
}

/// DHCP message types (Option 53) as defined in RFC 2132 §9.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Client broadcast to locate servers.
    Discover = 1,
    /// Server response to DISCOVER with an address offer.
    Offer = 2,
    /// Client request for offered parameters.
    Request = 3,
    /// Client indicates the address is already in use.
    Decline = 4,
    /// Server acknowledgement with configuration.
    Ack = 5,
    /// Server negative acknowledgement.
    Nak = 6,
    /// Client gives up its address.
    Release = 7,
    /// Client asks for configuration without an address.
    Inform = 8,
}

impl MessageType {
    const ALL: [Self; 8] = [
        Self::Discover,
        Self::Offer,
        Self::Request,
        Self::Decline,
        Self::Ack,
        Self::Nak,
        Self::Release,
        Self::Inform,
    ];
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        Self::ALL
            .into_iter()
            .find(|message_type| *message_type as u8 == value)
            .ok_or(value)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Discover => "DISCOVER",
            Self::Offer => "OFFER",
            Self::Request => "REQUEST",
            Self::Decline => "DECLINE",
            Self::Ack => "ACK",
            Self::Nak => "NAK",
            Self::Release => "RELEASE",
            Self::Inform => "INFORM",
        };
        f.write_str(name)
    }
}

/// A parsed DHCP option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    SubnetMask(Ipv4Addr),
    /// First address is the default gateway.
    Router(Vec<Ipv4Addr>),
    DnsServer(Vec<Ipv4Addr>),
    Hostname(String),
    DomainName(String),
    InterfaceMtu(u16),
    BroadcastAddress(Ipv4Addr),
    RequestedIpAddress(Ipv4Addr),
    /// Lease time in seconds.
    LeaseTime(u32),
    MessageType(MessageType),
    ServerIdentifier(Ipv4Addr),
    /// Option codes the client wants in the reply.
    ParameterRequestList(Vec<u8>),
    Message(String),
    /// T1 in seconds.
    RenewalTime(u32),
    /// T2 in seconds.
    RebindingTime(u32),
    ClientIdentifier(Vec<u8>),
    /// Any other option, kept verbatim.
    Unknown(u8, Vec<u8>),
}

fn ipv4(data: &[u8], what: &str) -> Result<Ipv4Addr> {
    let octets: [u8; 4] = data
        .try_into()
        .map_err(|_| Error::InvalidPacket(format!("Invalid {} length: {}", what, data.len())))?;
    Ok(Ipv4Addr::from(octets))
}

fn ipv4_list(data: &[u8], what: &str) -> Result<Vec<Ipv4Addr>> {
    if data.is_empty() || !data.len().is_multiple_of(4) {
        return Err(Error::InvalidPacket(format!(
            "Invalid {} option length: {}",
            what,
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(4)
        .map(|chunk| Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]))
        .collect())
}

fn seconds(data: &[u8], what: &str) -> Result<u32> {
    let bytes: [u8; 4] = data
        .try_into()
        .map_err(|_| Error::InvalidPacket(format!("Invalid {} length: {}", what, data.len())))?;
    Ok(u32::from_be_bytes(bytes))
}

fn text(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}

fn tlv(code: u8, data: &[u8]) -> Vec<u8> {
    let len = data.len().min(MAX_OPTION_LEN);
    let mut result = Vec::with_capacity(len + 2);
    result.push(code);
    result.push(len as u8);
    result.extend_from_slice(&data[..len]);
    result
}

fn tlv_addresses(code: u8, addrs: &[Ipv4Addr]) -> Vec<u8> {
    let data: Vec<u8> = addrs
        .iter()
        .take(MAX_ADDRESSES_PER_OPTION)
        .flat_map(|addr| addr.octets())
        .collect();
    tlv(code, &data)
}

impl DhcpOption {
    /// Returns the RFC 2132 option code for this option.
    pub fn option_code(&self) -> u8 {
        let code = match self {
            Self::SubnetMask(_) => OptionCode::SubnetMask,
            Self::Router(_) => OptionCode::Router,
            Self::DnsServer(_) => OptionCode::DnsServer,
            Self::Hostname(_) => OptionCode::Hostname,
            Self::DomainName(_) => OptionCode::DomainName,
            Self::InterfaceMtu(_) => OptionCode::InterfaceMtu,
            Self::BroadcastAddress(_) => OptionCode::BroadcastAddress,
            Self::RequestedIpAddress(_) => OptionCode::RequestedIpAddress,
            Self::LeaseTime(_) => OptionCode::LeaseTime,
            Self::MessageType(_) => OptionCode::MessageType,
            Self::ServerIdentifier(_) => OptionCode::ServerIdentifier,
            Self::ParameterRequestList(_) => OptionCode::ParameterRequestList,
            Self::Message(_) => OptionCode::Message,
            Self::RenewalTime(_) => OptionCode::RenewalTime,
            Self::RebindingTime(_) => OptionCode::RebindingTime,
            Self::ClientIdentifier(_) => OptionCode::ClientIdentifier,
            Self::Unknown(code, _) => return *code,
        };
        code as u8
    }

    /// Parses a DHCP option from its code and raw data.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] if the data length is invalid for
    /// the option type (e.g., subnet mask must be exactly 4 bytes), or if
    /// the message type value is unknown.
    pub fn parse(code: u8, data: &[u8]) -> Result<Self> {
        let option = match OptionCode::try_from(code) {
            Ok(OptionCode::SubnetMask) => Self::SubnetMask(ipv4(data, "subnet mask")?),
            Ok(OptionCode::Router) => Self::Router(ipv4_list(data, "router")?),
            Ok(OptionCode::DnsServer) => Self::DnsServer(ipv4_list(data, "DNS server")?),
            Ok(OptionCode::Hostname) => Self::Hostname(text(data)),
            Ok(OptionCode::DomainName) => Self::DomainName(text(data)),
            Ok(OptionCode::InterfaceMtu) => {
                let bytes: [u8; 2] = data
                    .try_into()
                    .map_err(|_| Error::InvalidPacket("Invalid MTU length".to_string()))?;
                Self::InterfaceMtu(u16::from_be_bytes(bytes))
            }
            Ok(OptionCode::BroadcastAddress) => {
                Self::BroadcastAddress(ipv4(data, "broadcast address")?)
            }
            Ok(OptionCode::RequestedIpAddress) => {
                Self::RequestedIpAddress(ipv4(data, "requested IP address")?)
            }
            Ok(OptionCode::LeaseTime) => Self::LeaseTime(seconds(data, "lease time")?),
            Ok(OptionCode::MessageType) => {
                let [value] = data else {
                    return Err(Error::InvalidPacket(
                        "Invalid message type length".to_string(),
                    ));
                };
                let message_type = MessageType::try_from(*value).map_err(|value| {
                    Error::InvalidPacket(format!("Unknown message type: {}", value))
                })?;
                Self::MessageType(message_type)
            }
            Ok(OptionCode::ServerIdentifier) => {
                Self::ServerIdentifier(ipv4(data, "server identifier")?)
            }
            Ok(OptionCode::ParameterRequestList) => Self::ParameterRequestList(data.to_vec()),
            Ok(OptionCode::Message) => Self::Message(text(data)),
            Ok(OptionCode::RenewalTime) => Self::RenewalTime(seconds(data, "renewal time")?),
            Ok(OptionCode::RebindingTime) => {
                Self::RebindingTime(seconds(data, "rebinding time")?)
            }
            Ok(OptionCode::ClientIdentifier) => Self::ClientIdentifier(data.to_vec()),
            Ok(OptionCode::Pad) | Ok(OptionCode::End) => {
                return Err(Error::InvalidPacket(
                    "Pad/End should not be parsed as options".to_string(),
                ));
            }
            Err(unknown) => Self::Unknown(unknown, data.to_vec()),
        };
        Ok(option)
    }

    /// Encodes the option to its wire format (code + length + data).
    pub fn encode(&self) -> Vec<u8> {
        let code = self.option_code();
        match self {
            Self::SubnetMask(addr)
            | Self::BroadcastAddress(addr)
            | Self::RequestedIpAddress(addr)
            | Self::ServerIdentifier(addr) => tlv(code, &addr.octets()),
            Self::Router(addrs) | Self::DnsServer(addrs) => tlv_addresses(code, addrs),
            Self::Hostname(name) | Self::DomainName(name) | Self::Message(name) => {
                tlv(code, name.as_bytes())
            }
            Self::InterfaceMtu(mtu) => tlv(code, &mtu.to_be_bytes()),
            Self::LeaseTime(time) | Self::RenewalTime(time) | Self::RebindingTime(time) => {
                tlv(code, &time.to_be_bytes())
            }
            Self::MessageType(message_type) => vec![code, 1, *message_type as u8],
            Self::ParameterRequestList(data)
            | Self::ClientIdentifier(data)
            | Self::Unknown(_, data) => tlv(code, data),
        }
    }
}
