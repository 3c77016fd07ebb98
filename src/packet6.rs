//! DHCPv6 messages (RFC 8415).
//!
//! A client/server message is a type byte, a 24-bit transaction id and a
//! run of options. Each option is a 16-bit code, a 16-bit length and that
//! many bytes of value; IA_NA and IA Address options carry further options
//! inside their value. Options the server does not interpret are kept as
//! [`Dhcp6Option::Unknown`].
//!
//! Relay-forward and relay-reply messages are not handled.

use std::fmt;
use std::net::Ipv6Addr;

use crate::error::{Error, Result};
use crate::hwaddr::HwAddr;

/// UDP port DHCPv6 clients listen on.
pub const DHCP6_CLIENT_PORT: u16 = 546;

/// UDP port DHCPv6 servers listen on.
pub const DHCP6_SERVER_PORT: u16 = 547;

/// All_DHCP_Relay_Agents_and_Servers.
pub const ALL_DHCP_SERVERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 1, 2);

const MESSAGE_HEADER_LEN: usize = 4;
const IA_NA_FIXED_LEN: usize = 12;
const IA_ADDR_FIXED_LEN: usize = 24;
const MAX_TRANSACTION_ID: u32 = 0x00ff_ffff;

/// A DUID is at most 128 bytes after its 2-byte type.
const MAX_DUID_LEN: usize = 130;

const DUID_LLT: u16 = 1;
const DUID_LL: u16 = 3;
const HW_TYPE_ETHERNET: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Dhcp6MessageType {
    Solicit = 1,
    Advertise = 2,
    Request = 3,
    Confirm = 4,
    Renew = 5,
    Rebind = 6,
    Reply = 7,
    Release = 8,
    Decline = 9,
    Reconfigure = 10,
    InformationRequest = 11,
}

impl Dhcp6MessageType {
    const ALL: [Self; 11] = [
        Self::Solicit,
        Self::Advertise,
        Self::Request,
        Self::Confirm,
        Self::Renew,
        Self::Rebind,
        Self::Reply,
        Self::Release,
        Self::Decline,
        Self::Reconfigure,
        Self::InformationRequest,
    ];

    /// True for the messages a client sends to a server.
    pub fn is_client_message(self) -> bool {
        !matches!(self, Self::Advertise | Self::Reply | Self::Reconfigure)
    }
}

impl TryFrom<u8> for Dhcp6MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        Self::ALL
            .into_iter()
            .find(|message_type| *message_type as u8 == value)
            .ok_or(value)
    }
}

impl fmt::Display for Dhcp6MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Solicit => "SOLICIT",
            Self::Advertise => "ADVERTISE",
            Self::Request => "REQUEST",
            Self::Confirm => "CONFIRM",
            Self::Renew => "RENEW",
            Self::Rebind => "REBIND",
            Self::Reply => "REPLY",
            Self::Release => "RELEASE",
            Self::Decline => "DECLINE",
            Self::Reconfigure => "RECONFIGURE",
            Self::InformationRequest => "INFORMATION-REQUEST",
        };
        f.write_str(name)
    }
}

/// DHCPv6 option codes this crate reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Dhcp6OptionCode {
    ClientId = 1,
    ServerId = 2,
    IaNa = 3,
    IaAddr = 5,
    OptionRequest = 6,
    Preference = 7,
    ElapsedTime = 8,
    StatusCode = 13,
    RapidCommit = 14,
    DnsServers = 23,
    ClientFqdn = 39,
}

/// Status Code option values (RFC 8415 §21.13).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum StatusCode {
    Success = 0,
    UnspecFail = 1,
    NoAddrsAvail = 2,
    NoBinding = 3,
    NotOnLink = 4,
    UseMulticast = 5,
}

impl StatusCode {
    const ALL: [Self; 6] = [
        Self::Success,
        Self::UnspecFail,
        Self::NoAddrsAvail,
        Self::NoBinding,
        Self::NotOnLink,
        Self::UseMulticast,
    ];
}

impl TryFrom<u16> for StatusCode {
    type Error = u16;

    fn try_from(value: u16) -> std::result::Result<Self, u16> {
        Self::ALL
            .into_iter()
            .find(|status| *status as u16 == value)
            .ok_or(value)
    }
}

/// Identity Association for Non-temporary Addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IaNa {
    pub iaid: u32,
    pub t1: u32,
    pub t2: u32,
    pub options: Vec<Dhcp6Option>,
}

impl IaNa {
    pub fn addresses(&self) -> impl Iterator<Item = &IaAddress> {
        self.options.iter().filter_map(|option| match option {
            Dhcp6Option::IaAddr(address) => Some(address),
            _ => None,
        })
    }

    /// The first address the client listed, if any.
    pub fn first_address(&self) -> Option<Ipv6Addr> {
        self.addresses().next().map(|address| address.addr)
    }

    pub fn status(&self) -> Option<StatusCode> {
        status_of(&self.options)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IaAddress {
    pub addr: Ipv6Addr,
    pub preferred_lifetime: u32,
    pub valid_lifetime: u32,
    pub options: Vec<Dhcp6Option>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dhcp6Option {
    /// Client DUID.
    ClientId(Vec<u8>),
    /// Server DUID.
    ServerId(Vec<u8>),
    IaNa(IaNa),
    IaAddr(IaAddress),
    /// Option codes the client wants in the reply.
    OptionRequest(Vec<u16>),
    Preference(u8),
    /// Hundredths of a second since the client began the exchange.
    ElapsedTime(u16),
    StatusCode(StatusCode, String),
    RapidCommit,
    DnsServers(Vec<Ipv6Addr>),
    /// Flags byte followed by a wire-format domain name (RFC 4704).
    ClientFqdn(Vec<u8>),
    Unknown(u16, Vec<u8>),
}

fn malformed(what: &str, len: usize) -> Error {
    Error::InvalidPacket(format!("Invalid DHCPv6 {} option length: {}", what, len))
}

fn be_u32(bytes: &[u8]) -> u32 {
    bytes
        .get(..4)
        .and_then(|head| head.try_into().ok())
        .map(u32::from_be_bytes)
        .unwrap_or(0)
}

fn ipv6_at(bytes: &[u8]) -> Ipv6Addr {
    let octets: [u8; 16] = bytes
        .get(..16)
        .and_then(|head| head.try_into().ok())
        .unwrap_or([0; 16]);
    Ipv6Addr::from(octets)
}

fn wire_len(len: usize) -> u16 {
    u16::try_from(len).unwrap_or(u16::MAX)
}

fn status_of(options: &[Dhcp6Option]) -> Option<StatusCode> {
    options.iter().find_map(|option| match option {
        Dhcp6Option::StatusCode(status, _) => Some(*status),
        _ => None,
    })
}

impl Dhcp6Option {
    pub fn code(&self) -> u16 {
        let code = match self {
            Self::ClientId(_) => Dhcp6OptionCode::ClientId,
            Self::ServerId(_) => Dhcp6OptionCode::ServerId,
            Self::IaNa(_) => Dhcp6OptionCode::IaNa,
            Self::IaAddr(_) => Dhcp6OptionCode::IaAddr,
            Self::OptionRequest(_) => Dhcp6OptionCode::OptionRequest,
            Self::Preference(_) => Dhcp6OptionCode::Preference,
            Self::ElapsedTime(_) => Dhcp6OptionCode::ElapsedTime,
            Self::StatusCode(..) => Dhcp6OptionCode::StatusCode,
            Self::RapidCommit => Dhcp6OptionCode::RapidCommit,
            Self::DnsServers(_) => Dhcp6OptionCode::DnsServers,
            Self::ClientFqdn(_) => Dhcp6OptionCode::ClientFqdn,
            Self::Unknown(code, _) => return *code,
        };
        code as u16
    }

    fn decode(code: u16, value: &[u8]) -> Result<Self> {
        let len = value.len();
        let option = match code {
            1 | 2 => {
                if !(2..=MAX_DUID_LEN).contains(&len) {
                    return Err(malformed("DUID", len));
                }
                if code == 1 {
                    Self::ClientId(value.to_vec())
                } else {
                    Self::ServerId(value.to_vec())
                }
            }
            3 => {
                if len < IA_NA_FIXED_LEN {
                    return Err(malformed("IA_NA", len));
                }
                Self::IaNa(IaNa {
                    iaid: be_u32(value),
                    t1: be_u32(&value[4..]),
                    t2: be_u32(&value[8..]),
                    options: parse_options(&value[IA_NA_FIXED_LEN..])?,
                })
            }
            5 => {
                if len < IA_ADDR_FIXED_LEN {
                    return Err(malformed("IA Address", len));
                }
                Self::IaAddr(IaAddress {
                    addr: ipv6_at(value),
                    preferred_lifetime: be_u32(&value[16..]),
                    valid_lifetime: be_u32(&value[20..]),
                    options: parse_options(&value[IA_ADDR_FIXED_LEN..])?,
                })
            }
            6 => {
                if len % 2 != 0 {
                    return Err(malformed("Option Request", len));
                }
                Self::OptionRequest(
                    value
                        .chunks_exact(2)
                        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                        .collect(),
                )
            }
            7 => match value {
                [preference] => Self::Preference(*preference),
                _ => return Err(malformed("Preference", len)),
            },
            8 => match value {
                [high, low] => Self::ElapsedTime(u16::from_be_bytes([*high, *low])),
                _ => return Err(malformed("Elapsed Time", len)),
            },
            13 => {
                let Some((status, message)) = value.split_first_chunk::<2>() else {
                    return Err(malformed("Status Code", len));
                };
                match StatusCode::try_from(u16::from_be_bytes(*status)) {
                    Ok(status) => {
                        Self::StatusCode(status, String::from_utf8_lossy(message).into_owned())
                    }
                    Err(_) => Self::Unknown(code, value.to_vec()),
                }
            }
            14 => {
                if len != 0 {
                    return Err(malformed("Rapid Commit", len));
                }
                Self::RapidCommit
            }
            23 => {
                if len == 0 || len % 16 != 0 {
                    return Err(malformed("DNS Recursive Name Server", len));
                }
                Self::DnsServers(value.chunks_exact(16).map(ipv6_at).collect())
            }
            39 => {
                if len == 0 {
                    return Err(malformed("Client FQDN", len));
                }
                Self::ClientFqdn(value.to_vec())
            }
            _ => Self::Unknown(code, value.to_vec()),
        };
        Ok(option)
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.code().to_be_bytes());
        let len_at = out.len();
        out.extend_from_slice(&[0, 0]);

        match self {
            Self::ClientId(data)
            | Self::ServerId(data)
            | Self::ClientFqdn(data)
            | Self::Unknown(_, data) => out.extend_from_slice(data),
            Self::IaNa(ia) => {
                out.extend_from_slice(&ia.iaid.to_be_bytes());
                out.extend_from_slice(&ia.t1.to_be_bytes());
                out.extend_from_slice(&ia.t2.to_be_bytes());
                for option in &ia.options {
                    option.encode_into(out);
                }
            }
            Self::IaAddr(address) => {
                out.extend_from_slice(&address.addr.octets());
                out.extend_from_slice(&address.preferred_lifetime.to_be_bytes());
                out.extend_from_slice(&address.valid_lifetime.to_be_bytes());
                for option in &address.options {
                    option.encode_into(out);
                }
            }
            Self::OptionRequest(codes) => {
                for code in codes {
                    out.extend_from_slice(&code.to_be_bytes());
                }
            }
            Self::Preference(preference) => out.push(*preference),
            Self::ElapsedTime(elapsed) => out.extend_from_slice(&elapsed.to_be_bytes()),
            Self::StatusCode(status, message) => {
                out.extend_from_slice(&(*status as u16).to_be_bytes());
                out.extend_from_slice(message.as_bytes());
            }
            Self::RapidCommit => {}
            Self::DnsServers(servers) => {
                for server in servers {
                    out.extend_from_slice(&server.octets());
                }
            }
        }

        let len = wire_len(out.len() - len_at - 2);
        out[len_at..len_at + 2].copy_from_slice(&len.to_be_bytes());
    }
}

/// Parses a run of options filling `data` exactly.
fn parse_options(mut data: &[u8]) -> Result<Vec<Dhcp6Option>> {
    let mut options = Vec::new();
    while !data.is_empty() {
        let Some((header, rest)) = data.split_first_chunk::<4>() else {
            return Err(Error::InvalidPacket(
                "DHCPv6 option header truncated".to_string(),
            ));
        };
        let code = u16::from_be_bytes([header[0], header[1]]);
        let len = usize::from(u16::from_be_bytes([header[2], header[3]]));
        if rest.len() < len {
            return Err(Error::InvalidPacket(format!(
                "DHCPv6 option {} truncated: {} of {} bytes",
                code,
                rest.len(),
                len
            )));
        }

        let (value, rest) = rest.split_at(len);
        options.push(Dhcp6Option::decode(code, value)?);
        data = rest;
    }
    Ok(options)
}

/// A DHCPv6 client/server message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dhcp6Message {
    pub message_type: Dhcp6MessageType,
    /// 24-bit transaction id.
    pub transaction_id: u32,
    pub options: Vec<Dhcp6Option>,
}

impl Dhcp6Message {
    pub fn new(
        message_type: Dhcp6MessageType,
        transaction_id: u32,
        options: Vec<Dhcp6Option>,
    ) -> Self {
        Self {
            message_type,
            transaction_id: transaction_id & MAX_TRANSACTION_ID,
            options,
        }
    }

    /// Starts a reply: same transaction id, the client's DUID echoed.
    pub fn reply_to(request: &Self, message_type: Dhcp6MessageType) -> Self {
        let options = request
            .client_id()
            .map(|duid| vec![Dhcp6Option::ClientId(duid.to_vec())])
            .unwrap_or_default();
        Self::new(message_type, request.transaction_id, options)
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] for a short message, a relay or
    /// unknown message type, or an option that is truncated or has an
    /// impossible length.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let Some((header, options)) = data.split_first_chunk::<MESSAGE_HEADER_LEN>() else {
            return Err(Error::InvalidPacket(format!(
                "DHCPv6 message too short: {} bytes",
                data.len()
            )));
        };

        let message_type = Dhcp6MessageType::try_from(header[0]).map_err(|value| {
            Error::InvalidPacket(format!("Unsupported DHCPv6 message type {}", value))
        })?;

        Ok(Self {
            message_type,
            transaction_id: u32::from_be_bytes([0, header[1], header[2], header[3]]),
            options: parse_options(options)?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.push(self.message_type as u8);
        out.extend_from_slice(&self.transaction_id.to_be_bytes()[1..]);
        for option in &self.options {
            option.encode_into(&mut out);
        }
        out
    }

    pub fn client_id(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|option| match option {
            Dhcp6Option::ClientId(duid) => Some(duid.as_slice()),
            _ => None,
        })
    }

    pub fn server_id(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|option| match option {
            Dhcp6Option::ServerId(duid) => Some(duid.as_slice()),
            _ => None,
        })
    }

    /// The first IA_NA in the message.
    pub fn ia_na(&self) -> Option<&IaNa> {
        self.options.iter().find_map(|option| match option {
            Dhcp6Option::IaNa(ia) => Some(ia),
            _ => None,
        })
    }

    pub fn is_requested(&self, code: Dhcp6OptionCode) -> bool {
        self.options.iter().any(|option| match option {
            Dhcp6Option::OptionRequest(codes) => codes.contains(&(code as u16)),
            _ => false,
        })
    }

    pub fn has_rapid_commit(&self) -> bool {
        self.options.contains(&Dhcp6Option::RapidCommit)
    }

    pub fn client_fqdn(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|option| match option {
            Dhcp6Option::ClientFqdn(data) => Some(data.as_slice()),
            _ => None,
        })
    }

    /// The top-level status, if the message carries one.
    pub fn status(&self) -> Option<StatusCode> {
        status_of(&self.options)
    }
}

/// DUID-LL for an Ethernet address.
pub fn duid_ll(hw_addr: HwAddr) -> Vec<u8> {
    let mut duid = Vec::with_capacity(10);
    duid.extend_from_slice(&DUID_LL.to_be_bytes());
    duid.extend_from_slice(&HW_TYPE_ETHERNET.to_be_bytes());
    duid.extend_from_slice(&hw_addr.octets());
    duid
}

/// The Ethernet address inside a DUID-LL or DUID-LLT.
///
/// Other DUID types do not carry one.
pub fn duid_hw_addr(duid: &[u8]) -> Option<HwAddr> {
    let (header, rest) = duid.split_first_chunk::<4>()?;
    let duid_type = u16::from_be_bytes([header[0], header[1]]);
    let hw_type = u16::from_be_bytes([header[2], header[3]]);
    if hw_type != HW_TYPE_ETHERNET {
        return None;
    }

    let link = match duid_type {
        DUID_LL => rest,
        DUID_LLT => rest.get(4..)?,
        _ => return None,
    };
    (link.len() == 6).then(|| HwAddr::from_slice(link).ok()).flatten()
}

/// The first label of a Client FQDN option value.
pub fn fqdn_hostname(fqdn: &[u8]) -> Option<String> {
    let (_flags, name) = fqdn.split_first()?;
    let (len, rest) = name.split_first()?;
    let label = rest.get(..usize::from(*len)).filter(|label| !label.is_empty())?;
    Some(String::from_utf8_lossy(label).into_owned())
}
