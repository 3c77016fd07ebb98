//! BOOTP/DHCP message encoding per RFC 2131.
//!
//! Covers the UDP payload only. Ethernet, IPv4 and UDP framing live in
//! [`codec`](crate::codec).
//!
//! Fixed header layout, by byte offset:
//!
//! ```text
//!   0  op  htype  hlen  hops
//!   4  xid
//!   8  secs  flags
//!  12  ciaddr   16  yiaddr   20  siaddr   24  giaddr
//!  28  chaddr (16)
//!  44  sname (64)
//! 108  file (128)
//! 236  magic cookie 99.130.83.99
//! 240  options, terminated by End (255)
//! ```

use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::hwaddr::HwAddr;
use crate::options::{DhcpOption, MessageType, OptionCode};

const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

const CHADDR: usize = 28;
const SNAME: usize = 44;
const FILE: usize = 108;
const COOKIE: usize = 236;

/// Header plus magic cookie; the shortest payload that can parse.
pub const DHCP_FIXED_HEADER_SIZE: usize = COOKIE + MAGIC_COOKIE.len();

/// Encoded messages are zero-padded to the BOOTP minimum.
const MIN_ENCODED_LEN: usize = 300;

const MAX_HOPS: u8 = 16;

const FLAG_BROADCAST: u16 = 0x8000;

pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;
pub const HTYPE_ETHERNET: u8 = 1;
pub const HLEN_ETHERNET: u8 = 6;

/// One DHCP message, request or reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpPacket {
    /// [`BOOTREQUEST`] or [`BOOTREPLY`].
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    /// Chosen by the client; replies echo it.
    pub xid: u32,
    pub secs: u16,
    /// Only the broadcast bit is defined.
    pub flags: u16,
    /// The client's current address, when it has one.
    pub ciaddr: Ipv4Addr,
    /// The address the server hands out.
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    /// Hardware address in the first `hlen` bytes, zero padded.
    pub chaddr: [u8; 16],
    pub sname: [u8; 64],
    pub file: [u8; 128],
    /// Options in the order they appeared on the wire.
    pub options: Vec<DhcpOption>,
}

fn ipv4_at(data: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    )
}

fn array_at<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&data[offset..offset + N]);
    out
}

impl DhcpPacket {
    /// Parses a UDP payload. Anything after the End option is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] when the payload is shorter than
    /// the fixed header, the magic cookie is wrong, `hops` is above 16,
    /// an Ethernet client gives an `hlen` other than 6, or an option is
    /// truncated or malformed.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < DHCP_FIXED_HEADER_SIZE {
            return Err(Error::InvalidPacket(format!(
                "Payload of {} bytes is shorter than the {} byte header",
                data.len(),
                DHCP_FIXED_HEADER_SIZE
            )));
        }

        if data[COOKIE..DHCP_FIXED_HEADER_SIZE] != MAGIC_COOKIE {
            return Err(Error::InvalidPacket("Bad magic cookie".to_string()));
        }

        let [op, htype, hlen, hops] = array_at::<4>(data, 0);
        if hops > MAX_HOPS {
            return Err(Error::InvalidPacket(format!("Too many hops: {}", hops)));
        }
        if htype == HTYPE_ETHERNET && hlen != HLEN_ETHERNET {
            return Err(Error::InvalidPacket(format!(
                "Ethernet hlen must be {}, got {}",
                HLEN_ETHERNET, hlen
            )));
        }

        Ok(Self {
            op,
            htype,
            hlen,
            hops,
            xid: u32::from_be_bytes(array_at(data, 4)),
            secs: u16::from_be_bytes(array_at(data, 8)),
            flags: u16::from_be_bytes(array_at(data, 10)),
            ciaddr: ipv4_at(data, 12),
            yiaddr: ipv4_at(data, 16),
            siaddr: ipv4_at(data, 20),
            giaddr: ipv4_at(data, 24),
            chaddr: array_at(data, CHADDR),
            sname: array_at(data, SNAME),
            file: array_at(data, FILE),
            options: parse_options(&data[DHCP_FIXED_HEADER_SIZE..])?,
        })
    }

    /// Serializes the message, End-terminated and padded to 300 bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MIN_ENCODED_LEN + 64);

        out.extend_from_slice(&[self.op, self.htype, self.hlen, self.hops]);
        out.extend_from_slice(&self.xid.to_be_bytes());
        out.extend_from_slice(&self.secs.to_be_bytes());
        out.extend_from_slice(&self.flags.to_be_bytes());
        for addr in [self.ciaddr, self.yiaddr, self.siaddr, self.giaddr] {
            out.extend_from_slice(&addr.octets());
        }
        out.extend_from_slice(&self.chaddr);
        out.extend_from_slice(&self.sname);
        out.extend_from_slice(&self.file);
        out.extend_from_slice(&MAGIC_COOKIE);

        out.extend(self.options.iter().flat_map(DhcpOption::encode));
        out.push(OptionCode::End as u8);

        if out.len() < MIN_ENCODED_LEN {
            out.resize(MIN_ENCODED_LEN, 0);
        }
        out
    }

    fn find_option<'a, T>(&'a self, pick: impl Fn(&'a DhcpOption) -> Option<T>) -> Option<T> {
        self.options.iter().find_map(pick)
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.find_option(|option| match option {
            DhcpOption::MessageType(message_type) => Some(*message_type),
            _ => None,
        })
    }

    /// Option 50. Names the offered address in a REQUEST and the
    /// conflicting one in a DECLINE.
    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.find_option(|option| match option {
            DhcpOption::RequestedIpAddress(ip) => Some(*ip),
            _ => None,
        })
    }

    /// Option 54.
    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        self.find_option(|option| match option {
            DhcpOption::ServerIdentifier(ip) => Some(*ip),
            _ => None,
        })
    }

    pub fn hostname(&self) -> Option<&str> {
        self.find_option(|option| match option {
            DhcpOption::Hostname(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// Option 55.
    pub fn parameter_request_list(&self) -> Option<&[u8]> {
        self.find_option(|option| match option {
            DhcpOption::ParameterRequestList(codes) => Some(codes.as_slice()),
            _ => None,
        })
    }

    pub fn lease_time(&self) -> Option<u32> {
        self.find_option(|option| match option {
            DhcpOption::LeaseTime(seconds) => Some(*seconds),
            _ => None,
        })
    }

    /// The client's Ethernet address from `chaddr`.
    pub fn hw_addr(&self) -> HwAddr {
        HwAddr::new(array_at(&self.chaddr, 0))
    }

    pub fn is_broadcast(&self) -> bool {
        self.flags & FLAG_BROADCAST != 0
    }

    /// Builds the message a client on `hw_addr` would send.
    ///
    /// The message type goes first, then `options`.
    pub fn new_request(
        message_type: MessageType,
        hw_addr: HwAddr,
        xid: u32,
        options: Vec<DhcpOption>,
    ) -> Self {
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&hw_addr.octets());

        Self {
            op: BOOTREQUEST,
            htype: HTYPE_ETHERNET,
            hlen: HLEN_ETHERNET,
            hops: 0,
            xid,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            sname: [0u8; 64],
            file: [0u8; 128],
            options: with_message_type(message_type, options),
        }
    }

    /// Builds an OFFER, ACK or NAK answering `request`.
    ///
    /// Echoes the request's `xid`, `flags`, `giaddr`, `chaddr`, `htype`
    /// and `hlen`. The message type goes first, then `options`.
    pub fn create_reply(
        request: &DhcpPacket,
        message_type: MessageType,
        your_ip: Ipv4Addr,
        server_ip: Ipv4Addr,
        options: Vec<DhcpOption>,
    ) -> Self {
        Self {
            op: BOOTREPLY,
            htype: request.htype,
            hlen: request.hlen,
            hops: 0,
            xid: request.xid,
            secs: 0,
            flags: request.flags,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: your_ip,
            siaddr: server_ip,
            giaddr: request.giaddr,
            chaddr: request.chaddr,
            sname: [0u8; 64],
            file: [0u8; 128],
            options: with_message_type(message_type, options),
        }
    }
}

fn with_message_type(message_type: MessageType, options: Vec<DhcpOption>) -> Vec<DhcpOption> {
    std::iter::once(DhcpOption::MessageType(message_type))
        .chain(options)
        .collect()
}

fn parse_options(mut rest: &[u8]) -> Result<Vec<DhcpOption>> {
    let mut options = Vec::new();

    while let Some((&code, tail)) = rest.split_first() {
        if code == OptionCode::End as u8 {
            break;
        }
        if code == OptionCode::Pad as u8 {
            rest = tail;
            continue;
        }

        let Some((&len, tail)) = tail.split_first() else {
            return Err(Error::InvalidPacket(format!(
                "Option {} has no length byte",
                code
            )));
        };
        let len = usize::from(len);
        if tail.len() < len {
            return Err(Error::InvalidPacket(format!(
                "Option {} claims {} bytes, {} left",
                code,
                len,
                tail.len()
            )));
        }

        let (value, tail) = tail.split_at(len);
        options.push(DhcpOption::parse(code, value)?);
        rest = tail;
    }

    Ok(options)
}
