//! Raw frame codec: Ethernet II, IPv4 or IPv6, and UDP around a DHCP message.
//!
//! The server talks to clients that have no address yet, so it reads and
//! writes whole link-layer frames. [`DhcpFrame`] is the structural view of
//! one DHCPv4 frame and [`Dhcp6Frame`] of one DHCPv6 frame. [`decode`]
//! applies the checks a server makes on inbound traffic and sorts frames by
//! family; [`encode_reply`] and [`encode_reply6`] apply the reply
//! addressing rules.
//!
//! ```text
//! | dst mac | src mac | type | IPv4 header | UDP header | DHCP message   | padding |
//! |    6    |    6    |  2   |   20..60    |     8      |   240 + n      |   any   |
//!
//! | dst mac | src mac | type | IPv6 header | UDP header | DHCPv6 message | padding |
//! |    6    |    6    |  2   |     40      |     8      |     4 + n      |   any   |
//! ```
//!
//! Anything past the IP length or the UDP length is link padding and is
//! ignored. IPv6 extension headers are not followed.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::{Error, Result};
use crate::hwaddr::{BROADCAST, HwAddr};
use crate::options::MessageType;
use crate::packet::{BOOTREQUEST, DhcpPacket, HTYPE_ETHERNET};
use crate::packet6::{DHCP6_CLIENT_PORT, DHCP6_SERVER_PORT, Dhcp6Message, duid_hw_addr};

/// UDP port the server listens on.
pub const DHCP_SERVER_PORT: u16 = 67;

/// UDP port clients listen on.
pub const DHCP_CLIENT_PORT: u16 = 68;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_IPV6: u16 = 0x86dd;

const ETHERNET_HEADER_LEN: usize = 14;
const IPV4_MIN_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const UDP_HEADER_LEN: usize = 8;
const IPPROTO_UDP: u8 = 17;
const DEFAULT_TTL: u8 = 64;

/// More-fragments flag and fragment offset bits of the IPv4 flags word.
const IPV4_FRAGMENT_MASK: u16 = 0x3fff;

/// One DHCP message with its Ethernet, IPv4 and UDP addressing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpFrame {
    pub src_mac: HwAddr,
    pub dst_mac: HwAddr,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub packet: DhcpPacket,
}

impl DhcpFrame {
    /// Parses an Ethernet frame carrying IPv4/UDP/DHCP.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] for truncated headers, a non-IPv4
    /// EtherType, a non-UDP protocol, fragments, lengths that point past
    /// the end of the frame, or a malformed DHCP message.
    pub fn parse(frame: &[u8]) -> Result<Self> {
        let (dst_mac, src_mac, ip) = parse_ethernet(frame, ETHERTYPE_IPV4)?;
        let (src_ip, dst_ip, datagram) = parse_ipv4(ip)?;
        let (src_port, dst_port, payload) = parse_udp(datagram)?;

        Ok(Self {
            src_mac,
            dst_mac,
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            packet: DhcpPacket::parse(payload)?,
        })
    }

    /// Encodes the frame with a computed IPv4 header checksum and UDP checksum.
    pub fn encode(&self) -> Vec<u8> {
        build_frame(
            self.src_mac,
            self.dst_mac,
            self.src_ip,
            self.dst_ip,
            self.src_port,
            self.dst_port,
            &self.packet.encode(),
        )
    }
}

/// One DHCPv6 message with its Ethernet, IPv6 and UDP addressing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dhcp6Frame {
    pub src_mac: HwAddr,
    pub dst_mac: HwAddr,
    pub src_ip: Ipv6Addr,
    pub dst_ip: Ipv6Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub message: Dhcp6Message,
}

impl Dhcp6Frame {
    /// Parses an Ethernet frame carrying IPv6/UDP/DHCPv6.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] for truncated headers, a non-IPv6
    /// EtherType, a next header other than UDP, lengths that point past
    /// the end of the frame, or a malformed DHCPv6 message.
    pub fn parse(frame: &[u8]) -> Result<Self> {
        let (dst_mac, src_mac, ip) = parse_ethernet(frame, ETHERTYPE_IPV6)?;
        let (src_ip, dst_ip, datagram) = parse_ipv6(ip)?;
        let (src_port, dst_port, payload) = parse_udp(datagram)?;

        Ok(Self {
            src_mac,
            dst_mac,
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            message: Dhcp6Message::parse(payload)?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        build_frame6(
            self.src_mac,
            self.dst_mac,
            self.src_ip,
            self.dst_ip,
            self.src_port,
            self.dst_port,
            &self.message.encode(),
        )
    }

    /// The client's hardware address: from its DUID when the DUID carries
    /// one, else the frame's source MAC.
    pub fn client_hw_addr(&self) -> HwAddr {
        self.message
            .client_id()
            .and_then(duid_hw_addr)
            .unwrap_or(self.src_mac)
    }
}

/// A decoded client request of either family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    V4(DhcpFrame),
    V6(Dhcp6Frame),
}

impl Inbound {
    /// The hardware address used to key rate limiting and leases.
    pub fn client_hw_addr(&self) -> HwAddr {
        match self {
            Self::V4(frame) => frame.packet.hw_addr(),
            Self::V6(frame) => frame.client_hw_addr(),
        }
    }
}

/// Decodes a client request, dispatching on the EtherType.
pub fn decode(frame: &[u8]) -> Result<Inbound> {
    let ethertype = frame
        .get(12..ETHERNET_HEADER_LEN)
        .map(|bytes| u16::from_be_bytes([bytes[0], bytes[1]]));

    match ethertype {
        Some(ETHERTYPE_IPV4) => decode_request(frame).map(Inbound::V4),
        Some(ETHERTYPE_IPV6) => decode_request6(frame).map(Inbound::V6),
        Some(other) => Err(Error::InvalidPacket(format!(
            "Unsupported EtherType {:#06x}",
            other
        ))),
        None => Err(Error::InvalidPacket(format!(
            "Frame too short: {} bytes",
            frame.len()
        ))),
    }
}

/// Decodes a frame received on the server port.
///
/// On top of [`DhcpFrame::parse`], requires client-to-server ports,
/// a BOOTREQUEST from an Ethernet client and a message type option.
pub fn decode_request(frame: &[u8]) -> Result<DhcpFrame> {
    let decoded = DhcpFrame::parse(frame)?;

    if decoded.src_port != DHCP_CLIENT_PORT || decoded.dst_port != DHCP_SERVER_PORT {
        return Err(Error::InvalidPacket(format!(
            "Unexpected UDP ports {} -> {}",
            decoded.src_port, decoded.dst_port
        )));
    }

    let packet = &decoded.packet;
    if packet.op != BOOTREQUEST {
        return Err(Error::InvalidPacket("Expected BOOTREQUEST".to_string()));
    }
    if packet.htype != HTYPE_ETHERNET {
        return Err(Error::InvalidPacket(format!(
            "Unsupported hardware type {}",
            packet.htype
        )));
    }
    if packet.message_type().is_none() {
        return Err(Error::InvalidPacket(
            "Missing DHCP message type option".to_string(),
        ));
    }

    Ok(decoded)
}

/// Picks the link and network destination of a reply.
///
/// NAKs, requests with the broadcast flag and clients without a usable
/// source address get a broadcast. Everything else is unicast to the
/// assigned address (or `ciaddr` when nothing is assigned) at the client's
/// hardware address.
pub fn reply_destination(request: &DhcpPacket, reply: &DhcpPacket) -> (HwAddr, Ipv4Addr) {
    let is_nak = reply.message_type() == Some(MessageType::Nak);

    if is_nak || request.is_broadcast() || request.ciaddr.is_unspecified() {
        return (BROADCAST, Ipv4Addr::BROADCAST);
    }

    let ip = if reply.yiaddr.is_unspecified() {
        request.ciaddr
    } else {
        reply.yiaddr
    };
    (request.hw_addr(), ip)
}

/// Wraps a reply into a frame from the server to the client port.
pub fn encode_reply(
    request: &DhcpPacket,
    reply: &DhcpPacket,
    server_mac: HwAddr,
    server_ip: Ipv4Addr,
) -> Vec<u8> {
    let (dst_mac, dst_ip) = reply_destination(request, reply);
    build_frame(
        server_mac,
        dst_mac,
        server_ip,
        dst_ip,
        DHCP_SERVER_PORT,
        DHCP_CLIENT_PORT,
        &reply.encode(),
    )
}

/// Decodes a DHCPv6 frame sent from the client port to the server port
/// carrying a client message.
pub fn decode_request6(frame: &[u8]) -> Result<Dhcp6Frame> {
    let decoded = Dhcp6Frame::parse(frame)?;

    if decoded.src_port != DHCP6_CLIENT_PORT || decoded.dst_port != DHCP6_SERVER_PORT {
        return Err(Error::InvalidPacket(format!(
            "Unexpected UDP ports {} -> {}",
            decoded.src_port, decoded.dst_port
        )));
    }
    if !decoded.message.message_type.is_client_message() {
        return Err(Error::InvalidPacket(format!(
            "Unexpected {} from a client",
            decoded.message.message_type
        )));
    }

    Ok(decoded)
}

/// Wraps a DHCPv6 reply into a frame sent back to the requesting client,
/// from the server's link-local address.
pub fn encode_reply6(request: &Dhcp6Frame, reply: &Dhcp6Message, server_mac: HwAddr) -> Vec<u8> {
    build_frame6(
        server_mac,
        request.src_mac,
        link_local(server_mac),
        request.src_ip,
        DHCP6_SERVER_PORT,
        DHCP6_CLIENT_PORT,
        &reply.encode(),
    )
}

/// The EUI-64 link-local address of a MAC (RFC 4291 appendix A).
pub fn link_local(hw_addr: HwAddr) -> Ipv6Addr {
    let mac = hw_addr.octets();
    let mut octets = [0u8; 16];
    octets[0] = 0xfe;
    octets[1] = 0x80;
    octets[8] = mac[0] ^ 0x02;
    octets[9] = mac[1];
    octets[10] = mac[2];
    octets[11] = 0xff;
    octets[12] = 0xfe;
    octets[13] = mac[3];
    octets[14] = mac[4];
    octets[15] = mac[5];
    Ipv6Addr::from(octets)
}

fn parse_ethernet(frame: &[u8], expected: u16) -> Result<(HwAddr, HwAddr, &[u8])> {
    if frame.len() < ETHERNET_HEADER_LEN {
        return Err(Error::InvalidPacket(format!(
            "Frame too short: {} bytes",
            frame.len()
        )));
    }

    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    if ethertype != expected {
        return Err(Error::InvalidPacket(format!(
            "Unsupported EtherType {:#06x}",
            ethertype
        )));
    }

    let dst_mac = HwAddr::from_slice(&frame[0..6])?;
    let src_mac = HwAddr::from_slice(&frame[6..12])?;
    Ok((dst_mac, src_mac, &frame[ETHERNET_HEADER_LEN..]))
}

fn parse_ipv4(data: &[u8]) -> Result<(Ipv4Addr, Ipv4Addr, &[u8])> {
    if data.len() < IPV4_MIN_HEADER_LEN {
        return Err(Error::InvalidPacket("IPv4 header truncated".to_string()));
    }

    let version = data[0] >> 4;
    if version != 4 {
        return Err(Error::InvalidPacket(format!(
            "Unexpected IP version {}",
            version
        )));
    }

    let header_len = usize::from(data[0] & 0x0f) * 4;
    let total_len = usize::from(u16::from_be_bytes([data[2], data[3]]));
    if header_len < IPV4_MIN_HEADER_LEN || total_len < header_len || total_len > data.len() {
        return Err(Error::InvalidPacket(format!(
            "Invalid IPv4 lengths: header {}, total {}, available {}",
            header_len,
            total_len,
            data.len()
        )));
    }

    let fragment = u16::from_be_bytes([data[6], data[7]]);
    if fragment & IPV4_FRAGMENT_MASK != 0 {
        return Err(Error::InvalidPacket(
            "Fragmented IPv4 datagram".to_string(),
        ));
    }

    if data[9] != IPPROTO_UDP {
        return Err(Error::InvalidPacket(format!(
            "Unexpected IP protocol {}",
            data[9]
        )));
    }

    let src_ip = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
    let dst_ip = Ipv4Addr::new(data[16], data[17], data[18], data[19]);

    Ok((src_ip, dst_ip, &data[header_len..total_len]))
}

fn parse_ipv6(data: &[u8]) -> Result<(Ipv6Addr, Ipv6Addr, &[u8])> {
    let Some((header, rest)) = data.split_first_chunk::<IPV6_HEADER_LEN>() else {
        return Err(Error::InvalidPacket("IPv6 header truncated".to_string()));
    };

    let version = header[0] >> 4;
    if version != 6 {
        return Err(Error::InvalidPacket(format!(
            "Unexpected IP version {}",
            version
        )));
    }

    let payload_len = usize::from(u16::from_be_bytes([header[4], header[5]]));
    if payload_len > rest.len() {
        return Err(Error::InvalidPacket(format!(
            "Invalid IPv6 payload length {} (available {})",
            payload_len,
            rest.len()
        )));
    }

    if header[6] != IPPROTO_UDP {
        return Err(Error::InvalidPacket(format!(
            "Unexpected IPv6 next header {}",
            header[6]
        )));
    }

    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&header[8..24]);
    dst.copy_from_slice(&header[24..40]);

    Ok((Ipv6Addr::from(src), Ipv6Addr::from(dst), &rest[..payload_len]))
}

fn parse_udp(data: &[u8]) -> Result<(u16, u16, &[u8])> {
    if data.len() < UDP_HEADER_LEN {
        return Err(Error::InvalidPacket("UDP header truncated".to_string()));
    }

    let src_port = u16::from_be_bytes([data[0], data[1]]);
    let dst_port = u16::from_be_bytes([data[2], data[3]]);
    let udp_len = usize::from(u16::from_be_bytes([data[4], data[5]]));

    if udp_len < UDP_HEADER_LEN || udp_len > data.len() {
        return Err(Error::InvalidPacket(format!(
            "Invalid UDP length {} (available {})",
            udp_len,
            data.len()
        )));
    }

    Ok((src_port, dst_port, &data[UDP_HEADER_LEN..udp_len]))
}

fn build_frame(
    src_mac: HwAddr,
    dst_mac: HwAddr,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let total_len = IPV4_MIN_HEADER_LEN + udp_len;
    let mut frame = Vec::with_capacity(ETHERNET_HEADER_LEN + total_len);

    frame.extend_from_slice(&dst_mac.octets());
    frame.extend_from_slice(&src_mac.octets());
    frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

    let ip_start = frame.len();
    frame.push(0x45);
    frame.push(0x10);
    frame.extend_from_slice(&wire_len(total_len).to_be_bytes());
    frame.extend_from_slice(&[0, 0, 0, 0]);
    frame.push(DEFAULT_TTL);
    frame.push(IPPROTO_UDP);
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(&src_ip.octets());
    frame.extend_from_slice(&dst_ip.octets());

    let header_checksum = checksum(&frame[ip_start..]);
    frame[ip_start + 10..ip_start + 12].copy_from_slice(&header_checksum.to_be_bytes());

    let udp_start = frame.len();
    frame.extend_from_slice(&src_port.to_be_bytes());
    frame.extend_from_slice(&dst_port.to_be_bytes());
    frame.extend_from_slice(&wire_len(udp_len).to_be_bytes());
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(payload);

    let udp_checksum = udp_checksum(src_ip, dst_ip, &frame[udp_start..]);
    frame[udp_start + 6..udp_start + 8].copy_from_slice(&udp_checksum.to_be_bytes());

    frame
}

fn build_frame6(
    src_mac: HwAddr,
    dst_mac: HwAddr,
    src_ip: Ipv6Addr,
    dst_ip: Ipv6Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let mut frame = Vec::with_capacity(ETHERNET_HEADER_LEN + IPV6_HEADER_LEN + udp_len);

    frame.extend_from_slice(&dst_mac.octets());
    frame.extend_from_slice(&src_mac.octets());
    frame.extend_from_slice(&ETHERTYPE_IPV6.to_be_bytes());

    frame.extend_from_slice(&[0x60, 0, 0, 0]);
    frame.extend_from_slice(&wire_len(udp_len).to_be_bytes());
    frame.push(IPPROTO_UDP);
    frame.push(DEFAULT_TTL);
    frame.extend_from_slice(&src_ip.octets());
    frame.extend_from_slice(&dst_ip.octets());

    let udp_start = frame.len();
    frame.extend_from_slice(&src_port.to_be_bytes());
    frame.extend_from_slice(&dst_port.to_be_bytes());
    frame.extend_from_slice(&wire_len(udp_len).to_be_bytes());
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(payload);

    let udp_checksum = udp6_checksum(src_ip, dst_ip, &frame[udp_start..]);
    frame[udp_start + 6..udp_start + 8].copy_from_slice(&udp_checksum.to_be_bytes());

    frame
}

fn wire_len(len: usize) -> u16 {
    u16::try_from(len).unwrap_or(u16::MAX)
}

fn sum_words(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// RFC 1071 Internet checksum.
fn checksum(data: &[u8]) -> u16 {
    fold(sum_words(0, data))
}

/// Zero is sent as all ones.
fn pseudo_checksum(pseudo: &[u8], segment: &[u8]) -> u16 {
    match fold(sum_words(sum_words(0, pseudo), segment)) {
        0 => 0xffff,
        value => value,
    }
}

/// UDP checksum over the IPv4 pseudo-header.
fn udp_checksum(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, segment: &[u8]) -> u16 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src_ip.octets());
    pseudo[4..8].copy_from_slice(&dst_ip.octets());
    pseudo[9] = IPPROTO_UDP;
    pseudo[10..12].copy_from_slice(&wire_len(segment.len()).to_be_bytes());
    pseudo_checksum(&pseudo, segment)
}

/// UDP checksum over the IPv6 pseudo-header. Mandatory for IPv6.
fn udp6_checksum(src_ip: Ipv6Addr, dst_ip: Ipv6Addr, segment: &[u8]) -> u16 {
    let mut pseudo = [0u8; 40];
    pseudo[0..16].copy_from_slice(&src_ip.octets());
    pseudo[16..32].copy_from_slice(&dst_ip.octets());
    pseudo[34..36].copy_from_slice(&wire_len(segment.len()).to_be_bytes());
    pseudo[39] = IPPROTO_UDP;
    pseudo_checksum(&pseudo, segment)
}
