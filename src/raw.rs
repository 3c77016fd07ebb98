//! Linux `AF_PACKET` transport.
//!
//! Clients without an address can only be reached below IP, so the
//! production transport reads and writes whole Ethernet frames on a packet
//! socket bound to one interface. Every frame on the link is delivered,
//! IPv4 and IPv6 alike; the codec drops what is not DHCP.

use std::ffi::CString;
use std::io::{self, Read, Write};
use std::mem;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tracing::info;

use crate::error::{Error, Result};
use crate::hwaddr::HwAddr;
use crate::transport::{Transport, TransportProvider};

/// Large enough for a full Ethernet frame at the default MTU.
const RECV_BUFFER_SIZE: usize = 2048;

/// `ETH_P_ALL`: every EtherType.
const ETH_P_ALL: u16 = 0x0003;

pub struct RawSocketTransport {
    interface: String,
    socket: AsyncFd<Socket>,
    hw_addr: HwAddr,
}

impl RawSocketTransport {
    /// Opens a packet socket on `interface`.
    ///
    /// Needs `CAP_NET_RAW`.
    pub fn open(interface: &str) -> Result<Self> {
        let protocol = Protocol::from(i32::from(ETH_P_ALL.to_be()));
        let socket = Socket::new(Domain::PACKET, Type::RAW, Some(protocol))
            .map_err(|error| Error::Socket(format!("Failed to create packet socket: {}", error)))?;

        socket
            .set_nonblocking(true)
            .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

        let index = interface_index(interface)?;
        socket.bind(&link_address(index)).map_err(|error| {
            Error::Socket(format!("Failed to bind to {}: {}", interface, error))
        })?;

        let hw_addr = interface_hw_addr(interface)?;
        let socket = AsyncFd::with_interest(socket, Interest::READABLE | Interest::WRITABLE)
            .map_err(|error| {
                Error::Socket(format!("Failed to register socket for {}: {}", interface, error))
            })?;

        info!("Packet socket open on {} ({}, index {})", interface, hw_addr, index);

        Ok(Self {
            interface: interface.to_string(),
            socket,
            hw_addr,
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }
}

impl Transport for RawSocketTransport {
    async fn receive_frame(&mut self) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            let mut guard = self.socket.readable().await?;
            let result = guard.try_io(|inner| {
                let mut socket = inner.get_ref();
                socket.read(&mut buffer)
            });
            match result {
                Ok(Ok(size)) => {
                    buffer.truncate(size);
                    return Ok(buffer);
                }
                Ok(Err(error)) => return Err(error.into()),
                Err(_would_block) => continue,
            }
        }
    }

    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<()> {
        loop {
            let mut guard = self.socket.writable().await?;
            let result = guard.try_io(|inner| {
                let mut socket = inner.get_ref();
                socket.write(&frame)
            });
            match result {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(error)) => return Err(error.into()),
                Err(_would_block) => continue,
            }
        }
    }

    fn hardware_addr(&self) -> HwAddr {
        self.hw_addr
    }
}

/// Opens [`RawSocketTransport`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawSocketProvider;

impl TransportProvider for RawSocketProvider {
    type Transport = RawSocketTransport;

    fn open(&self, interface: &str) -> Result<RawSocketTransport> {
        RawSocketTransport::open(interface)
    }
}

fn interface_index(interface: &str) -> Result<u32> {
    let name = CString::new(interface)
        .map_err(|_| Error::Socket(format!("Invalid interface name {:?}", interface)))?;

    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if index == 0 {
        return Err(Error::Socket(format!(
            "Unknown interface {}: {}",
            interface,
            io::Error::last_os_error()
        )));
    }
    Ok(index)
}

fn link_address(index: u32) -> SockAddr {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let link = (&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr_ll>();

    // sockaddr_storage is large and aligned enough for any sockaddr_ll.
    unsafe {
        (*link).sll_family = libc::AF_PACKET as libc::sa_family_t;
        (*link).sll_protocol = ETH_P_ALL.to_be();
        (*link).sll_ifindex = index as libc::c_int;
        SockAddr::new(
            storage,
            mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    }
}

fn interface_hw_addr(interface: &str) -> Result<HwAddr> {
    let path = format!("/sys/class/net/{}/address", interface);
    let content = std::fs::read_to_string(&path)
        .map_err(|error| Error::Socket(format!("Failed to read {}: {}", path, error)))?;
    content.trim().parse()
}
