//! Link-layer frame transports.
//!
//! A [`Transport`] moves whole Ethernet frames for one interface. The
//! server only ever receives and sends, so any backend that can do both
//! plugs in: [`RawSocketTransport`](crate::raw::RawSocketTransport) on
//! Linux, or the in-memory [`ChannelTransport`] for tests and tooling.
//!
//! [`receive_frame`](Transport::receive_frame) must be cancel safe. The
//! server races it against shutdown and drops it when shutdown wins.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::hwaddr::HwAddr;

/// Frame I/O for one interface.
pub trait Transport: Send + 'static {
    /// Waits for the next inbound frame.
    ///
    /// Returns [`Error::TransportClosed`] once no more frames can arrive.
    fn receive_frame(&mut self) -> impl Future<Output = Result<Vec<u8>>> + Send;

    /// Sends one frame, waiting while the outbound side is full.
    fn send_frame(&mut self, frame: Vec<u8>) -> impl Future<Output = Result<()>> + Send;

    /// Hardware address replies are sent from.
    fn hardware_addr(&self) -> HwAddr;
}

/// Opens a [`Transport`] by interface name.
pub trait TransportProvider: Send + Sync {
    type Transport: Transport;

    fn open(&self, interface: &str) -> Result<Self::Transport>;
}

/// A transport backed by a pair of bounded channels.
#[derive(Debug)]
pub struct ChannelTransport {
    hw_addr: HwAddr,
    inbound: mpsc::Receiver<Vec<u8>>,
    outbound: mpsc::Sender<Vec<u8>>,
}

/// The client side of a [`ChannelTransport`].
#[derive(Debug)]
pub struct ChannelPeer {
    inbound: mpsc::Sender<Vec<u8>>,
    outbound: mpsc::Receiver<Vec<u8>>,
}

impl ChannelTransport {
    /// Creates a transport and the peer that feeds and drains it.
    ///
    /// `capacity` bounds each direction.
    pub fn pair(hw_addr: HwAddr, capacity: usize) -> (Self, ChannelPeer) {
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        (
            Self {
                hw_addr,
                inbound: inbound_rx,
                outbound: outbound_tx,
            },
            ChannelPeer {
                inbound: inbound_tx,
                outbound: outbound_rx,
            },
        )
    }
}

impl Transport for ChannelTransport {
    async fn receive_frame(&mut self) -> Result<Vec<u8>> {
        self.inbound.recv().await.ok_or(Error::TransportClosed)
    }

    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| Error::TransportClosed)
    }

    fn hardware_addr(&self) -> HwAddr {
        self.hw_addr
    }
}

impl ChannelPeer {
    /// Delivers a frame to the server.
    pub async fn send(&self, frame: Vec<u8>) -> Result<()> {
        self.inbound
            .send(frame)
            .await
            .map_err(|_| Error::TransportClosed)
    }

    /// Waits for the next frame the server sent. `None` once the server
    /// side is gone.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.outbound.recv().await
    }

    /// Returns a frame the server already sent, without waiting.
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.outbound.try_recv().ok()
    }
}

/// Hands out pre-built [`ChannelTransport`]s by interface name.
#[derive(Debug, Default)]
pub struct ChannelProvider {
    transports: Mutex<HashMap<String, ChannelTransport>>,
}

impl ChannelProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a transport for `interface` and returns its peer.
    pub fn add(&self, interface: &str, hw_addr: HwAddr, capacity: usize) -> ChannelPeer {
        let (transport, peer) = ChannelTransport::pair(hw_addr, capacity);
        self.transports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(interface.to_string(), transport);
        peer
    }
}

impl TransportProvider for ChannelProvider {
    type Transport = ChannelTransport;

    /// Each registered transport can be opened once.
    fn open(&self, interface: &str) -> Result<ChannelTransport> {
        self.transports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(interface)
            .ok_or_else(|| Error::Socket(format!("No transport for interface {}", interface)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER_MAC: HwAddr = HwAddr::new([0x02, 0, 0, 0, 0, 1]);

    #[tokio::test]
    async fn test_channel_round_trip() {
        let (mut transport, mut peer) = ChannelTransport::pair(SERVER_MAC, 4);
        assert_eq!(transport.hardware_addr(), SERVER_MAC);

        peer.send(vec![1, 2, 3]).await.unwrap();
        assert_eq!(transport.receive_frame().await.unwrap(), vec![1, 2, 3]);

        transport.send_frame(vec![4, 5]).await.unwrap();
        assert_eq!(peer.recv().await, Some(vec![4, 5]));
        assert_eq!(peer.try_recv(), None);
    }

    #[tokio::test]
    async fn test_closed_peer_ends_transport() {
        let (mut transport, peer) = ChannelTransport::pair(SERVER_MAC, 4);
        drop(peer);

        assert!(matches!(
            transport.receive_frame().await,
            Err(Error::TransportClosed)
        ));
        assert!(matches!(
            transport.send_frame(vec![0]).await,
            Err(Error::TransportClosed)
        ));
    }

    #[test]
    fn test_provider_opens_once() {
        let provider = ChannelProvider::new();
        let _peer = provider.add("br0", SERVER_MAC, 1);

        assert!(provider.open("br0").is_ok());
        assert!(matches!(provider.open("br0"), Err(Error::Socket(_))));
        assert!(provider.open("wlan0").is_err());
    }
}
