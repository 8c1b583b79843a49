//! Packet transport boundary
//!
//! The broker core consumes and produces already-decoded packets. Wire
//! framing (TCP, TLS, WebSocket) lives outside the crate: an adapter
//! decodes bytes into `Packet` values and implements `PacketTransport`.
//! The channel-backed pair below is the reference implementation, used by
//! the test suites and by embedders that run clients in-process.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::protocol::{Packet, TransportError};

/// A duplex stream of decoded packets between one client and the broker.
///
/// `recv` returning `Ok(None)` means the peer closed the transport cleanly;
/// an abnormal closure surfaces as `TransportError`. Implementations must
/// preserve packet order in both directions.
#[async_trait]
pub trait PacketTransport: Send {
    /// Receive the next inbound packet, or `None` on clean closure.
    async fn recv(&mut self) -> Result<Option<Packet>, TransportError>;

    /// Send a packet to the peer.
    async fn send(&mut self, packet: Packet) -> Result<(), TransportError>;
}

/// Broker-side endpoint of an in-memory transport
pub struct ChannelTransport {
    inbound: mpsc::Receiver<Packet>,
    outbound: mpsc::Sender<Packet>,
}

/// Client-side endpoint of an in-memory transport
pub struct ClientConduit {
    tx: mpsc::Sender<Packet>,
    rx: mpsc::Receiver<Packet>,
}

/// Create a connected in-memory transport pair.
///
/// `capacity` bounds each direction independently; a full broker-to-client
/// channel makes `send` wait, modeling a transport whose write would block.
pub fn pair(capacity: usize) -> (ClientConduit, ChannelTransport) {
    let (client_tx, broker_rx) = mpsc::channel(capacity);
    let (broker_tx, client_rx) = mpsc::channel(capacity);
    (
        ClientConduit {
            tx: client_tx,
            rx: client_rx,
        },
        ChannelTransport {
            inbound: broker_rx,
            outbound: broker_tx,
        },
    )
}

#[async_trait]
impl PacketTransport for ChannelTransport {
    async fn recv(&mut self) -> Result<Option<Packet>, TransportError> {
        Ok(self.inbound.recv().await)
    }

    async fn send(&mut self, packet: Packet) -> Result<(), TransportError> {
        self.outbound
            .send(packet)
            .await
            .map_err(|_| TransportError::Closed)
    }
}

impl ClientConduit {
    /// Send a packet to the broker.
    pub async fn send(&self, packet: Packet) -> Result<(), TransportError> {
        self.tx.send(packet).await.map_err(|_| TransportError::Closed)
    }

    /// Receive the next packet from the broker, or `None` when the broker
    /// side has closed.
    pub async fn recv(&mut self) -> Option<Packet> {
        self.rx.recv().await
    }

    /// Try to receive without waiting.
    pub fn try_recv(&mut self) -> Option<Packet> {
        self.rx.try_recv().ok()
    }

    /// Drop the sending half, signaling a clean closure to the broker.
    pub fn close(self) -> mpsc::Receiver<Packet> {
        self.rx
    }
}
