//! Broker error taxonomy
//!
//! Every variant of `BrokerError` is fatal for the connection it arises on
//! and for that connection only; shared structures are never left in an
//! inconsistent state. Queue overflow is intentionally absent - it is
//! handled locally by eviction or a busy acknowledgment, never escalated.

use std::fmt;

use super::ReasonCode;

/// Errors reported by a packet transport
#[derive(Debug)]
pub enum TransportError {
    /// Peer closed the transport
    Closed,
    /// Framing layer delivered something it could not decode
    Malformed(&'static str),
    /// Underlying I/O failure
    Io(std::io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Closed => write!(f, "transport closed"),
            TransportError::Malformed(msg) => write!(f, "malformed packet: {}", msg),
            TransportError::Io(e) => write!(f, "transport I/O error: {}", e),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e)
    }
}

/// Connection-fatal broker errors
#[derive(Debug)]
pub enum BrokerError {
    /// Malformed packet, invalid flags, unexpected packet for the current
    /// state, or unsupported protocol version
    ProtocolViolation(&'static str),
    /// Authentication capability denied the connection
    AuthDenied(ReasonCode),
    /// A QoS 1/2 handshake step exhausted its retry budget
    DeliveryTimeout { packet_id: u16, retries: u32 },
    /// No packet received within 1.5x the negotiated keep-alive
    KeepAliveTimeout,
    /// Admission refused (max connections reached)
    ResourceExhaustion,
    /// This connection's session was taken over by a newer connection
    TakenOver,
    /// Outbound buffer exceeded the slow-consumer limit
    SlowConsumer,
    /// Broker shutdown or normal connection teardown
    Shutdown,
    /// Transport failure
    Transport(TransportError),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            BrokerError::AuthDenied(code) => write!(f, "authentication denied: {}", code),
            BrokerError::DeliveryTimeout { packet_id, retries } => write!(
                f,
                "delivery timeout: packet {} unacknowledged after {} retries",
                packet_id, retries
            ),
            BrokerError::KeepAliveTimeout => write!(f, "keep alive timeout"),
            BrokerError::ResourceExhaustion => write!(f, "max connections reached"),
            BrokerError::TakenOver => write!(f, "session taken over"),
            BrokerError::SlowConsumer => write!(f, "outbound buffer limit exceeded"),
            BrokerError::Shutdown => write!(f, "shutdown"),
            BrokerError::Transport(e) => write!(f, "transport error: {}", e),
        }
    }
}

impl std::error::Error for BrokerError {}

impl From<TransportError> for BrokerError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Malformed(msg) => BrokerError::ProtocolViolation(msg),
            other => BrokerError::Transport(other),
        }
    }
}
