//! MQTT reason codes
//!
//! The subset of v5.0 reason codes the broker core emits. Acknowledgment
//! packets carry one of these; the transport layer maps them to v3.1.1
//! return codes where that protocol is in play.

use std::fmt;

/// MQTT Reason Code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[derive(Default)]
pub enum ReasonCode {
    /// Success / Normal disconnection / Granted QoS 0
    #[default]
    Success = 0x00,
    /// Granted QoS 1
    GrantedQoS1 = 0x01,
    /// Granted QoS 2
    GrantedQoS2 = 0x02,
    /// Disconnect with Will Message
    DisconnectWithWill = 0x04,
    /// No subscription existed
    NoSubscriptionExisted = 0x11,
    /// Unspecified error
    UnspecifiedError = 0x80,
    /// Malformed Packet
    MalformedPacket = 0x81,
    /// Protocol Error
    ProtocolError = 0x82,
    /// Unsupported Protocol Version
    UnsupportedProtocolVersion = 0x84,
    /// Client Identifier not valid
    ClientIdNotValid = 0x85,
    /// Bad User Name or Password
    BadUserNameOrPassword = 0x86,
    /// Not authorized
    NotAuthorized = 0x87,
    /// Server unavailable
    ServerUnavailable = 0x88,
    /// Server busy
    ServerBusy = 0x89,
    /// Keep Alive timeout
    KeepAliveTimeout = 0x8D,
    /// Session taken over
    SessionTakenOver = 0x8E,
    /// Topic Filter invalid
    TopicFilterInvalid = 0x8F,
    /// Topic Name invalid
    TopicNameInvalid = 0x90,
    /// Quota exceeded
    QuotaExceeded = 0x97,
    /// QoS not supported
    QoSNotSupported = 0x9B,
    /// Wildcard Subscriptions not supported
    WildcardSubsNotSupported = 0xA2,
}

impl ReasonCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(ReasonCode::Success),
            0x01 => Some(ReasonCode::GrantedQoS1),
            0x02 => Some(ReasonCode::GrantedQoS2),
            0x04 => Some(ReasonCode::DisconnectWithWill),
            0x11 => Some(ReasonCode::NoSubscriptionExisted),
            0x80 => Some(ReasonCode::UnspecifiedError),
            0x81 => Some(ReasonCode::MalformedPacket),
            0x82 => Some(ReasonCode::ProtocolError),
            0x84 => Some(ReasonCode::UnsupportedProtocolVersion),
            0x85 => Some(ReasonCode::ClientIdNotValid),
            0x86 => Some(ReasonCode::BadUserNameOrPassword),
            0x87 => Some(ReasonCode::NotAuthorized),
            0x88 => Some(ReasonCode::ServerUnavailable),
            0x89 => Some(ReasonCode::ServerBusy),
            0x8D => Some(ReasonCode::KeepAliveTimeout),
            0x8E => Some(ReasonCode::SessionTakenOver),
            0x8F => Some(ReasonCode::TopicFilterInvalid),
            0x90 => Some(ReasonCode::TopicNameInvalid),
            0x97 => Some(ReasonCode::QuotaExceeded),
            0x9B => Some(ReasonCode::QoSNotSupported),
            0xA2 => Some(ReasonCode::WildcardSubsNotSupported),
            _ => None,
        }
    }

    /// True for codes below 0x80 (the success range)
    pub fn is_success(&self) -> bool {
        (*self as u8) < 0x80
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:02X})", self, *self as u8)
    }
}
