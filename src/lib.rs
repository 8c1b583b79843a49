//! EmberMQ - embeddable MQTT broker engine
//!
//! A publish/subscribe broker core that operates on decoded packets: the
//! embedding application supplies a [`transport::PacketTransport`] per
//! connection, and the engine runs the protocol state machine, the topic
//! matcher, session persistence with offline queueing, QoS 1/2 delivery
//! tracking, and the retained-message store.

pub mod broker;
pub mod config;
pub mod hooks;
pub mod protocol;
pub mod retained;
pub mod session;
pub mod topic;
pub mod transport;

pub use broker::{Broker, BrokerEvent};
pub use config::Config;
pub use hooks::{AuthOutcome, CompositeHooks, DefaultHooks, Hooks};
pub use protocol::{BrokerError, Packet, ProtocolVersion, QoS, ReasonCode};
pub use session::QueuePolicy;
pub use transport::{pair, ChannelTransport, ClientConduit, PacketTransport};
