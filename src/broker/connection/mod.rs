//! Per-connection protocol state machine.
//!
//! Each attached transport gets one task running [`Connection::run`]. The
//! task owns the transport exclusively: it reads inbound packets, drains
//! the connection's [`Outbound`] queue, retries unacked deliveries, and
//! enforces the keep-alive deadline, all from a single `select!` loop.

mod connect;
mod disconnect;
mod publish;
mod qos;
mod subscribe;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::hooks::Hooks;
use crate::protocol::{BrokerError, Disconnect, Packet, ReasonCode, TransportError};
use crate::retained::RetainedStore;
use crate::session::{Session, SessionStore};
use crate::topic::SubscriptionStore;
use crate::transport::PacketTransport;

use super::outbound::Outbound;
use super::router::Router;
use super::BrokerEvent;

/// How long a fresh connection may idle before its CONNECT must arrive
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared broker state handed to every connection task
pub(crate) struct Context {
    pub sessions: Arc<SessionStore>,
    pub subscriptions: Arc<SubscriptionStore>,
    pub retained: Arc<RetainedStore>,
    pub connections: Arc<DashMap<Arc<str>, Arc<Outbound>>>,
    pub router: Arc<Router>,
    pub config: Arc<Config>,
    pub hooks: Arc<dyn Hooks>,
    pub events: broadcast::Sender<BrokerEvent>,
}

pub(crate) enum State {
    /// Waiting for the CONNECT packet
    AwaitingConnect,
    Connected {
        client_id: Arc<str>,
        session: Arc<RwLock<Session>>,
    },
}

pub(crate) struct Connection<T> {
    pub(crate) transport: T,
    pub(crate) addr: SocketAddr,
    pub(crate) state: State,
    pub(crate) ctx: Arc<Context>,
    /// Created after CONNECT is accepted
    pub(crate) outbound: Option<Arc<Outbound>>,
    /// Username from CONNECT, for authorization checks
    pub(crate) username: Option<String>,
    shutdown: broadcast::Receiver<()>,
}

impl<T: PacketTransport> Connection<T> {
    pub(crate) fn new(
        transport: T,
        addr: SocketAddr,
        ctx: Arc<Context>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            transport,
            addr,
            state: State::AwaitingConnect,
            ctx,
            outbound: None,
            username: None,
            shutdown,
        }
    }

    /// Drive the connection to completion.
    pub(crate) async fn run(&mut self) -> Result<(), BrokerError> {
        match timeout(CONNECT_TIMEOUT, self.read_connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                // The handshake can fail after the connection registered
                // itself (a CONNACK the transport refused to carry, say);
                // that registration must not outlive the task.
                let registered = match &self.state {
                    State::Connected { client_id, session } => {
                        Some((client_id.clone(), session.clone()))
                    }
                    State::AwaitingConnect => None,
                };
                if let Some((client_id, session)) = registered {
                    self.handle_disconnect(&client_id, &session, true, false).await;
                }
                return Err(e);
            }
            Err(_) => {
                debug!(addr = %self.addr, "connect timeout");
                return Err(BrokerError::KeepAliveTimeout);
            }
        }
        self.run_connected().await
    }

    async fn run_connected(&mut self) -> Result<(), BrokerError> {
        let (client_id, session) = match &self.state {
            State::Connected { client_id, session } => (client_id.clone(), session.clone()),
            State::AwaitingConnect => {
                return Err(BrokerError::ProtocolViolation("not connected"))
            }
        };
        let outbound = self
            .outbound
            .clone()
            .ok_or(BrokerError::ProtocolViolation("not connected"))?;

        let keep_alive = match session.read().keep_alive {
            0 => Duration::from_secs(u64::MAX / 4), // effectively disabled
            secs => Duration::from_millis(u64::from(secs) * 1500),
        };
        let mut keep_alive_deadline = tokio::time::Instant::now() + keep_alive;

        let mut retry_ticker = tokio::time::interval(self.ctx.config.limits.retry_interval);
        retry_ticker.tick().await; // skip the immediate tick

        loop {
            tokio::select! {
                result = self.transport.recv() => {
                    match result {
                        Ok(Some(packet)) => {
                            session.write().touch();
                            keep_alive_deadline = tokio::time::Instant::now() + keep_alive;
                            match self.handle_packet(&client_id, &session, packet).await {
                                Ok(true) => {}
                                // Clean DISCONNECT, already handled
                                Ok(false) => return Ok(()),
                                Err(e) => {
                                    warn!(client_id = %client_id, error = %e, "closing connection");
                                    self.handle_disconnect(&client_id, &session, true, false).await;
                                    return Err(e);
                                }
                            }
                        }
                        Ok(None) => {
                            // Peer went away without DISCONNECT: abnormal close
                            debug!(client_id = %client_id, "transport closed by peer");
                            self.handle_disconnect(&client_id, &session, true, false).await;
                            return Ok(());
                        }
                        Err(TransportError::Malformed(what)) => {
                            self.handle_disconnect(&client_id, &session, true, false).await;
                            return Err(BrokerError::ProtocolViolation(what));
                        }
                        Err(e) => {
                            self.handle_disconnect(&client_id, &session, true, false).await;
                            return Err(e.into());
                        }
                    }
                }

                _ = outbound.notified() => {
                    for packet in outbound.drain() {
                        if let Err(e) = self.transport.send(packet).await {
                            debug!(client_id = %client_id, error = %e, "write failed");
                            self.handle_disconnect(&client_id, &session, true, false).await;
                            return Err(e.into());
                        }
                    }
                    if !outbound.is_alive() {
                        // Closed by takeover or slow-consumer eviction
                        debug!(client_id = %client_id, "outbound closed, disconnecting");
                        self.handle_disconnect(&client_id, &session, false, false).await;
                        return Ok(());
                    }
                }

                _ = retry_ticker.tick() => {
                    if let Err(e) = self.retry_unacked(&session) {
                        warn!(client_id = %client_id, error = %e, "delivery abandoned");
                        self.handle_disconnect(&client_id, &session, true, false).await;
                        return Err(e);
                    }
                }

                _ = tokio::time::sleep_until(keep_alive_deadline) => {
                    info!(client_id = %client_id, "keep-alive timeout");
                    let _ = self
                        .transport
                        .send(Packet::Disconnect(Disconnect::with_reason(
                            ReasonCode::KeepAliveTimeout,
                        )))
                        .await;
                    self.handle_disconnect(&client_id, &session, true, false).await;
                    return Err(BrokerError::KeepAliveTimeout);
                }

                _ = self.shutdown.recv() => {
                    debug!(client_id = %client_id, "broker shutdown");
                    let _ = self
                        .transport
                        .send(Packet::Disconnect(Disconnect::with_reason(
                            ReasonCode::ServerUnavailable,
                        )))
                        .await;
                    self.handle_disconnect(&client_id, &session, false, false).await;
                    return Err(BrokerError::Shutdown);
                }
            }
        }
    }

    /// Dispatch one inbound packet. Returns Ok(false) when the client sent
    /// a clean DISCONNECT and the loop should end.
    async fn handle_packet(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        packet: Packet,
    ) -> Result<bool, BrokerError> {
        match packet {
            Packet::Connect(_) => Err(BrokerError::ProtocolViolation("duplicate CONNECT")),
            Packet::Publish(publish) => {
                self.handle_publish(client_id, session, publish).await?;
                Ok(true)
            }
            Packet::PubAck(puback) => {
                self.handle_puback(client_id, session, puback);
                Ok(true)
            }
            Packet::PubRec(pubrec) => {
                self.handle_pubrec(session, pubrec)?;
                Ok(true)
            }
            Packet::PubRel(pubrel) => {
                self.handle_pubrel(session, pubrel)?;
                Ok(true)
            }
            Packet::PubComp(pubcomp) => {
                self.handle_pubcomp(client_id, session, pubcomp);
                Ok(true)
            }
            Packet::Subscribe(subscribe) => {
                self.handle_subscribe(client_id, session, subscribe).await?;
                Ok(true)
            }
            Packet::Unsubscribe(unsubscribe) => {
                self.handle_unsubscribe(client_id, session, unsubscribe)?;
                Ok(true)
            }
            Packet::PingReq => {
                self.transport.send(Packet::PingResp).await?;
                Ok(true)
            }
            Packet::Disconnect(disconnect) => {
                debug!(client_id = %client_id, reason = ?disconnect.reason_code, "client disconnect");
                // A normal DISCONNECT discards the will; DisconnectWithWill
                // keeps the delivery obligation.
                let publish_will = !disconnect.is_normal();
                self.handle_disconnect(client_id, session, publish_will, true)
                    .await;
                Ok(false)
            }
            Packet::ConnAck(_) | Packet::SubAck(_) | Packet::UnsubAck(_) | Packet::PingResp => {
                Err(BrokerError::ProtocolViolation("server-to-client packet from client"))
            }
        }
    }

    pub(crate) fn enqueue(&self, packet: Packet) -> Result<(), BrokerError> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or(BrokerError::ProtocolViolation("not connected"))?;
        outbound
            .send_packet(packet)
            .map_err(|_| BrokerError::SlowConsumer)
    }
}

/// Generate a random client id suffix
pub(crate) fn rand_id() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let hasher = RandomState::new().build_hasher();
    hasher.finish()
}
