//! CONNECT handling: admission, authentication, session takeover, and
//! session resumption.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info};

use super::{rand_id, Connection, State};
use crate::broker::outbound::Outbound;
use crate::broker::BrokerEvent;
use crate::hooks::AuthOutcome;
use crate::protocol::{
    BrokerError, ConnAck, Connect, Disconnect, Packet, PubRel, QoS, ReasonCode,
};
use crate::session::{Qos2Stage, Session, SessionState};
use crate::transport::PacketTransport;

impl<T: PacketTransport> Connection<T> {
    /// Wait for the first packet, which must be CONNECT.
    pub(crate) async fn read_connect(&mut self) -> Result<(), BrokerError> {
        match self.transport.recv().await? {
            Some(Packet::Connect(connect)) => self.handle_connect(*connect).await,
            Some(_) => {
                debug!(addr = %self.addr, "first packet was not CONNECT");
                Err(BrokerError::ProtocolViolation("first packet must be CONNECT"))
            }
            None => Err(BrokerError::ProtocolViolation("closed before CONNECT")),
        }
    }

    async fn handle_connect(&mut self, connect: Connect) -> Result<(), BrokerError> {
        let config = Arc::clone(&self.ctx.config);

        // A zero-byte client id is only acceptable for a throwaway session
        if connect.client_id.is_empty() && !connect.clean_start {
            self.refuse(ReasonCode::ClientIdNotValid).await?;
            return Err(BrokerError::ProtocolViolation(
                "empty client id with clean_start=false",
            ));
        }
        if connect.client_id.is_empty() && !config.mqtt.allow_anonymous {
            self.refuse(ReasonCode::ClientIdNotValid).await?;
            return Err(BrokerError::AuthDenied(ReasonCode::ClientIdNotValid));
        }

        let client_id: Arc<str> = if connect.client_id.is_empty() {
            format!("ember-{:x}", rand_id()).into()
        } else {
            connect.client_id.as_str().into()
        };

        debug!(addr = %self.addr, client_id = %client_id, "CONNECT");

        match self
            .ctx
            .hooks
            .authenticate(
                &client_id,
                connect.username.as_deref(),
                connect.password.as_deref(),
                self.addr,
            )
            .await
        {
            AuthOutcome::Allow => {
                self.username = connect.username.clone();
            }
            AuthOutcome::Deny(reason) => {
                debug!(client_id = %client_id, ?reason, "authentication refused");
                self.refuse(reason).await?;
                return Err(BrokerError::AuthDenied(reason));
            }
        }

        // Admission control; a takeover replaces a slot rather than taking
        // a new one
        let is_takeover = self.ctx.connections.contains_key(&client_id);
        if !is_takeover && self.ctx.connections.len() >= config.limits.max_connections {
            info!(client_id = %client_id, "connection limit reached");
            self.refuse(ReasonCode::ServerBusy).await?;
            return Err(BrokerError::ResourceExhaustion);
        }

        // Evict the previous holder of this client id
        if let Some(existing) = self.ctx.connections.get(&client_id) {
            info!(client_id = %client_id, "session taken over");
            let _ = existing.send_packet(Packet::Disconnect(Disconnect::with_reason(
                ReasonCode::SessionTakenOver,
            )));
            existing.close();
        }

        let resolved =
            self.ctx
                .sessions
                .resolve(&client_id, connect.protocol_version, connect.clean_start);
        let session = resolved.session;
        let session_present = resolved.resumed && !connect.clean_start;

        // Whenever a stored session was discarded, whether by clean start
        // or because it had expired in place, its filters must leave the
        // trie with it.
        if resolved.replaced {
            self.ctx.subscriptions.unsubscribe_all(&client_id);
        }

        {
            let mut s = session.write();
            s.keep_alive = if connect.keep_alive == 0 {
                config.session.default_keep_alive
            } else {
                connect.keep_alive.min(config.session.max_keep_alive)
            };
            // A client-supplied expiry wins; otherwise persistent sessions
            // get the configured default and throwaway sessions expire at
            // disconnect.
            s.expiry = match connect.session_expiry {
                Some(expiry) => Some(expiry),
                None if connect.clean_start => Some(Duration::ZERO),
                None => Some(config.session.default_expiry),
            };
            s.queue_limit = config.limits.max_queued;
            s.queue_policy = config.limits.queue_policy;
            s.will = connect.will;
            s.touch();
        }

        let outbound = Arc::new(Outbound::new(
            Arc::clone(&session),
            config.limits.outbound_buffer,
            config.limits.max_inflight,
        ));
        self.ctx
            .connections
            .insert(Arc::clone(&client_id), Arc::clone(&outbound));
        self.outbound = Some(Arc::clone(&outbound));
        self.state = State::Connected {
            client_id: Arc::clone(&client_id),
            session: Arc::clone(&session),
        };

        self.transport
            .send(Packet::ConnAck(ConnAck {
                session_present,
                reason_code: ReasonCode::Success,
            }))
            .await?;

        let _ = self.ctx.events.send(BrokerEvent::ClientConnected {
            client_id: Arc::clone(&client_id),
        });
        self.ctx
            .hooks
            .on_connected(&client_id, self.username.as_deref())
            .await;

        if session_present {
            // Unacked deliveries resume under their original packet ids
            self.resend_inflight(&session)?;
            self.deliver_retained_for_resumed(&session)?;
        }
        self.ctx.router.flush_queued(&client_id, &outbound);

        Ok(())
    }

    /// Send a refusing CONNACK straight on the transport; the connection
    /// never reaches the connected state.
    async fn refuse(&mut self, reason_code: ReasonCode) -> Result<(), BrokerError> {
        self.transport
            .send(Packet::ConnAck(ConnAck {
                session_present: false,
                reason_code,
            }))
            .await?;
        Ok(())
    }

    /// Retransmit unacknowledged messages after a session resume: PUBLISH
    /// with dup set while awaiting PUBACK/PUBREC, PUBREL while awaiting
    /// PUBCOMP.
    fn resend_inflight(&self, session: &Arc<RwLock<Session>>) -> Result<(), BrokerError> {
        let to_resend: Vec<_> = {
            let mut s = session.write();
            let now = Instant::now();
            s.inflight_outgoing
                .values_mut()
                .map(|inflight| {
                    inflight.sent_at = now;
                    (inflight.packet_id, inflight.publish.clone(), inflight.qos2)
                })
                .collect()
        };

        for (packet_id, mut publish, qos2) in to_resend {
            match qos2 {
                None | Some(Qos2Stage::AwaitingPubRec) => {
                    publish.dup = true;
                    publish.packet_id = Some(packet_id);
                    self.enqueue(Packet::Publish(publish))?;
                }
                Some(Qos2Stage::AwaitingPubComp) => {
                    self.enqueue(Packet::PubRel(PubRel::new(packet_id)))?;
                }
            }
        }
        Ok(())
    }

    /// A resumed session re-receives retained state for the filters it
    /// already holds.
    fn deliver_retained_for_resumed(
        &self,
        session: &Arc<RwLock<Session>>,
    ) -> Result<(), BrokerError> {
        debug_assert!(session.read().state == SessionState::Connected);
        let filters: Vec<(String, QoS)> = {
            let s = session.read();
            s.subscriptions
                .iter()
                .map(|(f, qos)| (f.clone(), *qos))
                .collect()
        };

        for (filter, granted) in filters {
            self.deliver_retained(&filter, granted)?;
        }
        Ok(())
    }
}
