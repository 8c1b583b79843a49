//! Inbound PUBLISH handling.
//!
//! QoS 0 routes immediately, QoS 1 routes then acks, QoS 2 routes on
//! first receipt and remembers the packet id so a retransmitted PUBLISH
//! is re-acknowledged without being routed again.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use super::Connection;
use crate::broker::BrokerEvent;
use crate::protocol::{BrokerError, Packet, PubAck, PubRec, Publish, QoS, ReasonCode};
use crate::session::Session;
use crate::topic::validate_topic_name;
use crate::transport::PacketTransport;

impl<T: PacketTransport> Connection<T> {
    pub(crate) async fn handle_publish(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        publish: Publish,
    ) -> Result<(), BrokerError> {
        if publish.qos != QoS::AtMostOnce && publish.packet_id.is_none() {
            return Err(BrokerError::ProtocolViolation("QoS > 0 PUBLISH without packet id"));
        }
        if (publish.qos as u8) > self.ctx.config.mqtt.max_qos {
            return Err(BrokerError::ProtocolViolation("QoS exceeds broker maximum"));
        }

        if let Err(e) = validate_topic_name(&publish.topic) {
            warn!(client_id = %client_id, topic = %publish.topic, error = %e, "invalid topic name");
            self.ack_with_reason(&publish, ReasonCode::TopicNameInvalid)?;
            return Ok(());
        }

        trace!(client_id = %client_id, topic = %publish.topic, qos = ?publish.qos, "PUBLISH");

        let allowed = self
            .ctx
            .hooks
            .may_publish(
                client_id,
                self.username.as_deref(),
                &publish.topic,
                publish.qos,
                publish.retain,
            )
            .await;
        if !allowed {
            debug!(client_id = %client_id, topic = %publish.topic, "publish denied");
            self.ack_with_reason(&publish, ReasonCode::NotAuthorized)?;
            return Ok(());
        }

        match publish.qos {
            QoS::AtMostOnce => {
                self.route(&publish);
            }
            QoS::AtLeastOnce => {
                let packet_id = publish.packet_id.unwrap_or_default();
                self.route(&publish);
                self.enqueue(Packet::PubAck(PubAck::new(packet_id)))?;
            }
            QoS::ExactlyOnce => {
                let packet_id = publish.packet_id.unwrap_or_default();

                let (duplicate, over_limit) = {
                    let s = session.read();
                    (
                        s.inflight_incoming.contains(&packet_id),
                        s.inflight_incoming.len() >= self.ctx.config.limits.max_awaiting_rel,
                    )
                };

                if duplicate {
                    // Already routed; just re-acknowledge
                    trace!(client_id = %client_id, packet_id, "duplicate QoS 2 PUBLISH");
                    self.enqueue(Packet::PubRec(PubRec::new(packet_id)))?;
                    return Ok(());
                }
                if over_limit {
                    debug!(client_id = %client_id, "too many unreleased QoS 2 publishes");
                    self.enqueue(Packet::PubRec(PubRec {
                        packet_id,
                        reason_code: ReasonCode::QuotaExceeded,
                    }))?;
                    return Ok(());
                }

                session.write().inflight_incoming.insert(packet_id);
                self.route(&publish);
                self.enqueue(Packet::PubRec(PubRec::new(packet_id)))?;
            }
        }

        Ok(())
    }

    fn route(&self, publish: &Publish) {
        self.ctx.router.route(publish);
        let _ = self.ctx.events.send(BrokerEvent::MessagePublished {
            topic: Arc::clone(&publish.topic),
            payload: publish.payload.clone(),
            qos: publish.qos,
        });
    }

    /// Refuse a PUBLISH: QoS 1/2 get the reason in their ack, QoS 0 is
    /// dropped silently.
    fn ack_with_reason(&self, publish: &Publish, reason_code: ReasonCode) -> Result<(), BrokerError> {
        let Some(packet_id) = publish.packet_id else {
            return Ok(());
        };
        let response = match publish.qos {
            QoS::AtMostOnce => return Ok(()),
            QoS::AtLeastOnce => Packet::PubAck(PubAck {
                packet_id,
                reason_code,
            }),
            QoS::ExactlyOnce => Packet::PubRec(PubRec {
                packet_id,
                reason_code,
            }),
        };
        self.enqueue(response)
    }
}
