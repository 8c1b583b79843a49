//! SUBSCRIBE and UNSUBSCRIBE handling, including retained-message
//! delivery at subscribe time.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::Connection;
use crate::protocol::{
    BrokerError, Packet, QoS, ReasonCode, SubAck, Subscribe, UnsubAck, Unsubscribe,
};
use crate::session::Session;
use crate::topic::validate_topic_filter;
use crate::transport::PacketTransport;

impl<T: PacketTransport> Connection<T> {
    pub(crate) async fn handle_subscribe(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        subscribe: Subscribe,
    ) -> Result<(), BrokerError> {
        if subscribe.filters.is_empty() {
            return Err(BrokerError::ProtocolViolation("SUBSCRIBE with no filters"));
        }

        let config = &self.ctx.config;
        let mut reason_codes = Vec::with_capacity(subscribe.filters.len());
        // Filters whose retained state should go out after the SUBACK
        let mut granted: Vec<(String, QoS)> = Vec::new();

        for sub in &subscribe.filters {
            if validate_topic_filter(&sub.filter).is_err() {
                reason_codes.push(ReasonCode::TopicFilterInvalid);
                continue;
            }
            if !config.mqtt.wildcard_subscriptions
                && (sub.filter.contains('+') || sub.filter.contains('#'))
            {
                reason_codes.push(ReasonCode::WildcardSubsNotSupported);
                continue;
            }

            let allowed = self
                .ctx
                .hooks
                .may_subscribe(client_id, self.username.as_deref(), &sub.filter, sub.qos)
                .await;
            if !allowed {
                debug!(client_id = %client_id, filter = %sub.filter, "subscribe denied");
                reason_codes.push(ReasonCode::NotAuthorized);
                continue;
            }

            let max_qos = QoS::from_u8(config.mqtt.max_qos).unwrap_or(QoS::ExactlyOnce);
            let granted_qos = sub.qos.min(max_qos);

            self.ctx
                .subscriptions
                .subscribe(&sub.filter, Arc::clone(client_id), granted_qos);
            session
                .write()
                .subscriptions
                .insert(sub.filter.clone(), granted_qos);

            reason_codes.push(match granted_qos {
                QoS::AtMostOnce => ReasonCode::Success,
                QoS::AtLeastOnce => ReasonCode::GrantedQoS1,
                QoS::ExactlyOnce => ReasonCode::GrantedQoS2,
            });
            granted.push((sub.filter.clone(), granted_qos));

            debug!(client_id = %client_id, filter = %sub.filter, qos = ?granted_qos, "SUBSCRIBE");
        }

        self.enqueue(Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            reason_codes,
        }))?;

        for (filter, qos) in granted {
            self.deliver_retained(&filter, qos)?;
        }
        Ok(())
    }

    /// Deliver the retained messages matching one filter, capped at the
    /// granted QoS, with the retain flag set.
    pub(crate) fn deliver_retained(&self, filter: &str, granted: QoS) -> Result<(), BrokerError> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or(BrokerError::ProtocolViolation("not connected"))?;

        for retained in self.ctx.retained.matching(filter) {
            let effective_qos = retained.qos.min(granted);
            let publish = crate::protocol::Publish {
                dup: false,
                qos: effective_qos,
                retain: true,
                topic: retained.topic,
                packet_id: None,
                payload: retained.payload,
            };
            if outbound.send_publish(publish, effective_qos, true).is_err() {
                // Window or buffer full; the subscriber loses the snapshot
                // for this topic, not the subscription
                break;
            }
        }
        Ok(())
    }

    pub(crate) fn handle_unsubscribe(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        unsubscribe: Unsubscribe,
    ) -> Result<(), BrokerError> {
        let mut reason_codes = Vec::with_capacity(unsubscribe.filters.len());

        for filter in &unsubscribe.filters {
            let removed = self.ctx.subscriptions.unsubscribe(filter, client_id);
            session.write().subscriptions.remove(filter.as_str());

            reason_codes.push(if removed {
                ReasonCode::Success
            } else {
                ReasonCode::NoSubscriptionExisted
            });
            debug!(client_id = %client_id, filter = %filter, removed, "UNSUBSCRIBE");
        }

        self.enqueue(Packet::UnsubAck(UnsubAck {
            packet_id: unsubscribe.packet_id,
            reason_codes,
        }))
    }
}
