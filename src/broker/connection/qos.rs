//! Acknowledgement handling (PUBACK, PUBREC, PUBREL, PUBCOMP) and the
//! retransmission sweep.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::trace;

use super::Connection;
use crate::protocol::{BrokerError, Packet, PubAck, PubComp, PubRec, PubRel};
use crate::session::{Qos2Stage, Session};
use crate::transport::PacketTransport;

impl<T: PacketTransport> Connection<T> {
    /// PUBACK completes a QoS 1 delivery and frees an inflight slot.
    pub(crate) fn handle_puback(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        puback: PubAck,
    ) {
        session.write().inflight_outgoing.remove(&puback.packet_id);
        self.promote_queued(client_id);
    }

    /// PUBREC advances a QoS 2 delivery to the release stage.
    pub(crate) fn handle_pubrec(
        &mut self,
        session: &Arc<RwLock<Session>>,
        pubrec: PubRec,
    ) -> Result<(), BrokerError> {
        {
            let mut s = session.write();
            if let Some(inflight) = s.inflight_outgoing.get_mut(&pubrec.packet_id) {
                inflight.qos2 = Some(Qos2Stage::AwaitingPubComp);
                inflight.sent_at = Instant::now();
                inflight.retries = 0;
            }
        }
        self.enqueue(Packet::PubRel(PubRel::new(pubrec.packet_id)))
    }

    /// PUBREL releases an incoming QoS 2 publish. PUBCOMP goes out whether
    /// or not the id was known, so a lost PUBCOMP can be recovered.
    pub(crate) fn handle_pubrel(
        &mut self,
        session: &Arc<RwLock<Session>>,
        pubrel: PubRel,
    ) -> Result<(), BrokerError> {
        session.write().inflight_incoming.remove(&pubrel.packet_id);
        self.enqueue(Packet::PubComp(PubComp::new(pubrel.packet_id)))
    }

    /// PUBCOMP completes a QoS 2 delivery.
    pub(crate) fn handle_pubcomp(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        pubcomp: PubComp,
    ) {
        session.write().inflight_outgoing.remove(&pubcomp.packet_id);
        self.promote_queued(client_id);
    }

    /// An ack freed an inflight slot; pull the next held message, if any.
    fn promote_queued(&self, client_id: &Arc<str>) {
        if let Some(outbound) = &self.outbound {
            self.ctx.router.flush_queued(client_id, outbound);
        }
    }

    /// Retransmit deliveries whose ack is overdue. A delivery that has
    /// exhausted the retry budget fails the connection with
    /// [`BrokerError::DeliveryTimeout`]; the session (and the message)
    /// survive for the next connection.
    pub(crate) fn retry_unacked(
        &mut self,
        session: &Arc<RwLock<Session>>,
    ) -> Result<(), BrokerError> {
        let interval = self.ctx.config.limits.retry_interval;
        let max_retries = self.ctx.config.limits.max_retries;
        let now = Instant::now();

        let to_retry: Vec<_> = {
            let mut s = session.write();
            let mut exhausted: Option<(u16, u32)> = None;
            let due: Vec<_> = s
                .inflight_outgoing
                .values_mut()
                .filter(|inflight| inflight.is_due(interval))
                .filter_map(|inflight| {
                    if max_retries != 0 && inflight.retries >= max_retries {
                        exhausted = Some((inflight.packet_id, inflight.retries));
                        return None;
                    }
                    inflight.retries += 1;
                    inflight.sent_at = now;
                    Some((inflight.packet_id, inflight.publish.clone(), inflight.qos2))
                })
                .collect();
            if let Some((packet_id, retries)) = exhausted {
                return Err(BrokerError::DeliveryTimeout { packet_id, retries });
            }
            due
        };

        for (packet_id, mut publish, qos2) in to_retry {
            match qos2 {
                None | Some(Qos2Stage::AwaitingPubRec) => {
                    publish.dup = true;
                    publish.packet_id = Some(packet_id);
                    trace!(packet_id, "retrying PUBLISH");
                    self.enqueue(Packet::Publish(publish))?;
                }
                Some(Qos2Stage::AwaitingPubComp) => {
                    trace!(packet_id, "retrying PUBREL");
                    self.enqueue(Packet::PubRel(PubRel::new(packet_id)))?;
                }
            }
        }
        Ok(())
    }
}
