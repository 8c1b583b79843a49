//! Connection teardown and will publication.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::Connection;
use crate::broker::BrokerEvent;
use crate::protocol::Publish;
use crate::session::Session;
use crate::transport::PacketTransport;

impl<T: PacketTransport> Connection<T> {
    /// Tear the connection down: unregister it, park or destroy the
    /// session, and publish the will when the close was abnormal.
    pub(crate) async fn handle_disconnect(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        publish_will: bool,
        graceful: bool,
    ) {
        // Only the registered owner of this client id may touch the
        // session. After a takeover the registration, the session, and the
        // will all belong to the successor; the evicted task must leave
        // them alone.
        let owned = match &self.outbound {
            Some(outbound) => {
                let unregistered = self
                    .ctx
                    .connections
                    .remove_if(client_id, |_, registered| Arc::ptr_eq(registered, outbound))
                    .is_some();
                outbound.close();
                unregistered
            }
            None => false,
        };

        if owned {
            let will = session.write().will.take();
            if publish_will {
                if let Some(will) = will {
                    debug!(client_id = %client_id, topic = %will.topic, "publishing will");
                    let publish = Publish {
                        dup: false,
                        qos: will.qos,
                        retain: will.retain,
                        topic: Arc::from(will.topic.as_str()),
                        packet_id: None,
                        payload: will.payload,
                    };
                    self.ctx.router.route(&publish);
                }
            }

            // Zero-expiry sessions are removed outright; their filters go too
            let removed = self.ctx.sessions.detach(client_id);
            if removed {
                self.ctx.subscriptions.unsubscribe_all(client_id);
            }

            let _ = self.ctx.events.send(BrokerEvent::ClientDisconnected {
                client_id: Arc::clone(client_id),
            });
        } else {
            debug!(client_id = %client_id, "connection superseded, session left to successor");
        }

        self.ctx.hooks.on_disconnected(client_id, graceful).await;

        debug!(client_id = %client_id, graceful, owned, "disconnected");
    }
}
