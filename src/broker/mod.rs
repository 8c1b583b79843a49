//! The broker engine: owns the shared stores, accepts transports, and
//! runs the background session-expiry sweep.
//!
//! The broker is transport-agnostic. The embedding application accepts
//! connections however it likes, wraps each one in a [`PacketTransport`],
//! and hands it to [`Broker::attach`]; everything from CONNECT onward
//! happens on the spawned connection task.

mod connection;
pub(crate) mod outbound;
mod router;

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::Config;
use crate::hooks::{DefaultHooks, Hooks};
use crate::protocol::{BrokerError, Publish, QoS};
use crate::retained::RetainedStore;
use crate::session::SessionStore;
use crate::topic::{validate_topic_name, SubscriptionStore};
use crate::transport::PacketTransport;

use connection::{Connection, Context};
use outbound::Outbound;
use router::Router;

/// Observable broker happenings, for monitoring and tests.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    ClientConnected {
        client_id: Arc<str>,
    },
    ClientDisconnected {
        client_id: Arc<str>,
    },
    MessagePublished {
        topic: Arc<str>,
        payload: Bytes,
        qos: QoS,
    },
    /// A message bound for an offline session was lost to queue overflow
    MessageDropped {
        client_id: Arc<str>,
        topic: Arc<str>,
    },
}

pub struct Broker {
    config: Arc<Config>,
    sessions: Arc<SessionStore>,
    subscriptions: Arc<SubscriptionStore>,
    retained: Arc<RetainedStore>,
    connections: Arc<DashMap<Arc<str>, Arc<Outbound>>>,
    router: Arc<Router>,
    ctx: Arc<Context>,
    events: broadcast::Sender<BrokerEvent>,
    shutdown: broadcast::Sender<()>,
}

impl Broker {
    pub fn new(config: Config) -> Self {
        Self::with_hooks(config, Arc::new(DefaultHooks))
    }

    pub fn with_hooks(config: Config, hooks: Arc<dyn Hooks>) -> Self {
        let config = Arc::new(config);
        let sessions = Arc::new(SessionStore::new());
        let subscriptions = Arc::new(SubscriptionStore::new());
        let retained = Arc::new(RetainedStore::new());
        let connections: Arc<DashMap<Arc<str>, Arc<Outbound>>> = Arc::new(DashMap::new());
        let (events, _) = broadcast::channel(1024);
        let (shutdown, _) = broadcast::channel(1);

        let router = Arc::new(Router::new(
            Arc::clone(&subscriptions),
            Arc::clone(&sessions),
            Arc::clone(&retained),
            Arc::clone(&connections),
            Arc::clone(&config),
            events.clone(),
        ));
        let ctx = Arc::new(Context {
            sessions: Arc::clone(&sessions),
            subscriptions: Arc::clone(&subscriptions),
            retained: Arc::clone(&retained),
            connections: Arc::clone(&connections),
            router: Arc::clone(&router),
            config: Arc::clone(&config),
            hooks,
            events: events.clone(),
        });

        Self {
            config,
            sessions,
            subscriptions,
            retained,
            connections,
            router,
            ctx,
            events,
            shutdown,
        }
    }

    /// Take ownership of a transport and run its protocol state machine
    /// on a new task. The first packet must be a CONNECT.
    pub fn attach<T>(&self, transport: T, addr: SocketAddr) -> JoinHandle<Result<(), BrokerError>>
    where
        T: PacketTransport + 'static,
    {
        let ctx = Arc::clone(&self.ctx);
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut connection = Connection::new(transport, addr, ctx, shutdown);
            let result = connection.run().await;
            if let Err(ref e) = result {
                debug!(addr = %addr, error = %e, "connection ended");
            }
            result
        })
    }

    /// Publish a message from the embedding application, outside any
    /// client connection. Retained handling and fan-out follow the same
    /// path as client publishes.
    pub fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<usize, BrokerError> {
        validate_topic_name(topic).map_err(|_| BrokerError::ProtocolViolation("invalid topic"))?;
        let publish = Publish {
            dup: false,
            qos,
            retain,
            topic: Arc::from(topic),
            packet_id: None,
            payload,
        };
        let delivered = self.router.route(&publish);
        let _ = self.events.send(BrokerEvent::MessagePublished {
            topic: Arc::clone(&publish.topic),
            payload: publish.payload,
            qos,
        });
        Ok(delivered)
    }

    /// Periodically drop expired sessions and their subscriptions. Runs
    /// until [`Broker::shutdown`] is called.
    pub fn spawn_expiry_sweeper(&self) -> JoinHandle<()> {
        let sessions = Arc::clone(&self.sessions);
        let subscriptions = Arc::clone(&self.subscriptions);
        let interval = self.config.session.sweep_interval;
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = sessions.sweep();
                        for client_id in &removed {
                            subscriptions.unsubscribe_all(client_id);
                        }
                        if !removed.is_empty() {
                            info!(count = removed.len(), "expired sessions removed");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }

    /// Signal every connection task and background task to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    pub fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn retained_count(&self) -> usize {
        self.retained.len()
    }
}
