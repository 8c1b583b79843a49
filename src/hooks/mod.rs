//! Extensibility points for authentication, authorization, and lifecycle
//! events. Embedders implement [`Hooks`] to gate CONNECT, PUBLISH, and
//! SUBSCRIBE; every method has an allow-all default.

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::protocol::{QoS, ReasonCode};

#[cfg(test)]
mod tests;

/// Verdict of an authentication hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Allow,
    /// Refuse the connection with this CONNACK reason
    Deny(ReasonCode),
}

impl AuthOutcome {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AuthOutcome::Allow)
    }
}

/// Broker extension trait.
///
/// The checks run inline on the connection task, so implementations should
/// stay fast; anything slow belongs behind a cache or a channel.
#[async_trait]
pub trait Hooks: Send + Sync {
    /// Called on CONNECT before any session state is touched.
    async fn authenticate(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _password: Option<&[u8]>,
        _remote_addr: SocketAddr,
    ) -> AuthOutcome {
        AuthOutcome::Allow
    }

    /// Called for every inbound PUBLISH. Returning false drops the message
    /// and, for QoS 1/2, acks it with NotAuthorized.
    async fn may_publish(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _topic: &str,
        _qos: QoS,
        _retain: bool,
    ) -> bool {
        true
    }

    /// Called per filter in a SUBSCRIBE. Returning false marks that filter
    /// NotAuthorized in the SUBACK without failing the rest.
    async fn may_subscribe(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _filter: &str,
        _qos: QoS,
    ) -> bool {
        true
    }

    /// Called after CONNACK is queued for a successful connect.
    async fn on_connected(&self, _client_id: &str, _username: Option<&str>) {}

    /// Called when a connection ends. `graceful` is true when the client
    /// sent DISCONNECT.
    async fn on_disconnected(&self, _client_id: &str, _graceful: bool) {}
}

/// Allow-everything implementation used when no hooks are installed.
#[derive(Default)]
pub struct DefaultHooks;

#[async_trait]
impl Hooks for DefaultHooks {}

#[async_trait]
impl<T: Hooks + ?Sized> Hooks for std::sync::Arc<T> {
    async fn authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
        remote_addr: SocketAddr,
    ) -> AuthOutcome {
        (**self)
            .authenticate(client_id, username, password, remote_addr)
            .await
    }

    async fn may_publish(
        &self,
        client_id: &str,
        username: Option<&str>,
        topic: &str,
        qos: QoS,
        retain: bool,
    ) -> bool {
        (**self)
            .may_publish(client_id, username, topic, qos, retain)
            .await
    }

    async fn may_subscribe(
        &self,
        client_id: &str,
        username: Option<&str>,
        filter: &str,
        qos: QoS,
    ) -> bool {
        (**self).may_subscribe(client_id, username, filter, qos).await
    }

    async fn on_connected(&self, client_id: &str, username: Option<&str>) {
        (**self).on_connected(client_id, username).await;
    }

    async fn on_disconnected(&self, client_id: &str, graceful: bool) {
        (**self).on_disconnected(client_id, graceful).await;
    }
}

/// Chains several hook implementations.
///
/// Checks short-circuit on the first denial; events fan out to every
/// member in registration order.
#[derive(Default)]
pub struct CompositeHooks {
    hooks: Vec<Box<dyn Hooks>>,
}

impl CompositeHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<H: Hooks + 'static>(&mut self, hooks: H) {
        self.hooks.push(Box::new(hooks));
    }

    pub fn with<H: Hooks + 'static>(mut self, hooks: H) -> Self {
        self.add(hooks);
        self
    }
}

#[async_trait]
impl Hooks for CompositeHooks {
    async fn authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
        remote_addr: SocketAddr,
    ) -> AuthOutcome {
        for hooks in &self.hooks {
            if let AuthOutcome::Deny(reason) = hooks
                .authenticate(client_id, username, password, remote_addr)
                .await
            {
                return AuthOutcome::Deny(reason);
            }
        }
        AuthOutcome::Allow
    }

    async fn may_publish(
        &self,
        client_id: &str,
        username: Option<&str>,
        topic: &str,
        qos: QoS,
        retain: bool,
    ) -> bool {
        for hooks in &self.hooks {
            if !hooks
                .may_publish(client_id, username, topic, qos, retain)
                .await
            {
                return false;
            }
        }
        true
    }

    async fn may_subscribe(
        &self,
        client_id: &str,
        username: Option<&str>,
        filter: &str,
        qos: QoS,
    ) -> bool {
        for hooks in &self.hooks {
            if !hooks.may_subscribe(client_id, username, filter, qos).await {
                return false;
            }
        }
        true
    }

    async fn on_connected(&self, client_id: &str, username: Option<&str>) {
        for hooks in &self.hooks {
            hooks.on_connected(client_id, username).await;
        }
    }

    async fn on_disconnected(&self, client_id: &str, graceful: bool) {
        for hooks in &self.hooks {
            hooks.on_disconnected(client_id, graceful).await;
        }
    }
}
