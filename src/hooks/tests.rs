use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::*;

fn remote() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 52000))
}

struct DenyPublishTo(&'static str);

#[async_trait]
impl Hooks for DenyPublishTo {
    async fn may_publish(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        topic: &str,
        _qos: QoS,
        _retain: bool,
    ) -> bool {
        topic != self.0
    }
}

struct PasswordGate;

#[async_trait]
impl Hooks for PasswordGate {
    async fn authenticate(
        &self,
        _client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
        _remote_addr: SocketAddr,
    ) -> AuthOutcome {
        match (username, password) {
            (Some("admin"), Some(b"secret")) => AuthOutcome::Allow,
            _ => AuthOutcome::Deny(ReasonCode::BadUserNameOrPassword),
        }
    }
}

struct CountingHooks {
    connects: AtomicUsize,
}

#[async_trait]
impl Hooks for CountingHooks {
    async fn on_connected(&self, _client_id: &str, _username: Option<&str>) {
        self.connects.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn defaults_allow_everything() {
    let hooks = DefaultHooks;
    assert!(hooks.authenticate("c", None, None, remote()).await.is_allowed());
    assert!(hooks.may_publish("c", None, "t", QoS::AtMostOnce, false).await);
    assert!(hooks.may_subscribe("c", None, "#", QoS::ExactlyOnce).await);
}

#[tokio::test]
async fn authenticate_deny_carries_reason() {
    let hooks = PasswordGate;
    assert!(hooks
        .authenticate("c", Some("admin"), Some(b"secret"), remote())
        .await
        .is_allowed());
    assert_eq!(
        hooks.authenticate("c", Some("admin"), Some(b"wrong"), remote()).await,
        AuthOutcome::Deny(ReasonCode::BadUserNameOrPassword)
    );
}

#[tokio::test]
async fn composite_short_circuits_on_denial() {
    let hooks = CompositeHooks::new()
        .with(DenyPublishTo("secret/topic"))
        .with(DefaultHooks);

    assert!(hooks.may_publish("c", None, "open/topic", QoS::AtMostOnce, false).await);
    assert!(!hooks.may_publish("c", None, "secret/topic", QoS::AtMostOnce, false).await);
}

#[tokio::test]
async fn composite_fans_out_events() {
    let counter = Arc::new(CountingHooks {
        connects: AtomicUsize::new(0),
    });
    let hooks = CompositeHooks::new()
        .with(Arc::clone(&counter))
        .with(Arc::clone(&counter));

    hooks.on_connected("c", None).await;
    assert_eq!(counter.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn arc_wrapped_hooks_delegate() {
    let hooks: Arc<dyn Hooks> = Arc::new(PasswordGate);
    assert_eq!(
        hooks.authenticate("c", None, None, remote()).await,
        AuthOutcome::Deny(ReasonCode::BadUserNameOrPassword)
    );
}
