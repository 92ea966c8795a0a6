//! Shared helpers for repo-net integration tests.

#![allow(dead_code)]

use repo_net::auth::{create_device, create_user, AuthProvider, AuthProviderConfig};
use repo_net::events::{EventBus, Subscription};
use repo_net::protocol::{ChannelId, MessageEnvelope};
use repo_net::transport::{self, AdapterEvent, NetworkAdapter};
use repo_net::PeerId;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn peer(s: &str) -> PeerId {
    s.parse().unwrap()
}

/// Let spawned pump tasks run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

/// Poll `check` until it holds or a second has passed.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Record every event published on `bus`.
pub fn record<E: Clone + Send + 'static>(bus: &Arc<EventBus<E>>) -> (Arc<Mutex<Vec<E>>>, Subscription<E>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = Arc::clone(&seen);
    let subscription = bus.subscribe(move |event| seen_clone.lock().unwrap().push(event));
    (seen, subscription)
}

pub fn member(user: &str, device: &str) -> Arc<AuthProvider> {
    AuthProvider::new(AuthProviderConfig::new(create_device(user, device)).with_user(create_user(user)))
}

// ============================================================================
// Scripted adapter
// ============================================================================

/// Adapter driven by the test: events are injected by hand and sent
/// envelopes are recorded.
pub struct ScriptedAdapter {
    events: Arc<EventBus<AdapterEvent>>,
    ready_on_connect: bool,
    local: Mutex<Option<PeerId>>,
    sent: Mutex<Vec<MessageEnvelope>>,
}

impl ScriptedAdapter {
    pub fn new() -> Arc<Self> {
        Self::with_ready(true)
    }

    /// Adapter that stays unready until `ready()` is called.
    pub fn slow() -> Arc<Self> {
        Self::with_ready(false)
    }

    fn with_ready(ready_on_connect: bool) -> Arc<Self> {
        Arc::new(Self {
            events: Arc::new(EventBus::new()),
            ready_on_connect,
            local: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn local_peer(&self) -> Option<PeerId> {
        self.local.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<MessageEnvelope> {
        self.sent.lock().unwrap().clone()
    }

    pub fn ready(&self) {
        self.events.emit(AdapterEvent::Ready);
    }

    pub fn candidate(&self, peer_id: PeerId) {
        self.events.emit(AdapterEvent::PeerCandidate {
            peer_id,
            channel_id: ChannelId::sync(),
        });
    }

    pub fn deliver(&self, envelope: MessageEnvelope) {
        self.events.emit(AdapterEvent::Message(envelope));
    }

    pub fn lose(&self, peer_id: PeerId) {
        self.events.emit(AdapterEvent::PeerDisconnected { peer_id });
    }
}

impl NetworkAdapter for ScriptedAdapter {
    fn events(&self) -> &Arc<EventBus<AdapterEvent>> {
        &self.events
    }

    fn connect(&self, peer_id: PeerId) {
        *self.local.lock().unwrap() = Some(peer_id);
        if self.ready_on_connect {
            self.ready();
        }
    }

    fn send(&self, envelope: MessageEnvelope) -> transport::Result<()> {
        self.sent.lock().unwrap().push(envelope);
        Ok(())
    }

    fn disconnect(&self) {
        self.events.emit(AdapterEvent::Close);
    }
}
