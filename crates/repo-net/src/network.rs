//! NetworkSubsystem: many adapters, one peer-addressable network.
//!
//! The subsystem owns the peer → adapter registry, the aggregate readiness
//! flag, the ephemeral dedup table and the local sender sequence. Every
//! state change happens inside an adapter callback while holding the single
//! `inner` lock; the lock is always released before events are emitted so
//! subscribers may call back into `send`.
//!
//! Peer binding is first-writer-wins: a candidate for a peer that is already
//! bound to another adapter is ignored, and a disconnect only counts when it
//! comes from the adapter that owns the binding.

use crate::events::{EventBus, Subscription};
use crate::ids::SessionId;
use crate::protocol::{
    ChannelId, EphemeralMessage, MessageContents, MessageEnvelope, RepoMessage, SyncMessage,
};
use crate::transport::{AdapterEvent, NetworkAdapter, SharedError};
use crate::PeerId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub type AdapterId = usize;

#[derive(Clone, Debug)]
pub enum NetworkEvent {
    /// A peer became reachable through one of the adapters.
    Peer { peer_id: PeerId },
    PeerDisconnected { peer_id: PeerId },
    /// A validated (and, for ephemeral, deduplicated) inbound message.
    Message(RepoMessage),
    /// Every registered adapter is ready.
    Ready,
    Error {
        peer_id: Option<PeerId>,
        channel_id: Option<ChannelId>,
        error: SharedError,
    },
}

struct AdapterEntry {
    adapter: Arc<dyn NetworkAdapter>,
    ready: bool,
    _subscription: Subscription<AdapterEvent>,
}

#[derive(Default)]
struct Inner {
    adapters: HashMap<AdapterId, AdapterEntry>,
    adapters_by_peer: HashMap<PeerId, AdapterId>,
    /// Highest ephemeral count delivered per (sender, session).
    ephemeral_counts: HashMap<(PeerId, SessionId), u64>,
}

impl Inner {
    fn all_ready(&self) -> bool {
        self.adapters.values().all(|a| a.ready)
    }
}

pub struct NetworkSubsystem {
    peer_id: PeerId,
    session_id: SessionId,
    count: AtomicU64,
    next_adapter_id: AtomicUsize,
    inner: Mutex<Inner>,
    ready: watch::Sender<bool>,
    events: Arc<EventBus<NetworkEvent>>,
}

impl NetworkSubsystem {
    pub fn new(peer_id: PeerId) -> Arc<Self> {
        let (ready, _) = watch::channel(true);
        Arc::new(Self {
            peer_id,
            session_id: SessionId::generate(),
            count: AtomicU64::new(0),
            next_adapter_id: AtomicUsize::new(0),
            inner: Mutex::new(Inner::default()),
            ready,
            events: Arc::new(EventBus::new()),
        })
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn events(&self) -> &Arc<EventBus<NetworkEvent>> {
        &self.events
    }

    /// Register an adapter and connect it as the local peer.
    pub fn add_network_adapter(self: &Arc<Self>, adapter: Arc<dyn NetworkAdapter>) -> AdapterId {
        let id = self.next_adapter_id.fetch_add(1, Ordering::Relaxed);
        let weak: Weak<Self> = Arc::downgrade(self);
        let subscription = adapter.events().subscribe(move |event| {
            if let Some(network) = weak.upgrade() {
                network.handle_adapter_event(id, event);
            }
        });

        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.adapters.insert(
                id,
                AdapterEntry {
                    adapter: Arc::clone(&adapter),
                    ready: false,
                    _subscription: subscription,
                },
            );
        }
        self.ready.send_replace(false);
        debug!("Adapter {} added, connecting as {}", id, self.peer_id);

        adapter.connect(self.peer_id.clone());
        id
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Resolves once every registered adapter has signalled ready.
    pub async fn when_ready(&self) {
        let mut rx = self.ready.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Peers currently bound to an adapter.
    pub fn peers(&self) -> Vec<PeerId> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut peers: Vec<_> = inner.adapters_by_peer.keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn adapter_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .adapters
            .len()
    }

    /// Send to `contents.target_id()` through the adapter that owns that peer.
    ///
    /// Unknown peers are dropped with a warning. Adapter failures surface as
    /// `NetworkEvent::Error`.
    pub fn send(&self, contents: MessageContents) {
        let target = contents.target_id().clone();
        let adapter = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner
                .adapters_by_peer
                .get(&target)
                .and_then(|id| inner.adapters.get(id))
                .map(|entry| Arc::clone(&entry.adapter))
        };
        let Some(adapter) = adapter else {
            warn!("Tried to send to unknown peer {}, dropping", target);
            return;
        };

        let envelope = self.stamp(contents);
        let channel_id = envelope.channel_id.clone();
        if let Err(e) = adapter.send(envelope) {
            warn!("Send to {} on {} failed: {}", target, channel_id, e);
            self.events.emit(NetworkEvent::Error {
                peer_id: Some(target),
                channel_id: Some(channel_id),
                error: Arc::new(e),
            });
        }
    }

    /// Disconnect every adapter.
    pub fn disconnect(&self) {
        let adapters: Vec<_> = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner
                .adapters
                .values()
                .map(|entry| Arc::clone(&entry.adapter))
                .collect()
        };
        for adapter in adapters {
            adapter.disconnect();
        }
    }

    fn stamp(&self, contents: MessageContents) -> MessageEnvelope {
        match contents {
            MessageContents::Sync {
                target_id,
                channel_id,
                message,
                broadcast,
            } => SyncMessage {
                sender_id: self.peer_id.clone(),
                target_id,
                channel_id,
                message,
                broadcast,
            }
            .into(),
            MessageContents::Ephemeral {
                target_id,
                channel_id,
                message,
                broadcast,
            } => EphemeralMessage {
                sender_id: self.peer_id.clone(),
                target_id,
                channel_id,
                message,
                broadcast,
                count: self.count.fetch_add(1, Ordering::Relaxed) + 1,
                session_id: self.session_id.clone(),
            }
            .into(),
            MessageContents::Relay(message) => message.into(),
        }
    }

    fn handle_adapter_event(&self, adapter_id: AdapterId, event: AdapterEvent) {
        let out = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            match event {
                AdapterEvent::Ready => {
                    let Some(entry) = inner.adapters.get_mut(&adapter_id) else {
                        return;
                    };
                    if entry.ready {
                        return;
                    }
                    entry.ready = true;
                    if inner.all_ready() {
                        info!("All {} adapters ready", inner.adapters.len());
                        self.ready.send_replace(true);
                        Some(NetworkEvent::Ready)
                    } else {
                        None
                    }
                }
                AdapterEvent::PeerCandidate { peer_id, channel_id } => {
                    match inner.adapters_by_peer.get(&peer_id).copied() {
                        Some(owner) => {
                            debug!(
                                "Peer {} already bound to adapter {}, ignoring candidate from {} on {}",
                                peer_id, owner, adapter_id, channel_id
                            );
                            None
                        }
                        None => {
                            inner.adapters_by_peer.insert(peer_id.clone(), adapter_id);
                            info!("Peer {} connected via adapter {}", peer_id, adapter_id);
                            Some(NetworkEvent::Peer { peer_id })
                        }
                    }
                }
                AdapterEvent::PeerDisconnected { peer_id } => {
                    if inner.adapters_by_peer.get(&peer_id) == Some(&adapter_id) {
                        inner.adapters_by_peer.remove(&peer_id);
                        info!("Peer {} disconnected", peer_id);
                        Some(NetworkEvent::PeerDisconnected { peer_id })
                    } else {
                        None
                    }
                }
                AdapterEvent::Message(envelope) => match RepoMessage::try_from(envelope) {
                    Err(e) => {
                        warn!("Dropping invalid message from adapter {}: {}", adapter_id, e);
                        None
                    }
                    Ok(RepoMessage::Ephemeral(message)) => {
                        let key = (message.sender_id.clone(), message.session_id.clone());
                        let last = inner.ephemeral_counts.get(&key).copied().unwrap_or(0);
                        if message.count > last {
                            inner.ephemeral_counts.insert(key, message.count);
                            Some(NetworkEvent::Message(RepoMessage::Ephemeral(message)))
                        } else {
                            debug!(
                                "Dropping stale ephemeral message {} from {} (last {})",
                                message.count, message.sender_id, last
                            );
                            None
                        }
                    }
                    Ok(message) => Some(NetworkEvent::Message(message)),
                },
                AdapterEvent::Error {
                    peer_id,
                    channel_id,
                    error,
                } => {
                    warn!("Adapter {} error (peer {:?}): {}", adapter_id, peer_id, error);
                    Some(NetworkEvent::Error {
                        peer_id,
                        channel_id,
                        error,
                    })
                }
                AdapterEvent::Close => {
                    inner.adapters_by_peer.retain(|_, owner| *owner != adapter_id);
                    let removed = inner.adapters.remove(&adapter_id);
                    info!("Adapter {} closed", adapter_id);
                    drop(inner);
                    // Dropping the entry unsubscribes from the adapter.
                    drop(removed);
                    None
                }
            }
        };

        if let Some(event) = out {
            self.events.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ready_without_adapters() {
        let network = NetworkSubsystem::new(PeerId::generate());
        assert!(network.is_ready());
        network.when_ready().await;
    }

    #[test]
    fn test_ephemeral_stamping_increments_count() {
        let network = NetworkSubsystem::new("me".parse().unwrap());
        let stamp = |n: &NetworkSubsystem| {
            n.stamp(MessageContents::Ephemeral {
                target_id: "you".parse().unwrap(),
                channel_id: ChannelId::ephemeral("x"),
                message: vec![],
                broadcast: true,
            })
        };
        let first = stamp(&network);
        let second = stamp(&network);
        assert_eq!(first.count, Some(1));
        assert_eq!(second.count, Some(2));
        assert_eq!(first.session_id.as_ref(), Some(network.session_id()));
        assert_eq!(first.sender_id.as_ref().map(|p| p.as_str()), Some("me"));
    }

    #[test]
    fn test_relay_passes_through() {
        let network = NetworkSubsystem::new("me".parse().unwrap());
        let relayed = EphemeralMessage {
            sender_id: "origin".parse().unwrap(),
            target_id: "you".parse().unwrap(),
            channel_id: ChannelId::ephemeral("x"),
            message: vec![1],
            broadcast: false,
            count: 42,
            session_id: SessionId::from("theirs"),
        };
        let env = network.stamp(MessageContents::Relay(relayed.clone()));
        assert_eq!(env, MessageEnvelope::from(relayed));
    }

    #[test]
    fn test_separate_instances_have_separate_sequences() {
        let a = NetworkSubsystem::new("a".parse().unwrap());
        let b = NetworkSubsystem::new("b".parse().unwrap());
        assert_ne!(a.session_id(), b.session_id());
    }
}
