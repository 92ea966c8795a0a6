//! AuthenticatedAdapter: decorator that only exposes authenticated peers.
//!
//! Produced by `AuthProvider::wrap_network_adapter`. It subscribes to the
//! wrapped adapter and republishes a filtered, decrypted event stream:
//!
//! - `PeerCandidate` starts handshakes and is only re-emitted once one of them
//!   reaches connected.
//! - Auth channel messages (`auth_channel`, `a/<shareId>`) feed handshakes and
//!   are never re-emitted.
//! - Other messages are opened with the sender's `MessageTransform`; failures
//!   become `Error` events and the message is dropped.
//! - `Ready`, `Error`, `PeerDisconnected` and `Close` pass through unchanged.
//!
//! Outbound envelopes are serialized whole and sealed, so counts and session
//! ids of relayed messages travel inside the tunnel.

use super::crypto::SymmetricKey;
use super::provider::AuthProvider;
use super::{AuthError, Result};
use crate::events::{EventBus, Subscription};
use crate::ids::ShareId;
use crate::protocol::{ChannelId, MessageEnvelope};
use crate::transport::{self, AdapterEvent, NetworkAdapter, TransportError};
use crate::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

#[derive(Serialize, Deserialize)]
struct SealedPayload {
    share_id: ShareId,
    data: Vec<u8>,
}

/// Inbound/outbound transform for one peer.
///
/// Holds the session key of every share the peer authenticated for. With no
/// sessions it is the identity transform. Values are immutable; installing a
/// session produces a new transform that replaces the old one in one step.
#[derive(Debug, Clone, Default)]
pub struct MessageTransform {
    sessions: BTreeMap<ShareId, SymmetricKey>,
}

impl MessageTransform {
    pub fn identity() -> Self {
        Self::default()
    }

    pub fn is_identity(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn with_session(&self, share_id: ShareId, key: SymmetricKey) -> Self {
        let mut next = self.clone();
        next.sessions.insert(share_id, key);
        next
    }

    pub fn without_session(&self, share_id: &ShareId) -> Self {
        let mut next = self.clone();
        next.sessions.remove(share_id);
        next
    }

    pub fn shares(&self) -> impl Iterator<Item = &ShareId> {
        self.sessions.keys()
    }

    /// Seal with the session of the lowest share id.
    pub fn outbound(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let Some((share_id, key)) = self.sessions.iter().next() else {
            return Ok(plaintext.to_vec());
        };
        let payload = SealedPayload {
            share_id: share_id.clone(),
            data: key.encrypt(plaintext)?,
        };
        Ok(bincode::serialize(&payload)?)
    }

    pub fn inbound(&self, data: &[u8]) -> Result<Vec<u8>> {
        if self.is_identity() {
            return Ok(data.to_vec());
        }
        let payload: SealedPayload = bincode::deserialize(data)?;
        let key = self
            .sessions
            .get(&payload.share_id)
            .ok_or_else(|| AuthError::NotFound(format!("no session for share {}", payload.share_id)))?;
        Ok(key.decrypt(&payload.data)?)
    }
}

#[derive(Default)]
struct AdapterState {
    local_peer_id: Option<PeerId>,
    /// Installed transforms; a peer is announced while it has one.
    transforms: HashMap<PeerId, Arc<MessageTransform>>,
    /// Candidates reported by the wrapped adapter, for shares added later.
    candidates: HashMap<PeerId, ChannelId>,
}

pub struct AuthenticatedAdapter {
    id: usize,
    base: Arc<dyn NetworkAdapter>,
    provider: Weak<AuthProvider>,
    events: Arc<EventBus<AdapterEvent>>,
    state: Mutex<AdapterState>,
    base_subscription: Mutex<Option<Subscription<AdapterEvent>>>,
}

impl AuthenticatedAdapter {
    pub(crate) fn new(id: usize, base: Arc<dyn NetworkAdapter>, provider: &Arc<AuthProvider>) -> Arc<Self> {
        let adapter = Arc::new(Self {
            id,
            base,
            provider: Arc::downgrade(provider),
            events: Arc::new(EventBus::new()),
            state: Mutex::new(AdapterState::default()),
            base_subscription: Mutex::new(None),
        });

        let weak: Weak<Self> = Arc::downgrade(&adapter);
        let subscription = adapter.base.events().subscribe(move |event| {
            if let Some(adapter) = weak.upgrade() {
                adapter.handle_base_event(event);
            }
        });
        *adapter
            .base_subscription
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(subscription);
        adapter
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn base(&self) -> &Arc<dyn NetworkAdapter> {
        &self.base
    }

    pub fn local_peer_id(&self) -> Option<PeerId> {
        self.lock().local_peer_id.clone()
    }

    pub fn is_authenticated(&self, peer_id: &PeerId) -> bool {
        self.lock().transforms.contains_key(peer_id)
    }

    /// Channel the wrapped adapter announced `peer_id` on, `sync_channel` if
    /// the handshake started from an inbound hello instead.
    pub(crate) fn candidate_channel(&self, peer_id: &PeerId) -> ChannelId {
        self.lock()
            .candidates
            .get(peer_id)
            .cloned()
            .unwrap_or_else(ChannelId::sync)
    }

    pub(crate) fn known_candidates(&self) -> Vec<(PeerId, ChannelId)> {
        self.lock()
            .candidates
            .iter()
            .map(|(p, c)| (p.clone(), c.clone()))
            .collect()
    }

    /// Install a share session for `peer_id`. Returns true when this is the
    /// peer's first session, i.e. it should be announced.
    pub(crate) fn install_session(&self, peer_id: &PeerId, share_id: &ShareId, key: SymmetricKey) -> bool {
        let mut state = self.lock();
        let current = state.transforms.get(peer_id).cloned();
        let first = current.is_none();
        let next = current
            .unwrap_or_default()
            .with_session(share_id.clone(), key);
        state.transforms.insert(peer_id.clone(), Arc::new(next));
        first
    }

    /// Remove a share session. Returns true when the peer has none left.
    pub(crate) fn remove_session(&self, peer_id: &PeerId, share_id: &ShareId) -> bool {
        let mut state = self.lock();
        let Some(current) = state.transforms.get(peer_id).cloned() else {
            return false;
        };
        let next = current.without_session(share_id);
        if next.is_identity() {
            state.transforms.remove(peer_id);
            true
        } else {
            state.transforms.insert(peer_id.clone(), Arc::new(next));
            false
        }
    }

    pub(crate) fn emit(&self, event: AdapterEvent) {
        self.events.emit(event);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AdapterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn handle_base_event(self: &Arc<Self>, event: AdapterEvent) {
        let Some(provider) = self.provider.upgrade() else {
            return;
        };

        match event {
            AdapterEvent::PeerCandidate { peer_id, channel_id } => {
                self.lock()
                    .candidates
                    .insert(peer_id.clone(), channel_id.clone());
                provider.on_candidate(self, peer_id, channel_id);
            }
            AdapterEvent::Message(envelope) if envelope.channel_id.is_auth() => {
                provider.on_auth_message(self, envelope);
            }
            AdapterEvent::Message(envelope) => self.receive(envelope),
            AdapterEvent::PeerDisconnected { peer_id } => {
                {
                    let mut state = self.lock();
                    state.candidates.remove(&peer_id);
                    state.transforms.remove(&peer_id);
                }
                provider.abort_peer(self.id, &peer_id);
                self.emit(AdapterEvent::PeerDisconnected { peer_id });
            }
            AdapterEvent::Close => {
                {
                    let mut state = self.lock();
                    state.candidates.clear();
                    state.transforms.clear();
                }
                provider.abort_adapter(self.id);
                self.emit(AdapterEvent::Close);
            }
            other => self.emit(other),
        }
    }

    fn receive(&self, envelope: MessageEnvelope) {
        let channel_id = envelope.channel_id.clone();
        let Some(sender) = envelope.sender_id.clone() else {
            debug!("Dropping message without sender on {}", channel_id);
            return;
        };

        let transform = self.lock().transforms.get(&sender).cloned();
        let opened = match transform {
            Some(transform) => transform
                .inbound(&envelope.message)
                .and_then(|plain| MessageEnvelope::from_json(&plain).map_err(AuthError::from)),
            None => Err(AuthError::NotAuthenticated(sender.clone())),
        };

        match opened {
            Ok(inner) => self.emit(AdapterEvent::Message(inner)),
            Err(e) => {
                warn!("Dropping message from {} on {}: {}", sender, channel_id, e);
                self.emit(AdapterEvent::Error {
                    peer_id: Some(sender),
                    channel_id: Some(channel_id),
                    error: Arc::new(e),
                });
            }
        }
    }
}

impl NetworkAdapter for AuthenticatedAdapter {
    fn events(&self) -> &Arc<EventBus<AdapterEvent>> {
        &self.events
    }

    fn connect(&self, peer_id: PeerId) {
        self.lock().local_peer_id = Some(peer_id.clone());
        self.base.connect(peer_id);
    }

    fn send(&self, envelope: MessageEnvelope) -> transport::Result<()> {
        let target = envelope
            .target_id
            .clone()
            .ok_or_else(|| TransportError::PeerNotFound("envelope has no target".to_string()))?;
        let (transform, local) = {
            let state = self.lock();
            (state.transforms.get(&target).cloned(), state.local_peer_id.clone())
        };
        let transform = transform.ok_or_else(|| TransportError::NotAuthenticated(target.clone()))?;
        let sender = local
            .or_else(|| envelope.sender_id.clone())
            .ok_or_else(|| TransportError::Other("adapter is not connected".to_string()))?;

        let sealed = envelope
            .to_json()
            .map_err(AuthError::from)
            .and_then(|inner| transform.outbound(&inner))
            .map_err(|e| TransportError::Other(e.to_string()))?;

        let mut outer = MessageEnvelope::sync(sender, target, envelope.channel_id.clone(), sealed);
        outer.broadcast = envelope.broadcast;
        self.base.send(outer)
    }

    fn disconnect(&self) {
        self.base.disconnect();
    }
}
