//! AuthProvider: owns shares and turns raw adapters into authenticated ones.
//!
//! The provider holds the device identity (and the user identity, when this
//! device has it), every share it belongs to, invitations it is waiting to
//! redeem, and one flat arena of handshake connections keyed by
//! `(ShareId, PeerId)`. There is at most one live connection per key: a
//! candidate for a key that already has one is ignored, and a finished
//! connection is removed before a new one is created.
//!
//! Adapters returned by `wrap_network_adapter` call back into the provider for
//! candidates, handshake traffic and transport loss; the provider answers by
//! installing session transforms on the adapter and emitting the gated
//! `PeerCandidate`. All state lives behind one mutex that is never held while
//! events are emitted.
//!
//! The provider's `Share` is the authoritative team. A connection is brought
//! up to date with it before each step it takes, and any admission or merge
//! the step produced is folded back under the same lock, so invitation use
//! counts are always checked against every admission made so far.

use super::adapter::AuthenticatedAdapter;
use super::channel::AuthChannel;
use super::handshake::{Connection, ConnectionEvent, ConnectionState, HandshakeMessage, InitialContext, SendFn};
use super::identity::{FullIdentity, PublicIdentity};
use super::team::{InvitationSeed, InviteOptions, Team, TeamKeyring};
use super::{AuthError, Result};
use crate::events::{EventBus, Subscription};
use crate::ids::{DocumentId, ShareId};
use crate::protocol::{ChannelId, ChannelKind, MessageEnvelope};
use crate::transport::{AdapterEvent, NetworkAdapter};
use crate::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct AuthProviderConfig {
    pub device: FullIdentity,
    /// Absent on a device that joins its user through a device invitation;
    /// the user identity arrives with the admission.
    pub user: Option<FullIdentity>,
}

impl AuthProviderConfig {
    pub fn new(device: FullIdentity) -> Self {
        Self { device, user: None }
    }

    pub fn with_user(mut self, user: FullIdentity) -> Self {
        self.user = Some(user);
        self
    }
}

/// What an invited user needs to join a share.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberInvitation {
    pub share_id: ShareId,
    pub seed: InvitationSeed,
}

/// What a new device of an existing user needs to join a share.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInvitation {
    pub share_id: ShareId,
    pub user_id: String,
    pub seed: InvitationSeed,
}

#[derive(Debug, Clone)]
pub enum AuthEvent {
    /// This device was admitted to a share it was invited to.
    Joined { share_id: ShareId },
    /// The share's team graph or document set changed (admission,
    /// invitation, merge).
    TeamChanged { share_id: ShareId },
    /// A peer authenticated for a share.
    Connected { share_id: ShareId, peer_id: PeerId },
    /// A handshake failed on either side.
    Failed {
        share_id: ShareId,
        peer_id: PeerId,
        reason: String,
    },
}

struct Share {
    team: Team,
    keyring: TeamKeyring,
    document_ids: BTreeSet<DocumentId>,
}

enum Pending {
    Member(InvitationSeed),
    Device { user_id: String, seed: InvitationSeed },
}

struct Slot {
    connection: Connection,
    channel: Arc<AuthChannel>,
    _messages: Subscription<Vec<u8>>,
    adapter: Weak<AuthenticatedAdapter>,
    adapter_id: usize,
    connected: bool,
}

impl Slot {
    fn is_live(&self) -> bool {
        self.connection.state() != ConnectionState::Disconnected
    }
}

type ConnectionKey = (ShareId, PeerId);
type Waiter = oneshot::Sender<Result<()>>;

#[derive(Default)]
struct State {
    user: Option<FullIdentity>,
    shares: BTreeMap<ShareId, Share>,
    pending: BTreeMap<ShareId, Pending>,
    connections: HashMap<ConnectionKey, Slot>,
    waiters: HashMap<PeerId, Vec<Waiter>>,
    connections_created: usize,
}

impl State {
    fn initial_context(&self, device: &FullIdentity, share_id: &ShareId) -> Option<InitialContext> {
        if let Some(share) = self.shares.get(share_id) {
            return Some(InitialContext::Member {
                device: device.clone(),
                user: self.user.clone(),
                team: share.team.clone(),
                keyring: share.keyring.clone(),
            });
        }
        match self.pending.get(share_id)? {
            Pending::Member(seed) => Some(InitialContext::InviteeMember {
                user: self.user.clone()?,
                device: device.clone(),
                share_id: share_id.clone(),
                seed: seed.clone(),
            }),
            Pending::Device { user_id, seed } => Some(InitialContext::InviteeDevice {
                device: device.clone(),
                user_id: user_id.clone(),
                share_id: share_id.clone(),
                seed: seed.clone(),
            }),
        }
    }

    fn knows(&self, share_id: &ShareId) -> bool {
        self.shares.contains_key(share_id) || self.pending.contains_key(share_id)
    }

    fn share_mut(&mut self, share_id: &ShareId) -> Result<&mut Share> {
        self.shares
            .get_mut(share_id)
            .ok_or_else(|| AuthError::NotFound(format!("share {}", share_id)))
    }

    fn share(&self, share_id: &ShareId) -> Result<&Share> {
        self.shares
            .get(share_id)
            .ok_or_else(|| AuthError::NotFound(format!("share {}", share_id)))
    }

    /// Fold what a connection step learned into the share right away and
    /// keep only the events that changed something.
    fn absorb(&mut self, share_id: &ShareId, events: Vec<ConnectionEvent>) -> Vec<ConnectionEvent> {
        events
            .into_iter()
            .filter(|event| match event {
                ConnectionEvent::Joined {
                    team,
                    keyring,
                    user,
                    document_ids,
                } => {
                    self.pending.remove(share_id);
                    if self.user.is_none() {
                        self.user = user.clone();
                    }
                    match self.shares.get_mut(share_id) {
                        Some(share) => {
                            share.team.merge(team);
                            share.document_ids.extend(document_ids.iter().cloned());
                        }
                        None => {
                            self.shares.insert(
                                share_id.clone(),
                                Share {
                                    team: team.clone(),
                                    keyring: keyring.clone(),
                                    document_ids: document_ids.iter().cloned().collect(),
                                },
                            );
                        }
                    }
                    true
                }
                ConnectionEvent::Change(team) => self
                    .shares
                    .get_mut(share_id)
                    .is_some_and(|share| share.team.merge(team)),
                ConnectionEvent::Documents(ids) => self.shares.get_mut(share_id).is_some_and(|share| {
                    let before = share.document_ids.len();
                    share.document_ids.extend(ids.iter().cloned());
                    share.document_ids.len() > before
                }),
                _ => true,
            })
            .collect()
    }

    fn take_slots(&mut self, matches: impl Fn(&ConnectionKey, &Slot) -> bool) -> Vec<(ConnectionKey, Slot)> {
        let keys: Vec<ConnectionKey> = self
            .connections
            .iter()
            .filter(|(key, slot)| matches(key, slot))
            .map(|(key, _)| key.clone())
            .collect();
        keys.into_iter()
            .filter_map(|key| self.connections.remove(&key).map(|slot| (key, slot)))
            .collect()
    }
}

/// Persisted form of one share.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SavedShare {
    /// Team graph JSON sealed with the team key, hex.
    encrypted_team: String,
    /// Keyring JSON sealed with the device storage key, hex.
    encrypted_team_keys: String,
    document_ids: Vec<DocumentId>,
}

pub struct AuthProvider {
    device: FullIdentity,
    state: Mutex<State>,
    adapters: Mutex<Vec<Weak<AuthenticatedAdapter>>>,
    next_adapter_id: AtomicUsize,
    events: Arc<EventBus<AuthEvent>>,
}

impl AuthProvider {
    pub fn new(config: AuthProviderConfig) -> Arc<Self> {
        info!("Auth provider for device {}", config.device.id);
        Arc::new(Self {
            device: config.device,
            state: Mutex::new(State {
                user: config.user,
                ..Default::default()
            }),
            adapters: Mutex::new(Vec::new()),
            next_adapter_id: AtomicUsize::new(0),
            events: Arc::new(EventBus::new()),
        })
    }

    pub fn device(&self) -> &FullIdentity {
        &self.device
    }

    /// Redacted device identity, safe to hand to anyone.
    pub fn public_keys(&self) -> PublicIdentity {
        self.device.redact()
    }

    pub fn user(&self) -> Option<FullIdentity> {
        self.lock().user.clone()
    }

    pub fn events(&self) -> &Arc<EventBus<AuthEvent>> {
        &self.events
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Decorate `base` so only authenticated peers and decrypted traffic
    /// come out of it.
    pub fn wrap_network_adapter(self: &Arc<Self>, base: Arc<dyn NetworkAdapter>) -> Arc<AuthenticatedAdapter> {
        let id = self.next_adapter_id.fetch_add(1, Ordering::Relaxed);
        let adapter = AuthenticatedAdapter::new(id, base, self);
        let mut adapters = self.adapters.lock().unwrap_or_else(|e| e.into_inner());
        adapters.retain(|a| a.strong_count() > 0);
        adapters.push(Arc::downgrade(&adapter));
        adapter
    }

    // ==================== Shares ====================

    /// Register a share created elsewhere. An already known share keeps its
    /// documents and adopts the newer team graph.
    pub fn add_share(self: &Arc<Self>, team: Team, keyring: TeamKeyring) -> ShareId {
        let share_id = team.id.clone();
        {
            let mut state = self.lock();
            state.pending.remove(&share_id);
            match state.shares.get_mut(&share_id) {
                Some(share) => {
                    share.team.merge(&team);
                    share.keyring = keyring;
                }
                None => {
                    state.shares.insert(
                        share_id.clone(),
                        Share {
                            team,
                            keyring,
                            document_ids: BTreeSet::new(),
                        },
                    );
                }
            }
        }
        info!("Added share {}", share_id);
        self.connect_known_peers(&share_id);
        share_id
    }

    /// Found a new share with this device's user as its only member.
    pub fn create_share(self: &Arc<Self>, document_ids: impl IntoIterator<Item = DocumentId>) -> Result<ShareId> {
        let share_id = {
            let mut state = self.lock();
            let user = state
                .user
                .clone()
                .ok_or_else(|| AuthError::Permission("creating a share requires a user identity".to_string()))?;
            let (team, keyring) = Team::create(&user.name, &user, &self.device);
            let share_id = team.id.clone();
            state.shares.insert(
                share_id.clone(),
                Share {
                    team,
                    keyring,
                    document_ids: document_ids.into_iter().collect(),
                },
            );
            info!("Created share {} for {}", share_id, user.id);
            share_id
        };
        self.connect_known_peers(&share_id);
        Ok(share_id)
    }

    /// Wait to be admitted to a share as a new member.
    pub fn join_as_member(self: &Arc<Self>, invitation: MemberInvitation) -> Result<()> {
        {
            let mut state = self.lock();
            if state.user.is_none() {
                return Err(AuthError::Permission(
                    "joining as a member requires a user identity".to_string(),
                ));
            }
            if state.shares.contains_key(&invitation.share_id) {
                return Ok(());
            }
            state
                .pending
                .insert(invitation.share_id.clone(), Pending::Member(invitation.seed));
        }
        debug!("Waiting for admission to share {}", invitation.share_id);
        self.connect_known_peers(&invitation.share_id);
        Ok(())
    }

    /// Wait to be admitted to a share as another device of an existing user.
    pub fn join_as_device(self: &Arc<Self>, invitation: DeviceInvitation) -> Result<()> {
        {
            let mut state = self.lock();
            if state.shares.contains_key(&invitation.share_id) {
                return Ok(());
            }
            state.pending.insert(
                invitation.share_id.clone(),
                Pending::Device {
                    user_id: invitation.user_id,
                    seed: invitation.seed,
                },
            );
        }
        debug!("Waiting for device admission to share {}", invitation.share_id);
        self.connect_known_peers(&invitation.share_id);
        Ok(())
    }

    pub fn invite_member(&self, share_id: &ShareId, options: &InviteOptions) -> Result<MemberInvitation> {
        let seed = {
            let mut state = self.lock();
            state.share_mut(share_id)?.team.invite_member(options)?
        };
        self.events.emit(AuthEvent::TeamChanged {
            share_id: share_id.clone(),
        });
        Ok(MemberInvitation {
            share_id: share_id.clone(),
            seed,
        })
    }

    /// Invite another device of this device's user.
    pub fn invite_device(&self, share_id: &ShareId, options: &InviteOptions) -> Result<DeviceInvitation> {
        let (user_id, seed) = {
            let mut state = self.lock();
            let own_user = state.user.as_ref().map(|u| u.id.clone());
            let share = state.share_mut(share_id)?;
            let user_id = own_user
                .or_else(|| share.team.device_owner(&self.device.id).map(|m| m.user.id.clone()))
                .ok_or_else(|| AuthError::Permission(format!("{} has no user on share {}", self.device.id, share_id)))?;
            let seed = share.team.invite_device(&user_id, options)?;
            (user_id, seed)
        };
        self.events.emit(AuthEvent::TeamChanged {
            share_id: share_id.clone(),
        });
        Ok(DeviceInvitation {
            share_id: share_id.clone(),
            user_id,
            seed,
        })
    }

    /// Allow a sync server to authenticate for a share.
    pub fn add_server(&self, share_id: &ShareId, server: PublicIdentity) -> Result<()> {
        self.lock().share_mut(share_id)?.team.add_server(server);
        self.events.emit(AuthEvent::TeamChanged {
            share_id: share_id.clone(),
        });
        Ok(())
    }

    /// Authorize more documents for a share. Known ids are ignored.
    pub fn add_documents(&self, share_id: &ShareId, document_ids: impl IntoIterator<Item = DocumentId>) -> Result<()> {
        let mut state = self.lock();
        state.share_mut(share_id)?.document_ids.extend(document_ids);
        Ok(())
    }

    pub fn documents(&self, share_id: &ShareId) -> Result<Vec<DocumentId>> {
        Ok(self.lock().share(share_id)?.document_ids.iter().cloned().collect())
    }

    pub fn team(&self, share_id: &ShareId) -> Option<Team> {
        self.lock().shares.get(share_id).map(|s| s.team.clone())
    }

    pub fn keyring(&self, share_id: &ShareId) -> Option<TeamKeyring> {
        self.lock().shares.get(share_id).map(|s| s.keyring.clone())
    }

    pub fn share_ids(&self) -> Vec<ShareId> {
        self.lock().shares.keys().cloned().collect()
    }

    // ==================== Connections ====================

    /// Live handshake connections (authenticating or connected).
    pub fn connection_count(&self) -> usize {
        self.lock().connections.values().filter(|s| s.is_live()).count()
    }

    /// Connections ever created by this provider.
    pub fn connections_created(&self) -> usize {
        self.lock().connections_created
    }

    pub fn is_authenticated(&self, peer_id: &PeerId) -> bool {
        self.lock()
            .connections
            .iter()
            .any(|((_, p), slot)| p == peer_id && slot.connected)
    }

    /// Resolves once `peer_id` authenticates for any share. Fails when its
    /// handshakes fail or its transport goes away first.
    pub async fn authenticated(&self, peer_id: &PeerId) -> Result<()> {
        let rx = {
            let mut state = self.lock();
            let connected = state
                .connections
                .iter()
                .any(|((_, p), slot)| p == peer_id && slot.connected);
            if connected {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.entry(peer_id.clone()).or_default().push(tx);
            rx
        };
        rx.await
            .unwrap_or_else(|_| Err(AuthError::Disconnected(peer_id.clone())))
    }

    pub(crate) fn on_candidate(self: &Arc<Self>, adapter: &Arc<AuthenticatedAdapter>, peer_id: PeerId, channel_id: ChannelId) {
        let targets: Vec<ShareId> = {
            let state = self.lock();
            match channel_id.kind() {
                ChannelKind::ShareAuth(share_id) => {
                    if state.knows(&share_id) {
                        vec![share_id]
                    } else {
                        debug!("Candidate {} for unknown share {}", peer_id, share_id);
                        Vec::new()
                    }
                }
                _ => state
                    .shares
                    .keys()
                    .chain(state.pending.keys())
                    .cloned()
                    .collect(),
            }
        };
        for share_id in targets {
            self.ensure_connection(adapter, &share_id, &peer_id, None);
        }
    }

    /// Handshake traffic reaching the adapter. Messages for an existing
    /// connection arrive through its `AuthChannel`; this only starts a
    /// connection when a peer says hello first.
    pub(crate) fn on_auth_message(self: &Arc<Self>, adapter: &Arc<AuthenticatedAdapter>, envelope: MessageEnvelope) {
        let ChannelKind::ShareAuth(share_id) = envelope.channel_id.kind() else {
            debug!("Ignoring traffic on {}", envelope.channel_id);
            return;
        };
        let Some(sender) = envelope.sender_id.clone() else {
            return;
        };
        {
            let state = self.lock();
            if state.connections.contains_key(&(share_id.clone(), sender.clone())) {
                return;
            }
            if !state.knows(&share_id) {
                debug!("Ignoring handshake from {} for unknown share {}", sender, share_id);
                return;
            }
        }
        // Only an opening hello starts a connection. Proofs, rejects and
        // hellos that answer one of ours belong to a handshake that is over.
        if !matches!(
            HandshakeMessage::from_bytes(&envelope.message),
            Ok(HandshakeMessage::Hello { seen_nonce: None, .. })
        ) {
            debug!("Ignoring stray handshake message from {} on {}", sender, share_id);
            return;
        }
        self.ensure_connection(adapter, &share_id, &sender, Some(&envelope.message));
    }

    fn ensure_connection(
        self: &Arc<Self>,
        adapter: &Arc<AuthenticatedAdapter>,
        share_id: &ShareId,
        peer_id: &PeerId,
        first_message: Option<&[u8]>,
    ) {
        let key = (share_id.clone(), peer_id.clone());
        let mut state = self.lock();
        if let Some(slot) = state.connections.get(&key) {
            if slot.is_live() {
                debug!("Connection to {} for share {} already exists", peer_id, share_id);
                return;
            }
            state.connections.remove(&key);
        }
        let Some(context) = state.initial_context(&self.device, share_id) else {
            return;
        };
        let Some(local_peer_id) = adapter.local_peer_id() else {
            warn!("Adapter {} is not connected, cannot authenticate {}", adapter.id(), peer_id);
            return;
        };

        let channel = AuthChannel::open_on(
            Arc::clone(adapter.base()),
            local_peer_id,
            peer_id.clone(),
            ChannelId::share_auth(share_id),
        );
        let send: SendFn = {
            let channel = Arc::clone(&channel);
            Box::new(move |bytes| channel.send(bytes))
        };
        let messages = {
            let provider = Arc::downgrade(self);
            let (share_id, peer_id) = key.clone();
            channel.on_message(move |bytes| {
                if let Some(provider) = provider.upgrade() {
                    provider.deliver(&share_id, &peer_id, &bytes);
                }
            })
        };

        let mut connection = Connection::new(share_id.clone(), peer_id.clone(), context, send);
        if let Some(share) = state.shares.get(share_id) {
            connection.refresh(&share.team, &share.document_ids);
        }
        let events = match first_message {
            Some(message) => connection.deliver(message),
            None => connection.start(),
        };
        let events = state.absorb(share_id, events);
        state.connections.insert(
            key,
            Slot {
                connection,
                channel,
                _messages: messages,
                adapter: Arc::downgrade(adapter),
                adapter_id: adapter.id(),
                connected: false,
            },
        );
        state.connections_created += 1;
        drop(state);

        self.process(Some(adapter), share_id, peer_id, events);
    }

    fn deliver(self: &Arc<Self>, share_id: &ShareId, peer_id: &PeerId, bytes: &[u8]) {
        let (adapter, events) = {
            let mut state = self.lock();
            let State {
                shares, connections, ..
            } = &mut *state;
            let Some(slot) = connections.get_mut(&(share_id.clone(), peer_id.clone())) else {
                return;
            };
            if let Some(share) = shares.get(share_id) {
                slot.connection.refresh(&share.team, &share.document_ids);
            }
            let events = slot.connection.deliver(bytes);
            let adapter = slot.adapter.upgrade();
            (adapter, state.absorb(share_id, events))
        };
        self.process(adapter.as_ref(), share_id, peer_id, events);
    }

    fn process(
        self: &Arc<Self>,
        adapter: Option<&Arc<AuthenticatedAdapter>>,
        share_id: &ShareId,
        peer_id: &PeerId,
        events: Vec<ConnectionEvent>,
    ) {
        let key = (share_id.clone(), peer_id.clone());
        let mut joined = false;

        for event in events {
            match event {
                ConnectionEvent::Joined { .. } => {
                    info!("Joined share {}", share_id);
                    joined = true;
                    self.events.emit(AuthEvent::Joined {
                        share_id: share_id.clone(),
                    });
                }
                ConnectionEvent::Change(_) | ConnectionEvent::Documents(_) => {
                    self.events.emit(AuthEvent::TeamChanged {
                        share_id: share_id.clone(),
                    });
                }
                ConnectionEvent::Connected { session_key } => {
                    let waiters = {
                        let mut state = self.lock();
                        if let Some(slot) = state.connections.get_mut(&key) {
                            slot.connected = true;
                        }
                        state.waiters.remove(peer_id).unwrap_or_default()
                    };
                    for waiter in waiters {
                        let _ = waiter.send(Ok(()));
                    }
                    if let Some(adapter) = adapter {
                        // Install before announcing so the first message to
                        // the new peer is already sealed.
                        if adapter.install_session(peer_id, share_id, session_key) {
                            adapter.emit(AdapterEvent::PeerCandidate {
                                peer_id: peer_id.clone(),
                                channel_id: adapter.candidate_channel(peer_id),
                            });
                        }
                    }
                    self.events.emit(AuthEvent::Connected {
                        share_id: share_id.clone(),
                        peer_id: peer_id.clone(),
                    });
                }
                ConnectionEvent::LocalError(reason) | ConnectionEvent::RemoteError(reason) => {
                    if let Some(adapter) = adapter {
                        adapter.emit(AdapterEvent::Error {
                            peer_id: Some(peer_id.clone()),
                            channel_id: Some(ChannelId::share_auth(share_id)),
                            error: Arc::new(AuthError::Authentication(reason.clone())),
                        });
                    }
                    self.events.emit(AuthEvent::Failed {
                        share_id: share_id.clone(),
                        peer_id: peer_id.clone(),
                        reason: reason.clone(),
                    });
                    self.reject_if_hopeless(peer_id, &reason);
                }
                ConnectionEvent::Disconnected => {
                    let slot = self.lock().connections.remove(&key);
                    let Some(slot) = slot else {
                        continue;
                    };
                    slot.channel.close();
                    if slot.connected {
                        let last = adapter.is_some_and(|a| a.remove_session(peer_id, share_id));
                        if let Some(adapter) = adapter.filter(|_| last) {
                            adapter.emit(AdapterEvent::PeerDisconnected {
                                peer_id: peer_id.clone(),
                            });
                        }
                    }
                }
            }
        }

        if joined {
            self.connect_known_peers(share_id);
        }
    }

    /// Fail waiters for `peer_id` once none of its handshakes can succeed.
    fn reject_if_hopeless(&self, peer_id: &PeerId, reason: &str) {
        let waiters = {
            let mut state = self.lock();
            let hope = state
                .connections
                .iter()
                .any(|((_, p), slot)| p == peer_id && (slot.is_live() || slot.connected));
            if hope {
                return;
            }
            state.waiters.remove(peer_id).unwrap_or_default()
        };
        for waiter in waiters {
            let _ = waiter.send(Err(AuthError::Authentication(reason.to_string())));
        }
    }

    /// Start handshakes for `share_id` with every peer the wrapped adapters
    /// have already seen.
    fn connect_known_peers(self: &Arc<Self>, share_id: &ShareId) {
        let adapters: Vec<Arc<AuthenticatedAdapter>> = self
            .adapters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for adapter in adapters {
            for (peer_id, channel_id) in adapter.known_candidates() {
                if let ChannelKind::ShareAuth(other) = channel_id.kind() {
                    if &other != share_id {
                        continue;
                    }
                }
                self.ensure_connection(&adapter, share_id, &peer_id, None);
            }
        }
    }

    /// Transport to `peer_id` on one adapter went away.
    pub(crate) fn abort_peer(&self, adapter_id: usize, peer_id: &PeerId) {
        let (slots, waiters) = {
            let mut state = self.lock();
            let slots = state.take_slots(|(_, p), slot| p == peer_id && slot.adapter_id == adapter_id);
            (slots, state.waiters.remove(peer_id).unwrap_or_default())
        };
        Self::release(slots);
        for waiter in waiters {
            let _ = waiter.send(Err(AuthError::Disconnected(peer_id.clone())));
        }
    }

    /// A wrapped adapter closed.
    pub(crate) fn abort_adapter(&self, adapter_id: usize) {
        let (slots, waiters) = {
            let mut state = self.lock();
            let slots = state.take_slots(|_, slot| slot.adapter_id == adapter_id);
            let waiters: Vec<(PeerId, Vec<Waiter>)> = slots
                .iter()
                .filter_map(|((_, p), _)| state.waiters.remove(p).map(|w| (p.clone(), w)))
                .collect();
            (slots, waiters)
        };
        Self::release(slots);
        for (peer_id, list) in waiters {
            for waiter in list {
                let _ = waiter.send(Err(AuthError::Disconnected(peer_id.clone())));
            }
        }
    }

    fn release(slots: Vec<(ConnectionKey, Slot)>) {
        for ((share_id, peer_id), mut slot) in slots {
            debug!("Dropping connection to {} for share {}", peer_id, share_id);
            slot.connection.abort();
            slot.channel.close();
        }
    }

    // ==================== Persistence ====================

    /// Serialize every share. Connections are never saved.
    pub fn save(&self) -> Result<Vec<u8>> {
        let storage_key = self.device.storage_key()?;
        let state = self.lock();
        let mut saved = BTreeMap::new();
        for (share_id, share) in &state.shares {
            let team = serde_json::to_vec(&share.team)?;
            let keys = serde_json::to_vec(&share.keyring)?;
            saved.insert(
                share_id.clone(),
                SavedShare {
                    encrypted_team: hex::encode(share.keyring.key.encrypt(&team)?),
                    encrypted_team_keys: hex::encode(storage_key.encrypt(&keys)?),
                    document_ids: share.document_ids.iter().cloned().collect(),
                },
            );
        }
        Ok(serde_json::to_vec(&saved)?)
    }

    /// Restore shares written by `save` on this device and start handshakes
    /// with peers already seen for them.
    pub fn load(self: &Arc<Self>, data: &[u8]) -> Result<()> {
        let storage_key = self.device.storage_key()?;
        let saved: BTreeMap<ShareId, SavedShare> = serde_json::from_slice(data)?;

        let mut shares = BTreeMap::new();
        for (share_id, entry) in saved {
            let keys = hex::decode(&entry.encrypted_team_keys)
                .map_err(|e| AuthError::Authentication(format!("share {}: {}", share_id, e)))?;
            let keyring: TeamKeyring = serde_json::from_slice(&storage_key.decrypt(&keys)?)?;
            let team = hex::decode(&entry.encrypted_team)
                .map_err(|e| AuthError::Authentication(format!("share {}: {}", share_id, e)))?;
            let team: Team = serde_json::from_slice(&keyring.key.decrypt(&team)?)?;
            shares.insert(
                share_id,
                Share {
                    team,
                    keyring,
                    document_ids: entry.document_ids.into_iter().collect(),
                },
            );
        }

        let share_ids: Vec<ShareId> = shares.keys().cloned().collect();
        {
            let mut state = self.lock();
            info!("Loaded {} shares", shares.len());
            for share_id in &share_ids {
                state.pending.remove(share_id);
            }
            state.shares.extend(shares);
        }
        for share_id in &share_ids {
            self.connect_known_peers(share_id);
        }
        Ok(())
    }
}
