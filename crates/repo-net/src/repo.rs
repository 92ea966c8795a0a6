//! Repo: documents, peers and ephemeral data behind one handle.
//!
//! The repo owns a `NetworkSubsystem`, a `CollectionSynchronizer` and an
//! `EphemeralData` bus and wires their events together:
//!
//! - network peers are added to (and removed from) the synchronizer and the
//!   ephemeral bus
//! - sync messages are routed by channel: `m/...` to the ephemeral bus, auth
//!   channels are ignored (the authenticated adapter consumes them), anything
//!   else to the synchronizer
//! - outbound synchronizer and ephemeral messages go to `NetworkSubsystem::send`
//! - with storage configured, every document change is saved as a snapshot
//!
//! When an `AuthProvider` is configured every adapter is wrapped through it,
//! so peers only appear once they share a team with us.

use crate::auth::AuthProvider;
use crate::document::{DocEvent, DocHandle, DocumentError};
use crate::ephemeral::{EphemeralData, EphemeralEvent};
use crate::events::Subscription;
use crate::ids::DocumentId;
use crate::network::{NetworkEvent, NetworkSubsystem};
use crate::protocol::{ChannelKind, EphemeralMessage, MessageContents, RepoMessage};
use crate::storage::{StorageAdapter, StorageError};
use crate::synchronizer::{CollectionSynchronizer, SyncError, SyncEvent};
use crate::transport::NetworkAdapter;
use crate::PeerId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Document {0} is unavailable")]
    Unavailable(DocumentId),
}

pub type Result<T> = std::result::Result<T, RepoError>;

const DEFAULT_FIND_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RepoConfig {
    /// Local peer id; generated when absent.
    pub peer_id: Option<PeerId>,
    pub network: Vec<Arc<dyn NetworkAdapter>>,
    pub storage: Option<Arc<dyn StorageAdapter>>,
    pub auth_provider: Option<Arc<AuthProvider>>,
    /// Forward broadcast ephemeral messages to every other peer.
    pub relay: bool,
    /// How long `find` waits for a peer to deliver a missing document.
    pub find_timeout: Duration,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            peer_id: None,
            network: Vec::new(),
            storage: None,
            auth_provider: None,
            relay: false,
            find_timeout: DEFAULT_FIND_TIMEOUT,
        }
    }
}

type Saves = Arc<Mutex<HashMap<DocumentId, Subscription<DocEvent>>>>;

pub struct Repo {
    network: Arc<NetworkSubsystem>,
    synchronizer: Arc<CollectionSynchronizer>,
    ephemeral: Arc<EphemeralData>,
    storage: Option<Arc<dyn StorageAdapter>>,
    auth_provider: Option<Arc<AuthProvider>>,
    find_timeout: Duration,
    _subscriptions: Subscriptions,
}

struct Subscriptions {
    _network: Subscription<NetworkEvent>,
    _sync: Subscription<SyncEvent>,
    _ephemeral: Subscription<EphemeralEvent>,
    _saves: Saves,
}

impl Repo {
    pub fn new(config: RepoConfig) -> Arc<Self> {
        let peer_id = config.peer_id.unwrap_or_else(PeerId::generate);
        let network = NetworkSubsystem::new(peer_id);
        let synchronizer = CollectionSynchronizer::new();
        let ephemeral = EphemeralData::new();
        let saves: Saves = Arc::new(Mutex::new(HashMap::new()));

        let network_subscription = {
            let network_handle = Arc::downgrade(&network);
            let synchronizer = Arc::clone(&synchronizer);
            let ephemeral = Arc::clone(&ephemeral);
            let relay = config.relay;
            network.events().subscribe(move |event| match event {
                NetworkEvent::Peer { peer_id } => {
                    synchronizer.add_peer(peer_id.clone());
                    ephemeral.add_peer(peer_id);
                }
                NetworkEvent::PeerDisconnected { peer_id } => {
                    synchronizer.remove_peer(&peer_id);
                    ephemeral.remove_peer(&peer_id);
                }
                NetworkEvent::Message(RepoMessage::Sync(message)) => match message.channel_id.kind() {
                    ChannelKind::Ephemeral => {
                        ephemeral.receive(&message.sender_id, &message.channel_id, &message.message)
                    }
                    ChannelKind::Auth | ChannelKind::ShareAuth(_) => {
                        debug!("Ignoring auth traffic from {} on the repo", message.sender_id)
                    }
                    ChannelKind::Sync | ChannelKind::Other => synchronizer.receive_sync_message(
                        &message.sender_id,
                        &message.channel_id,
                        &message.message,
                    ),
                },
                NetworkEvent::Message(RepoMessage::Ephemeral(message)) => {
                    ephemeral.receive(&message.sender_id, &message.channel_id, &message.message);
                    if relay && message.broadcast {
                        if let Some(network) = network_handle.upgrade() {
                            relay_ephemeral(&network, message);
                        }
                    }
                }
                NetworkEvent::Ready => info!("Network ready"),
                NetworkEvent::Error {
                    peer_id,
                    channel_id,
                    error,
                } => warn!(
                    "Network error (peer {:?}, channel {:?}): {}",
                    peer_id, channel_id, error
                ),
            })
        };

        let sync_subscription = {
            let network = Arc::clone(&network);
            let storage = config.storage.clone();
            let saves = Arc::clone(&saves);
            synchronizer.events().subscribe(move |event| match event {
                SyncEvent::Message {
                    target_id,
                    channel_id,
                    message,
                    broadcast,
                } => network.send(MessageContents::Sync {
                    target_id,
                    channel_id,
                    message,
                    broadcast,
                }),
                SyncEvent::Document(handle) => {
                    if let Some(storage) = &storage {
                        let subscription = save_on_change(&handle, Arc::clone(storage));
                        saves
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .insert(handle.id().clone(), subscription);
                    }
                }
            })
        };

        let ephemeral_subscription = {
            let network = Arc::clone(&network);
            ephemeral.events().subscribe(move |event| {
                if let EphemeralEvent::Message {
                    target_id,
                    channel_id,
                    message,
                    broadcast,
                } = event
                {
                    network.send(MessageContents::Ephemeral {
                        target_id,
                        channel_id,
                        message,
                        broadcast,
                    });
                }
            })
        };

        for adapter in config.network {
            let adapter: Arc<dyn NetworkAdapter> = match &config.auth_provider {
                Some(provider) => provider.wrap_network_adapter(adapter),
                None => adapter,
            };
            network.add_network_adapter(adapter);
        }

        Arc::new(Self {
            network,
            synchronizer,
            ephemeral,
            storage: config.storage,
            auth_provider: config.auth_provider,
            find_timeout: config.find_timeout,
            _subscriptions: Subscriptions {
                _network: network_subscription,
                _sync: sync_subscription,
                _ephemeral: ephemeral_subscription,
                _saves: saves,
            },
        })
    }

    pub fn peer_id(&self) -> &PeerId {
        self.network.peer_id()
    }

    pub fn network(&self) -> &Arc<NetworkSubsystem> {
        &self.network
    }

    pub fn synchronizer(&self) -> &Arc<CollectionSynchronizer> {
        &self.synchronizer
    }

    pub fn ephemeral(&self) -> &Arc<EphemeralData> {
        &self.ephemeral
    }

    pub fn auth_provider(&self) -> Option<&Arc<AuthProvider>> {
        self.auth_provider.as_ref()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.network.peers()
    }

    pub async fn when_ready(&self) {
        self.network.when_ready().await
    }

    /// New empty document, shared with every connected peer.
    pub fn create(&self) -> Arc<DocHandle> {
        let handle = DocHandle::new(DocumentId::generate());
        debug!("Created document {}", handle.id());
        self.synchronizer.add_document(handle)
    }

    /// Open a document: from memory, then storage, then peers.
    ///
    /// Fails with `Unavailable` when no peer delivers it within the find
    /// timeout.
    pub async fn find(&self, document_id: &DocumentId) -> Result<Arc<DocHandle>> {
        let handle = match self.synchronizer.document(document_id) {
            Some(handle) => handle,
            None => match self.load(document_id).await? {
                Some(handle) => self.synchronizer.add_document(handle),
                None => {
                    debug!("Document {} not stored locally, asking peers", document_id);
                    self.synchronizer
                        .add_document(DocHandle::pending(document_id.clone()))
                }
            },
        };

        if handle.is_ready() {
            return Ok(handle);
        }
        match tokio::time::timeout(self.find_timeout, handle.when_ready()).await {
            Ok(()) => Ok(handle),
            Err(_) => {
                warn!("Timed out waiting for document {}", document_id);
                Err(RepoError::Unavailable(document_id.clone()))
            }
        }
    }

    async fn load(&self, document_id: &DocumentId) -> Result<Option<Arc<DocHandle>>> {
        let Some(storage) = &self.storage else {
            return Ok(None);
        };
        let Some(data) = storage.load_binary(document_id).await? else {
            return Ok(None);
        };
        let handle = DocHandle::pending(document_id.clone());
        handle.import(&data)?;
        handle.mark_ready();
        debug!("Loaded document {} from storage", document_id);
        Ok(Some(handle))
    }

    /// Disconnect every adapter.
    pub fn shutdown(&self) {
        self.network.disconnect();
    }
}

fn relay_ephemeral(network: &NetworkSubsystem, message: EphemeralMessage) {
    for peer_id in network.peers() {
        if peer_id == message.sender_id || &peer_id == network.peer_id() {
            continue;
        }
        network.send(MessageContents::Relay(EphemeralMessage {
            target_id: peer_id,
            ..message.clone()
        }));
    }
}

fn save_on_change(handle: &Arc<DocHandle>, storage: Arc<dyn StorageAdapter>) -> Subscription<DocEvent> {
    let weak = Arc::downgrade(handle);
    handle.events().subscribe(move |event| {
        let document_id = match &event {
            DocEvent::LocalChange { document_id, .. } | DocEvent::RemoteChange { document_id } => {
                document_id.clone()
            }
        };
        let Some(handle) = weak.upgrade() else {
            return;
        };
        let snapshot = match handle.export_snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Failed to export {} for saving: {}", document_id, e);
                return;
            }
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to save {} on", document_id);
            return;
        };
        let storage = Arc::clone(&storage);
        runtime.spawn(async move {
            if let Err(e) = storage.save(&document_id, &snapshot).await {
                warn!("Failed to save {}: {}", document_id, e);
            }
        });
    })
}
