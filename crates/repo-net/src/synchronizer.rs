//! CollectionSynchronizer: keeps a set of documents in sync with connected peers.
//!
//! The protocol is symmetric and takes one round-trip per peer:
//!
//! 1. When a peer is added we send a `SyncRequest` with our version vectors.
//! 2. The peer answers with a `SyncExchange` carrying the updates we are
//!    missing plus its own version vectors.
//! 3. We apply the updates and answer with a `SyncResponse` carrying the
//!    updates the peer is missing.
//! 4. Local edits are pushed to every peer as a `DocumentUpdate`. Imported
//!    edits are relayed to every other peer the same way.
//!
//! A request with `full: false` only concerns the documents it names; it is
//! how a pending document is fetched from peers.
//!
//! Messages are bincode-encoded. The synchronizer never talks to the network
//! directly: it emits `SyncEvent::Message` for the repo to send.

use crate::document::{DocEvent, DocHandle, DocumentError};
use crate::events::{EventBus, Subscription};
use crate::ids::DocumentId;
use crate::protocol::ChannelId;
use crate::PeerId;
use loro::VersionVector;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),
}

pub type Result<T> = std::result::Result<T, SyncError>;

type Versions = BTreeMap<DocumentId, Vec<u8>>;
type Updates = BTreeMap<DocumentId, Vec<u8>>;

/// Messages exchanged on the sync channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Our encoded version vectors. `full` asks about every document the
    /// receiver has, not just the ones listed.
    SyncRequest { versions: Versions, full: bool },

    /// Updates the requester is missing, plus our versions so it can answer
    /// with what we are missing.
    SyncExchange {
        updates: Updates,
        versions: Versions,
        full: bool,
    },

    /// Final step of an exchange.
    SyncResponse { updates: Updates },

    /// Push a single document update (real-time edits and relays)
    DocumentUpdate { document_id: DocumentId, data: Vec<u8> },
}

impl SyncMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

#[derive(Clone)]
pub enum SyncEvent {
    /// Bytes to hand to the network.
    Message {
        target_id: PeerId,
        channel_id: ChannelId,
        message: Vec<u8>,
        broadcast: bool,
    },
    /// A document entered the collection (created, found or received).
    Document(Arc<DocHandle>),
}

impl std::fmt::Debug for SyncEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Message {
                target_id, message, ..
            } => write!(f, "Message(to {}, {} bytes)", target_id, message.len()),
            Self::Document(handle) => write!(f, "Document({})", handle.id()),
        }
    }
}

struct Entry {
    handle: Arc<DocHandle>,
    _subscription: Subscription<DocEvent>,
}

#[derive(Default)]
struct Inner {
    documents: BTreeMap<DocumentId, Entry>,
    peers: BTreeSet<PeerId>,
}

pub struct CollectionSynchronizer {
    inner: Mutex<Inner>,
    events: Arc<EventBus<SyncEvent>>,
}

impl CollectionSynchronizer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            events: Arc::new(EventBus::new()),
        })
    }

    pub fn events(&self) -> &Arc<EventBus<SyncEvent>> {
        &self.events
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn document(&self, document_id: &DocumentId) -> Option<Arc<DocHandle>> {
        self.lock()
            .documents
            .get(document_id)
            .map(|e| Arc::clone(&e.handle))
    }

    pub fn document_ids(&self) -> Vec<DocumentId> {
        self.lock().documents.keys().cloned().collect()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.lock().peers.iter().cloned().collect()
    }

    /// Track `handle`. Returns the handle that is now in the collection,
    /// which is the existing one if the id was already known.
    ///
    /// Ready documents are pushed to every peer; pending ones are requested.
    pub fn add_document(self: &Arc<Self>, handle: Arc<DocHandle>) -> Arc<DocHandle> {
        let (handle, inserted) = self.track(handle);
        if !inserted {
            return handle;
        }
        let peers = self.peers();

        let message = if handle.is_ready() {
            handle
                .export_snapshot()
                .map_err(SyncError::from)
                .and_then(|data| {
                    SyncMessage::DocumentUpdate {
                        document_id: handle.id().clone(),
                        data,
                    }
                    .encode()
                })
        } else {
            let versions = BTreeMap::from([(handle.id().clone(), handle.version().encode())]);
            SyncMessage::SyncRequest {
                versions,
                full: false,
            }
            .encode()
        };
        match message {
            Ok(message) => {
                for peer_id in peers {
                    self.send(peer_id, message.clone(), true);
                }
            }
            Err(e) => warn!("Could not announce document {}: {}", handle.id(), e),
        }
        handle
    }

    /// Insert without announcing. Returns the handle in the collection and
    /// whether it was new.
    fn track(self: &Arc<Self>, handle: Arc<DocHandle>) -> (Arc<DocHandle>, bool) {
        {
            let mut inner = self.lock();
            if let Some(existing) = inner.documents.get(handle.id()) {
                return (Arc::clone(&existing.handle), false);
            }
            let subscription = self.watch(&handle);
            inner.documents.insert(
                handle.id().clone(),
                Entry {
                    handle: Arc::clone(&handle),
                    _subscription: subscription,
                },
            );
        }
        debug!("Tracking document {}", handle.id());
        self.events.emit(SyncEvent::Document(Arc::clone(&handle)));
        (handle, true)
    }

    pub fn remove_document(&self, document_id: &DocumentId) {
        self.lock().documents.remove(document_id);
    }

    /// Start syncing with `peer_id`.
    pub fn add_peer(&self, peer_id: PeerId) {
        let versions = {
            let mut inner = self.lock();
            if !inner.peers.insert(peer_id.clone()) {
                return;
            }
            versions_of(inner.documents.values().map(|e| &e.handle))
        };
        debug!("Syncing {} documents with {}", versions.len(), peer_id);
        match (SyncMessage::SyncRequest {
            versions,
            full: true,
        })
        .encode()
        {
            Ok(message) => self.send(peer_id, message, false),
            Err(e) => warn!("Could not encode sync request: {}", e),
        }
    }

    pub fn remove_peer(&self, peer_id: &PeerId) {
        self.lock().peers.remove(peer_id);
    }

    /// Handle bytes received on the sync channel. Errors are logged; a bad
    /// message from one peer never affects the others.
    pub fn receive_sync_message(self: &Arc<Self>, sender_id: &PeerId, channel_id: &ChannelId, message: &[u8]) {
        if let Err(e) = self.handle(sender_id, message) {
            warn!("Dropping sync message from {} on {}: {}", sender_id, channel_id, e);
        }
    }

    fn handle(self: &Arc<Self>, sender_id: &PeerId, message: &[u8]) -> Result<()> {
        match SyncMessage::decode(message)? {
            SyncMessage::SyncRequest { versions, full } => {
                let handles = self.handles_for(&versions, full);
                let updates = updates_for(&handles, &versions, &BTreeSet::new())?;
                let reply = SyncMessage::SyncExchange {
                    updates,
                    versions: versions_of(handles.iter()),
                    full,
                };
                self.send(sender_id.clone(), reply.encode()?, false);
            }
            SyncMessage::SyncExchange {
                updates,
                versions,
                full,
            } => {
                debug!(
                    "SyncExchange from {}: {} updates, {} versions",
                    sender_id,
                    updates.len(),
                    versions.len()
                );
                // Don't echo back what we just received.
                let received: BTreeSet<DocumentId> = updates.keys().cloned().collect();
                self.apply(sender_id, updates)?;
                let handles = self.handles_for(&versions, full);
                let updates = updates_for(&handles, &versions, &received)?;
                if !updates.is_empty() {
                    self.send(sender_id.clone(), SyncMessage::SyncResponse { updates }.encode()?, false);
                }
            }
            SyncMessage::SyncResponse { updates } => self.apply(sender_id, updates)?,
            SyncMessage::DocumentUpdate { document_id, data } => {
                self.apply(sender_id, BTreeMap::from([(document_id, data)]))?
            }
        }
        Ok(())
    }

    /// Documents a request is about.
    fn handles_for(&self, versions: &Versions, full: bool) -> Vec<Arc<DocHandle>> {
        let inner = self.lock();
        inner
            .documents
            .values()
            .filter(|e| full || versions.contains_key(e.handle.id()))
            .filter(|e| e.handle.is_ready())
            .map(|e| Arc::clone(&e.handle))
            .collect()
    }

    /// Import updates from `sender_id`, creating documents we did not know,
    /// and relay whatever changed to the other peers.
    fn apply(self: &Arc<Self>, sender_id: &PeerId, updates: Updates) -> Result<()> {
        for (document_id, data) in updates {
            let (handle, _) = self.track(DocHandle::pending(document_id.clone()));
            if !handle.import(&data)? {
                continue;
            }
            debug!("Applied update to {} from {}", document_id, sender_id);

            let others: Vec<PeerId> = self
                .lock()
                .peers
                .iter()
                .filter(|p| *p != sender_id)
                .cloned()
                .collect();
            if others.is_empty() {
                continue;
            }
            let relay = SyncMessage::DocumentUpdate {
                document_id: document_id.clone(),
                data,
            }
            .encode()?;
            for peer_id in others {
                self.send(peer_id, relay.clone(), true);
            }
        }
        Ok(())
    }

    fn send(&self, target_id: PeerId, message: Vec<u8>, broadcast: bool) {
        self.events.emit(SyncEvent::Message {
            target_id,
            channel_id: ChannelId::sync(),
            message,
            broadcast,
        });
    }

    /// Push local edits of `handle` to every peer.
    fn watch(self: &Arc<Self>, handle: &Arc<DocHandle>) -> Subscription<DocEvent> {
        let weak: Weak<Self> = Arc::downgrade(self);
        handle.events().subscribe(move |event| {
            let DocEvent::LocalChange { document_id, update } = event else {
                return;
            };
            let Some(sync) = weak.upgrade() else {
                return;
            };
            let peers = sync.peers();
            if peers.is_empty() {
                return;
            }
            match (SyncMessage::DocumentUpdate { document_id, data: update }).encode() {
                Ok(message) => {
                    for peer_id in peers {
                        sync.send(peer_id, message.clone(), true);
                    }
                }
                Err(e) => warn!("Could not encode document update: {}", e),
            }
        })
    }
}

fn versions_of<'a>(handles: impl Iterator<Item = &'a Arc<DocHandle>>) -> Versions {
    handles
        .map(|h| (h.id().clone(), h.version().encode()))
        .collect()
}

/// Updates a peer at `versions` is missing, skipping `exclude`.
fn updates_for(handles: &[Arc<DocHandle>], versions: &Versions, exclude: &BTreeSet<DocumentId>) -> Result<Updates> {
    let mut updates = BTreeMap::new();
    for handle in handles {
        if exclude.contains(handle.id()) {
            continue;
        }
        let data = match versions.get(handle.id()).map(|v| VersionVector::decode(v)) {
            Some(Ok(theirs)) => {
                if theirs == handle.version() {
                    continue;
                }
                handle.export_updates(&theirs)?
            }
            // They don't have it (or sent garbage): send a full snapshot.
            _ => handle.export_snapshot()?,
        };
        if !data.is_empty() {
            updates.insert(handle.id().clone(), data);
        }
    }
    Ok(updates)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two synchronizers whose messages are shuttled by hand.
    struct Pair {
        a: Arc<CollectionSynchronizer>,
        b: Arc<CollectionSynchronizer>,
        outbox: Arc<Mutex<Vec<(PeerId, PeerId, Vec<u8>)>>>,
        _subs: Vec<Subscription<SyncEvent>>,
    }

    fn peer(s: &str) -> PeerId {
        s.parse().unwrap()
    }

    impl Pair {
        fn new() -> Self {
            let a = CollectionSynchronizer::new();
            let b = CollectionSynchronizer::new();
            let outbox = Arc::new(Mutex::new(Vec::new()));
            let mut subs = Vec::new();
            for (sync, from) in [(&a, "a"), (&b, "b")] {
                let outbox = Arc::clone(&outbox);
                subs.push(sync.events().subscribe(move |event| {
                    if let SyncEvent::Message {
                        target_id, message, ..
                    } = event
                    {
                        outbox.lock().unwrap().push((peer(from), target_id, message));
                    }
                }));
            }
            Self {
                a,
                b,
                outbox,
                _subs: subs,
            }
        }

        fn connect(&self) {
            self.a.add_peer(peer("b"));
            self.b.add_peer(peer("a"));
        }

        fn run(&self) -> usize {
            let mut delivered = 0;
            loop {
                let batch: Vec<_> = self.outbox.lock().unwrap().drain(..).collect();
                if batch.is_empty() {
                    return delivered;
                }
                for (from, to, message) in batch {
                    let target = if to == peer("a") { &self.a } else { &self.b };
                    target.receive_sync_message(&from, &ChannelId::sync(), &message);
                    delivered += 1;
                }
            }
        }
    }

    #[test]
    fn test_symmetric_sync_on_connect() {
        let pair = Pair::new();
        let da = DocHandle::new(DocumentId::from("a-doc"));
        da.change(|root| root.insert("from", "a")).unwrap();
        pair.a.add_document(da);
        let db = DocHandle::new(DocumentId::from("b-doc"));
        db.change(|root| root.insert("from", "b")).unwrap();
        pair.b.add_document(db);

        pair.connect();
        pair.run();

        assert_eq!(
            pair.b.document(&DocumentId::from("a-doc")).unwrap().value(),
            serde_json::json!({ "from": "a" })
        );
        assert_eq!(
            pair.a.document(&DocumentId::from("b-doc")).unwrap().value(),
            serde_json::json!({ "from": "b" })
        );
    }

    #[test]
    fn test_local_changes_are_pushed() {
        let pair = Pair::new();
        pair.connect();
        pair.run();

        let doc = DocHandle::new(DocumentId::from("d"));
        pair.a.add_document(Arc::clone(&doc));
        doc.change(|root| root.insert("foo", "bar")).unwrap();
        pair.run();

        let remote = pair.b.document(&DocumentId::from("d")).unwrap();
        assert!(remote.is_ready());
        assert_eq!(remote.value(), serde_json::json!({ "foo": "bar" }));
    }

    #[test]
    fn test_pending_document_is_fetched() {
        let pair = Pair::new();
        let doc = DocHandle::new(DocumentId::from("d"));
        doc.change(|root| root.insert("k", 1)).unwrap();
        pair.a.add_document(doc);
        // Connected before either side knows about the other's documents.
        pair.a.add_peer(peer("b"));
        pair.b.add_peer(peer("a"));

        let pending = pair.b.add_document(DocHandle::pending(DocumentId::from("d")));
        pair.run();
        assert!(pending.is_ready());
        assert_eq!(pending.value(), serde_json::json!({ "k": 1 }));
    }

    #[test]
    fn test_updates_are_relayed_to_other_peers() {
        let hub = CollectionSynchronizer::new();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sent_clone = Arc::clone(&sent);
        let _sub = hub.events().subscribe(move |event| {
            if let SyncEvent::Message { target_id, message, .. } = event {
                if let Ok(SyncMessage::DocumentUpdate { .. }) = SyncMessage::decode(&message) {
                    sent_clone.lock().unwrap().push(target_id);
                }
            }
        });
        hub.add_peer(peer("alice"));
        hub.add_peer(peer("bob"));

        let doc = DocHandle::new(DocumentId::from("d"));
        doc.change(|root| root.insert("k", "v")).unwrap();
        let update = SyncMessage::DocumentUpdate {
            document_id: DocumentId::from("d"),
            data: doc.export_snapshot().unwrap(),
        }
        .encode()
        .unwrap();

        hub.receive_sync_message(&peer("alice"), &ChannelId::sync(), &update);
        assert_eq!(*sent.lock().unwrap(), vec![peer("bob")]);

        // The same update again changes nothing and is not relayed.
        hub.receive_sync_message(&peer("alice"), &ChannelId::sync(), &update);
        assert_eq!(sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_garbage_is_dropped() {
        let sync = CollectionSynchronizer::new();
        sync.receive_sync_message(&peer("x"), &ChannelId::sync(), b"not bincode");
        assert!(sync.document_ids().is_empty());
    }
}
