//! DocHandle: shared handle to one Loro document.
//!
//! Application data lives in the `root` map of the document. Handles start
//! either ready (created locally or loaded from storage) or pending (asked
//! for by id and waiting for a peer to deliver it); `when_ready` resolves once
//! the document has content.

use crate::events::EventBus;
use crate::ids::DocumentId;
use loro::{ExportMode, LoroDoc, LoroMap, LoroValue, VersionVector};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Loro error: {0}")]
    Loro(String),

    #[error("Export error: {0}")]
    Export(String),
}

pub type Result<T> = std::result::Result<T, DocumentError>;

const ROOT: &str = "root";

#[derive(Debug, Clone)]
pub enum DocEvent {
    /// A local `change` committed; `update` holds just the new operations.
    LocalChange {
        document_id: DocumentId,
        update: Vec<u8>,
    },
    /// Imported bytes changed the document.
    RemoteChange { document_id: DocumentId },
}

pub struct DocHandle {
    id: DocumentId,
    doc: Mutex<LoroDoc>,
    ready: watch::Sender<bool>,
    events: Arc<EventBus<DocEvent>>,
}

impl DocHandle {
    /// New, empty, ready document.
    pub fn new(id: DocumentId) -> Arc<Self> {
        Self::with_state(id, true)
    }

    /// Handle for a document that still has to arrive from storage or a peer.
    pub fn pending(id: DocumentId) -> Arc<Self> {
        Self::with_state(id, false)
    }

    fn with_state(id: DocumentId, ready: bool) -> Arc<Self> {
        let (ready, _) = watch::channel(ready);
        Arc::new(Self {
            id,
            doc: Mutex::new(LoroDoc::new()),
            ready,
            events: Arc::new(EventBus::new()),
        })
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub fn events(&self) -> &Arc<EventBus<DocEvent>> {
        &self.events
    }

    fn lock(&self) -> MutexGuard<'_, LoroDoc> {
        self.doc.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub fn mark_ready(&self) {
        self.ready.send_if_modified(|ready| !std::mem::replace(ready, true));
    }

    pub async fn when_ready(&self) {
        let mut rx = self.ready.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Edit the root map and commit.
    pub fn change<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&LoroMap) -> loro::LoroResult<()>,
    {
        let update = {
            let doc = self.lock();
            let before = doc.state_vv();
            f(&doc.get_map(ROOT)).map_err(|e| DocumentError::Loro(e.to_string()))?;
            doc.commit();
            if doc.state_vv() == before {
                return Ok(());
            }
            doc.export(ExportMode::updates(&before))
                .map_err(|e| DocumentError::Export(e.to_string()))?
        };
        self.mark_ready();
        self.events.emit(DocEvent::LocalChange {
            document_id: self.id.clone(),
            update,
        });
        Ok(())
    }

    /// Root map as JSON.
    pub fn value(&self) -> serde_json::Value {
        loro_value_to_json(&self.lock().get_map(ROOT).get_deep_value())
    }

    pub fn version(&self) -> VersionVector {
        self.lock().state_vv()
    }

    pub fn export_snapshot(&self) -> Result<Vec<u8>> {
        self.lock()
            .export(ExportMode::Snapshot)
            .map_err(|e| DocumentError::Export(e.to_string()))
    }

    /// Operations a peer at `from` is missing.
    pub fn export_updates(&self, from: &VersionVector) -> Result<Vec<u8>> {
        self.lock()
            .export(ExportMode::updates(from))
            .map_err(|e| DocumentError::Export(e.to_string()))
    }

    /// Import a snapshot or update. Returns whether the document changed;
    /// a change makes the handle ready.
    pub fn import(&self, data: &[u8]) -> Result<bool> {
        let modified = {
            let doc = self.lock();
            let before = doc.state_vv();
            doc.import(data).map_err(|e| DocumentError::Loro(e.to_string()))?;
            doc.state_vv() != before
        };
        if modified {
            self.mark_ready();
            self.events.emit(DocEvent::RemoteChange {
                document_id: self.id.clone(),
            });
        }
        Ok(modified)
    }
}

fn loro_value_to_json(value: &LoroValue) -> serde_json::Value {
    match value {
        LoroValue::Null => serde_json::Value::Null,
        LoroValue::Bool(b) => serde_json::Value::Bool(*b),
        LoroValue::I64(n) => serde_json::json!(*n),
        LoroValue::Double(n) => serde_json::json!(*n),
        LoroValue::String(s) => serde_json::Value::String(s.to_string()),
        LoroValue::List(list) => serde_json::Value::Array(list.iter().map(loro_value_to_json).collect()),
        LoroValue::Map(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), loro_value_to_json(v)))
                .collect(),
        ),
        // Binary and unresolved containers have no JSON form.
        _ => serde_json::Value::Null,
    }
}
