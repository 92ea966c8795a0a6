//! StorageAdapter trait for persisting document snapshots.
//!
//! Implementations:
//! - `MemoryStorage` - For testing and ephemeral peers
//! - `FsStorage` (in repo-server) - One file per document under a directory

use crate::ids::DocumentId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Last saved bytes of a document, `None` if it was never saved.
    async fn load_binary(&self, document_id: &DocumentId) -> Result<Option<Vec<u8>>>;

    /// Replace the saved bytes of a document.
    async fn save(&self, document_id: &DocumentId, data: &[u8]) -> Result<()>;

    async fn remove(&self, document_id: &DocumentId) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryStorage {
    documents: RwLock<HashMap<DocumentId, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn load_binary(&self, document_id: &DocumentId) -> Result<Option<Vec<u8>>> {
        Ok(self
            .documents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(document_id)
            .cloned())
    }

    async fn save(&self, document_id: &DocumentId, data: &[u8]) -> Result<()> {
        self.documents
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(document_id.clone(), data.to_vec());
        Ok(())
    }

    async fn remove(&self, document_id: &DocumentId) -> Result<()> {
        self.documents
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(document_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_storage() {
        let storage = MemoryStorage::new();
        let id = DocumentId::from("doc");
        assert!(storage.load_binary(&id).await.unwrap().is_none());

        storage.save(&id, b"one").await.unwrap();
        storage.save(&id, b"two").await.unwrap();
        assert_eq!(storage.load_binary(&id).await.unwrap().unwrap(), b"two");
        assert_eq!(storage.len(), 1);

        storage.remove(&id).await.unwrap();
        assert!(storage.is_empty());
    }
}
