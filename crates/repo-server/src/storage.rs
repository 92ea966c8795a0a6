//! On-disk state under the storage directory.
//!
//! - `documents/<id>.loro`: latest snapshot of each document (`FsStorage`)
//! - `shares.json`: the auth provider's saved shares (`SharesFile`)
//!
//! Files are written to a temporary sibling and renamed into place so a
//! crash never leaves a half-written snapshot behind.

use anyhow::{Context, Result};
use async_trait::async_trait;
use repo_net::storage::{self, StorageAdapter, StorageError};
use repo_net::{AuthProvider, DocumentId};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

pub const DOCUMENTS_DIR: &str = "documents";
pub const SHARES_FILE: &str = "shares.json";

pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(storage_dir: &Path) -> Result<Self> {
        let root = storage_dir.join(DOCUMENTS_DIR);
        fs::create_dir_all(&root).with_context(|| format!("Failed to create {:?}", root))?;
        Ok(Self { root })
    }

    fn path(&self, document_id: &DocumentId) -> storage::Result<PathBuf> {
        let name = document_id.as_str();
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StorageError::Other(format!("invalid document id {:?}", name)));
        }
        Ok(self.root.join(format!("{}.loro", name)))
    }
}

#[async_trait]
impl StorageAdapter for FsStorage {
    async fn load_binary(&self, document_id: &DocumentId) -> storage::Result<Option<Vec<u8>>> {
        let path = self.path(document_id)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, document_id: &DocumentId, data: &[u8]) -> storage::Result<()> {
        let path = self.path(document_id)?;
        let tmp = path.with_extension("loro.tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!("Saved {} ({} bytes)", document_id, data.len());
        Ok(())
    }

    async fn remove(&self, document_id: &DocumentId) -> storage::Result<()> {
        let path = self.path(document_id)?;
        match tokio::fs::remove_file(&path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// `shares.json`: the provider's encrypted shares.
pub struct SharesFile {
    path: PathBuf,
}

impl SharesFile {
    pub fn new(storage_dir: &Path) -> Self {
        Self {
            path: storage_dir.join(SHARES_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Restore saved shares into `provider`. A missing file is not an error.
    pub fn load_into(&self, provider: &Arc<AuthProvider>) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let data = fs::read(&self.path).with_context(|| format!("Failed to read {:?}", self.path))?;
        provider
            .load(&data)
            .with_context(|| format!("Failed to restore shares from {:?}", self.path))?;
        Ok(())
    }

    pub fn save(&self, provider: &AuthProvider) -> Result<()> {
        let data = provider.save()?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, data).with_context(|| format!("Failed to write {:?}", tmp))?;
        fs::rename(&tmp, &self.path).with_context(|| format!("Failed to write {:?}", self.path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repo_net::auth::{create_server, AuthProviderConfig};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_fs_storage_roundtrip() {
        let dir = TempDir::new().unwrap();
        let storage = FsStorage::new(dir.path()).unwrap();
        let id = DocumentId::generate();

        assert!(storage.load_binary(&id).await.unwrap().is_none());
        storage.save(&id, b"first").await.unwrap();
        storage.save(&id, b"second").await.unwrap();
        assert_eq!(storage.load_binary(&id).await.unwrap().unwrap(), b"second");
        assert!(dir.path().join(DOCUMENTS_DIR).join(format!("{}.loro", id)).exists());

        storage.remove(&id).await.unwrap();
        storage.remove(&id).await.unwrap();
        assert!(storage.load_binary(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fs_storage_rejects_path_ids() {
        let dir = TempDir::new().unwrap();
        let storage = FsStorage::new(dir.path()).unwrap();
        let id = DocumentId::from("../escape");
        assert!(matches!(
            storage.save(&id, b"x").await,
            Err(StorageError::Other(_))
        ));
    }

    #[test]
    fn test_missing_shares_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let provider = AuthProvider::new(AuthProviderConfig::new(create_server("host")));
        SharesFile::new(dir.path()).load_into(&provider).unwrap();
        assert!(provider.share_ids().is_empty());
    }
}
