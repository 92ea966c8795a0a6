//! The server's long-term identity.
//!
//! Stored as `server-keys.json` in the storage directory and created on
//! first start. The identity is named after the host it was created for.

use anyhow::{Context, Result};
use repo_net::auth::{create_server, FullIdentity};
use std::fs;
use std::path::Path;
use tracing::info;

pub const KEYS_FILE: &str = "server-keys.json";

pub fn load_or_create(storage_dir: &Path, host: &str) -> Result<FullIdentity> {
    let path = storage_dir.join(KEYS_FILE);
    if path.exists() {
        let contents =
            fs::read_to_string(&path).with_context(|| format!("Failed to read {:?}", path))?;
        let identity: FullIdentity = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {:?}", path))?;
        info!("Loaded server identity {}", identity.id);
        return Ok(identity);
    }

    fs::create_dir_all(storage_dir)
        .with_context(|| format!("Failed to create storage directory {:?}", storage_dir))?;
    let identity = create_server(host);
    fs::write(&path, serde_json::to_string_pretty(&identity)?)
        .with_context(|| format!("Failed to write {:?}", path))?;
    info!("Created server identity {} at {:?}", identity.id, path);
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_keys_survive_restart() {
        let dir = TempDir::new().unwrap();
        let first = load_or_create(dir.path(), "sync.example.com").unwrap();
        let second = load_or_create(dir.path(), "other-host").unwrap();
        assert_eq!(first.redact(), second.redact());
        assert_eq!(second.id, "sync.example.com");
    }

    #[test]
    fn test_corrupt_keys_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(KEYS_FILE), "not json").unwrap();
        assert!(load_or_create(dir.path(), "host").is_err());
    }
}
