//! Wires the server together: identity, shares, storage, repo and listeners.

use crate::config::Config;
use crate::http::{self, AppState};
use crate::keys;
use crate::storage::{FsStorage, SharesFile};
use crate::websocket::WebSocketServerAdapter;
use anyhow::Result;
use axum::Router;
use repo_net::auth::{AuthEvent, AuthProviderConfig};
use repo_net::{AuthProvider, NetworkAdapter, PeerId, Repo, RepoConfig, Subscription};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub struct Server {
    repo: Arc<Repo>,
    provider: Arc<AuthProvider>,
    adapter: Arc<WebSocketServerAdapter>,
    shares: Arc<SharesFile>,
    _persist: Subscription<AuthEvent>,
}

impl Server {
    /// Load (or create) everything under `storage_dir`.
    ///
    /// The server's peer id is its host name; membership changes learned
    /// during handshakes are written back to `shares.json`.
    pub fn open(storage_dir: &Path, host: &str) -> Result<Self> {
        let identity = keys::load_or_create(storage_dir, host)?;
        let peer_id: PeerId = identity.id.parse()?;
        let provider = AuthProvider::new(AuthProviderConfig::new(identity));

        let shares = Arc::new(SharesFile::new(storage_dir));
        shares.load_into(&provider)?;
        info!("Restored {} share(s)", provider.share_ids().len());

        let persist = {
            let shares = Arc::clone(&shares);
            let weak = Arc::downgrade(&provider);
            provider.events().subscribe(move |event| {
                if matches!(event, AuthEvent::TeamChanged { .. } | AuthEvent::Joined { .. }) {
                    if let Some(provider) = weak.upgrade() {
                        if let Err(e) = shares.save(&provider) {
                            warn!("Failed to persist shares: {:#}", e);
                        }
                    }
                }
            })
        };

        let adapter = WebSocketServerAdapter::new();
        let repo = Repo::new(RepoConfig {
            peer_id: Some(peer_id),
            network: vec![adapter.clone() as Arc<dyn NetworkAdapter>],
            storage: Some(Arc::new(FsStorage::new(storage_dir)?)),
            auth_provider: Some(Arc::clone(&provider)),
            relay: true,
            ..Default::default()
        });

        Ok(Self {
            repo,
            provider,
            adapter,
            shares,
            _persist: persist,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::open(&config.storage_dir, &config.host)
    }

    pub fn repo(&self) -> &Arc<Repo> {
        &self.repo
    }

    pub fn provider(&self) -> &Arc<AuthProvider> {
        &self.provider
    }

    pub fn adapter(&self) -> &Arc<WebSocketServerAdapter> {
        &self.adapter
    }

    pub fn router(&self) -> Router {
        http::router(AppState {
            provider: Arc::clone(&self.provider),
            shares: Arc::clone(&self.shares),
        })
    }

    /// Accept sync clients on `listener` until `shutdown`.
    pub fn spawn_sync(&self, listener: TcpListener) -> tokio::task::JoinHandle<()> {
        tokio::spawn(Arc::clone(&self.adapter).serve(listener))
    }

    pub fn shutdown(&self) {
        self.repo.shutdown();
    }
}
