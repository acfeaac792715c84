use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info};

use crate::{
    config::Config,
    handshake::Role,
    locks::LockTable,
    operator::Operator,
    peer::Peer,
    registry::PeerRegistry,
    store::Store,
    sync_manager::{SyncManager, SyncOutcome},
};

/// A running sync node: folder coordination plus the set of live peers.
#[derive(Clone)]
pub struct Node {
    manager: SyncManager,
    registry: PeerRegistry,
}

impl Node {
    pub fn new(
        store: Store,
        operator: Operator,
        username: impl Into<String>,
        keepalive: Duration,
    ) -> Self {
        let manager = SyncManager::new(store, LockTable::new(), operator);
        let registry = PeerRegistry::new(manager.clone(), username, keepalive);
        Self { manager, registry }
    }

    pub fn from_config(store: Store, operator: Operator, config: &Config) -> Self {
        Self::new(store, operator, config.username.clone(), config.keepalive)
    }

    pub fn manager(&self) -> &SyncManager {
        &self.manager
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub async fn add(&self, folder: &Path) -> Result<u32> {
        let manager = self.manager.clone();
        let folder = folder.to_path_buf();
        tokio::task::spawn_blocking(move || manager.add(&folder)).await?
    }

    /// Snapshots `folder` and broadcasts whatever changed.
    pub async fn sync(&self, folder: &Path) -> Result<SyncOutcome> {
        let manager = self.manager.clone();
        let path = folder.to_path_buf();
        let outcome = tokio::task::spawn_blocking(move || manager.sync(&path)).await??;
        self.broadcast(folder, &outcome).await;
        Ok(outcome)
    }

    /// Broadcasts every file of `folder` as a full offer.
    pub async fn offer(&self, folder: &Path) -> Result<SyncOutcome> {
        let manager = self.manager.clone();
        let path = folder.to_path_buf();
        let outcome = tokio::task::spawn_blocking(move || manager.offer(&path)).await??;
        self.broadcast(folder, &outcome).await;
        Ok(outcome)
    }

    async fn broadcast(&self, folder: &Path, outcome: &SyncOutcome) {
        let SyncOutcome::Offer {
            folder_id,
            kind,
            files,
            messages,
        } = outcome
        else {
            return;
        };
        let mut delivered = 0;
        for message in messages {
            delivered = delivered.max(self.registry.broadcast(message).await);
        }
        info!(
            folder = %folder.display(),
            folder_id,
            ?kind,
            files,
            peers = delivered,
            "broadcast sync request"
        );
    }

    /// Dials `addr` as the initiating side.
    pub async fn connect(&self, addr: SocketAddr) -> Result<Option<Arc<Peer>>> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to {addr}"))?;
        self.registry.register_connection(stream, Role::Initiator).await
    }

    /// Accepts connections forever as the responding side. A second
    /// connection from an IP that already has a session is a duplicate.
    pub async fn listen(&self, listener: TcpListener) {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Accept failed: {e}");
                    continue;
                }
            };
            let role = match self.registry.lookup(addr.ip()) {
                Some(_) => Role::DuplicateResponder,
                None => Role::Responder,
            };
            let registry = self.registry.clone();
            tokio::spawn(async move {
                if let Err(e) = registry.register_connection(stream, role).await {
                    error!("Connection from {addr} failed: {e:#}");
                }
            });
        }
    }

    /// Every folder in the registry.
    pub fn folders(&self) -> Result<Vec<(u32, PathBuf)>> {
        Ok(self
            .manager
            .store()
            .list_folders()?
            .into_iter()
            .map(|(id, entry)| (id, entry.path()))
            .collect())
    }

    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}
