//! Connected peers indexed by remote IP, one session per IP.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::{
    config::unix_seconds,
    handshake::{self, Role},
    peer::{Peer, PeerId},
    protocol::Message,
    sync_manager::SyncManager,
};

/// What to do with a new session for an IP that may already have one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// No session for this IP yet.
    New,
    /// The existing session started strictly earlier and stays.
    KeepExisting,
    /// The new session started earlier, or at the same second, and takes over.
    Replace,
}

/// The older session wins; on a tie the newer connection replaces the old one.
pub fn resolve_duplicate(existing: Option<u32>, incoming: u32) -> Admission {
    match existing {
        None => Admission::New,
        Some(existing) if existing < incoming => Admission::KeepExisting,
        Some(_) => Admission::Replace,
    }
}

#[derive(Clone)]
pub struct PeerRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    peers: Mutex<HashMap<IpAddr, Arc<Peer>>>,
    manager: SyncManager,
    username: String,
    keepalive: Duration,
}

impl PeerRegistry {
    pub fn new(manager: SyncManager, username: impl Into<String>, keepalive: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                peers: Mutex::new(HashMap::new()),
                manager,
                username: username.into(),
                keepalive,
            }),
        }
    }

    pub fn username(&self) -> &str {
        &self.inner.username
    }

    /// Runs the handshake on a fresh connection and, if admitted, starts the
    /// peer. Returns `None` when an earlier session for the same IP is kept.
    pub async fn register_connection(
        &self,
        stream: TcpStream,
        role: Role,
    ) -> Result<Option<Arc<Peer>>> {
        self.register_connection_at(stream, role, unix_seconds(SystemTime::now()))
            .await
    }

    pub(crate) async fn register_connection_at(
        &self,
        mut stream: TcpStream,
        role: Role,
        now: u32,
    ) -> Result<Option<Arc<Peer>>> {
        let addr = stream.peer_addr().context("Failed to read peer address")?;
        let handshake = handshake::perform(&mut stream, role, &self.inner.username, now)
            .await
            .with_context(|| format!("Handshake with {addr} failed"))?;
        stream.set_nodelay(true)?;

        let (reader, writer) = stream.into_split();
        let peer = Arc::new(Peer::new(
            addr,
            handshake,
            writer,
            self.clone(),
            self.inner.manager.clone(),
        ));

        let replaced = {
            let mut peers = self.inner.peers.lock();
            let existing = peers.get(&addr.ip()).map(|p| p.connected_at());
            match resolve_duplicate(existing, peer.connected_at()) {
                Admission::KeepExisting => {
                    info!(peer = %peer, ?role, "keeping earlier session, dropping new connection");
                    return Ok(None);
                }
                Admission::New | Admission::Replace => peers.insert(addr.ip(), peer.clone()),
            }
        };
        if let Some(old) = replaced {
            info!(old = %old, new = %peer, "earlier session replaces existing one");
            old.disconnect().await;
        }

        peer.start(reader, self.inner.keepalive);
        Ok(Some(peer))
    }

    /// Forgets the session for `ip`, but only if it is still `id`.
    pub fn unregister(&self, ip: IpAddr, id: PeerId) -> bool {
        let mut peers = self.inner.peers.lock();
        match peers.get(&ip) {
            Some(peer) if peer.id() == id => {
                peers.remove(&ip);
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, ip: IpAddr) -> Option<Arc<Peer>> {
        self.inner.peers.lock().get(&ip).cloned()
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.inner.peers.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sends `message` to every connected peer concurrently. Returns how many
    /// deliveries succeeded; a failing peer is dropped without delaying the
    /// others.
    pub async fn broadcast(&self, message: &Message) -> usize {
        let mut sends = JoinSet::new();
        for peer in self.peers() {
            let message = message.clone();
            sends.spawn(async move {
                match peer.send(&message).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(peer = %peer, "broadcast failed: {e}");
                        peer.disconnect().await;
                        false
                    }
                }
            });
        }

        let mut delivered = 0;
        while let Some(sent) = sends.join_next().await {
            if matches!(sent, Ok(true)) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Disconnects every peer.
    pub async fn shutdown(&self) {
        for peer in self.peers() {
            peer.disconnect().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{locks::LockTable, operator::Operator, store::Store};
    use tokio::net::TcpListener;

    fn registry(username: &str) -> PeerRegistry {
        let (operator, _) = Operator::channel(1);
        let manager = SyncManager::new(Store::temporary().unwrap(), LockTable::new(), operator);
        PeerRegistry::new(manager, username, Duration::from_secs(60))
    }

    /// Connects a raw client that handshakes as initiator with timestamp `ts`.
    async fn dial(listener: &TcpListener, registry: &PeerRegistry, role: Role, ts: u32) -> (TcpStream, Option<Arc<Peer>>) {
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (client_side, admitted) = tokio::join!(
            handshake::perform(&mut client, Role::Initiator, "alice", ts),
            registry.register_connection_at(server, role, 0),
        );
        assert_eq!(client_side.unwrap().username, "bob");
        (client, admitted.unwrap())
    }

    #[test]
    fn older_session_wins() {
        assert_eq!(resolve_duplicate(None, 5), Admission::New);
        assert_eq!(resolve_duplicate(Some(100), 200), Admission::KeepExisting);
        assert_eq!(resolve_duplicate(Some(100), 100), Admission::Replace);
        assert_eq!(resolve_duplicate(Some(200), 100), Admission::Replace);
    }

    #[tokio::test]
    async fn duplicate_connections_keep_the_earlier_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry = registry("bob");

        let (_first, admitted) = dial(&listener, &registry, Role::Responder, 200).await;
        let first = admitted.unwrap();
        assert_eq!(first.username(), "alice");
        assert_eq!(registry.len(), 1);

        let (_second, admitted) = dial(&listener, &registry, Role::DuplicateResponder, 100).await;
        let second = admitted.unwrap();
        assert!(!first.is_connected());
        let ip = second.addr().ip();
        assert_eq!(registry.lookup(ip).unwrap().connected_at(), 100);

        let (_third, admitted) = dial(&listener, &registry, Role::DuplicateResponder, 300).await;
        assert!(admitted.is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup(ip).unwrap().id(), second.id());
    }

    #[tokio::test]
    async fn reconnect_in_the_same_second_replaces_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry = registry("bob");

        let (_first, admitted) = dial(&listener, &registry, Role::Responder, 100).await;
        let first = admitted.unwrap();
        let (_second, admitted) = dial(&listener, &registry, Role::DuplicateResponder, 100).await;
        let second = admitted.unwrap();

        assert!(!first.is_connected());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup(second.addr().ip()).unwrap().id(), second.id());
    }

    #[tokio::test]
    async fn unregister_ignores_stale_ids() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry = registry("bob");
        let (_client, admitted) = dial(&listener, &registry, Role::Responder, 10).await;
        let peer = admitted.unwrap();
        let ip = peer.addr().ip();

        let (_other, _) = dial(&listener, &registry, Role::DuplicateResponder, 5).await;
        assert!(!registry.unregister(ip, peer.id()));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn closed_socket_leaves_registry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry = registry("bob");
        let (client, admitted) = dial(&listener, &registry, Role::Responder, 10).await;
        let peer = admitted.unwrap();
        drop(client);

        for _ in 0..100 {
            if registry.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(registry.is_empty());
        assert!(!peer.is_connected());
    }

    #[tokio::test]
    async fn broadcast_reaches_connected_peers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry = registry("bob");
        let (mut client, _) = dial(&listener, &registry, Role::Responder, 10).await;

        assert_eq!(registry.broadcast(&Message::Pong).await, 1);
        assert_eq!(crate::protocol::read_message(&mut client).await.unwrap(), Message::Pong);
    }
}
