//! One connected peer: a socket reader feeding a sequential dispatcher,
//! a keep-alive ticker, and one chunk pump per file being sent.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    config::DISPATCH_QUEUE_DEPTH,
    handshake::Handshake,
    protocol::{self, DiffKind, FileAdvert, Message, ProtocolError},
    registry::PeerRegistry,
    sync_manager::SyncManager,
    transfer::{TransferId, TransferUnit},
};

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("peer is disconnected")]
    Disconnected,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Distinguishes two sessions with the same remote IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(u64);

impl PeerId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

type ReceiveKey = (u32, String);

pub struct Peer {
    id: PeerId,
    addr: SocketAddr,
    username: String,
    connected_at: u32,
    connected: AtomicBool,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    sending: parking_lot::Mutex<HashMap<PathBuf, TransferId>>,
    shutdown: CancellationToken,
    registry: PeerRegistry,
    manager: SyncManager,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.username, self.addr)
    }
}

impl Peer {
    pub(crate) fn new(
        addr: SocketAddr,
        handshake: Handshake,
        writer: OwnedWriteHalf,
        registry: PeerRegistry,
        manager: SyncManager,
    ) -> Self {
        Self {
            id: PeerId::next(),
            addr,
            username: handshake.username,
            connected_at: handshake.connected_at,
            connected: AtomicBool::new(true),
            writer: tokio::sync::Mutex::new(writer),
            sending: parking_lot::Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            registry,
            manager,
        }
    }

    /// Moves the session to active: spawns the receive loop, the dispatch
    /// loop and the keep-alive ticker.
    pub(crate) fn start(self: &Arc<Self>, reader: OwnedReadHalf, keepalive: Duration) {
        let (queue, frames) = mpsc::channel(DISPATCH_QUEUE_DEPTH);
        tokio::spawn(self.clone().receive_loop(reader, queue));
        tokio::spawn(self.clone().dispatch_loop(frames));
        tokio::spawn(self.clone().keepalive(keepalive));
        info!(peer = %self, connected_at = self.connected_at, "peer connected");
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Session start agreed during the handshake, unix seconds.
    pub fn connected_at(&self) -> u32 {
        self.connected_at
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Writes one frame. Concurrent senders are serialized so frames never
    /// interleave; a write failure ends the session.
    pub async fn send(&self, message: &Message) -> Result<(), PeerError> {
        if !self.is_connected() {
            return Err(PeerError::Disconnected);
        }
        let frame = message.encode()?;
        let result = {
            let mut writer = self.writer.lock().await;
            match writer.write_all(&frame).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = result {
            warn!(peer = %self, "write failed: {e}");
            self.disconnect().await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Terminal transition. Safe to call any number of times.
    pub async fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        if let Err(e) = self.writer.lock().await.shutdown().await {
            debug!(peer = %self, "socket shutdown: {e}");
        }
        self.registry.unregister(self.addr.ip(), self.id);
        info!(peer = %self, "peer disconnected");
    }

    async fn receive_loop(self: Arc<Self>, mut reader: OwnedReadHalf, queue: mpsc::Sender<Message>) {
        loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                frame = protocol::read_frame(&mut reader) => frame,
            };
            let body = match frame {
                Ok(body) => body,
                Err(ProtocolError::Closed) => {
                    debug!(peer = %self, "connection closed by peer");
                    break;
                }
                Err(e) => {
                    warn!(peer = %self, "read failed: {e}");
                    break;
                }
            };
            match Message::decode(&body) {
                Ok(message) => {
                    if queue.send(message).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(peer = %self, "dropping malformed frame: {e}"),
            }
        }
        self.disconnect().await;
    }

    async fn dispatch_loop(self: Arc<Self>, mut frames: mpsc::Receiver<Message>) {
        let mut receiving: HashMap<ReceiveKey, TransferUnit> = HashMap::new();
        loop {
            let message = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                message = frames.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            if let Err(e) = self.dispatch(message, &mut receiving).await {
                warn!(peer = %self, "{e:#}");
            }
        }
        for (_, unit) in receiving.drain() {
            if unit.transferred() == 0 {
                debug!(peer = %self, file = %unit.path().display(), "nothing received, restoring local file");
                let (path, owner) = (unit.path().to_path_buf(), unit.id());
                drop(unit);
                self.manager.cancel_receive(&path, owner);
            } else {
                debug!(peer = %self, file = %unit.path().display(), "abandoning partial receive");
                self.manager.abort_receive(&unit);
            }
        }
    }

    async fn keepalive(self: Arc<Self>, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !self.is_connected() || self.send(&Message::Ping).await.is_err() {
                break;
            }
        }
    }

    async fn dispatch(
        self: &Arc<Self>,
        message: Message,
        receiving: &mut HashMap<ReceiveKey, TransferUnit>,
    ) -> Result<()> {
        match message {
            Message::Ping => trace!(peer = %self, "ping"),
            Message::Pong => trace!(peer = %self, "pong"),
            Message::SyncRequest {
                folder_id,
                kind,
                files,
            } => self.on_sync_request(folder_id, kind, files, receiving).await?,
            Message::FileRequest {
                folder_id, name, ..
            } => self.on_file_request(folder_id, &name).await?,
            Message::FileChunk {
                folder_id,
                name,
                data,
            } => self.on_file_chunk(folder_id, name, &data, receiving).await,
        }
        Ok(())
    }

    async fn on_sync_request(
        &self,
        folder_id: u32,
        kind: DiffKind,
        files: Vec<FileAdvert>,
        receiving: &mut HashMap<ReceiveKey, TransferUnit>,
    ) -> Result<()> {
        let plans = self
            .manager
            .plan_incoming(&self.username, folder_id, kind, files)
            .await?;

        for plan in plans {
            if !self.is_connected() {
                self.manager.cancel_receive(&plan.path, plan.owner);
                continue;
            }
            if let Some(old) = plan.superseded {
                self.cancel_local(old, receiving);
            }
            let unit = match TransferUnit::create_for_receive(
                plan.owner,
                folder_id,
                &plan.path,
                plan.size,
                plan.mod_time,
            )
            .await
            {
                Ok(unit) => unit,
                Err(e) => {
                    warn!(peer = %self, "cannot receive: {e}");
                    self.manager.cancel_receive(&plan.path, plan.owner);
                    continue;
                }
            };
            if unit.is_complete() {
                self.manager.finish_receive(unit).await;
                continue;
            }

            // Left in `receiving` on failure; the dispatch loop releases it on exit.
            receiving.insert((folder_id, plan.name.clone()), unit);
            if let Err(e) = self
                .send(&Message::FileRequest {
                    folder_id,
                    kind,
                    name: plan.name,
                })
                .await
            {
                debug!(peer = %self, "file request not sent: {e}");
            }
        }
        Ok(())
    }

    /// Stops any transfer of ours still registered under `old`.
    fn cancel_local(&self, old: TransferId, receiving: &mut HashMap<ReceiveKey, TransferUnit>) {
        receiving.retain(|_, unit| unit.id() != old);
        self.sending.lock().retain(|_, id| *id != old);
    }

    async fn on_file_request(self: &Arc<Self>, folder_id: u32, name: &str) -> Result<()> {
        let path = self.manager.resolve_file(folder_id, name)?;
        let unit = TransferUnit::open_for_send(TransferId::next(), folder_id, &path).await?;
        if !self
            .manager
            .locks()
            .try_acquire(&path, unit.mod_time(), unit.id())
        {
            debug!(peer = %self, file = %path.display(), "transfer already in flight, ignoring request");
            return Ok(());
        }
        self.sending.lock().insert(path, unit.id());
        tokio::spawn(self.clone().pump(unit));
        Ok(())
    }

    fn still_sending(&self, path: &Path, id: TransferId) -> bool {
        self.is_connected()
            && self.sending.lock().get(path) == Some(&id)
            && self.manager.locks().is_held_by(path, id)
    }

    /// Streams one file as FILE_DATA frames until exhausted, disconnected, or
    /// superseded.
    async fn pump(self: Arc<Self>, mut unit: TransferUnit) {
        let path = unit.path().to_path_buf();
        let id = unit.id();
        let result = self.send_chunks(&mut unit).await;

        match result {
            Ok(true) => info!(peer = %self, file = %path.display(), bytes = unit.file_size(), "sent file"),
            Ok(false) => info!(peer = %self, file = %path.display(), "send stopped early"),
            Err(e) => warn!(peer = %self, file = %path.display(), "send failed: {e:#}"),
        }
        {
            let mut sending = self.sending.lock();
            if sending.get(&path) == Some(&id) {
                sending.remove(&path);
            }
        }
        self.manager.locks().release(&path, id);
    }

    /// `Ok(true)` once the whole file went out, `Ok(false)` if stopped early.
    async fn send_chunks(&self, unit: &mut TransferUnit) -> Result<bool> {
        loop {
            if !self.still_sending(unit.path(), unit.id()) {
                return Ok(false);
            }
            let data = unit.next_chunk().await?;
            if data.is_empty() {
                return Ok(true);
            }
            self.send(&Message::FileChunk {
                folder_id: unit.folder_id(),
                name: unit.name().to_string(),
                data,
            })
            .await?;
        }
    }

    async fn on_file_chunk(
        &self,
        folder_id: u32,
        name: String,
        data: &[u8],
        receiving: &mut HashMap<ReceiveKey, TransferUnit>,
    ) {
        let key = (folder_id, name);
        let Some(unit) = receiving.get_mut(&key) else {
            debug!(peer = %self, folder_id, file = %key.1, "no transfer for chunk, dropping");
            return;
        };
        if !self.manager.locks().is_held_by(unit.path(), unit.id()) {
            info!(peer = %self, file = %unit.path().display(), "transfer superseded, dropping");
            receiving.remove(&key);
            return;
        }

        match unit.accept_chunk(data).await {
            Ok(false) => {}
            Ok(true) => {
                if let Some(unit) = receiving.remove(&key) {
                    self.manager.finish_receive(unit).await;
                }
            }
            Err(e) => {
                warn!(peer = %self, "receive aborted, partial file left in place: {e}");
                if let Some(unit) = receiving.remove(&key) {
                    self.manager.abort_receive(&unit);
                }
            }
        }
    }
}
