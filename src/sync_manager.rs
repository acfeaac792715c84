use anyhow::{bail, Context, Result};
use chrono::Utc;
use filetime::{set_file_mtime, FileTime};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{
    locks::{Arbitration, LockTable},
    operator::{FolderOffer, Operator},
    protocol::{DiffKind, FileAdvert, Message, MAX_FILES_PER_REQUEST},
    snapshot::{self, FileRecord, FolderSnapshot, SYNC_DIR},
    store::Store,
    transfer::{TransferId, TransferUnit},
};

/// Result of asking a folder to sync.
#[derive(Debug)]
pub enum SyncOutcome {
    NothingToDo,
    Offer {
        folder_id: u32,
        kind: DiffKind,
        files: usize,
        messages: Vec<Message>,
    },
}

/// A file this node decided to pull after a SYNC_REQ. The lock for `path`
/// is already held by `owner`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedReceive {
    pub folder_id: u32,
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub mod_time: u32,
    pub owner: TransferId,
    /// Local transfer that held the path before and must be cancelled.
    pub superseded: Option<TransferId>,
}

/// Folder-facing side of the node: registering folders, building offers,
/// and deciding which advertised files to accept.
#[derive(Clone)]
pub struct SyncManager {
    store: Store,
    locks: LockTable,
    operator: Operator,
    metadata: Arc<Mutex<()>>,
    /// Backups taken for receives that have not completed yet.
    backups: Arc<Mutex<HashMap<PathBuf, PathBuf>>>,
}

impl SyncManager {
    pub fn new(store: Store, locks: LockTable, operator: Operator) -> Self {
        Self {
            store,
            locks,
            operator,
            metadata: Arc::new(Mutex::new(())),
            backups: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    /// Registers `folder` under a fresh unique ID and snapshots it.
    pub fn add(&self, folder: &Path) -> Result<u32> {
        let folder = canonical_dir(folder)?;
        if let Some(id) = self.store.find_by_path(&folder)? {
            info!(folder = %folder.display(), folder_id = id, "folder already registered");
            return Ok(id);
        }
        let folder_id = self.new_folder_id()?;
        self.add_with_id(&folder, folder_id)?;
        Ok(folder_id)
    }

    /// Registers `folder` under a known ID.
    pub fn add_with_id(&self, folder: &Path, folder_id: u32) -> Result<()> {
        let folder = canonical_dir(folder)?;
        {
            let _guard = self.metadata.lock();
            let snapshot = snapshot::build_snapshot(&folder, folder_id)
                .with_context(|| format!("Failed to snapshot {}", folder.display()))?;
            info!(
                folder = %folder.display(),
                folder_id,
                files = snapshot.files.len(),
                "added folder"
            );
        }
        self.store.put_folder(folder_id, &folder)?;
        Ok(())
    }

    /// Rebuilds the snapshot and prepares SYNC_REQ frames for what changed.
    ///
    /// A folder never offered before is offered in full.
    pub fn sync(&self, folder: &Path) -> Result<SyncOutcome> {
        let folder = canonical_dir(folder)?;
        let previous = match FolderSnapshot::load(&folder)? {
            Some(prev) if self.store.contains(prev.folder_id)? => prev,
            _ => {
                info!(folder = %folder.display(), "unsynced folder, adding it for syncing");
                self.add(&folder)?;
                return self.offer(&folder);
            }
        };
        if !previous.synced {
            return self.offer(&folder);
        }

        let _guard = self.metadata.lock();
        let mut current = FolderSnapshot::scan(&folder, previous.folder_id)?;
        let changed: Vec<FileAdvert> = current
            .diff(&previous)
            .into_iter()
            .map(FileRecord::advert)
            .collect();
        if changed.is_empty() {
            info!(folder = %folder.display(), "nothing to do");
            return Ok(SyncOutcome::NothingToDo);
        }

        current.synced = true;
        current.last_synced_at = Some(Utc::now());
        current.save(&folder)?;
        info!(
            folder = %folder.display(),
            folder_id = current.folder_id,
            changed = changed.len(),
            "prepared incremental sync"
        );
        Ok(outcome(current.folder_id, DiffKind::Incremental, changed))
    }

    /// Prepares a full offer of every file in `folder`.
    pub fn offer(&self, folder: &Path) -> Result<SyncOutcome> {
        let folder = canonical_dir(folder)?;
        let folder_id = match FolderSnapshot::load(&folder)? {
            Some(prev) if self.store.contains(prev.folder_id)? => prev.folder_id,
            _ => self.add(&folder)?,
        };

        let _guard = self.metadata.lock();
        let mut current = FolderSnapshot::scan(&folder, folder_id)?;
        current.synced = true;
        current.last_synced_at = Some(Utc::now());
        current.save(&folder)?;
        let files = current.files.iter().map(FileRecord::advert).collect();
        Ok(outcome(folder_id, DiffKind::Full, files))
    }

    /// Decides which advertised files to pull. Unknown folders go through
    /// the operator; known ones are compared against the local content and
    /// arbitrated by mod-time against transfers already in flight. Scanning
    /// and backups run on the blocking pool.
    pub async fn plan_incoming(
        &self,
        from: &str,
        folder_id: u32,
        kind: DiffKind,
        files: Vec<FileAdvert>,
    ) -> Result<Vec<PlannedReceive>> {
        match self.store.get_folder(folder_id)? {
            Some(folder) => {
                info!(peer = from, folder_id, ?kind, files = files.len(), "sync request for known folder");
                let manager = self.clone();
                tokio::task::spawn_blocking(move || manager.plan_resync(&folder, folder_id, files))
                    .await?
            }
            None => self.accept_new_folder(from, folder_id, files).await,
        }
    }

    async fn accept_new_folder(
        &self,
        from: &str,
        folder_id: u32,
        files: Vec<FileAdvert>,
    ) -> Result<Vec<PlannedReceive>> {
        let offer = FolderOffer {
            from: from.to_string(),
            folder_id,
            files: files.clone(),
        };
        let Some(acceptance) = self.operator.review(offer).await else {
            info!(peer = from, folder_id, "folder offer declined");
            return Ok(Vec::new());
        };
        if !is_valid_name(&acceptance.name) {
            bail!("Invalid folder name {:?}", acceptance.name);
        }

        let manager = self.clone();
        let from = from.to_string();
        let folder = acceptance.directory.join(&acceptance.name);
        tokio::task::spawn_blocking(move || manager.register_accepted(&from, folder_id, &folder, files))
            .await?
    }

    fn register_accepted(
        &self,
        from: &str,
        folder_id: u32,
        folder: &Path,
        files: Vec<FileAdvert>,
    ) -> Result<Vec<PlannedReceive>> {
        std::fs::create_dir_all(snapshot::sync_dir(folder))
            .with_context(|| format!("Failed to create {}", folder.display()))?;
        let folder = canonical_dir(folder)?;

        // Another peer may have offered the same folder while we were asking.
        if let Some(existing) = self.store.get_folder(folder_id)? {
            warn!(folder_id, "folder was registered while prompting, re-syncing instead");
            return self.plan_resync(&existing, folder_id, files);
        }

        {
            let _guard = self.metadata.lock();
            FolderSnapshot {
                folder_id,
                files: Vec::new(),
                synced: true,
                last_synced_at: None,
            }
            .save(&folder)?;
        }
        self.store.put_folder(folder_id, &folder)?;
        info!(peer = from, folder_id, folder = %folder.display(), "accepted folder");

        let mut plans = Vec::new();
        for advert in files {
            if !is_valid_name(&advert.name) {
                warn!(peer = from, name = %advert.name, "ignoring advertised file with invalid name");
                continue;
            }
            if let Some(plan) = self.claim(&folder, folder_id, &advert) {
                plans.push(plan);
            }
        }
        Ok(plans)
    }

    fn plan_resync(
        &self,
        folder: &Path,
        folder_id: u32,
        files: Vec<FileAdvert>,
    ) -> Result<Vec<PlannedReceive>> {
        let current = FolderSnapshot::scan(folder, folder_id)?;
        let mut plans = Vec::new();
        for advert in files {
            if !is_valid_name(&advert.name) {
                warn!(name = %advert.name, "ignoring advertised file with invalid name");
                continue;
            }
            if current
                .file(&advert.name)
                .is_some_and(|f| f.content_hash == advert.hash)
            {
                debug!(folder_id, file = %advert.name, "unchanged, skipping");
                continue;
            }
            if let Some(plan) = self.claim(folder, folder_id, &advert) {
                plans.push(plan);
            }
        }
        Ok(plans)
    }

    /// Arbitrates the lock for one advertised file and, once granted, moves
    /// the local copy aside. A path whose backup belongs to an unfinished
    /// receive keeps that backup: what sits at the path is partial data.
    fn claim(&self, folder: &Path, folder_id: u32, advert: &FileAdvert) -> Option<PlannedReceive> {
        let path = folder.join(&advert.name);
        let owner = TransferId::next();
        let superseded = match self.locks.arbitrate(&path, advert.mod_time, owner) {
            Arbitration::Rejected { held } => {
                info!(
                    file = %path.display(),
                    held,
                    incoming = advert.mod_time,
                    "already transferring a newer version, keeping it"
                );
                return None;
            }
            Arbitration::Granted { superseded } => superseded,
        };
        if let Some(old) = superseded {
            info!(file = %path.display(), %old, "newer version supersedes transfer in flight");
        }

        {
            let mut backups = self.backups.lock();
            if !backups.contains_key(&path) {
                match backup_file(folder, &advert.name) {
                    Ok(Some(backup)) => {
                        backups.insert(path.clone(), backup);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(file = %path.display(), "failed to back up, skipping: {e}");
                        self.locks.release(&path, owner);
                        return None;
                    }
                }
            }
        }

        Some(PlannedReceive {
            folder_id,
            name: advert.name.clone(),
            path,
            size: advert.size,
            mod_time: advert.mod_time,
            owner,
            superseded,
        })
    }

    /// Absolute path of `name` inside a registered folder.
    pub fn resolve_file(&self, folder_id: u32, name: &str) -> Result<PathBuf> {
        if !is_valid_name(name) {
            bail!("Invalid file name {:?}", name);
        }
        let folder = self
            .store
            .get_folder(folder_id)?
            .with_context(|| format!("Unknown folder id {folder_id}"))?;
        Ok(folder.join(name))
    }

    /// Stamps a fully received file with the sender's mod-time, releases its
    /// lock and records it in the folder metadata.
    pub async fn finish_receive(&self, unit: TransferUnit) {
        let manager = self.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || manager.complete_receive(&unit)).await {
            warn!("failed to finish receive: {e}");
        }
    }

    fn complete_receive(&self, unit: &TransferUnit) {
        let mtime = FileTime::from_unix_time(i64::from(unit.mod_time()), 0);
        if let Err(e) = set_file_mtime(unit.path(), mtime) {
            warn!(file = %unit.path().display(), "failed to set mod-time: {e}");
        }
        if self.locks.release(unit.path(), unit.id()) {
            self.backups.lock().remove(unit.path());
        }
        if let Err(e) = self.record_received(unit.folder_id(), unit.name()) {
            warn!(folder_id = unit.folder_id(), "failed to update metadata: {e:#}");
        }
        info!(folder_id = unit.folder_id(), file = unit.name(), bytes = unit.file_size(), "received file");
    }

    /// Drops a unit that failed mid-transfer. The partial file stays, and so
    /// does the backup of what was there before.
    pub fn abort_receive(&self, unit: &TransferUnit) {
        self.locks.release(unit.path(), unit.id());
    }

    /// Gives up a planned receive before any data arrived: releases the lock
    /// and puts the backed-up local file back. Does nothing once another
    /// transfer owns the path.
    pub fn cancel_receive(&self, path: &Path, owner: TransferId) {
        let mut backups = self.backups.lock();
        if !self.locks.release(path, owner) {
            return;
        }
        if let Some(backup) = backups.remove(path) {
            restore_backup(&backup, path);
        }
    }

    /// Replaces the metadata record of one received file, leaving the rest
    /// of the baseline alone so local edits still show up in the next diff.
    pub fn record_received(&self, folder_id: u32, name: &str) -> Result<()> {
        let folder = self
            .store
            .get_folder(folder_id)?
            .with_context(|| format!("Unknown folder id {folder_id}"))?;
        let record = snapshot::hash_file(&folder.join(name), name.to_string())?;

        let _guard = self.metadata.lock();
        let mut snapshot = FolderSnapshot::load(&folder)?.unwrap_or(FolderSnapshot {
            folder_id,
            files: Vec::new(),
            synced: true,
            last_synced_at: None,
        });
        match snapshot.files.iter_mut().find(|f| f.name == name) {
            Some(existing) => *existing = record,
            None => {
                snapshot.files.push(record);
                snapshot.files.sort_by(|a, b| a.name.cmp(&b.name));
            }
        }
        snapshot.save(&folder)?;
        Ok(())
    }

    /// Whether any transfer holds a lock inside `folder`.
    pub fn folder_busy(&self, folder: &Path) -> bool {
        self.locks.any_under(folder)
    }

    fn new_folder_id(&self) -> Result<u32> {
        loop {
            let id: u32 = rand::random();
            if id != 0 && !self.store.contains(id)? {
                return Ok(id);
            }
        }
    }
}

fn outcome(folder_id: u32, kind: DiffKind, files: Vec<FileAdvert>) -> SyncOutcome {
    SyncOutcome::Offer {
        folder_id,
        kind,
        files: files.len(),
        messages: sync_requests(folder_id, kind, files),
    }
}

/// Splits an offer into SYNC_REQ frames of at most 65535 files each.
/// An empty offer still produces one frame so peers learn the folder.
pub fn sync_requests(folder_id: u32, kind: DiffKind, files: Vec<FileAdvert>) -> Vec<Message> {
    if files.is_empty() {
        return vec![Message::SyncRequest {
            folder_id,
            kind,
            files,
        }];
    }
    files
        .chunks(MAX_FILES_PER_REQUEST)
        .map(|chunk| Message::SyncRequest {
            folder_id,
            kind,
            files: chunk.to_vec(),
        })
        .collect()
}

/// A wire file name must be exactly one normal path component.
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name == SYNC_DIR || name.contains(['/', '\\', '\0']) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Moves `<folder>/<name>` to `<folder>/.sync/<name>.bak` if it exists.
fn backup_file(folder: &Path, name: &str) -> std::io::Result<Option<PathBuf>> {
    let source = folder.join(name);
    if !source.exists() {
        return Ok(None);
    }
    let dir = snapshot::sync_dir(folder);
    std::fs::create_dir_all(&dir)?;
    let backup = dir.join(format!("{name}.bak"));
    if backup.exists() {
        std::fs::remove_file(&backup)?;
    }
    std::fs::rename(&source, &backup)?;
    debug!(file = %source.display(), "backed up");
    Ok(Some(backup))
}

fn restore_backup(backup: &Path, path: &Path) {
    if let Err(e) = std::fs::rename(backup, path) {
        warn!(file = %path.display(), "failed to restore backup: {e}");
    }
}

fn canonical_dir(folder: &Path) -> Result<PathBuf> {
    let folder = std::fs::canonicalize(folder)
        .with_context(|| format!("Failed to resolve path {}", folder.display()))?;
    if !folder.is_dir() {
        bail!("{} is not a directory", folder.display());
    }
    Ok(folder)
}
