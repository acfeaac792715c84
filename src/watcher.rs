use anyhow::Result;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{node::Node, snapshot::SYNC_DIR};

/// Quiet period after the last change before a folder is synced.
pub const DEBOUNCE: Duration = Duration::from_secs(2);

pub struct FolderWatcher {
    watcher: RecommendedWatcher,
    rx: mpsc::Receiver<Result<PathBuf>>,
    folders: HashSet<PathBuf>,
    missing: HashSet<PathBuf>,
}

impl FolderWatcher {
    pub fn new() -> Result<Self> {
        let (tx, rx) = mpsc::channel(100);

        let watcher = RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    if event.kind.is_access() {
                        return;
                    }
                    for path in event.paths {
                        let _ = tx.blocking_send(Ok(path));
                    }
                }
                Err(e) => {
                    let _ = tx.blocking_send(Err(anyhow::anyhow!("Watch error: {}", e)));
                }
            },
            Config::default(),
        )?;

        Ok(Self {
            watcher,
            rx,
            folders: HashSet::new(),
            missing: HashSet::new(),
        })
    }

    /// Watches the files directly inside `folder`.
    pub fn watch(&mut self, folder: &Path) -> Result<()> {
        self.watcher.watch(folder, RecursiveMode::NonRecursive)?;
        self.folders.insert(folder.to_path_buf());
        Ok(())
    }

    pub fn unwatch(&mut self, folder: &Path) -> Result<()> {
        self.watcher.unwatch(folder)?;
        self.folders.remove(folder);
        Ok(())
    }

    /// Brings the watch set in line with the folder registry: folders added
    /// since the last call are watched, forgotten ones are dropped.
    pub fn refresh(&mut self, registered: Vec<(u32, PathBuf)>) {
        let wanted: HashSet<PathBuf> = registered.iter().map(|(_, f)| f.clone()).collect();
        let stale: Vec<PathBuf> = self.folders.difference(&wanted).cloned().collect();
        for folder in stale {
            info!(folder = %folder.display(), "no longer registered, unwatching");
            if let Err(e) = self.unwatch(&folder) {
                debug!(folder = %folder.display(), "unwatch failed: {e}");
                self.folders.remove(&folder);
            }
        }
        self.missing.retain(|f| wanted.contains(f));

        for (id, folder) in registered {
            if self.folders.contains(&folder) {
                continue;
            }
            if !folder.is_dir() {
                if self.missing.insert(folder.clone()) {
                    warn!(folder_id = id, folder = %folder.display(), "registered folder is missing");
                }
                continue;
            }
            match self.watch(&folder) {
                Ok(()) => {
                    self.missing.remove(&folder);
                    info!(folder_id = id, folder = %folder.display(), "watching folder");
                }
                Err(e) => error!(folder_id = id, folder = %folder.display(), "Failed to watch: {e}"),
            }
        }
    }

    pub async fn next_event(&mut self) -> Option<Result<PathBuf>> {
        self.rx.recv().await
    }

    /// Registered folder a changed path belongs to. Changes under `.sync`
    /// are our own bookkeeping and are ignored.
    fn folder_of(&self, path: &Path) -> Option<PathBuf> {
        let folder = self.folders.iter().find(|f| path.starts_with(f))?;
        let relative = path.strip_prefix(folder).ok()?;
        if relative.starts_with(SYNC_DIR) {
            return None;
        }
        Some(folder.clone())
    }

    /// Watches every registered folder and syncs each one once it has been
    /// quiet for [`DEBOUNCE`]. A folder with transfers in flight waits until
    /// they finish. The registry is re-read on every tick, so folders added
    /// or accepted while running are picked up.
    pub async fn run(mut self, node: Node) -> Result<()> {
        self.refresh(node.folders()?);

        let mut pending: HashMap<PathBuf, Instant> = HashMap::new();
        let mut ticker = tokio::time::interval(DEBOUNCE / 4);
        loop {
            tokio::select! {
                event = self.next_event() => match event {
                    Some(Ok(path)) => {
                        if let Some(folder) = self.folder_of(&path) {
                            debug!(path = %path.display(), "local change");
                            pending.insert(folder, Instant::now());
                        }
                    }
                    Some(Err(e)) => error!("{e}"),
                    None => break,
                },
                _ = ticker.tick() => {
                    match node.folders() {
                        Ok(registered) => self.refresh(registered),
                        Err(e) => error!("Failed to list folders: {e:#}"),
                    }
                    pending.retain(|folder, _| self.folders.contains(folder));
                    let due: Vec<PathBuf> = pending
                        .iter()
                        .filter(|(folder, changed)| {
                            changed.elapsed() >= DEBOUNCE && !node.manager().folder_busy(folder)
                        })
                        .map(|(folder, _)| folder.clone())
                        .collect();
                    for folder in due {
                        pending.remove(&folder);
                        if let Err(e) = node.sync(&folder).await {
                            error!(folder = %folder.display(), "Failed to sync: {e:#}");
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
