//! Folder snapshots: per-file content hash, piece hashes, size and mod-time.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::unix_seconds;
use crate::protocol::FileAdvert;

/// Size of one hashed piece; the last piece of a file may be shorter.
pub const PIECE_SIZE: usize = 512 * 1024;

/// Per-folder directory holding metadata and backups.
pub const SYNC_DIR: &str = ".sync";
pub const METADATA_FILE: &str = "metadata";

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to list {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("corrupt metadata in {path}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, SnapshotError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub name: String,
    pub size: u64,
    pub content_hash: String,
    pub piece_hashes: Vec<String>,
    pub piece_count: u32,
    pub mod_time: u32,
}

impl FileRecord {
    pub fn advert(&self) -> FileAdvert {
        FileAdvert {
            name: self.name.clone(),
            size: self.size,
            hash: self.content_hash.clone(),
            mod_time: self.mod_time,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderSnapshot {
    pub folder_id: u32,
    pub files: Vec<FileRecord>,
    /// Whether this folder was ever offered to peers.
    pub synced: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl FolderSnapshot {
    /// Hashes every regular file directly inside `folder`.
    pub fn scan(folder: &Path, folder_id: u32) -> Result<Self> {
        let mut files = Vec::new();
        for name in list_files(folder)? {
            files.push(hash_file(&folder.join(&name), name)?);
        }
        debug!(folder = %folder.display(), files = files.len(), "scanned folder");
        Ok(Self {
            folder_id,
            files,
            synced: false,
            last_synced_at: None,
        })
    }

    pub fn file(&self, name: &str) -> Option<&FileRecord> {
        self.files.iter().find(|f| f.name == name)
    }

    /// Files of `self` that are new or whose content hash differs from `old`.
    pub fn diff<'a>(&'a self, old: &FolderSnapshot) -> Vec<&'a FileRecord> {
        let previous: HashMap<&str, &str> = old
            .files
            .iter()
            .map(|f| (f.name.as_str(), f.content_hash.as_str()))
            .collect();
        self.files
            .iter()
            .filter(|f| previous.get(f.name.as_str()) != Some(&f.content_hash.as_str()))
            .collect()
    }

    pub fn load(folder: &Path) -> Result<Option<Self>> {
        let path = metadata_path(folder);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(SnapshotError::Io { path, source }),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| SnapshotError::Metadata { path, source })
    }

    pub fn save(&self, folder: &Path) -> Result<()> {
        let dir = sync_dir(folder);
        std::fs::create_dir_all(&dir).map_err(|source| SnapshotError::Io {
            path: dir.clone(),
            source,
        })?;
        let path = metadata_path(folder);
        let json = serde_json::to_vec_pretty(self).map_err(|source| SnapshotError::Metadata {
            path: path.clone(),
            source,
        })?;
        std::fs::write(&path, json).map_err(|source| SnapshotError::Io { path, source })
    }
}

/// Scans `folder` and persists the result as its metadata.
pub fn build_snapshot(folder: &Path, folder_id: u32) -> Result<FolderSnapshot> {
    let snapshot = FolderSnapshot::scan(folder, folder_id)?;
    snapshot.save(folder)?;
    Ok(snapshot)
}

pub fn sync_dir(folder: &Path) -> PathBuf {
    folder.join(SYNC_DIR)
}

pub fn metadata_path(folder: &Path) -> PathBuf {
    sync_dir(folder).join(METADATA_FILE)
}

/// Names of the regular files directly inside `folder`, sorted.
///
/// Names that cannot travel on the wire (non UTF-8, longer than 255 bytes)
/// are skipped.
pub fn list_files(folder: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in WalkDir::new(folder).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|source| SnapshotError::Walk {
            path: folder.to_path_buf(),
            source,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        match entry.file_name().to_str() {
            Some(name) if name.len() <= u8::MAX as usize => names.push(name.to_string()),
            _ => warn!(path = %entry.path().display(), "skipping file with unsupported name"),
        }
    }
    names.sort();
    Ok(names)
}

/// Hashes one file: MD5 over the whole content, SHA-256 per piece.
pub fn hash_file(path: &Path, name: String) -> Result<FileRecord> {
    let io = |source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).map_err(io)?;
    let meta = file.metadata().map_err(io)?;

    let mut whole = Md5::new();
    let mut piece_hashes = Vec::new();
    let mut size = 0u64;
    let mut buf = vec![0u8; PIECE_SIZE];
    loop {
        let n = read_piece(&mut file, &mut buf).map_err(io)?;
        if n == 0 {
            break;
        }
        whole.update(&buf[..n]);
        piece_hashes.push(hex::encode(Sha256::digest(&buf[..n])));
        size += n as u64;
    }

    Ok(FileRecord {
        name,
        size,
        content_hash: hex::encode(whole.finalize()),
        piece_count: piece_hashes.len() as u32,
        piece_hashes,
        mod_time: meta.modified().map(unix_seconds).unwrap_or(0),
    })
}

/// Fills `buf` as far as the file allows; short only at end of file.
fn read_piece(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn folder_with(files: &[(&str, &[u8])]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (name, data) in files {
            std::fs::write(dir.path().join(name), data).unwrap();
        }
        dir
    }

    #[test]
    fn scan_lists_only_top_level_files() {
        let dir = folder_with(&[("b.txt", b"bbb".as_slice()), ("a.txt", b"a".as_slice())]);
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested/c.txt"), b"c").unwrap();
        std::fs::create_dir(dir.path().join(SYNC_DIR)).unwrap();

        let snap = FolderSnapshot::scan(dir.path(), 3).unwrap();
        let names: Vec<_> = snap.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["a.txt", "b.txt"]);
        assert_eq!(snap.folder_id, 3);
        assert_eq!(snap.file("b.txt").unwrap().size, 3);
    }

    #[test]
    fn content_hash_is_md5_hex() {
        let dir = folder_with(&[("hello", b"hello".as_slice())]);
        let snap = FolderSnapshot::scan(dir.path(), 1).unwrap();
        let record = snap.file("hello").unwrap();
        assert_eq!(record.content_hash, "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(record.content_hash.len(), crate::protocol::HASH_LEN);
    }

    #[test]
    fn pieces_cover_the_whole_file() {
        let data = vec![9u8; PIECE_SIZE * 2 + 10];
        let dir = folder_with(&[("big.bin", data.as_slice()), ("empty", b"".as_slice())]);
        let snap = FolderSnapshot::scan(dir.path(), 1).unwrap();

        let big = snap.file("big.bin").unwrap();
        assert_eq!(big.piece_count, 3);
        assert_eq!(big.piece_hashes.len(), 3);
        assert_eq!(big.piece_hashes[0], big.piece_hashes[1]);
        assert_ne!(big.piece_hashes[1], big.piece_hashes[2]);
        assert_eq!(big.size, data.len() as u64);

        let empty = snap.file("empty").unwrap();
        assert_eq!(empty.piece_count, 0);
        assert!(empty.piece_hashes.is_empty());
    }

    #[test]
    fn unchanged_folder_has_empty_diff() {
        let dir = folder_with(&[("a.txt", b"one".as_slice()), ("b.txt", b"two".as_slice())]);
        let first = build_snapshot(dir.path(), 1).unwrap();
        let second = build_snapshot(dir.path(), 1).unwrap();
        assert!(second.diff(&first).is_empty());
    }

    #[test]
    fn diff_reports_changed_and_new_files() {
        let dir = folder_with(&[("a.txt", b"one".as_slice()), ("x.txt", b"before".as_slice())]);
        let before = FolderSnapshot::scan(dir.path(), 1).unwrap();

        std::fs::write(dir.path().join("x.txt"), b"after").unwrap();
        let after = FolderSnapshot::scan(dir.path(), 1).unwrap();
        let changed: Vec<_> = after.diff(&before).iter().map(|f| f.name.clone()).collect();
        assert_eq!(changed, ["x.txt"]);

        std::fs::write(dir.path().join("new.txt"), b"fresh").unwrap();
        let grown = FolderSnapshot::scan(dir.path(), 1).unwrap();
        let changed: Vec<_> = grown.diff(&after).iter().map(|f| f.name.clone()).collect();
        assert_eq!(changed, ["new.txt"]);
    }

    #[test]
    fn metadata_persists_under_sync_dir() {
        let dir = folder_with(&[("a.txt", b"one".as_slice())]);
        assert!(FolderSnapshot::load(dir.path()).unwrap().is_none());

        let mut snap = build_snapshot(dir.path(), 11).unwrap();
        assert!(metadata_path(dir.path()).exists());
        snap.synced = true;
        snap.last_synced_at = Some(Utc::now());
        snap.save(dir.path()).unwrap();

        let loaded = FolderSnapshot::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded, snap);
    }

    #[test]
    fn corrupt_metadata_is_an_error() {
        let dir = folder_with(&[]);
        std::fs::create_dir(dir.path().join(SYNC_DIR)).unwrap();
        std::fs::write(metadata_path(dir.path()), b"{not json").unwrap();
        assert!(matches!(
            FolderSnapshot::load(dir.path()),
            Err(SnapshotError::Metadata { .. })
        ));
    }
}
