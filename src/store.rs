use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DbError(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] postcard::Error),
    #[error("System error: {0}")]
    SystemError(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// One locally known folder, own or accepted from a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderEntry {
    pub path: String,
    /// Unix seconds at registration.
    pub added_at: i64,
}

impl FolderEntry {
    pub fn path(&self) -> PathBuf {
        PathBuf::from(&self.path)
    }
}

/// Process-wide folder registry: folder unique ID -> absolute path.
#[derive(Clone)]
pub struct Store {
    #[allow(dead_code)]
    db: Db,
    folders: Tree,
}

impl Store {
    /// Opens (or creates) the registry under `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir).map_err(|e| StoreError::SystemError(e.to_string()))?;
        let db = sled::open(data_dir.join("db"))?;
        Self::from_db(db)
    }

    /// In-memory registry that vanishes on drop.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self> {
        let folders = db.open_tree("folders")?;
        Ok(Self { db, folders })
    }

    pub fn put_folder<P: AsRef<Path>>(&self, folder_id: u32, path: P) -> Result<()> {
        let entry = FolderEntry {
            path: path.as_ref().to_string_lossy().into_owned(),
            added_at: chrono::Utc::now().timestamp(),
        };
        let bytes = postcard::to_stdvec(&entry)?;
        self.folders.insert(folder_id.to_be_bytes(), bytes)?;
        self.folders.flush()?;
        Ok(())
    }

    pub fn get_folder(&self, folder_id: u32) -> Result<Option<PathBuf>> {
        Ok(self.get_entry(folder_id)?.map(|entry| entry.path()))
    }

    pub fn get_entry(&self, folder_id: u32) -> Result<Option<FolderEntry>> {
        match self.folders.get(folder_id.to_be_bytes())? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn contains(&self, folder_id: u32) -> Result<bool> {
        Ok(self.folders.contains_key(folder_id.to_be_bytes())?)
    }

    pub fn all_folder_ids(&self) -> Result<BTreeSet<u32>> {
        let mut ids = BTreeSet::new();
        for item in self.folders.iter() {
            let (key, _) = item?;
            ids.insert(decode_id(&key)?);
        }
        Ok(ids)
    }

    pub fn list_folders(&self) -> Result<Vec<(u32, FolderEntry)>> {
        let mut folders = Vec::new();
        for item in self.folders.iter() {
            let (key, value) = item?;
            folders.push((decode_id(&key)?, postcard::from_bytes(&value)?));
        }
        Ok(folders)
    }

    pub fn find_by_path<P: AsRef<Path>>(&self, path: P) -> Result<Option<u32>> {
        let path = path.as_ref();
        Ok(self
            .list_folders()?
            .into_iter()
            .find(|(_, entry)| entry.path() == path)
            .map(|(id, _)| id))
    }

    pub fn remove_folder(&self, folder_id: u32) -> Result<bool> {
        let old = self.folders.remove(folder_id.to_be_bytes())?;
        self.folders.flush()?;
        Ok(old.is_some())
    }
}

fn decode_id(key: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = key
        .try_into()
        .map_err(|_| StoreError::SystemError(format!("Invalid folder key length {}", key.len())))?;
    Ok(u32::from_be_bytes(bytes))
}
