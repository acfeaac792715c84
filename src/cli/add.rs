use anyhow::Result;
use std::path::PathBuf;

use lansync::{locks::LockTable, operator::Operator, store::Store, sync_manager::SyncManager};

pub fn run(store: &Store, path: PathBuf) -> Result<()> {
    // Offline: nothing can prompt, so the operator channel is dropped at once.
    let (operator, _) = Operator::channel(1);
    let manager = SyncManager::new(store.clone(), LockTable::new(), operator);
    let folder_id = manager.add(&path)?;
    println!("Added {} as folder {}", path.display(), folder_id);
    Ok(())
}
