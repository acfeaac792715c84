use anyhow::Result;
use chrono::DateTime;

use lansync::store::Store;

pub fn run(store: &Store, forget: Option<u32>) -> Result<()> {
    if let Some(folder_id) = forget {
        if store.remove_folder(folder_id)? {
            println!("Forgot folder {}", folder_id);
        } else {
            println!("No folder with id {}", folder_id);
        }
        return Ok(());
    }

    let folders = store.list_folders()?;
    if folders.is_empty() {
        println!("No folders registered.");
    } else {
        for (id, entry) in folders {
            let added = DateTime::from_timestamp(entry.added_at, 0)
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_default();
            println!("{:>10}  {}  {}", id, added, entry.path);
        }
    }
    Ok(())
}
