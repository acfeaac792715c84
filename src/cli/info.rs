use anyhow::Result;
use std::path::Path;

use lansync::store::Store;

pub fn run(data_dir: &Path) -> Result<()> {
    let store = Store::open(data_dir)?;

    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Data directory: {}", data_dir.display());
    println!("Registered folders: {}", store.all_folder_ids()?.len());

    Ok(())
}
