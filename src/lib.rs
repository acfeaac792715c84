pub mod config;
pub mod handshake;
pub mod locks;
pub mod node;
pub mod operator;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod snapshot;
pub mod store;
pub mod sync_manager;
pub mod transfer;
pub mod watcher;
