use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{error, info};

use lansync::{config::Config, node::Node, operator::Operator, store::Store, watcher::FolderWatcher};

use super::console;

pub async fn run(config: Config) -> Result<()> {
    let store = Store::open(&config.data_dir)?;
    let (operator, prompts) = Operator::channel(8);
    let node = Node::from_config(store, operator, &config);

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("Failed to listen on {}", config.listen))?;
    info!("Listening on {} as {}", listener.local_addr()?, config.username);
    let acceptor = node.clone();
    tokio::spawn(async move { acceptor.listen(listener).await });

    for addr in config.connect.iter().copied() {
        let node = node.clone();
        tokio::spawn(async move {
            match node.connect(addr).await {
                Ok(Some(peer)) => info!("Connected to {}", peer),
                Ok(None) => info!("Already connected to {}", addr),
                Err(e) => error!("{e:#}"),
            }
        });
    }

    if config.watch {
        let watcher = FolderWatcher::new()?;
        let node = node.clone();
        tokio::spawn(async move {
            if let Err(e) = watcher.run(node).await {
                error!("Watcher stopped: {e:#}");
            }
        });
    }

    console::run(node, prompts).await
}
