use anyhow::Result;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

use lansync::config::{self, Config, DEFAULT_PORT};
use lansync::store::Store;

mod add;
mod console;
mod folders;
mod info;
pub mod serve;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Where the folder registry lives (defaults to the user config dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show version and registry info
    Info,
    /// Register a folder for syncing
    Add {
        /// The folder to register
        path: PathBuf,
    },
    /// List registered folders
    Folders {
        /// Forget the folder with this ID
        #[arg(long)]
        forget: Option<u32>,
    },
    /// Run the node: accept peers, connect to peers and sync folders
    Serve {
        /// Name announced to peers
        #[arg(short, long)]
        username: String,
        /// Address to accept peers on
        #[arg(short, long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)))]
        listen: SocketAddr,
        /// Peers to dial at startup
        #[arg(short, long)]
        connect: Vec<SocketAddr>,
        /// Sync registered folders automatically when they change
        #[arg(short, long)]
        watch: bool,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let data_dir = config::data_dir(self.data_dir)?;
        match self.command {
            Commands::Info => info::run(&data_dir)?,
            Commands::Add { path } => add::run(&Store::open(&data_dir)?, path)?,
            Commands::Folders { forget } => folders::run(&Store::open(&data_dir)?, forget)?,
            Commands::Serve {
                username,
                listen,
                connect,
                watch,
            } => {
                let mut config = Config::new(username, data_dir)?;
                config.listen = listen;
                config.connect = connect;
                config.watch = watch;
                serve::run(config).await?
            }
        }
        Ok(())
    }
}
