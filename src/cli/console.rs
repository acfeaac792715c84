//! Line-oriented operator console for `serve`.
//!
//! Folder offers from peers arrive as prompts; while one is being answered
//! the dialog owns stdin.

use anyhow::{bail, Context, Result};
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc;
use tracing::{error, info};

use lansync::{
    node::Node,
    operator::{Acceptance, Prompt},
    sync_manager::SyncOutcome,
};

type Input = Lines<BufReader<Stdin>>;

enum Flow {
    Continue,
    Quit,
}

pub async fn run(node: Node, mut prompts: mpsc::Receiver<Prompt>) -> Result<()> {
    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    print_help();

    loop {
        tokio::select! {
            Some(prompt) = prompts.recv() => {
                let answer = if stdin_open {
                    ask_operator(&prompt, &mut input).await?
                } else {
                    info!(peer = %prompt.offer.from, "no console attached, declining folder offer");
                    None
                };
                let _ = prompt.reply.send(answer);
            }
            line = input.next_line(), if stdin_open => match line? {
                Some(line) => match execute(&node, line.trim()).await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Quit) => break,
                    Err(e) => error!("{e:#}"),
                },
                None => {
                    info!("stdin closed, serving until interrupted");
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Shutting down");
    node.shutdown().await;
    Ok(())
}

async fn ask_operator(prompt: &Prompt, input: &mut Input) -> Result<Option<Acceptance>> {
    let offer = &prompt.offer;
    println!(
        "\n{} offers folder {} with {} file(s):",
        offer.from,
        offer.folder_id,
        offer.files.len()
    );
    for file in offer.files.iter().take(10) {
        println!("  {} ({} bytes)", file.name, file.size);
    }
    if offer.files.len() > 10 {
        println!("  ...");
    }

    let accept = ask(input, "Accept? [y/n] ").await?;
    if !matches!(accept.as_deref(), Some("y" | "Y" | "yes")) {
        return Ok(None);
    }
    let Some(directory) = ask(input, "Create it in directory: ").await? else {
        return Ok(None);
    };
    let Some(name) = ask(input, "Folder name: ").await? else {
        return Ok(None);
    };
    Ok(Some(Acceptance {
        directory: PathBuf::from(directory),
        name,
    }))
}

/// Prints `question` and reads one non-empty answer. `None` on EOF or an
/// empty line.
async fn ask(input: &mut Input, question: &str) -> Result<Option<String>> {
    print!("{question}");
    std::io::stdout().flush()?;
    Ok(input
        .next_line()
        .await?
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty()))
}

async fn execute(node: &Node, line: &str) -> Result<Flow> {
    let (command, arg) = match line.split_once(char::is_whitespace) {
        Some((command, arg)) => (command, arg.trim()),
        None => (line, ""),
    };

    match command {
        "" => {}
        "add" => {
            let folder_id = node.add(path_arg(arg, "add <path>")?).await?;
            println!("Added {} as folder {}", arg, folder_id);
        }
        "sync" => report(node.sync(path_arg(arg, "sync <path>")?).await?),
        "offer" => report(node.offer(path_arg(arg, "offer <path>")?).await?),
        "connect" => {
            let addr: SocketAddr = arg
                .parse()
                .with_context(|| format!("Invalid address {arg:?}, usage: connect <ip:port>"))?;
            match node.connect(addr).await? {
                Some(peer) => println!("Connected to {}", peer),
                None => println!("Kept existing session with {}", addr),
            }
        }
        "peers" => {
            let peers = node.registry().peers();
            if peers.is_empty() {
                println!("No peers connected.");
            }
            for peer in peers {
                println!("{}  since {}", peer, peer.connected_at());
            }
        }
        "folders" => {
            let folders = node.folders()?;
            if folders.is_empty() {
                println!("No folders registered.");
            }
            for (id, path) in folders {
                println!("{:>10}  {}", id, path.display());
            }
        }
        "help" => print_help(),
        "quit" | "exit" => return Ok(Flow::Quit),
        other => println!("Unknown command {other:?}, try 'help'"),
    }
    Ok(Flow::Continue)
}

fn path_arg<'a>(arg: &'a str, usage: &str) -> Result<&'a Path> {
    if arg.is_empty() {
        bail!("Missing path, usage: {usage}");
    }
    Ok(Path::new(arg))
}

fn report(outcome: SyncOutcome) {
    match outcome {
        SyncOutcome::NothingToDo => println!("Nothing to do."),
        SyncOutcome::Offer {
            folder_id,
            kind,
            files,
            ..
        } => println!("Offered {} file(s) of folder {} ({:?})", files, folder_id, kind),
    }
}

fn print_help() {
    println!("Commands:");
    println!("  add <path>        register a folder");
    println!("  sync <path>       send what changed in a folder to all peers");
    println!("  offer <path>      send a whole folder to all peers");
    println!("  connect <ip:port> connect to a peer");
    println!("  peers             list connected peers");
    println!("  folders           list registered folders");
    println!("  quit              disconnect and exit");
}
