use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use meshstore_core::{
    crypto, ContentHash, Fetched, Node, NodeConfig, NodeHandle,
};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "meshstore")]
#[command(about = "Encrypted peer-to-peer file sharing node")]
struct Cli {
    /// Node identifier; node data lives under <data-dir>/<node-id>/
    node_id: String,
    /// TCP port to listen on
    port: u16,
    /// Address of an existing node to join; omit to found a new mesh
    peer_addr: Option<String>,
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,
    #[arg(long, default_value = "downloads")]
    downloads_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = NodeConfig {
        node_id: cli.node_id.clone(),
        listen_addr: format!("0.0.0.0:{}", cli.port),
        peer_addr: cli.peer_addr.clone(),
        data_dir: cli.data_dir.join(&cli.node_id),
        downloads_dir: cli.downloads_dir.clone(),
    };
    fs::create_dir_all(config.store_dir())
        .await
        .context("create store directory")?;
    fs::create_dir_all(config.watch_dir())
        .await
        .context("create watch directory")?;

    let node = Node::start(config.clone()).await.context("start node")?;
    if let Err(err) = node.clean_temp().await {
        warn!(%err, "failed to clean temp directory");
    }

    if let Some(addr) = &cli.peer_addr {
        println!("Connecting to peer at {addr}...");
        if let Err(err) = node.connect(addr).await {
            eprintln!("Failed to connect to peer: {err}");
        }
    }

    println!(
        "Node {} started. Watch directory: {}",
        node.id(),
        config.watch_dir().display()
    );
    println!("Available commands:");
    println!("  store <file>   - Store a file");
    println!("  get <hash>     - Get a file by hash");
    println!("  list           - List stored files");
    println!("  peers          - List known peers");
    println!("  connect <addr> - Connect to a peer");
    println!("  quit           - Exit the program");

    repl(&node, &cli.downloads_dir).await?;

    node.stop().await;
    Ok(())
}

async fn repl(node: &NodeHandle, downloads_dir: &Path) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    prompt()?;
    while let Some(line) = lines.next_line().await? {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            [] => {}
            ["store", path] => match node.store_file(Path::new(path)).await {
                Ok(hash) => println!("File stored with hash: {hash}"),
                Err(err) => println!("Failed to store file: {err}"),
            },
            ["get", hash] => {
                if let Err(err) = get(node, downloads_dir, hash).await {
                    println!("Failed to get file: {err}");
                }
            }
            ["list"] => match node.list().await {
                Ok(hashes) if hashes.is_empty() => println!("No files stored"),
                Ok(hashes) => {
                    println!("Stored files:");
                    for hash in hashes {
                        println!("  {hash}");
                    }
                }
                Err(err) => println!("Failed to list files: {err}"),
            },
            ["peers"] => {
                let peers = node.peers().await;
                if peers.is_empty() {
                    println!("No known peers");
                } else {
                    println!("Known peers:");
                    for peer in peers {
                        println!("  {} at {}", peer.id, peer.address);
                    }
                }
            }
            ["connect", addr] => match node.connect(addr).await {
                Ok(()) => println!("Connected to {addr}"),
                Err(err) => println!("Failed to connect: {err}"),
            },
            ["quit"] | ["exit"] => break,
            _ => println!("Unknown command"),
        }
        prompt()?;
    }
    Ok(())
}

fn prompt() -> anyhow::Result<()> {
    print!("> ");
    std::io::stdout().flush()?;
    Ok(())
}

/// Resolve a `get` command: decrypt a locally held object into the
/// downloads directory, or report that it was requested from the mesh.
async fn get(node: &NodeHandle, downloads_dir: &Path, hash_text: &str) -> anyhow::Result<()> {
    let hash = ContentHash::parse(hash_text)?;
    match node.get_file(&hash).await? {
        Fetched::Local { mut reader, key } => {
            fs::create_dir_all(downloads_dir).await?;
            let out_path = downloads_dir.join(hash.as_str());
            let temp_path = downloads_dir.join(format!(".{hash}.partial"));

            let mut temp = fs::File::create(&temp_path).await?;
            let decrypted = crypto::decrypt_stream(&key, &mut reader, &mut temp).await;
            if let Err(err) = decrypted {
                drop(temp);
                let _ = fs::remove_file(&temp_path).await;
                return Err(err.into());
            }
            temp.flush().await?;
            drop(temp);
            fs::rename(&temp_path, &out_path).await?;
            println!("File decrypted and saved to: {}", out_path.display());
        }
        Fetched::Requested => {
            println!("Not available locally; requested from peers. It will appear in downloads/ when received.");
        }
    }
    Ok(())
}
