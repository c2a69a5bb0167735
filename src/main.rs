//! cairn - backup client
//!
//! `cairn ping` checks credentials against the server; `cairn add PATH` asks
//! the server to back up one file.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;

use cairn::cli::{init_logging, ClientArgs, ClientCommand};
use cairn::config::{self, ClientConfig};
use cairn::url::{file_url, parse_server_addr, RemoteServer};
use cairn::BackupClient;

#[tokio::main]
async fn main() -> Result<()> {
    let args = ClientArgs::parse();
    init_logging(&args.log_level)?;

    let config = config::load_or_init(args.config.as_deref())?.client;
    let server = match args.server.as_deref() {
        Some(s) => parse_server_addr(s).with_context(|| format!("bad server address: {s}"))?,
        None => RemoteServer {
            host: config.host.clone(),
            port: config.port,
        },
    };

    let client = connect(&server, &config).await?;
    let result = match &args.command {
        ClientCommand::Ping => Ok(()),
        ClientCommand::Add {
            path,
            owner,
            source,
        } => add(&client, path, *owner, source.as_deref()).await,
    };
    client.close().await.ok();
    result
}

async fn connect(server: &RemoteServer, config: &ClientConfig) -> Result<BackupClient> {
    let client = BackupClient::connect(&server.host, server.port)
        .await
        .with_context(|| format!("connect to {}", server.addr()))?;
    let identity = client
        .handshake(&config.username, &config.key)
        .await
        .context("handshake")?;
    println!("Connected to {} as {} (server: {})", server.addr(), config.username, identity.username);
    Ok(client)
}

async fn add(client: &BackupClient, path: &Path, owner: i64, source: Option<&str>) -> Result<()> {
    let abs = std::fs::canonicalize(path)
        .with_context(|| format!("Failed to canonicalize path: {}", path.display()))?;
    if !abs.is_file() {
        anyhow::bail!("Not a file: {}", abs.display());
    }
    let client_path = abs.to_string_lossy();
    let source = source.map(str::to_string).unwrap_or_else(|| file_url(&abs));

    client
        .add_file(&client_path, owner, &source)
        .await
        .with_context(|| format!("add {client_path}"))?;
    println!("Backed up {client_path}");
    Ok(())
}
