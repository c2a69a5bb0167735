use anyhow::{Context, Result};
use clap::Parser;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cairn::auth::{CredentialStore, LayeredCredentials, StaticCredentials, StoreCredentials};
use cairn::catalog::Catalog;
use cairn::cli::{init_logging, DaemonOpts};
use cairn::config::{self, ServerConfig};
use cairn::ingest::Ingestor;
use cairn::logger::{IngestLogger, NoopLogger, TextLogger};
use cairn::protocol::Credentials;
use cairn::protocol_core::{ensure_dir_exists, ensure_parent_exists};
use cairn::server::Server;
use cairn::session::Services;
use cairn::storage::{SqliteStore, Store};
use cairn::transfer::SourceRouter;

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();
    init_logging(&opts.log_level)?;

    let mut cfg = config::load_or_init(opts.config.as_deref())?.server;
    apply_overrides(&mut cfg, &opts);

    ensure_dir_exists(&cfg.download_path)?;
    let storage_dir = std::fs::canonicalize(&cfg.download_path).with_context(|| {
        format!(
            "Failed to canonicalize storage path: {}",
            cfg.download_path.display()
        )
    })?;

    println!("Starting cairn daemon:");
    println!("  Bind: {}", cfg.bind);
    println!("  Database: {}", cfg.db_path.display());
    println!("  Storage: {}", storage_dir.display());
    println!("  Digest: {}", cfg.hash);

    if cfg.allow_skipped_handshake {
        eprintln!("WARNING: --allow-skipped-handshake accepts commands from unauthenticated clients");
    }
    if cfg.allow_local_sources {
        eprintln!("WARNING: local file sources are enabled; clients can make the daemon read any file it can open");
    }
    if cfg.bind.starts_with("0.0.0.0") {
        eprintln!("WARNING: Binding to 0.0.0.0 exposes daemon to all network interfaces");
        eprintln!("   The protocol is UNENCRYPTED; only use on trusted networks (LAN)");
        eprintln!();
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    rt.block_on(run(cfg, storage_dir))
}

fn apply_overrides(cfg: &mut ServerConfig, opts: &DaemonOpts) {
    if let Some(bind) = &opts.bind {
        cfg.bind = bind.clone();
    }
    if let Some(db) = &opts.db_path {
        cfg.db_path = db.clone();
    }
    if let Some(dir) = &opts.storage_dir {
        cfg.download_path = dir.clone();
    }
    if opts.allow_skipped_handshake {
        cfg.allow_skipped_handshake = true;
    }
    if opts.allow_local_sources {
        cfg.allow_local_sources = true;
    }
}

async fn run(cfg: ServerConfig, storage_dir: std::path::PathBuf) -> Result<()> {
    ensure_parent_exists(&cfg.db_path)?;
    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::open(&cfg.db_path)
            .with_context(|| format!("open database {}", cfg.db_path.display()))?,
    );
    let catalog = Catalog::new(Arc::clone(&store));
    catalog.init_schema().await.context("apply schema")?;
    for (username, secret) in &cfg.users {
        catalog.upsert_user(username, secret).await?;
    }

    let configured: HashMap<String, String> = cfg.users.clone().into_iter().collect();
    let credentials: Arc<dyn CredentialStore> = Arc::new(LayeredCredentials::new(vec![
        Arc::new(StaticCredentials::new(configured)),
        Arc::new(StoreCredentials::new(catalog.clone())),
    ]));

    let logger: Arc<dyn IngestLogger> = match &cfg.audit_log {
        Some(p) => match TextLogger::new(p) {
            Ok(l) => Arc::new(l),
            Err(e) => {
                warn!(path = %p.display(), error = %e, "audit log unavailable");
                Arc::new(NoopLogger)
            }
        },
        None => Arc::new(NoopLogger),
    };

    let source = SourceRouter::new(cfg.allow_local_sources)?;
    let ingestor = Ingestor::new(catalog, Arc::new(source), storage_dir, cfg.hash, logger);

    let services = Services {
        identity: Credentials {
            username: cfg.username.clone(),
            secretkey: cfg.secretkey.clone(),
        },
        credentials,
        ingestor: Arc::new(ingestor),
        allow_skipped_handshake: cfg.allow_skipped_handshake,
    };

    let server = Server::bind(&cfg.bind, services)
        .await
        .with_context(|| format!("bind {}", cfg.bind))?;

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received");
                trigger.cancel();
            }
            Err(e) => warn!(error = %e, "cannot listen for Ctrl-C"),
        }
    });

    server.serve(shutdown).await?;
    store.close().await?;
    info!("stopped");
    Ok(())
}
