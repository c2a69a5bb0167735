//! Shared CLI helpers and Clap definitions for `cairn` and `cairnd`

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Backup daemon options. Flags override the config file.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "cairn backup daemon")]
pub struct DaemonOpts {
    /// Config file (default: <config dir>/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Bind address (host:port)
    #[arg(long)]
    pub bind: Option<String>,

    /// SQLite database file
    #[arg(long = "db")]
    pub db_path: Option<PathBuf>,

    /// Directory receiving backed-up file contents
    #[arg(long = "storage")]
    pub storage_dir: Option<PathBuf>,

    /// Treat commands sent before a handshake as authenticated
    #[arg(long)]
    pub allow_skipped_handshake: bool,

    /// Let clients name file:// URLs and local paths as content sources
    #[arg(long)]
    pub allow_local_sources: bool,

    /// Log filter when RUST_LOG is unset (e.g. info, cairn=debug)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "cairn backup client")]
pub struct ClientArgs {
    /// Config file (default: <config dir>/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Server address (cairn://host:port, host:port or host)
    #[arg(long, global = true)]
    pub server: Option<String>,

    /// Log filter when RUST_LOG is unset
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: ClientCommand,
}

#[derive(Clone, Debug, Subcommand)]
pub enum ClientCommand {
    /// Handshake with the server and print its identity
    Ping,
    /// Back up one file
    Add {
        /// File to back up
        path: PathBuf,

        /// Owner id recorded with the file
        #[arg(long, default_value_t = 1)]
        owner: i64,

        /// Where the server fetches content from (default: file:// URL of
        /// PATH, which the daemon only reads with local sources enabled)
        #[arg(long)]
        source: Option<String>,
    },
}

pub fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_flags() {
        let opts = DaemonOpts::parse_from([
            "cairnd",
            "--bind",
            "127.0.0.1:9100",
            "--db",
            "/var/lib/cairn/db.sqlite3",
            "--allow-skipped-handshake",
        ]);
        assert_eq!(opts.bind.as_deref(), Some("127.0.0.1:9100"));
        assert_eq!(opts.db_path, Some(PathBuf::from("/var/lib/cairn/db.sqlite3")));
        assert!(opts.allow_skipped_handshake);
        assert!(!opts.allow_local_sources);
        assert!(opts.storage_dir.is_none());
        assert_eq!(opts.log_level, "info");
    }

    #[test]
    fn test_client_add_subcommand() {
        let args = ClientArgs::parse_from([
            "cairn",
            "add",
            "/home/u/notes.txt",
            "--owner",
            "7",
            "--server",
            "backup.lan:9001",
        ]);
        assert_eq!(args.server.as_deref(), Some("backup.lan:9001"));
        match args.command {
            ClientCommand::Add {
                path,
                owner,
                source,
            } => {
                assert_eq!(path, PathBuf::from("/home/u/notes.txt"));
                assert_eq!(owner, 7);
                assert!(source.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
