//! TOML configuration shared by `cairn` and `cairnd`
//!
//! A missing file is created with defaults on first use, so a fresh install
//! has something to edit.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::checksum::HashAlgorithm;
use crate::protocol::DEFAULT_PORT;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub client: ClientConfig,
    pub server: ServerConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub key: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: "localhost".into(),
            port: DEFAULT_PORT,
            username: "testuser".into(),
            key: "secretkeydontsteal".into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Identity asserted back to clients after a handshake
    pub username: String,
    pub secretkey: String,
    pub db_path: PathBuf,
    pub download_path: PathBuf,
    pub allow_skipped_handshake: bool,
    /// Accept `file://` and bare-path sources (same-host clients). Off by
    /// default: any authenticated client could read whatever the daemon can.
    pub allow_local_sources: bool,
    pub hash: HashAlgorithm,
    pub audit_log: Option<PathBuf>,
    /// Client accounts, seeded into the users table at startup
    pub users: BTreeMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: format!("0.0.0.0:{DEFAULT_PORT}"),
            username: "serveruser".into(),
            secretkey: "otherkey".into(),
            db_path: PathBuf::from("./db.sqlite3"),
            download_path: PathBuf::from("./downloads"),
            allow_skipped_handshake: false,
            allow_local_sources: false,
            hash: HashAlgorithm::default(),
            audit_log: None,
            users: BTreeMap::new(),
        }
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("Cairn");
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("cairn");
    }
    PathBuf::from(".cairn")
}

pub fn default_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Read `path` (or the default location). A missing file is written with
/// defaults and those defaults are returned.
pub fn load_or_init(path: Option<&Path>) -> Result<Config> {
    let p = path.map(Path::to_path_buf).unwrap_or_else(default_path);
    match std::fs::read_to_string(&p) {
        Ok(data) => toml::from_str(&data).with_context(|| format!("parse {}", p.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let config = Config::default();
            save(&config, &p)?;
            Ok(config)
        }
        Err(e) => Err(e).with_context(|| format!("read {}", p.display())),
    }
}

pub fn save(config: &Config, p: &Path) -> Result<()> {
    let dir = p
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    let data = toml::to_string(config)?;
    // atomic write
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    use std::io::Write as _;
    tmp.write_all(data.as_bytes())?;
    tmp.flush()?;
    #[cfg(unix)]
    {
        // Holds secrets
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600));
    }
    tmp.persist(p)?;
    Ok(())
}
