//! Address parsing: content source locations and cairn:// server addresses

use std::path::{Path, PathBuf};

use crate::protocol::DEFAULT_PORT;

/// Where ingested content is fetched from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocation {
    Http(String),
    File(PathBuf),
}

/// Classify a `sourceLocation` string.
/// Accepts http(s) URLs, `file://` URLs and bare absolute paths.
pub fn parse_source_location(location: &str) -> Option<SourceLocation> {
    let s = location.trim();
    let lower = s.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return Some(SourceLocation::Http(s.to_string()));
    }
    if lower.starts_with("file://") {
        let rest = &s["file://".len()..];
        // file://localhost/path is the same as file:///path
        let rest = rest.strip_prefix("localhost").unwrap_or(rest);
        if rest.is_empty() {
            return None;
        }
        return Some(SourceLocation::File(PathBuf::from(rest)));
    }
    let p = Path::new(s);
    if p.is_absolute() {
        return Some(SourceLocation::File(p.to_path_buf()));
    }
    None
}

/// `file://` URL for a local absolute path
pub fn file_url(path: &Path) -> String {
    let s = path.to_string_lossy().replace('\\', "/");
    if s.starts_with('/') {
        format!("file://{s}")
    } else {
        format!("file:///{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteServer {
    pub host: String,
    pub port: u16,
}

impl RemoteServer {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parse `cairn://host:port`, `host:port` or `host` (default port 9001)
pub fn parse_server_addr(s: &str) -> Option<RemoteServer> {
    let s_trim = s.trim();
    let lower = s_trim.to_ascii_lowercase();
    let rest = if lower.starts_with("cairn://") {
        &s_trim["cairn://".len()..]
    } else if lower.contains("://") {
        return None;
    } else {
        s_trim
    };
    let hp = rest.trim_end_matches('/');
    if hp.is_empty() {
        return None;
    }
    let (host, port) = match hp.rsplit_once(':') {
        Some((h, pr)) => (h.to_string(), pr.parse().ok()?),
        None => (hp.to_string(), DEFAULT_PORT),
    };
    if host.is_empty() {
        return None;
    }
    Some(RemoteServer { host, port })
}
