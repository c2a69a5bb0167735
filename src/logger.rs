use anyhow::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Audit trail of ingestion outcomes, separate from diagnostic tracing
pub trait IngestLogger: Send + Sync {
    fn tracked(&self, _owner_id: i64, _client_path: &str, _server_path: &Path, _bytes: u64) {}
    fn rejected(&self, _owner_id: i64, _client_path: &str, _reason: &str) {}
    fn rolled_back(&self, _owner_id: i64, _client_path: &str, _step: &str) {}
}

pub struct NoopLogger;
impl IngestLogger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl IngestLogger for TextLogger {
    fn tracked(&self, owner_id: i64, client_path: &str, server_path: &Path, bytes: u64) {
        self.line(&format!(
            "TRACKED owner={owner_id} path={client_path} stored={} bytes={bytes}",
            server_path.display()
        ));
    }
    fn rejected(&self, owner_id: i64, client_path: &str, reason: &str) {
        self.line(&format!(
            "REJECTED owner={owner_id} path={client_path} reason={reason}"
        ));
    }
    fn rolled_back(&self, owner_id: i64, client_path: &str, step: &str) {
        self.line(&format!(
            "ROLLBACK owner={owner_id} path={client_path} step={step}"
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_logger_appends_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("audit.log");
        let logger = TextLogger::new(&path).unwrap();
        logger.tracked(1, "/a/b", Path::new("/srv/x"), 12);
        logger.rejected(1, "/a/b", "already tracked");
        logger.rolled_back(2, "/c", "stored insert");

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("TRACKED owner=1 path=/a/b stored=/srv/x bytes=12"));
        assert!(lines[1].contains("REJECTED owner=1"));
        assert!(lines[2].contains("ROLLBACK owner=2 path=/c step=stored insert"));
    }

    #[test]
    fn test_noop_logger_is_silent() {
        let logger: &dyn IngestLogger = &NoopLogger;
        logger.tracked(1, "/a", Path::new("/b"), 0);
    }
}
