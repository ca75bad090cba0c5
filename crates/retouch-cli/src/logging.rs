//! Daily log files under `<data_dir>/logs` plus stderr output
//!
//! Files older than the retention period are removed at startup

use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const LOG_RETENTION_DAYS: u64 = 7;
const LOG_PREFIX: &str = "retouch";

pub struct LogManager {
    log_dir: PathBuf,
}

impl LogManager {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }

    /// `retouch.YYYY-MM-DD.log` for the local date.
    pub fn current_log_path(&self) -> PathBuf {
        let today = chrono::Local::now().format("%Y-%m-%d");
        self.log_dir.join(format!("{}.{}.log", LOG_PREFIX, today))
    }

    /// Newest first. A missing directory lists as empty.
    pub fn log_files(&self) -> Result<Vec<PathBuf>> {
        if !self.log_dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.log_dir)? {
            let path = entry?.path();
            if path.is_file() && is_log_file(&path) {
                files.push(path);
            }
        }
        files.sort();
        files.reverse();
        Ok(files)
    }

    /// Removes log files last modified more than `days` days ago.
    pub fn clean_older_than(&self, days: u64) -> Result<usize> {
        let cutoff = SystemTime::now() - Duration::from_secs(days * 24 * 60 * 60);
        let mut removed = 0;
        for path in self.log_files()? {
            let modified = fs::metadata(&path)?.modified()?;
            if modified >= cutoff {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => eprintln!("Failed to delete old log {}: {}", path.display(), e),
            }
        }
        if removed > 0 {
            tracing::info!(removed = removed, "Cleaned up old log files");
        }
        Ok(removed)
    }

    pub fn total_size(&self) -> Result<u64> {
        Ok(self
            .log_files()?
            .iter()
            .filter_map(|file| fs::metadata(file).ok())
            .map(|metadata| metadata.len())
            .sum())
    }

    pub fn format_size(bytes: u64) -> String {
        const KB: u64 = 1024;
        const MB: u64 = KB * 1024;
        const GB: u64 = MB * 1024;
        if bytes >= GB {
            format!("{:.2} GB", bytes as f64 / GB as f64)
        } else if bytes >= MB {
            format!("{:.2} MB", bytes as f64 / MB as f64)
        } else if bytes >= KB {
            format!("{:.2} KB", bytes as f64 / KB as f64)
        } else {
            format!("{} B", bytes)
        }
    }
}

fn is_log_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|name| name.starts_with(LOG_PREFIX) && name.ends_with(".log"))
        .unwrap_or(false)
}

/// `RUST_LOG` wins over the configured level; bad values fall back to info.
fn level_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    })
}

/// Keeps the background file writer alive; drop it last.
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

pub fn init_logging(log_dir: &Path, log_level: &str) -> Result<LoggingGuard> {
    fs::create_dir_all(log_dir)?;
    let manager = LogManager::new(log_dir.to_path_buf());
    manager.clean_older_than(LOG_RETENTION_DAYS)?;

    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(manager.current_log_path())?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true)
        .with_filter(level_filter(log_level));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(level_filter(log_level));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()?;

    Ok(LoggingGuard { _guard: guard })
}

#[cfg(test)]
mod tests {
    use super::LogManager;
    use std::fs;
    use std::time::{Duration, SystemTime};

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(LogManager::format_size(512), "512 B");
        assert_eq!(LogManager::format_size(2048), "2.00 KB");
        assert_eq!(LogManager::format_size(5 * 1024 * 1024), "5.00 MB");
    }

    #[test]
    fn only_prefixed_logs_are_listed() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("retouch.2026-01-01.log"), "a").expect("write");
        fs::write(dir.path().join("retouch.2026-01-02.log"), "bb").expect("write");
        fs::write(dir.path().join("other.log"), "ccc").expect("write");
        fs::write(dir.path().join("retouch.txt"), "dddd").expect("write");

        let manager = LogManager::new(dir.path().to_path_buf());
        let names: Vec<String> = manager
            .log_files()
            .expect("list")
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .collect();
        assert_eq!(names, vec!["retouch.2026-01-02.log", "retouch.2026-01-01.log"]);
        assert_eq!(manager.total_size().expect("size"), 3);
    }

    #[test]
    fn clean_removes_only_stale_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stale = dir.path().join("retouch.2020-01-01.log");
        let fresh = dir.path().join("retouch.2026-10-16.log");
        fs::write(&stale, "old").expect("write");
        fs::write(&fresh, "new").expect("write");
        let old_time = SystemTime::now() - Duration::from_secs(30 * 24 * 60 * 60);
        fs::File::options()
            .write(true)
            .open(&stale)
            .expect("open")
            .set_modified(old_time)
            .expect("set mtime");

        let manager = LogManager::new(dir.path().to_path_buf());
        assert_eq!(manager.clean_older_than(7).expect("clean"), 1);
        assert!(!stale.exists());
        assert!(fresh.exists());
    }

    #[test]
    fn missing_directory_lists_nothing() {
        let manager = LogManager::new("/nonexistent/retouch-logs".into());
        assert!(manager.log_files().expect("list").is_empty());
        assert_eq!(
            manager.current_log_path().parent(),
            Some(std::path::Path::new("/nonexistent/retouch-logs"))
        );
    }
}
