//! Logging initialization using tracing.
//!
//! Two layers: a console layer on stderr filtered by `--log-level` (or
//! `RUST_LOG`), and the run log, which records everything at debug level
//! without colour so `sprout status` and `sprout monitor` can parse it.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

pub const DEFAULT_LOG_FILE: &str = "sprout.log";

/// Install the global subscriber; `log_file` is appended to when given.
pub fn init_logging(level: &str, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter);

    let file = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open run log: {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(true)
                    .with_writer(Mutex::new(file))
                    .with_filter(LevelFilter::DEBUG),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .context("Failed to install logger")?;

    Ok(())
}

/// Name an existing log is moved to by `--fresh`
pub fn archive_name(path: &Path, stamp: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map_or_else(|| "sprout".into(), |s| s.to_string_lossy().into_owned());
    let name = match path.extension() {
        Some(ext) => format!("{stem}-{stamp}.{}", ext.to_string_lossy()),
        None => format!("{stem}-{stamp}"),
    };
    path.with_file_name(name)
}

/// Move an existing run log aside so the next run starts a new file.
///
/// Returns the archive path, or `None` when there was nothing to move.
pub fn archive_log(path: &Path) -> Result<Option<PathBuf>> {
    if !path.exists() {
        return Ok(None);
    }
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S").to_string();
    let archive = archive_name(path, &stamp);
    std::fs::rename(path, &archive).with_context(|| {
        format!(
            "Failed to archive {} to {}",
            path.display(),
            archive.display()
        )
    })?;
    Ok(Some(archive))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_name_keeps_extension() {
        assert_eq!(
            archive_name(Path::new("/var/log/sprout.log"), "20260101-120000"),
            PathBuf::from("/var/log/sprout-20260101-120000.log")
        );
        assert_eq!(
            archive_name(Path::new("runlog"), "20260101-120000"),
            PathBuf::from("runlog-20260101-120000")
        );
    }

    #[test]
    fn test_archive_log_moves_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sprout.log");
        assert!(archive_log(&path).unwrap().is_none());

        std::fs::write(&path, "previous run\n").unwrap();
        let archive = archive_log(&path).unwrap().unwrap();
        assert!(!path.exists());
        assert_eq!(std::fs::read_to_string(archive).unwrap(), "previous run\n");
    }
}
