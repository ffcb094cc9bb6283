//! Logging configuration using tracing.
//!
//! Console output is always enabled; an optional log file target is rotated
//! by size at open time (`file` -> `file.1` -> `file.2` ...) with a bounded
//! number of retained files, so a long-lived cron installation cannot fill
//! the disk it is supposed to protect.

use std::fs::{self, OpenOptions};
use std::io::BufWriter;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging with the specified level and optional rotated file target.
pub fn init(level: &str, file: Option<&Path>, max_bytes: u64, max_files: usize) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    match file {
        Some(path) => {
            rotate(path, max_bytes, max_files)?;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            // Buffered so a slow disk never stalls the transfer read loop.
            let writer = Mutex::new(BufWriter::new(file));
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
        }
        None => registry.init(),
    }

    Ok(())
}

/// Shift `path` -> `path.1` -> `path.2` ... when `path` has grown past
/// `max_bytes`, dropping the oldest so at most `max_files` files remain.
pub fn rotate(path: &Path, max_bytes: u64, max_files: usize) -> std::io::Result<()> {
    let len = match fs::metadata(path) {
        Ok(md) => md.len(),
        Err(_) => return Ok(()),
    };
    if len < max_bytes || max_files == 0 {
        return Ok(());
    }

    let numbered = |n: usize| {
        let mut os = path.as_os_str().to_os_string();
        os.push(format!(".{}", n));
        std::path::PathBuf::from(os)
    };

    let _ = fs::remove_file(numbered(max_files - 1));
    for n in (1..max_files.saturating_sub(1)).rev() {
        let _ = fs::rename(numbered(n), numbered(n + 1));
    }
    if max_files > 1 {
        fs::rename(path, numbered(1))?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(())
}
