//! diskvault - Main entry point
//!
//! Runs or cancels a backup onto the enrolled removable disk. Intended to be
//! invoked directly or from a cron job.

use anyhow::Result;
use clap::{Parser, Subcommand};
use diskvault::daemon::signal::spawn_signal_listener;
use diskvault::mount::LsblkResolver;
use diskvault::orchestrator::BackupOrchestrator;
use diskvault::{utils, Config};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "/etc/diskvault.toml";

const EXIT_FAILURE: i32 = 1;
/// The run went through, but eviction could not bring usage under the quota.
const EXIT_QUOTA_INSUFFICIENT: i32 = 10;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a backup now
    Run {
        /// Source tree to back up (overrides config)
        #[arg(long)]
        source: Option<PathBuf>,
    },
    /// Cancel a running backup
    Cancel,
    /// Enroll the disk mounted at PATH as the backup destination
    Enroll {
        /// Mount point of the backup disk
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args
        .config
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let mut config = Config::load_or_default(&config_path)?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(
        log_level,
        config.log.file.as_deref(),
        config.log.max_bytes,
        config.log.max_files,
    )?;

    tracing::info!("diskvault v{}", env!("CARGO_PKG_VERSION"));

    let code = match args.command {
        Command::Run { source } => {
            if let Some(source) = source {
                config.backup.source = source;
            }
            run_backup(config).await
        }
        Command::Cancel => cancel_running(&config),
        Command::Enroll { path } => enroll_disk(&mut config, &path),
    };
    std::process::exit(code);
}

/// Drive one backup run, returning the process exit code.
async fn run_backup(config: Config) -> i32 {
    let mut orchestrator = BackupOrchestrator::new(config, Box::new(LsblkResolver));

    // Signals cancel the run cooperatively: rsync is terminated and the
    // partial snapshot is kept for resume.
    let signal_task = spawn_signal_listener(orchestrator.cancel_token());

    // Observer task: polls the shared progress fields the way a UI would.
    let progress = orchestrator.progress();
    let poller = tokio::spawn(async move {
        let mut last_reported = -1i64;
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let percent = progress.percent() as i64;
            if percent != last_reported && !progress.status().is_empty() {
                tracing::info!("Progress: {}%", percent);
                last_reported = percent;
            }
        }
    });

    let report = orchestrator.run().await;
    poller.abort();
    orchestrator.cancel_token().cancel();
    let _ = signal_task.await;

    tracing::info!("Backup finished: {:?}", report.outcome);
    if report.quota_insufficient {
        EXIT_QUOTA_INSUFFICIENT
    } else if report.success() {
        0
    } else {
        EXIT_FAILURE
    }
}

/// Record the disk's filesystem UUID and reserve 90% of its capacity as the
/// backup quota.
fn enroll_disk(config: &mut Config, path: &std::path::Path) -> i32 {
    use diskvault::mount::MountResolver;

    let Some(uuid) = LsblkResolver.resolve_id(path) else {
        tracing::error!("No filesystem UUID found for {}", path.display());
        return EXIT_FAILURE;
    };

    match nix::sys::statvfs::statvfs(path) {
        Ok(stat) => {
            let total = stat.blocks() as u64 * stat.fragment_size() as u64;
            config.disk.quota_bytes = total / 10 * 9;
        }
        Err(e) => {
            tracing::warn!("Could not size {}; leaving quota unchanged: {}", path.display(), e);
        }
    }
    config.disk.uuid = Some(uuid.clone());

    if let Err(e) = config.save() {
        tracing::error!("Failed to save configuration: {}", e);
        return EXIT_FAILURE;
    }
    tracing::info!(
        "Enrolled backup disk {} (quota {} bytes)",
        uuid,
        config.disk.quota_bytes
    );
    0
}

/// Signal the instance that holds the lock file.
fn cancel_running(config: &Config) -> i32 {
    let lock_file = &config.daemon.lock_file;
    let pid = std::fs::read_to_string(lock_file)
        .ok()
        .and_then(|content| content.trim().parse::<i32>().ok());

    match pid {
        Some(pid) => match signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => {
                tracing::info!("Sent cancel signal to running backup (pid {})", pid);
                0
            }
            Err(e) => {
                tracing::error!("Failed to signal pid {}: {}", pid, e);
                EXIT_FAILURE
            }
        },
        None => {
            tracing::warn!(
                "No running backup found (lock file {} missing or unreadable)",
                lock_file.display()
            );
            EXIT_FAILURE
        }
    }
}
