//! The backup run state machine.
//!
//! One run moves through lock acquisition, planning, size estimation, quota
//! eviction, transfer, commit or rollback, and cleanup. Every terminal path
//! releases the lock and leaves the `Latest` link resolvable whenever a
//! prior successful snapshot is known. Cancellation can arrive from any
//! thread at any point; it always routes the run to rollback, preserving
//! the in-progress directory so the next run can resume over it.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{NaiveDateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, QuotaPolicy};
use crate::mount::MountResolver;
use crate::quota::{self, EvictOutcome};
use crate::retention::SnapshotStore;
use crate::transfer::driver::{exit_code_meaning, RsyncDriver, TransferPlan};
use crate::transfer::progress::{format_bytes, ProgressHandle};
use crate::utils::errors::Result;

/// How long the final status/100% stays readable before being cleared, so a
/// polling observer catches it.
pub const SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Terminal state of one backup run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// A new snapshot was committed.
    Completed,
    /// Estimate was zero: nothing changed, no snapshot created.
    NoChanges,
    /// Another instance holds the lock; nothing was touched.
    AlreadyRunning,
    /// No backup disk UUID configured.
    NotConfigured,
    /// The backup disk is not currently mounted.
    DiskNotMounted,
    /// Cancelled by operator or signal; partial kept for resume.
    Cancelled,
    /// rsync failed; partial kept for resume. `-1` when the subprocess
    /// could not even be spawned.
    TransferFailed { exit_code: i32 },
    /// Transfer succeeded but the snapshot rename did not.
    CommitFailed,
    /// Quota still exceeded after eviction and the policy is abort.
    QuotaAborted,
    /// Unexpected filesystem error before the transfer started.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Eviction could not bring usage under the quota. Can be set alongside
    /// `Completed` (policy `proceed`) or `QuotaAborted` (policy `abort`).
    pub quota_insufficient: bool,
}

impl RunReport {
    fn of(outcome: RunOutcome) -> Self {
        Self {
            outcome,
            quota_insufficient: false,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self.outcome, RunOutcome::Completed | RunOutcome::NoChanges)
    }
}

/// Existence-based lock file. Creation is atomic (`create_new`), and the
/// Drop impl removes the file so the lock is released on every exit path.
struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    /// `Ok(None)` means another instance already holds the lock.
    fn acquire(path: &Path) -> std::io::Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                // The content is informational only: it lets `cancel` find
                // the running instance. Existence is the actual gate.
                let _ = write!(file, "{}", std::process::id());
                Ok(Some(Self {
                    path: path.to_path_buf(),
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        debug!("Removing lock file {}", self.path.display());
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to remove lock file {}: {}", self.path.display(), e);
        }
    }
}

/// Sequences one backup run end to end. Owns the persisted config/quota
/// state; collaborators (mount discovery, the transfer tool) are injected.
pub struct BackupOrchestrator {
    config: Config,
    resolver: Box<dyn MountResolver>,
    cancel: CancellationToken,
    progress: ProgressHandle,
    settle_delay: Duration,
}

impl BackupOrchestrator {
    pub fn new(config: Config, resolver: Box<dyn MountResolver>) -> Self {
        Self {
            config,
            resolver,
            cancel: CancellationToken::new(),
            progress: ProgressHandle::new(),
            settle_delay: SETTLE_DELAY,
        }
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Observer handle; safe to poll from any thread.
    pub fn progress(&self) -> ProgressHandle {
        self.progress.clone()
    }

    /// Token shared with the driver and eviction loop. Signal adapters and
    /// embedders cancel through this.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request cancellation of a running backup.
    pub fn cancel(&self) {
        self.progress.set_status("Canceling backup");
        self.cancel.cancel();
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Execute one backup run. Never panics or propagates an error; every
    /// failure mode is folded into the report.
    pub async fn run(&mut self) -> RunReport {
        match self.run_inner().await {
            Ok(report) => report,
            Err(e) => {
                error!("Backup run failed: {}", e);
                self.progress.reset();
                RunReport::of(RunOutcome::Failed)
            }
        }
    }

    async fn run_inner(&mut self) -> Result<RunReport> {
        // Idle -> LockAcquired
        let _lock = match LockGuard::acquire(&self.config.daemon.lock_file)? {
            Some(guard) => guard,
            None => {
                info!(
                    "Backup already running (lock file {} exists)",
                    self.config.daemon.lock_file.display()
                );
                return Ok(RunReport::of(RunOutcome::AlreadyRunning));
            }
        };

        // LockAcquired -> Planning preconditions
        let Some(uuid) = self.config.disk.uuid.clone() else {
            error!("Backup disk not set!");
            return Ok(RunReport::of(RunOutcome::NotConfigured));
        };
        let Some(mount) = self.resolver.resolve_mount(&uuid) else {
            info!("Backup disk not mounted!");
            self.note_missed_backup();
            return Ok(RunReport::of(RunOutcome::DiskNotMounted));
        };

        // Planning
        let backup_root = mount.join(&self.config.backup.dir);
        fs::create_dir_all(&backup_root)?;
        let store = SnapshotStore::new(backup_root);
        let list = store.list()?;

        let stamp = Utc::now()
            .format(&self.config.backup.date_format)
            .to_string();
        let (dest_final, dest_partial) = store.reserve_destination(&stamp);
        let adopted = store.adopt_partial(&list, &dest_partial);
        let link_source = store.choose_link_source(&list);

        // The backup disk itself is always excluded, then system patterns,
        // then whatever the user configured.
        let mut excludes = vec![mount.to_string_lossy().to_string()];
        excludes.extend(self.config.backup.system_exclude.iter().cloned());
        excludes.extend(self.config.backup.exclude.iter().cloned());

        let plan = TransferPlan {
            source: self.config.backup.source.clone(),
            dest_final: dest_final.clone(),
            dest_partial: dest_partial.clone(),
            link_source: link_source.clone(),
            excludes,
            delete_stale: adopted.is_some(),
        };
        let driver = RsyncDriver::new(
            self.config.transfer.rsync_path.clone(),
            self.cancel.clone(),
            self.progress.clone(),
        );

        // Planning -> Estimating
        self.progress.set_status("Calculating backup size");
        let estimated = match driver.estimate(&plan).await {
            Ok(Some(size)) => size,
            Ok(None) => {
                info!("Backup cancelled during size estimate");
                self.clean_up(&store, Some(dest_partial.as_path()), link_source.as_deref());
                return Ok(self.finish(RunReport::of(RunOutcome::Cancelled)).await);
            }
            Err(e) => {
                error!("Size estimate failed: {}", e);
                self.clean_up(&store, Some(dest_partial.as_path()), link_source.as_deref());
                return Ok(self
                    .finish(RunReport::of(RunOutcome::TransferFailed { exit_code: -1 }))
                    .await);
            }
        };
        debug!("Estimated transfer size: {} bytes", estimated);

        if estimated == 0 {
            // Nothing changed since the last snapshot; a valid short-circuit.
            info!("No changes since last backup");
            self.clean_up(&store, Some(dest_partial.as_path()), link_source.as_deref());
            return Ok(self.finish(RunReport::of(RunOutcome::NoChanges)).await);
        }

        // Estimating -> Evicting
        self.progress.set_status("Deleting old backups");
        let candidates = quota::eviction_candidates(&list, link_source.as_deref());
        let evicted = quota::evict(candidates, estimated, &mut self.config, &self.cancel).await;
        let quota_insufficient = evicted == EvictOutcome::QuotaInsufficient;
        match evicted {
            EvictOutcome::Cancelled => {
                info!("Backup cancelled while deleting old backups");
                self.clean_up(&store, Some(dest_partial.as_path()), link_source.as_deref());
                return Ok(self.finish(RunReport::of(RunOutcome::Cancelled)).await);
            }
            EvictOutcome::QuotaInsufficient
                if self.config.backup.quota_policy == QuotaPolicy::Abort =>
            {
                error!("Backups exceed quota and policy is abort; skipping transfer");
                self.clean_up(&store, Some(dest_partial.as_path()), link_source.as_deref());
                return Ok(self
                    .finish(RunReport {
                        outcome: RunOutcome::QuotaAborted,
                        quota_insufficient: true,
                    })
                    .await);
            }
            EvictOutcome::QuotaInsufficient => {
                warn!("Backups exceed quota; backing up anyway");
            }
            EvictOutcome::Fits => {}
        }

        // Evicting -> Transferring
        self.progress
            .set_status(&format!("Backing up {}", format_bytes(estimated)));
        let exit_code = match driver.execute(&plan, estimated).await {
            Ok(code) => code,
            Err(e) => {
                error!("Transfer failed to start: {}", e);
                self.clean_up(&store, Some(dest_partial.as_path()), link_source.as_deref());
                return Ok(self
                    .finish(RunReport {
                        outcome: RunOutcome::TransferFailed { exit_code: -1 },
                        quota_insufficient,
                    })
                    .await);
            }
        };
        let cancelled = self.cancel.is_cancelled();

        // Transferring -> {Committing, RollingBack}. The subprocess has been
        // fully reaped by execute() before we get here.
        let report = if exit_code == 0 && !cancelled {
            match self.commit(estimated, &stamp, &dest_partial, &dest_final, &store) {
                Ok(()) => {
                    self.clean_up(&store, None, Some(dest_final.as_path()));
                    RunReport {
                        outcome: RunOutcome::Completed,
                        quota_insufficient,
                    }
                }
                Err(e) => {
                    error!("Failed to commit snapshot: {}", e);
                    self.clean_up(&store, Some(dest_partial.as_path()), link_source.as_deref());
                    RunReport {
                        outcome: RunOutcome::CommitFailed,
                        quota_insufficient,
                    }
                }
            }
        } else if cancelled {
            info!(
                "Backup cancelled; keeping {} for resume",
                dest_partial.display()
            );
            self.clean_up(&store, Some(dest_partial.as_path()), link_source.as_deref());
            RunReport {
                outcome: RunOutcome::Cancelled,
                quota_insufficient,
            }
        } else {
            error!(
                "rsync exited with code {} ({}); keeping {} for resume",
                exit_code,
                exit_code_meaning(exit_code),
                dest_partial.display()
            );
            self.clean_up(&store, Some(dest_partial.as_path()), link_source.as_deref());
            RunReport {
                outcome: RunOutcome::TransferFailed { exit_code },
                quota_insufficient,
            }
        };

        Ok(self.finish(report).await)
    }

    /// Rename the in-progress directory to its final name, repoint `Latest`
    /// and persist the updated quota state.
    fn commit(
        &mut self,
        estimated: u64,
        stamp: &str,
        partial: &Path,
        final_path: &Path,
        store: &SnapshotStore,
    ) -> Result<()> {
        fs::rename(partial, final_path)?;

        let latest = store.latest_link();
        if fs::symlink_metadata(&latest).is_ok() {
            if let Err(e) = fs::remove_file(&latest) {
                warn!("Failed to remove {}: {}", latest.display(), e);
            }
        }
        if let Err(e) = std::os::unix::fs::symlink(final_path, &latest) {
            // Cleanup will re-create the link from the committed snapshot.
            warn!("Failed to update {}: {}", latest.display(), e);
        }

        self.config.state.backup_size = self.config.state.backup_size.saturating_add(estimated);
        self.config.state.last_backup = stamp.to_string();
        self.config.state.days_since_last_backup = 0;
        if let Err(e) = self.config.save() {
            error!("Failed to persist backup state: {}", e);
        }

        info!("Backup committed as {}", final_path.display());
        Ok(())
    }

    /// Remove stale partial directories (except `keep`) and restore the
    /// `Latest` link if it went missing and a valid target is known.
    fn clean_up(&self, store: &SnapshotStore, keep: Option<&Path>, latest_target: Option<&Path>) {
        self.progress.set_status("Cleaning up");

        match store.list() {
            Ok(list) => {
                for partial in list.partial {
                    if Some(partial.path.as_path()) == keep {
                        continue;
                    }
                    info!("Removing stale partial {}", partial.path.display());
                    if let Err(e) = fs::remove_dir_all(&partial.path) {
                        warn!("Failed to remove {}: {}", partial.path.display(), e);
                    }
                }
            }
            Err(e) => warn!("Failed to list snapshots during cleanup: {}", e),
        }

        let latest = store.latest_link();
        if fs::symlink_metadata(&latest).is_err() {
            if let Some(target) = latest_target {
                info!("Restoring {} -> {}", latest.display(), target.display());
                if let Err(e) = std::os::unix::fs::symlink(target, &latest) {
                    warn!("Failed to restore {}: {}", latest.display(), e);
                }
            }
        }
    }

    /// Let observers read the final status, then clear it.
    async fn finish(&self, report: RunReport) -> RunReport {
        self.progress.set_status("Finished");
        tokio::time::sleep(self.settle_delay).await;
        self.progress.reset();
        report
    }

    /// Track how stale the backups are while the disk stays unplugged.
    fn note_missed_backup(&mut self) {
        if self.config.state.last_backup.is_empty() {
            return;
        }
        match NaiveDateTime::parse_from_str(
            &self.config.state.last_backup,
            &self.config.backup.date_format,
        ) {
            Ok(last) => {
                let days = (Utc::now().naive_utc() - last).num_days();
                info!("Days since last backup: {}", days);
                self.config.state.days_since_last_backup = days;
                if let Err(e) = self.config.save() {
                    warn!("Failed to persist backup state: {}", e);
                }
            }
            Err(e) => warn!(
                "Unparseable last backup timestamp {:?}: {}",
                self.config.state.last_backup, e
            ),
        }
    }
}
