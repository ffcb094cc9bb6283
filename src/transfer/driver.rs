//! rsync subprocess driver.
//!
//! The transfer tool is invoked twice per run: once with `-n` (dry run) to
//! obtain the byte estimate from the `--stats` summary, once for real with
//! `--progress`. Combined stdout/stderr is the only channel consumed; the
//! process exit code is the only success signal.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::parser::{parse_progress_line, parse_total_transferred, LineAccumulator};
use super::progress::ProgressHandle;
use crate::utils::errors::{EngineError, Result};

/// Everything one run needs to drive the transfer tool.
#[derive(Debug, Clone)]
pub struct TransferPlan {
    /// Source tree; trailing-slash semantics are rsync's.
    pub source: PathBuf,
    /// Committed snapshot path (rename target).
    pub dest_final: PathBuf,
    /// In-progress directory the transfer writes into.
    pub dest_partial: PathBuf,
    /// Prior snapshot for `--link-dest`; `None` on the first backup.
    pub link_source: Option<PathBuf>,
    /// System plus user exclude patterns, mount point included.
    pub excludes: Vec<String>,
    /// Set when resuming an adopted partial: entries deleted at the source
    /// since the cancelled run must not linger in the destination.
    pub delete_stale: bool,
}

/// Coarse classification of rsync exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    Success,
    /// Expected-in-the-field codes (interrupted, partial, vanished files).
    /// Still not committable: only exit 0 commits.
    RecoverablePartial,
    Fatal,
}

pub fn classify_exit(code: i32) -> ExitClass {
    match code {
        0 => ExitClass::Success,
        20 | 23 | 24 | 30 => ExitClass::RecoverablePartial,
        _ => ExitClass::Fatal,
    }
}

pub fn exit_code_meaning(code: i32) -> &'static str {
    match code {
        0 => "success",
        1 => "syntax or usage error",
        2 => "protocol incompatibility",
        11 => "error in file I/O",
        20 => "interrupted by signal",
        23 => "partial transfer due to error",
        24 => "partial transfer due to vanished source files",
        30 => "timeout in data send/receive",
        _ => "unknown error",
    }
}

/// Drives rsync and turns its output stream into a byte-progress signal.
pub struct RsyncDriver {
    rsync_path: PathBuf,
    cancel: CancellationToken,
    progress: ProgressHandle,
}

impl RsyncDriver {
    pub fn new(rsync_path: PathBuf, cancel: CancellationToken, progress: ProgressHandle) -> Self {
        Self {
            rsync_path,
            cancel,
            progress,
        }
    }

    /// `rsync -a --stats` plus excludes and the hard-link source.
    fn base_args(&self, plan: &TransferPlan) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-a".into(), "--stats".into()];
        for pattern in &plan.excludes {
            args.push(format!("--exclude={}", pattern).into());
        }
        if let Some(link) = &plan.link_source {
            let mut arg = OsString::from("--link-dest=");
            arg.push(link);
            args.push(arg);
        }
        args
    }

    /// Dry-run the transfer and return the projected byte count, or `None`
    /// when the read was cancelled.
    pub async fn estimate(&self, plan: &TransferPlan) -> Result<Option<u64>> {
        let mut args = self.base_args(plan);
        args.push("-n".into());
        args.push(plan.source.clone().into());
        args.push(plan.dest_partial.clone().into());

        let mut child = self.spawn(&args)?;
        let mut estimated = None;
        let cancelled = self
            .read_combined(&mut child, |line| {
                if let Some(size) = parse_total_transferred(line) {
                    estimated = Some(size);
                } else {
                    debug!("{}", line);
                }
            })
            .await;
        let status = self.reap(child, cancelled).await?;

        if cancelled {
            return Ok(None);
        }
        match estimated {
            Some(size) => Ok(Some(size)),
            None => Err(EngineError::Transfer(format!(
                "dry run produced no transfer size (exit code {})",
                status
            ))),
        }
    }

    /// Run the real transfer, publishing progress as files complete.
    /// Returns the subprocess exit code verbatim.
    pub async fn execute(&self, plan: &TransferPlan, total_bytes: u64) -> Result<i32> {
        let mut args = self.base_args(plan);
        args.push("--progress".into());
        if plan.delete_stale {
            args.push("--delete".into());
        }
        args.push(plan.source.clone().into());
        args.push(plan.dest_partial.clone().into());

        let mut child = self.spawn(&args)?;
        let mut transferred = 0u64;
        let progress = self.progress.clone();
        let cancelled = self
            .read_combined(&mut child, |line| {
                match parse_progress_line(line) {
                    Some(update) => {
                        // Count a file only once it finishes; its in-flight
                        // updates would otherwise be added repeatedly.
                        if update.finished {
                            transferred += update.bytes;
                            if total_bytes > 0 {
                                progress
                                    .set_percent(100.0 * transferred as f64 / total_bytes as f64);
                            }
                        }
                    }
                    // No size pattern: per-file activity, logged verbatim.
                    None => info!("{}", line),
                }
            })
            .await;
        let status = self.reap(child, cancelled).await?;

        if !cancelled {
            self.progress.set_percent(100.0);
        }
        Ok(status)
    }

    fn spawn(&self, args: &[OsString]) -> Result<Child> {
        debug!("Spawning {} {:?}", self.rsync_path.display(), args);
        Command::new(&self.rsync_path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                EngineError::Transfer(format!(
                    "failed to spawn {}: {}",
                    self.rsync_path.display(),
                    e
                ))
            })
    }

    /// Read the child's stdout and stderr incrementally, feeding completed
    /// lines to `on_line`. Returns true when the read loop was interrupted
    /// by cancellation. Observes the cancellation token at every read.
    async fn read_combined<F: FnMut(&str)>(&self, child: &mut Child, mut on_line: F) -> bool {
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let mut out_acc = LineAccumulator::new();
        let mut err_acc = LineAccumulator::new();
        let mut out_buf = [0u8; 8192];
        let mut err_buf = [0u8; 8192];
        let mut out_done = stdout.is_none();
        let mut err_done = stderr.is_none();

        let cancelled = loop {
            if out_done && err_done {
                break false;
            }
            tokio::select! {
                read = async {
                    match stdout.as_mut() {
                        Some(stream) => stream.read(&mut out_buf).await,
                        None => Ok(0),
                    }
                }, if !out_done => {
                    match read {
                        Ok(0) => out_done = true,
                        Ok(n) => {
                            for line in out_acc.push(&String::from_utf8_lossy(&out_buf[..n])) {
                                on_line(&line);
                            }
                        }
                        Err(e) => {
                            warn!("Error reading transfer output: {}", e);
                            out_done = true;
                        }
                    }
                }
                read = async {
                    match stderr.as_mut() {
                        Some(stream) => stream.read(&mut err_buf).await,
                        None => Ok(0),
                    }
                }, if !err_done => {
                    match read {
                        Ok(0) => err_done = true,
                        Ok(n) => {
                            for line in err_acc.push(&String::from_utf8_lossy(&err_buf[..n])) {
                                on_line(&line);
                            }
                        }
                        Err(e) => {
                            warn!("Error reading transfer output: {}", e);
                            err_done = true;
                        }
                    }
                }
                _ = self.cancel.cancelled() => break true,
            }
        };

        if let Some(rest) = out_acc.take_remainder() {
            on_line(&rest);
        }
        if let Some(rest) = err_acc.take_remainder() {
            on_line(&rest);
        }
        cancelled
    }

    /// Terminate the child if the run was cancelled, then always reap it.
    /// Returns the exit code (signal deaths map to rsync's code 20).
    async fn reap(&self, mut child: Child, cancelled: bool) -> Result<i32> {
        if cancelled {
            if let Some(pid) = child.id() {
                debug!("Terminating transfer subprocess (pid {})", pid);
                if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    warn!("Failed to signal transfer subprocess: {}", e);
                }
            }
        }
        let status = child.wait().await?;
        Ok(status.code().unwrap_or(20))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    fn write_stub(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("rsync-stub.sh");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn plan(dir: &Path) -> TransferPlan {
        TransferPlan {
            source: PathBuf::from("/src"),
            dest_final: dir.join("dest"),
            dest_partial: dir.join("dest.inprogress"),
            link_source: None,
            excludes: vec![],
            delete_stale: false,
        }
    }

    fn driver(stub: PathBuf, cancel: CancellationToken) -> (RsyncDriver, ProgressHandle) {
        let progress = ProgressHandle::new();
        (
            RsyncDriver::new(stub, cancel, progress.clone()),
            progress,
        )
    }

    #[tokio::test]
    async fn test_estimate_parses_stats_summary() {
        let tmp = TempDir::new().unwrap();
        let stub = write_stub(
            tmp.path(),
            "echo 'Number of files: 9'\necho 'Total transferred file size: 4,665 bytes'\nexit 0",
        );
        let (driver, _) = driver(stub, CancellationToken::new());

        let estimated = driver.estimate(&plan(tmp.path())).await.unwrap();
        assert_eq!(estimated, Some(4665));
    }

    #[tokio::test]
    async fn test_estimate_without_stats_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let stub = write_stub(tmp.path(), "echo 'rsync: some failure' >&2\nexit 1");
        let (driver, _) = driver(stub, CancellationToken::new());

        assert!(driver.estimate(&plan(tmp.path())).await.is_err());
    }

    #[tokio::test]
    async fn test_estimate_cancelled_returns_none() {
        let tmp = TempDir::new().unwrap();
        let stub = write_stub(tmp.path(), "sleep 30");
        let cancel = CancellationToken::new();
        let (driver, _) = driver(stub, cancel.clone());

        let canceller = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.cancel();
            }
        });
        let estimated = driver.estimate(&plan(tmp.path())).await.unwrap();
        canceller.await.unwrap();
        assert_eq!(estimated, None);
    }

    #[tokio::test]
    async fn test_execute_accumulates_finished_files_only() {
        let tmp = TempDir::new().unwrap();
        // Two files of 500 bytes each; the in-flight 250-byte updates must
        // not be counted toward the total.
        let stub = write_stub(
            tmp.path(),
            concat!(
                "printf 'some/file.txt\\n'\n",
                "printf '        250  50%%   10.5kB/s    0:00:01\\r'\n",
                "printf '        500 100%%   10.5kB/s    0:00:02 (xfr#1, to-chk=1/2)\\n'\n",
                "printf 'other/file.txt\\n'\n",
                "printf '        500 100%%   10.5kB/s    0:00:02 (xfr#2, to-chk=0/2)\\n'\n",
                "exit 0",
            ),
        );
        let (driver, progress) = driver(stub, CancellationToken::new());

        let code = driver.execute(&plan(tmp.path()), 1000).await.unwrap();
        assert_eq!(code, 0);
        assert_eq!(progress.percent(), 100.0);
    }

    #[tokio::test]
    async fn test_execute_returns_exit_code_verbatim() {
        let tmp = TempDir::new().unwrap();
        let stub = write_stub(tmp.path(), "echo 'rsync: partial' >&2\nexit 23");
        let (driver, _) = driver(stub, CancellationToken::new());

        let code = driver.execute(&plan(tmp.path()), 100).await.unwrap();
        assert_eq!(code, 23);
        assert_eq!(classify_exit(code), ExitClass::RecoverablePartial);
    }

    #[tokio::test]
    async fn test_execute_cancel_terminates_and_reaps() {
        let tmp = TempDir::new().unwrap();
        let stub = write_stub(tmp.path(), "sleep 30");
        let cancel = CancellationToken::new();
        let (driver, progress) = driver(stub, cancel.clone());

        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.cancel();
            }
        });
        let code = driver.execute(&plan(tmp.path()), 100).await.unwrap();
        // Killed by SIGTERM: no progress forced to 100, signal exit code.
        assert_ne!(code, 0);
        assert!(progress.percent() < 100.0);
    }

    #[test]
    fn test_classify_exit_table() {
        assert_eq!(classify_exit(0), ExitClass::Success);
        for code in [20, 23, 24, 30] {
            assert_eq!(classify_exit(code), ExitClass::RecoverablePartial);
        }
        for code in [1, 2, 11, 12, 127] {
            assert_eq!(classify_exit(code), ExitClass::Fatal);
        }
    }

    #[test]
    fn test_base_args_include_excludes_and_link_dest() {
        let tmp = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let (driver, _) = driver(PathBuf::from("rsync"), cancel);
        let mut plan = plan(tmp.path());
        plan.excludes = vec!["/proc/*".to_string(), "/media/disk".to_string()];
        plan.link_source = Some(PathBuf::from("/media/disk/Backups/2026-01-01-000000"));

        let args = driver.base_args(&plan);
        assert_eq!(args[0], OsString::from("-a"));
        assert_eq!(args[1], OsString::from("--stats"));
        assert!(args.contains(&OsString::from("--exclude=/proc/*")));
        assert!(args.contains(&OsString::from(
            "--link-dest=/media/disk/Backups/2026-01-01-000000"
        )));
    }
}
