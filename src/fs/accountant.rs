//! Size-accounted tree deletion.
//!
//! Snapshots share unchanged file content through hard links, so a naive
//! `du`-style total double-counts almost everything. Only files with a link
//! count of exactly one represent reclaimable space: deleting one name of a
//! multiply-linked file removes the name but frees nothing. The deletion
//! walk therefore credits single-link files only, while still removing every
//! entry it visits.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use tokio_util::sync::CancellationToken;
use tracing::warn;
use walkdir::WalkDir;

/// Delete the tree at `path` bottom-up, returning the number of bytes
/// actually freed under the hard-link discount rule.
///
/// Observes `cancel` between file operations: when cancellation is seen the
/// walk stops immediately and the partial freed total is returned, leaving
/// the rest of the tree in place. Individual failures (entries vanishing
/// mid-walk, permission problems) are logged and skipped; they never abort
/// the walk.
pub fn remove_tree_accounted(path: &Path, cancel: &CancellationToken) -> u64 {
    let mut freed = 0u64;

    // contents_first yields every entry after its children, with `path`
    // itself last, so directories are empty by the time we reach them.
    for entry in WalkDir::new(path).contents_first(true) {
        if cancel.is_cancelled() {
            return freed;
        }

        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry under {}: {}", path.display(), e);
                continue;
            }
        };

        if entry.file_type().is_dir() {
            if let Err(e) = fs::remove_dir(entry.path()) {
                // Not a plain empty directory after all; try as a file.
                if let Err(e2) = fs::remove_file(entry.path()) {
                    warn!(
                        "Failed to remove {}: {} / {}",
                        entry.path().display(),
                        e,
                        e2
                    );
                }
            }
        } else {
            match entry.metadata() {
                Ok(md) => {
                    // Symlinks are removed but never credited; their lstat
                    // size is the target string, not reclaimable data.
                    if md.is_file() && md.nlink() == 1 {
                        freed += md.len();
                    }
                }
                Err(e) => {
                    warn!("Failed to stat {}: {}", entry.path().display(), e);
                }
            }
            if let Err(e) = fs::remove_file(entry.path()) {
                warn!("Failed to remove {}: {}", entry.path().display(), e);
            }
        }
    }

    freed
}
