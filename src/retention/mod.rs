//! Snapshot retention: listing, classification and link-source selection.
//!
//! A snapshot is a directory under the backup root named by a UTC timestamp.
//! An uncommitted snapshot carries the `.inprogress` suffix until the
//! orchestrator renames it on commit. Because names are timestamp-prefixed,
//! lexicographic order equals chronological order.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Name of the symlink pointing at the most recent complete snapshot.
pub const LATEST_LINK_NAME: &str = "Latest";

/// Suffix marking a snapshot that was never committed.
pub const IN_PROGRESS_SUFFIX: &str = ".inprogress";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    Complete,
    InProgress,
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub path: PathBuf,
    pub name: String,
    pub kind: SnapshotKind,
}

/// Snapshots found under the backup root, each class sorted oldest-first.
#[derive(Debug, Default)]
pub struct SnapshotList {
    pub complete: Vec<Snapshot>,
    pub partial: Vec<Snapshot>,
}

/// View over the snapshots below one backup root. Holds no cached state:
/// the listing is rebuilt from the filesystem on every call.
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the `Latest` symlink.
    pub fn latest_link(&self) -> PathBuf {
        self.root.join(LATEST_LINK_NAME)
    }

    /// List immediate children of the root, classified and sorted.
    /// Symlinks (including `Latest` itself) are excluded.
    pub fn list(&self) -> io::Result<SnapshotList> {
        debug!("Listing backups under {}", self.root.display());
        let mut list = SnapshotList::default();

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_symlink() || !file_type.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let kind = if name.ends_with(IN_PROGRESS_SUFFIX) {
                SnapshotKind::InProgress
            } else {
                SnapshotKind::Complete
            };
            let snapshot = Snapshot {
                path: entry.path(),
                name,
                kind,
            };
            match kind {
                SnapshotKind::Complete => list.complete.push(snapshot),
                SnapshotKind::InProgress => list.partial.push(snapshot),
            }
        }

        list.complete.sort_by(|a, b| a.name.cmp(&b.name));
        list.partial.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    /// Pick the snapshot to hard-link the next transfer against.
    ///
    /// Prefers the `Latest` link target (read without modifying the link;
    /// relative targets resolve against the root), then the most recent
    /// complete snapshot. `None` means this is the first backup and a full
    /// copy will be made.
    pub fn choose_link_source(&self, list: &SnapshotList) -> Option<PathBuf> {
        let latest = self.latest_link();
        if fs::symlink_metadata(&latest).is_ok() {
            match fs::read_link(&latest) {
                Ok(target) => {
                    let resolved = if target.is_absolute() {
                        target
                    } else {
                        self.root.join(target)
                    };
                    return Some(resolved);
                }
                Err(e) => {
                    warn!("Failed to read {}: {}", latest.display(), e);
                }
            }
        }
        list.complete.last().map(|snapshot| snapshot.path.clone())
    }

    /// Deterministic destination paths for a new run.
    pub fn reserve_destination(&self, timestamp: &str) -> (PathBuf, PathBuf) {
        let final_path = self.root.join(timestamp);
        let mut in_progress = final_path.as_os_str().to_os_string();
        in_progress.push(IN_PROGRESS_SUFFIX);
        (final_path, PathBuf::from(in_progress))
    }

    /// Rename the newest cancelled partial onto `in_progress` so the next
    /// transfer resumes over the bytes already on disk. Returns the adopted
    /// partial's old path, or `None` when there is nothing to adopt (or the
    /// rename raced with something else; the run then starts fresh).
    pub fn adopt_partial(&self, list: &SnapshotList, in_progress: &Path) -> Option<PathBuf> {
        let newest = list.partial.last()?;
        if newest.path == in_progress {
            return None;
        }
        match fs::rename(&newest.path, in_progress) {
            Ok(()) => {
                debug!(
                    "Resuming partial backup {} as {}",
                    newest.path.display(),
                    in_progress.display()
                );
                Some(newest.path.clone())
            }
            Err(e) => {
                warn!(
                    "Failed to adopt partial {}: {}",
                    newest.path.display(),
                    e
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn store_with_dirs(dirs: &[&str]) -> (TempDir, SnapshotStore) {
        let tmp = TempDir::new().unwrap();
        for dir in dirs {
            fs::create_dir(tmp.path().join(dir)).unwrap();
        }
        let store = SnapshotStore::new(tmp.path().to_path_buf());
        (tmp, store)
    }

    #[test]
    fn test_list_classifies_and_sorts() {
        let (_tmp, store) = store_with_dirs(&[
            "2026-01-02-000000",
            "2026-01-01-000000",
            "2026-01-03-000000.inprogress",
        ]);

        let list = store.list().unwrap();
        let complete: Vec<_> = list.complete.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(complete, vec!["2026-01-01-000000", "2026-01-02-000000"]);
        assert_eq!(list.partial.len(), 1);
        assert_eq!(list.partial[0].kind, SnapshotKind::InProgress);
    }

    #[test]
    fn test_list_excludes_symlinks_and_files() {
        let (tmp, store) = store_with_dirs(&["2026-01-01-000000"]);
        symlink(
            tmp.path().join("2026-01-01-000000"),
            tmp.path().join(LATEST_LINK_NAME),
        )
        .unwrap();
        fs::write(tmp.path().join("notes.txt"), b"x").unwrap();

        let list = store.list().unwrap();
        assert_eq!(list.complete.len(), 1);
        assert!(list.partial.is_empty());
    }

    #[test]
    fn test_link_source_prefers_latest_link() {
        let (tmp, store) = store_with_dirs(&["2026-01-01-000000", "2026-01-02-000000"]);
        symlink(
            tmp.path().join("2026-01-01-000000"),
            tmp.path().join(LATEST_LINK_NAME),
        )
        .unwrap();

        let list = store.list().unwrap();
        let source = store.choose_link_source(&list).unwrap();
        assert_eq!(source, tmp.path().join("2026-01-01-000000"));
        // Resolution is read-only: the link must still be there.
        assert!(fs::symlink_metadata(store.latest_link()).is_ok());
    }

    #[test]
    fn test_link_source_resolves_relative_target() {
        let (tmp, store) = store_with_dirs(&["2026-01-01-000000"]);
        symlink("2026-01-01-000000", tmp.path().join(LATEST_LINK_NAME)).unwrap();

        let list = store.list().unwrap();
        let source = store.choose_link_source(&list).unwrap();
        assert_eq!(source, tmp.path().join("2026-01-01-000000"));
    }

    #[test]
    fn test_link_source_falls_back_to_newest_complete() {
        let (tmp, store) = store_with_dirs(&[
            "2026-01-01-000000",
            "2026-01-05-000000",
            "2026-01-06-000000.inprogress",
        ]);

        let list = store.list().unwrap();
        let source = store.choose_link_source(&list).unwrap();
        assert_eq!(source, tmp.path().join("2026-01-05-000000"));
    }

    #[test]
    fn test_link_source_none_on_first_backup() {
        let (_tmp, store) = store_with_dirs(&[]);
        let list = store.list().unwrap();
        assert!(store.choose_link_source(&list).is_none());
    }

    #[test]
    fn test_reserve_destination_paths() {
        let (tmp, store) = store_with_dirs(&[]);
        let (final_path, in_progress) = store.reserve_destination("2026-08-07-101530");
        assert_eq!(final_path, tmp.path().join("2026-08-07-101530"));
        assert_eq!(
            in_progress,
            tmp.path().join("2026-08-07-101530.inprogress")
        );
    }

    #[test]
    fn test_adopt_partial_renames_newest() {
        let (tmp, store) = store_with_dirs(&[
            "2026-01-01-000000.inprogress",
            "2026-01-02-000000.inprogress",
        ]);
        fs::write(
            tmp.path().join("2026-01-02-000000.inprogress/marker"),
            b"x",
        )
        .unwrap();

        let list = store.list().unwrap();
        let (_, in_progress) = store.reserve_destination("2026-08-07-101530");
        let adopted = store.adopt_partial(&list, &in_progress).unwrap();

        assert_eq!(adopted, tmp.path().join("2026-01-02-000000.inprogress"));
        assert!(!adopted.exists());
        assert!(in_progress.join("marker").exists());
        // The older partial is untouched; cleanup deals with it later.
        assert!(tmp.path().join("2026-01-01-000000.inprogress").exists());
    }

    #[test]
    fn test_adopt_partial_none_when_empty() {
        let (_tmp, store) = store_with_dirs(&["2026-01-01-000000"]);
        let list = store.list().unwrap();
        let (_, in_progress) = store.reserve_destination("2026-08-07-101530");
        assert!(store.adopt_partial(&list, &in_progress).is_none());
    }
}
