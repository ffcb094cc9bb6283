//! Quota eviction: delete oldest complete snapshots until the projected
//! transfer fits the configured ceiling.
//!
//! The accounted size is persisted after every deletion, so a crash in the
//! middle of eviction never loses the bookkeeping for snapshots that are
//! already gone.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::fs::accountant::remove_tree_accounted;
use crate::retention::{Snapshot, SnapshotList};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictOutcome {
    /// Projected usage fits the quota (possibly after deletions).
    Fits,
    /// Candidates ran out with the quota still exceeded. Reportable; whether
    /// the run proceeds is the orchestrator's policy decision.
    QuotaInsufficient,
    Cancelled,
}

/// Complete snapshots eligible for eviction, oldest first. The chosen link
/// source is removed up front: evicting the directory the transfer is about
/// to hard-link against would destroy the basis of the incremental copy.
pub fn eviction_candidates(list: &SnapshotList, link_source: Option<&std::path::Path>) -> Vec<Snapshot> {
    list.complete
        .iter()
        .filter(|snapshot| link_source != Some(snapshot.path.as_path()))
        .cloned()
        .collect()
}

/// Evict oldest-first until `backup_size + estimated <= quota`, updating and
/// persisting the accounted size after each deletion.
pub async fn evict(
    mut candidates: Vec<Snapshot>,
    estimated: u64,
    config: &mut Config,
    cancel: &CancellationToken,
) -> EvictOutcome {
    while config.state.backup_size.saturating_add(estimated) > config.disk.quota_bytes {
        if cancel.is_cancelled() {
            return EvictOutcome::Cancelled;
        }
        if candidates.is_empty() {
            warn!(
                "Quota insufficient: {} accounted + {} projected exceeds {} with no snapshots left to evict",
                config.state.backup_size, estimated, config.disk.quota_bytes
            );
            return EvictOutcome::QuotaInsufficient;
        }

        let victim = candidates.remove(0);
        info!("Deleting old backup {}", victim.path.display());

        let path = victim.path.clone();
        let walk_cancel = cancel.clone();
        let freed = tokio::task::spawn_blocking(move || remove_tree_accounted(&path, &walk_cancel))
            .await
            .unwrap_or_else(|e| {
                warn!("Deletion task failed for {}: {}", victim.path.display(), e);
                0
            });

        config.state.backup_size = config.state.backup_size.saturating_sub(freed);
        if let Err(e) = config.save() {
            warn!("Failed to persist quota state: {}", e);
        }
        info!(
            "Freed {} bytes, accounted size now {}",
            freed, config.state.backup_size
        );
    }

    EvictOutcome::Fits
}
