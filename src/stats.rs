use std::sync::atomic::{AtomicU64, Ordering};

/// process-wide counters, shared by every mount
///
/// counters are monotone and read via snapshots; export to an external
/// telemetry pipeline is deliberately left to the daemon shell.
#[derive(Debug, Default)]
pub struct Stats {
    pub object_store: ObjectStoreStats,
    pub inodes: InodeStats,
    pub glob: GlobStats,
}

#[derive(Debug, Default)]
pub struct ObjectStoreStats {
    /// blob metadata served from the in-memory lru
    pub metadata_memory_hits: AtomicU64,
    /// objects served from the local key-value store
    pub local_hits: AtomicU64,
    /// fetches that had to go to the backing store
    pub backing_fetches: AtomicU64,
    /// callers that joined an already in-flight fetch
    pub coalesced_fetches: AtomicU64,
}

#[derive(Debug, Default)]
pub struct InodeStats {
    pub lookups: AtomicU64,
    pub inodes_created: AtomicU64,
    pub materializations: AtomicU64,
}

#[derive(Debug, Default)]
pub struct GlobStats {
    pub evaluations: AtomicU64,
}

/// plain-value view of the counters at one point in time
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub metadata_memory_hits: u64,
    pub local_hits: u64,
    pub backing_fetches: u64,
    pub coalesced_fetches: u64,
    pub lookups: u64,
    pub inodes_created: u64,
    pub materializations: u64,
    pub glob_evaluations: u64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Stats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            metadata_memory_hits: self.object_store.metadata_memory_hits.load(Ordering::Relaxed),
            local_hits: self.object_store.local_hits.load(Ordering::Relaxed),
            backing_fetches: self.object_store.backing_fetches.load(Ordering::Relaxed),
            coalesced_fetches: self.object_store.coalesced_fetches.load(Ordering::Relaxed),
            lookups: self.inodes.lookups.load(Ordering::Relaxed),
            inodes_created: self.inodes.inodes_created.load(Ordering::Relaxed),
            materializations: self.inodes.materializations.load(Ordering::Relaxed),
            glob_evaluations: self.glob.evaluations.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_bumps() {
        let stats = Stats::default();
        bump(&stats.object_store.local_hits);
        bump(&stats.object_store.local_hits);
        bump(&stats.inodes.materializations);

        let snap = stats.snapshot();
        assert_eq!(snap.local_hits, 2);
        assert_eq!(snap.materializations, 1);
        assert_eq!(snap.backing_fetches, 0);
    }
}
