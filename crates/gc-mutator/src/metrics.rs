//! Counters for SATB traffic and string table behaviour.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Snapshot of SATB buffer activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SatbMetrics {
    /// Objects logged by write barriers.
    pub objects_remembered: usize,
    /// Non-empty nodes handed to the retired pool.
    pub nodes_retired: usize,
    /// Nodes freshly allocated because the free pool was empty.
    pub nodes_allocated: usize,
    /// Objects handed to the marker by drains.
    pub objects_drained: usize,
}

/// Snapshot of string table activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StringTableMetrics {
    /// Lookups that found a canonical string.
    pub hits: usize,
    /// Lookups that found nothing.
    pub misses: usize,
    /// Strings created and published by the table.
    pub created: usize,
    /// Entries removed by weak sweeps.
    pub swept: usize,
}

#[derive(Debug, Default)]
pub(crate) struct SatbCounters {
    objects_remembered: AtomicUsize,
    nodes_retired: AtomicUsize,
    nodes_allocated: AtomicUsize,
    objects_drained: AtomicUsize,
}

impl SatbCounters {
    pub(crate) fn record_remembered(&self) {
        self.objects_remembered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retired(&self) {
        self.nodes_retired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_allocated(&self) {
        self.nodes_allocated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_drained(&self, objects: usize) {
        self.objects_drained.fetch_add(objects, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> SatbMetrics {
        SatbMetrics {
            objects_remembered: self.objects_remembered.load(Ordering::Relaxed),
            nodes_retired: self.nodes_retired.load(Ordering::Relaxed),
            nodes_allocated: self.nodes_allocated.load(Ordering::Relaxed),
            objects_drained: self.objects_drained.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct StringTableCounters {
    hits: AtomicUsize,
    misses: AtomicUsize,
    created: AtomicUsize,
    swept: AtomicUsize,
}

impl StringTableCounters {
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_swept(&self, entries: usize) {
        self.swept.fetch_add(entries, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StringTableMetrics {
        StringTableMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            swept: self.swept.load(Ordering::Relaxed),
        }
    }
}
