//! Weak sweep of the string table.
//!
//! The collector hands in a [`WeakRootVisitor`] that knows which strings
//! survived and where they live now. Dead entries are unlinked; moved
//! strings are updated in place.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::thread;

use super::base_string::{BaseString, NoReadBarrier, ReadBarrier, StringRef};
use super::hash_trie_map::{SweepCounts, N_CHILDREN};
use super::table::{BaseStringTable, HandleCreator};

/// Liveness oracle for weakly held strings.
///
/// Returns `None` if `string` died, or its current address if it survived.
pub trait WeakRootVisitor: Sync {
    /// Visit one weakly held string.
    fn visit(&self, string: StringRef) -> Option<StringRef>;
}

impl<F> WeakRootVisitor for F
where
    F: Fn(StringRef) -> Option<StringRef> + Sync,
{
    fn visit(&self, string: StringRef) -> Option<StringRef> {
        self(string)
    }
}

/// What a sweep did to the table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries removed because their string died.
    pub swept: usize,
    /// Entries whose string survived.
    pub kept: usize,
}

/// Adapts a root visitor to the trie's field visitor.
fn visit_field(visitor: &impl WeakRootVisitor, field: &AtomicPtr<BaseString>) -> bool {
    let Some(ptr) = NonNull::new(field.load(Ordering::Acquire)) else {
        return false;
    };
    // SAFETY: The table only stores string objects; the collector keeps
    // them addressable until this sweep has decided their fate.
    let string = unsafe { StringRef::from_raw(ptr) };
    match visitor.visit(string) {
        Some(forwarded) => {
            if forwarded != string {
                field.store(forwarded.as_ptr(), Ordering::Release);
            }
            true
        }
        None => false,
    }
}

/// Runs weak sweeps over one table.
#[derive(Debug)]
pub struct BaseStringTableCleaner<'a, H, B = NoReadBarrier> {
    table: &'a BaseStringTable<H, B>,
}

impl<'a, H: HandleCreator, B: ReadBarrier> BaseStringTableCleaner<'a, H, B> {
    /// Sweep `table`.
    #[must_use]
    pub const fn new(table: &'a BaseStringTable<H, B>) -> Self {
        Self { table }
    }

    /// Sweep on the calling thread.
    pub fn sweep_weak_ref(&self, visitor: &impl WeakRootVisitor) -> SweepReport {
        let counts = self
            .table
            .map()
            .sweep_weak(&|field: &AtomicPtr<BaseString>| visit_field(visitor, field));
        self.finish(counts)
    }

    /// Sweep with the configured number of workers.
    ///
    /// The root's child slots are dealt round-robin to the workers; the
    /// calling thread is one of them. Returns after every worker finished.
    pub fn post_sweep_weak_ref_task(&self, visitor: &impl WeakRootVisitor) -> SweepReport {
        let workers = self
            .table
            .context()
            .config()
            .sweep_workers
            .clamp(1, N_CHILDREN);
        #[cfg(feature = "tracing")]
        let _span = crate::log::internal::trace_string_table_sweep(workers);

        let map = self.table.map();
        let guard = map.lock();
        let field_visitor = |field: &AtomicPtr<BaseString>| visit_field(visitor, field);
        let sweep_share = |worker: usize| {
            let mut counts = SweepCounts::default();
            for index in (worker..N_CHILDREN).step_by(workers) {
                // SAFETY: Each index belongs to exactly one worker.
                counts += unsafe { map.clear_node_from_gc(&guard, index, &field_visitor) };
            }
            counts
        };

        let counts = thread::scope(|scope| {
            let handles: Vec<_> = (1..workers)
                .map(|worker| scope.spawn(move || sweep_share(worker)))
                .collect();
            let mut counts = sweep_share(0);
            for handle in handles {
                match handle.join() {
                    Ok(share) => counts += share,
                    Err(payload) => std::panic::resume_unwind(payload),
                }
            }
            counts
        });
        drop(guard);
        map.reclaim_deferred();
        self.finish(counts)
    }

    fn finish(&self, counts: SweepCounts) -> SweepReport {
        self.table.counters().record_swept(counts.swept);
        #[cfg(feature = "tracing")]
        crate::log::internal::log_sweep_result(counts.swept, counts.kept, counts.deferred);
        SweepReport {
            swept: counts.swept,
            kept: counts.kept,
        }
    }
}
