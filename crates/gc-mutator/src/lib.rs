//! Mutator-side coordination for a concurrent garbage collector.
//!
//! `gc-mutator` is the part of a managed runtime that application threads
//! run through while a concurrent collector works beside them:
//!
//! - **Saferegions**: a [`Mutator`] announces when it stops and resumes
//!   touching the heap, so the collector knows whose stack it may scan.
//! - **Suspension handshakes**: the collector raises flags on mutators
//!   (GC phase change, stop-the-world, exit, CPU profile); each mutator
//!   answers them at its next safepoint poll.
//! - **SATB buffers**: write barriers log overwritten references into a
//!   private per-mutator node that is retired to a global pool for the
//!   marker to drain.
//! - **String interning**: a lock-free [`HashTrieMap`] under a
//!   [`BaseStringTable`] that deduplicates strings across threads and is
//!   swept weakly by the collector.
//!
//! There are no process-wide singletons. Everything hangs off one
//! [`RuntimeContext`] that the embedder builds and passes down.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//!
//! use gc_mutator::{BaseStringTable, GcPhase, RuntimeConfig, RuntimeContext, ThreadHolder};
//!
//! let context = RuntimeContext::new(RuntimeConfig::default());
//! let holder = ThreadHolder::register(&context);
//! let mutator = holder.mutator();
//!
//! // Start running managed code.
//! mutator.leave_saferegion();
//!
//! let table = BaseStringTable::new(Arc::clone(&context));
//! let a = table.get_or_intern_string_utf8(mutator, b"hello", true);
//! let b = table.get_or_intern_string_utf8(mutator, b"hello", true);
//! assert_eq!(a, b);
//!
//! // The collector moves every mutator to a new phase.
//! context.mutators().transition_all_mutators(GcPhase::Marking);
//! assert_eq!(mutator.gc_phase(), GcPhase::Marking);
//!
//! mutator.enter_saferegion(true);
//! ThreadHolder::unregister();
//! ```
//!
//! # Fatal Errors
//!
//! Broken runtime invariants (a second party starting a phase transition,
//! exhausted hash bits in the trie, an exhausted string heap) are reported
//! and then panic. The workspace builds release binaries with
//! `panic = "abort"`.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod context;
mod log;
mod metrics;
mod satb;
mod thread_holder;

/// Narrow heap interface: object references, allocation and heap range.
pub mod heap;
pub mod mutator;
pub mod string;

// Re-export public API
pub use context::{
    CpuProfileHook, PhaseTransitionHook, RuntimeConfig, RuntimeContext, RuntimeContextBuilder,
    DEFAULT_HEAP_SIZE, DEFAULT_SWEEP_WORKERS,
};
pub use heap::{Allocator, HeapRange, ObjectKind, ObjectRef, RegionAllocator};
pub use metrics::{SatbMetrics, StringTableMetrics};
pub use mutator::unwind::{StackBounds, UnwindContext};
pub use mutator::{
    CpuProfileState, GcPhase, GcPhaseTransitionState, Mutator, MutatorManager, MutatorObserver,
    SaferegionState, ScopedEnterSaferegion, ScopedLeaveSaferegion, StopTheWorldGuard,
    SuspensionType,
};
pub use satb::{
    MarkingPhasePolicy, NodeId, SatbBuffer, SatbNode, SatbPolicy, DEFAULT_SATB_NODE_CAPACITY,
};
pub use string::{
    BaseStringTable, BaseStringTableCleaner, HandleCreator, HashTrieMap, StringRef, SweepReport,
};
pub use thread_holder::{CoroutineId, ThreadHolder};
