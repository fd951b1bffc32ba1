//! Structured logging for mutator coordination.
//!
//! When the `tracing` feature is enabled, this module provides spans and
//! events for phase transitions, stop-the-world windows, SATB traffic and
//! string table sweeps. Without the feature the helpers do not exist and
//! call sites are compiled out.

#[cfg(feature = "tracing")]
pub mod internal {
    use tracing::{span, Level};

    use crate::mutator::GcPhase;

    /// Create a span covering a stop-the-world window.
    pub fn trace_stop_the_world(mutators: usize) -> span::EnteredSpan {
        span!(Level::DEBUG, "stop_the_world", mutators = mutators).entered()
    }

    /// Create a span for a weak sweep over the string table.
    pub fn trace_string_table_sweep(workers: usize) -> span::EnteredSpan {
        span!(Level::DEBUG, "string_table_sweep", workers = workers).entered()
    }

    /// Log one mutator moving to a new GC phase.
    pub fn log_phase_transition(mutator: u64, from: GcPhase, to: GcPhase, by_self: bool) {
        tracing::debug!(
            mutator,
            from = ?from,
            to = ?to,
            by_self,
            "gc_phase_transition"
        );
    }

    /// Log a CPU profile sample taken on behalf of a mutator.
    pub fn log_cpu_profile(mutator: u64, by_self: bool) {
        tracing::trace!(mutator, by_self, "cpu_profile");
    }

    /// Log a SATB node handed to the retired pool.
    pub fn log_satb_retire(mutator: u64, objects: usize) {
        tracing::trace!(mutator, objects, "satb_retire");
    }

    /// Log a drain of the retired SATB pool.
    pub fn log_satb_drain(nodes: usize, objects: usize) {
        tracing::debug!(nodes, objects, "satb_drain");
    }

    /// Log the result of a weak sweep.
    pub fn log_sweep_result(swept: usize, kept: usize, deferred: usize) {
        tracing::debug!(swept, kept, deferred, "string_table_sweep_done");
    }

    /// Log a broken runtime invariant right before the process goes down.
    pub fn log_fatal(message: &str) {
        tracing::error!(reason = message, "fatal_error");
    }
}

/// Report a broken runtime invariant and stop.
///
/// The message goes to stderr (and to `tracing` when enabled) before the
/// panic. Release builds abort on panic, so nothing unwinds through a heap
/// whose invariants no longer hold.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        #[cfg(feature = "tracing")]
        $crate::log::internal::log_fatal(&message);
        eprintln!("[gc-mutator] FATAL: {message}");
        panic!("{}", message)
    }};
}

pub(crate) use fatal;
