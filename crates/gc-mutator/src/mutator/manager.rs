//! Registry of live mutators and the collector-side broadcast operations.
//!
//! # Lock Ordering
//!
//! 1. `stw` serialises stop-the-world requests.
//! 2. `mutators` protects the registry. A [`StopTheWorldGuard`] holds it for
//!    the whole window, so no thread can register mid-pause.
//! 3. `park` pairs with the `resumed` condvar. Parked mutators hold only
//!    this one, and only while checking their flags.
//!
//! Locks are always taken in that order.
//!
//! The registry holds weak references. A mutator stays alive through its
//! owner (usually a [`ThreadHolder`](crate::ThreadHolder)); dropping the
//! last strong reference retires its SATB node and the dead entry is
//! pruned at the next registration change.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::ptr;
use std::sync::{Arc, Weak};

use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex, MutexGuard};

use super::{CpuProfileState, GcPhase, GcPhaseTransitionState, Mutator, SuspensionType};

/// Every mutator of one runtime, plus the collector's current phase.
pub struct MutatorManager {
    stw: Mutex<()>,
    mutators: Mutex<Vec<Weak<Mutator>>>,
    park: Mutex<()>,
    resumed: Condvar,
    gc_phase: AtomicU8,
}

impl MutatorManager {
    pub(crate) fn new() -> Self {
        Self {
            stw: Mutex::new(()),
            mutators: Mutex::new(Vec::new()),
            park: Mutex::new(()),
            resumed: Condvar::new(),
            gc_phase: AtomicU8::new(GcPhase::Idle as u8),
        }
    }

    pub(crate) fn gc_phase(&self) -> GcPhase {
        GcPhase::from_u8(self.gc_phase.load(Ordering::Acquire))
    }

    pub(crate) fn set_gc_phase(&self, phase: GcPhase) {
        self.gc_phase.store(phase as u8, Ordering::Release);
    }

    pub(crate) fn register(&self, mutator: &Arc<Mutator>) {
        let mut mutators = self.mutators.lock();
        mutators.retain(|m| m.strong_count() > 0);
        mutators.push(Arc::downgrade(mutator));
    }

    /// Remove `mutator` from the registry.
    ///
    /// Returns `false` if it was not registered.
    pub fn unregister(&self, mutator: &Mutator) -> bool {
        let mut mutators = self.mutators.lock();
        let before = mutators.len();
        mutators.retain(|m| !ptr::eq(m.as_ptr(), mutator));
        let removed = before != mutators.len();
        mutators.retain(|m| m.strong_count() > 0);
        removed
    }

    /// Number of live registered mutators.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mutators
            .lock()
            .iter()
            .filter(|m| m.strong_count() > 0)
            .count()
    }

    /// Returns `true` if no live mutator is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call `visit` on every live registered mutator while holding the
    /// registry.
    ///
    /// `visit` must not register or unregister mutators.
    pub fn visit_all_mutators(&self, mut visit: impl FnMut(&Arc<Mutator>)) {
        for mutator in live(&self.mutators.lock()) {
            visit(&mutator);
        }
    }

    /// Block the calling mutator while any flag in `mask` is raised.
    pub(crate) fn park_while(&self, mutator: &Mutator, mask: SuspensionType) {
        let mut guard = self.park.lock();
        while mutator.has_suspension_request(mask) {
            self.resumed.wait(&mut guard);
        }
    }

    /// Lower `flag` on every mutator and wake the parked ones.
    pub fn resume_all(&self, flag: SuspensionType) {
        for mutator in live(&self.mutators.lock()) {
            mutator.clear_suspension_flag(flag);
        }
        self.wake_parked();
    }

    fn wake_parked(&self) {
        let _guard = self.park.lock();
        self.resumed.notify_all();
    }

    /// Stop every mutator except the caller's own.
    ///
    /// Returns once each of them is in a saferegion. Mutators that leave
    /// the saferegion while the guard is alive park before touching the
    /// heap. Dropping the guard resumes them.
    pub fn stop_the_world(&self) -> StopTheWorldGuard<'_> {
        let stw = self.stw.lock();
        let registry = self.mutators.lock();
        let mutators = live(&registry);
        #[cfg(feature = "tracing")]
        let span = crate::log::internal::trace_stop_the_world(mutators.len());

        let targets = || mutators.iter().filter(|m| !m.is_owned_by_current_thread());
        for mutator in targets() {
            mutator.set_suspension_flag(SuspensionType::STW);
            mutator.set_safepoint_active(true);
        }
        for mutator in targets() {
            let backoff = Backoff::new();
            while !mutator.in_saferegion() {
                backoff.snooze();
            }
        }

        StopTheWorldGuard {
            manager: self,
            mutators,
            _registry: registry,
            _stw: stw,
            #[cfg(feature = "tracing")]
            _span: span,
        }
    }

    /// Publish `phase` and make every mutator apply it.
    ///
    /// Mutators in a saferegion get the phase applied on their behalf.
    /// Running mutators apply it at their next poll; their safepoint word
    /// is raised until they have. The caller's own mutator, if any, is
    /// transitioned directly. Returns once every mutator has finished.
    pub fn transition_all_mutators(&self, phase: GcPhase) {
        let registry = self.mutators.lock();
        let mutators = live(&registry);
        self.set_gc_phase(phase);
        let raised = raise_handshake(&mutators, SuspensionType::GC_PHASE);
        for (mutator, raised) in mutators.iter().zip(raised) {
            let by_self = mutator.is_owned_by_current_thread();
            let backoff = Backoff::new();
            while mutator.transition_state() != GcPhaseTransitionState::FinishTransition {
                if by_self || mutator.in_saferegion() {
                    mutator.transition_gc_phase(by_self);
                }
                backoff.snooze();
            }
            if raised {
                mutator.set_safepoint_active(false);
            }
        }
    }

    /// Ask every mutator for one CPU profile sample and wait for all of them.
    ///
    /// Running mutators get their safepoint word raised until they have
    /// answered.
    pub fn request_cpu_profile_all(&self) {
        let registry = self.mutators.lock();
        let mutators = live(&registry);
        let raised = raise_handshake(&mutators, SuspensionType::CPU_PROFILE);
        for (mutator, raised) in mutators.iter().zip(raised) {
            let by_self = mutator.is_owned_by_current_thread();
            let backoff = Backoff::new();
            while mutator.cpu_profile_state() != CpuProfileState::FinishCpuProfile {
                if by_self || mutator.in_saferegion() {
                    mutator.transition_to_cpu_profile(by_self);
                }
                backoff.snooze();
            }
            if raised {
                mutator.set_safepoint_active(false);
            }
        }
    }

    /// Ask every other mutator to wind down.
    ///
    /// Each one flushes its SATB node at its next poll and parks until
    /// [`resume_all`](Self::resume_all) lowers `EXIT`.
    pub fn request_exit_all(&self) {
        for mutator in live(&self.mutators.lock()) {
            if !mutator.is_owned_by_current_thread() {
                mutator.set_suspension_flag(SuspensionType::EXIT);
            }
        }
    }
}

/// Strong references to the registered mutators that are still alive.
fn live(registry: &[Weak<Mutator>]) -> Vec<Arc<Mutator>> {
    registry.iter().filter_map(Weak::upgrade).collect()
}

/// Raise `flag` on every mutator, and the safepoint word on every other
/// thread's running mutator. Returns which words were raised.
fn raise_handshake(mutators: &[Arc<Mutator>], flag: SuspensionType) -> Vec<bool> {
    mutators
        .iter()
        .map(|mutator| {
            mutator.set_suspension_flag(flag);
            let raise = !mutator.is_owned_by_current_thread() && !mutator.in_saferegion();
            if raise {
                mutator.set_safepoint_active(true);
            }
            raise
        })
        .collect()
}

impl fmt::Debug for MutatorManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutatorManager")
            .field("mutators", &self.len())
            .field("gc_phase", &self.gc_phase())
            .finish_non_exhaustive()
    }
}

/// An active stop-the-world window.
///
/// While alive, no mutator other than the caller's touches the heap and
/// the registry is frozen.
#[must_use = "the world resumes as soon as the guard is dropped"]
pub struct StopTheWorldGuard<'a> {
    manager: &'a MutatorManager,
    mutators: Vec<Arc<Mutator>>,
    _registry: MutexGuard<'a, Vec<Weak<Mutator>>>,
    _stw: MutexGuard<'a, ()>,
    #[cfg(feature = "tracing")]
    _span: tracing::span::EnteredSpan,
}

impl StopTheWorldGuard<'_> {
    /// The stopped mutators (and the caller's own, if registered).
    #[must_use]
    pub fn mutators(&self) -> &[Arc<Mutator>] {
        &self.mutators
    }
}

impl Drop for StopTheWorldGuard<'_> {
    fn drop(&mut self) {
        for mutator in self.mutators.iter() {
            mutator.set_safepoint_active(false);
            mutator.clear_suspension_flag(SuspensionType::STW);
        }
        self.manager.wake_parked();
    }
}

impl fmt::Debug for StopTheWorldGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopTheWorldGuard")
            .field("mutators", &self.mutators.len())
            .finish_non_exhaustive()
    }
}
