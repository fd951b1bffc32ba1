//! Per-thread mutator state and the collector handshake protocol.
//!
//! A [`Mutator`] is the control block of one OS thread that touches the
//! managed heap. It composes three pieces:
//!
//! - the **saferegion state**: whether the thread currently holds
//!   unscanned heap references,
//! - the **suspension flags**: requests from the collector (phase change,
//!   stop-the-world, exit, CPU profile), answered at safepoint polls,
//! - the **SATB node**: the thread's private write-barrier log.
//!
//! # Ordering
//!
//! The saferegion state and the suspension flags are read and written with
//! sequentially consistent operations. A mutator leaving a saferegion stores
//! its state and then loads its flags; the collector sets a flag and then
//! loads the state. Under `SeqCst` at least one side observes the other, so
//! the collector never treats a thread as safe while it is touching the
//! heap with a pending request it has not seen.
//!
//! # Transitions
//!
//! Phase changes and CPU profile samples use a three-step handshake
//! (`Need -> In -> Finish`). Whoever wins the `Need -> In` exchange applies
//! the change exactly once; the other party waits with a spin-then-yield
//! backoff until `Finish` is published.

mod manager;
mod state;
pub mod unwind;

use std::cell::{Cell, UnsafeCell};
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use crossbeam::utils::Backoff;

pub use manager::{MutatorManager, StopTheWorldGuard};
pub use state::{CpuProfileState, GcPhase, GcPhaseTransitionState, SaferegionState, SuspensionType};
use unwind::{StackBounds, UnwindContext, UnwindSlot};

use crate::context::RuntimeContext;
use crate::heap::ObjectRef;
use crate::log::fatal;
use crate::satb::SatbNode;

static NEXT_MUTATOR_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Its address identifies the current OS thread cheaply.
    static THREAD_TOKEN: Cell<u8> = const { Cell::new(0) };
}

fn current_thread_token() -> usize {
    THREAD_TOKEN.with(|token| ptr::from_ref(token) as usize)
}

/// Control block of one thread bound to the managed heap.
pub struct Mutator {
    id: u64,
    context: Arc<RuntimeContext>,
    thread_id: ThreadId,
    owner_token: usize,
    stack_bounds: StackBounds,
    saferegion_state: AtomicU32,
    suspension_flag: AtomicU32,
    gc_phase: AtomicU8,
    transition_state: AtomicU8,
    cpu_profile_state: AtomicU8,
    observer_count: AtomicUsize,
    safepoint_active: AtomicBool,
    unwind_context: UnwindSlot,
    /// Owner-only, see `satb_slot`.
    satb_node: UnsafeCell<Option<Box<SatbNode>>>,
    raw_object_slot: AtomicPtr<u8>,
}

// SAFETY: Every field except `satb_node` is atomic or immutable. `satb_node`
// is only touched by the owning thread (checked at runtime) or by whoever
// holds the mutator's transition exclusively while the owner is blocked.
unsafe impl Sync for Mutator {}
// SAFETY: See `Sync`. Dropping on another thread only retires the node.
unsafe impl Send for Mutator {}

impl Mutator {
    /// Create the mutator for the calling thread and register it.
    ///
    /// The new mutator starts in a saferegion: the thread has not run any
    /// managed code yet.
    #[must_use]
    pub fn new_mutator(context: &Arc<RuntimeContext>) -> Arc<Self> {
        let mutator = Arc::new(Self {
            id: NEXT_MUTATOR_ID.fetch_add(1, Ordering::Relaxed),
            context: Arc::clone(context),
            thread_id: thread::current().id(),
            owner_token: current_thread_token(),
            stack_bounds: unwind::current_stack_bounds(),
            saferegion_state: AtomicU32::new(SaferegionState::InSaferegion as u32),
            suspension_flag: AtomicU32::new(0),
            gc_phase: AtomicU8::new(context.gc_phase() as u8),
            transition_state: AtomicU8::new(GcPhaseTransitionState::NoTransition as u8),
            cpu_profile_state: AtomicU8::new(CpuProfileState::NoCpuProfile as u8),
            observer_count: AtomicUsize::new(0),
            safepoint_active: AtomicBool::new(false),
            unwind_context: UnwindSlot::default(),
            satb_node: UnsafeCell::new(None),
            raw_object_slot: AtomicPtr::new(ptr::null_mut()),
        });
        context.mutators().register(&mutator);
        mutator
    }

    /// Unique id of this mutator.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// The thread this mutator was created on.
    #[must_use]
    pub const fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// The runtime this mutator belongs to.
    #[must_use]
    pub const fn context(&self) -> &Arc<RuntimeContext> {
        &self.context
    }

    /// Stack bounds of the owning thread, for the root scanner.
    #[must_use]
    pub const fn stack_bounds(&self) -> StackBounds {
        self.stack_bounds
    }

    /// Returns `true` when called on the thread that owns this mutator.
    #[must_use]
    pub fn is_owned_by_current_thread(&self) -> bool {
        current_thread_token() == self.owner_token
    }

    fn assert_owner(&self, operation: &str) {
        if !self.is_owned_by_current_thread() {
            fatal!(
                "mutator {} {operation} called from a thread that does not own it",
                self.id
            );
        }
    }

    // ------------------------------------------------------------------
    // Saferegion
    // ------------------------------------------------------------------

    /// Current saferegion state.
    #[must_use]
    pub fn saferegion_state(&self) -> SaferegionState {
        SaferegionState::from_u32(self.saferegion_state.load(Ordering::SeqCst))
    }

    /// Returns `true` if the collector may inspect this mutator right now.
    #[must_use]
    pub fn in_saferegion(&self) -> bool {
        self.saferegion_state() == SaferegionState::InSaferegion
    }

    /// Announce that this thread stopped touching the heap.
    ///
    /// Returns `false` if it already was in a saferegion. With
    /// `update_unwind_context` the caller's frame is recorded for the
    /// collector's stack scan first.
    #[inline(always)]
    pub fn enter_saferegion(&self, update_unwind_context: bool) -> bool {
        if self.in_saferegion() {
            return false;
        }
        if update_unwind_context {
            self.unwind_context.store(UnwindContext::capture());
        }
        self.do_enter_saferegion();
        true
    }

    /// Announce that this thread is about to touch the heap again.
    ///
    /// Returns `false` if it already was outside a saferegion. Any pending
    /// suspension request is handled before returning.
    pub fn leave_saferegion(&self) -> bool {
        if !self.in_saferegion() {
            return false;
        }
        self.do_leave_saferegion();
        if self.has_any_suspension_request() {
            self.handle_suspension();
        }
        true
    }

    /// Unconditionally mark the mutator as in a saferegion.
    pub fn do_enter_saferegion(&self) {
        self.saferegion_state
            .store(SaferegionState::InSaferegion as u32, Ordering::SeqCst);
    }

    /// Unconditionally mark the mutator as outside a saferegion.
    ///
    /// Unlike [`leave_saferegion`](Self::leave_saferegion) this does not
    /// poll for suspension requests.
    pub fn do_leave_saferegion(&self) {
        self.saferegion_state
            .store(SaferegionState::NotInSaferegion as u32, Ordering::SeqCst);
    }

    /// The frame recorded by the last `enter_saferegion(true)`.
    #[must_use]
    pub fn unwind_context(&self) -> UnwindContext {
        self.unwind_context.load()
    }

    // ------------------------------------------------------------------
    // Suspension requests
    // ------------------------------------------------------------------

    /// Pending requests.
    #[must_use]
    pub fn suspension_flags(&self) -> SuspensionType {
        SuspensionType::from_bits_truncate(self.suspension_flag.load(Ordering::SeqCst))
    }

    /// Raise `flag`.
    ///
    /// Raising [`SuspensionType::GC_PHASE`] arms the phase handshake and
    /// raising [`SuspensionType::CPU_PROFILE`] arms the profile handshake
    /// before the flag becomes visible.
    pub fn set_suspension_flag(&self, flag: SuspensionType) {
        if flag.contains(SuspensionType::GC_PHASE) {
            self.arm_phase_transition();
        }
        if flag.contains(SuspensionType::CPU_PROFILE) {
            self.arm_cpu_profile();
        }
        self.suspension_flag.fetch_or(flag.bits(), Ordering::SeqCst);
    }

    /// Lower `flag`, leaving other requests untouched.
    pub fn clear_suspension_flag(&self, flag: SuspensionType) {
        self.suspension_flag
            .fetch_and(!flag.bits(), Ordering::SeqCst);
    }

    /// Returns `true` if any request in `flag` is pending.
    #[must_use]
    pub fn has_suspension_request(&self, flag: SuspensionType) -> bool {
        self.suspension_flags().intersects(flag)
    }

    /// Returns `true` if any request is pending.
    #[must_use]
    pub fn has_any_suspension_request(&self) -> bool {
        self.suspension_flag.load(Ordering::SeqCst) != 0
    }

    /// Raise or lower the out-of-band safepoint word.
    ///
    /// Generated code polls this word; the collector raises it for threads
    /// that run too long without reaching a regular poll.
    pub fn set_safepoint_active(&self, active: bool) {
        self.safepoint_active.store(active, Ordering::SeqCst);
    }

    /// Returns `true` if the out-of-band safepoint word is raised.
    #[must_use]
    pub fn safepoint_active(&self) -> bool {
        self.safepoint_active.load(Ordering::SeqCst)
    }

    /// Explicit safepoint poll for loops and generated code.
    ///
    /// Returns `true` if a request was handled.
    pub fn safepoint_poll(&self) -> bool {
        if !self.has_any_suspension_request() && !self.safepoint_active() {
            return false;
        }
        self.handle_suspension();
        true
    }

    /// Slow path: answer every pending request.
    ///
    /// Must be called by the owning thread while outside a saferegion.
    pub fn handle_suspension(&self) {
        self.assert_owner("handle_suspension");
        loop {
            let flags = self.suspension_flags();
            if flags.is_empty() {
                return;
            }
            if flags.contains(SuspensionType::GC_PHASE) {
                // Clear before looking at the handshake: a request raised
                // after this point stays visible for the next iteration.
                self.clear_suspension_flag(SuspensionType::GC_PHASE);
                self.transition_gc_phase(true);
            }
            if flags.contains(SuspensionType::CPU_PROFILE) {
                self.clear_suspension_flag(SuspensionType::CPU_PROFILE);
                self.transition_to_cpu_profile(true);
            }
            if flags.contains(SuspensionType::EXIT) {
                self.flush_satb_buffer();
            }
            if flags.intersects(SuspensionType::STW | SuspensionType::EXIT) {
                self.do_enter_saferegion();
                self.context
                    .mutators()
                    .park_while(self, SuspensionType::STW | SuspensionType::EXIT);
                self.do_leave_saferegion();
            }
        }
    }

    // ------------------------------------------------------------------
    // GC phase handshake
    // ------------------------------------------------------------------

    /// Phase this mutator last applied.
    #[must_use]
    pub fn gc_phase(&self) -> GcPhase {
        GcPhase::from_u8(self.gc_phase.load(Ordering::Acquire))
    }

    /// Current phase handshake state.
    #[must_use]
    pub fn transition_state(&self) -> GcPhaseTransitionState {
        GcPhaseTransitionState::from_u8(self.transition_state.load(Ordering::Acquire))
    }

    fn arm_phase_transition(&self) {
        let state = self.transition_state();
        if state == GcPhaseTransitionState::InTransition {
            fatal!(
                "mutator {}: new GC phase requested while a transition is in progress",
                self.id
            );
        }
        self.transition_state
            .store(GcPhaseTransitionState::NeedTransition as u8, Ordering::SeqCst);
    }

    /// Apply the collector's current phase to this mutator, at most once
    /// per request.
    ///
    /// `by_self` is `true` when the owning thread calls this from its
    /// suspension handler, and `false` when the collector forces the change
    /// on a mutator parked in a saferegion. Returns `true` if this call
    /// applied the phase. A mutator that finds the collector mid-transition
    /// waits for it to finish.
    pub fn transition_gc_phase(&self, by_self: bool) -> bool {
        loop {
            match self.transition_state() {
                GcPhaseTransitionState::NeedTransition => {
                    if self
                        .transition_state
                        .compare_exchange(
                            GcPhaseTransitionState::NeedTransition as u8,
                            GcPhaseTransitionState::InTransition as u8,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                    {
                        self.transition_to_gc_phase_exclusive(by_self);
                        self.transition_state.store(
                            GcPhaseTransitionState::FinishTransition as u8,
                            Ordering::Release,
                        );
                        return true;
                    }
                }
                GcPhaseTransitionState::InTransition => {
                    if by_self {
                        self.wait_for_phase_transition();
                    }
                    return false;
                }
                GcPhaseTransitionState::NoTransition
                | GcPhaseTransitionState::FinishTransition => return false,
            }
        }
    }

    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    fn transition_to_gc_phase_exclusive(&self, by_self: bool) {
        if self.transition_state() != GcPhaseTransitionState::InTransition {
            fatal!(
                "mutator {}: GC phase applied without owning the transition",
                self.id
            );
        }
        let from = self.gc_phase();
        let to = self.context.gc_phase();
        if from.is_satb_marking() && !to.is_satb_marking() {
            // SAFETY: Holding `InTransition` excludes the owner from its
            // barrier code until `FinishTransition` is published.
            self.context
                .satb_buffer()
                .retire_node_from(unsafe { self.satb_slot() });
        }
        self.gc_phase.store(to as u8, Ordering::Release);
        self.context.run_phase_hook(self, to);
        #[cfg(feature = "tracing")]
        crate::log::internal::log_phase_transition(self.id, from, to, by_self);
    }

    /// Spin, then yield, until no phase transition is in progress.
    pub fn wait_for_phase_transition(&self) {
        let backoff = Backoff::new();
        while self.transition_state() == GcPhaseTransitionState::InTransition {
            backoff.snooze();
        }
    }

    // ------------------------------------------------------------------
    // CPU profile handshake
    // ------------------------------------------------------------------

    /// Current profile handshake state.
    #[must_use]
    pub fn cpu_profile_state(&self) -> CpuProfileState {
        CpuProfileState::from_u8(self.cpu_profile_state.load(Ordering::Acquire))
    }

    fn arm_cpu_profile(&self) {
        if self.cpu_profile_state() == CpuProfileState::InCpuProfiling {
            fatal!(
                "mutator {}: CPU profile requested while one is being taken",
                self.id
            );
        }
        self.cpu_profile_state
            .store(CpuProfileState::NeedCpuProfile as u8, Ordering::SeqCst);
    }

    /// Take the requested CPU profile sample, at most once per request.
    ///
    /// Same handshake as [`transition_gc_phase`](Self::transition_gc_phase).
    pub fn transition_to_cpu_profile(&self, by_self: bool) -> bool {
        loop {
            match self.cpu_profile_state() {
                CpuProfileState::NeedCpuProfile => {
                    if self
                        .cpu_profile_state
                        .compare_exchange(
                            CpuProfileState::NeedCpuProfile as u8,
                            CpuProfileState::InCpuProfiling as u8,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                    {
                        self.context.run_cpu_profile_hook(self);
                        #[cfg(feature = "tracing")]
                        crate::log::internal::log_cpu_profile(self.id, by_self);
                        self.cpu_profile_state
                            .store(CpuProfileState::FinishCpuProfile as u8, Ordering::Release);
                        return true;
                    }
                }
                CpuProfileState::InCpuProfiling => {
                    if by_self {
                        self.wait_for_cpu_profiling();
                    }
                    return false;
                }
                CpuProfileState::NoCpuProfile | CpuProfileState::FinishCpuProfile => {
                    return false;
                }
            }
        }
    }

    /// Spin, then yield, until no profile sample is being taken.
    pub fn wait_for_cpu_profiling(&self) {
        let backoff = Backoff::new();
        while self.cpu_profile_state() == CpuProfileState::InCpuProfiling {
            backoff.snooze();
        }
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    /// Register an external party inspecting this mutator.
    ///
    /// Deregistration of the thread waits until every guard is dropped.
    #[must_use = "the observer is released when the guard is dropped"]
    pub fn observe(&self) -> MutatorObserver<'_> {
        self.observer_count.fetch_add(1, Ordering::SeqCst);
        MutatorObserver { mutator: self }
    }

    /// Number of live observer guards.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.observer_count.load(Ordering::SeqCst)
    }

    /// Spin, then yield, until no observer is left.
    pub fn wait_for_observers(&self) {
        let backoff = Backoff::new();
        while self.observer_count() != 0 {
            backoff.snooze();
        }
    }

    // ------------------------------------------------------------------
    // SATB
    // ------------------------------------------------------------------

    /// # Safety
    ///
    /// The caller must be the owning thread, or hold this mutator's phase
    /// transition exclusively (`InTransition`) while the owner is blocked.
    #[allow(clippy::mut_from_ref)]
    unsafe fn satb_slot(&self) -> &mut Option<Box<SatbNode>> {
        // SAFETY: Exclusivity is guaranteed by the caller.
        unsafe { &mut *self.satb_node.get() }
    }

    /// Write barrier slow path: log `obj` if the collector needs it.
    ///
    /// Objects outside the managed heap and objects the SATB policy rejects
    /// are ignored. Must be called by the owning thread outside a
    /// saferegion: while the mutator is in one, the collector may retire
    /// its node on its behalf.
    pub fn remember_object_in_satb_buffer(&self, obj: ObjectRef) {
        if !self.context.heap_range().contains(obj.addr()) {
            return;
        }
        if !self
            .context
            .satb_policy()
            .should_enqueue(obj, self.gc_phase())
        {
            return;
        }
        self.assert_owner("remember_object_in_satb_buffer");
        if self.in_saferegion() {
            fatal!(
                "mutator {}: write barrier used inside a saferegion",
                self.id
            );
        }
        // SAFETY: Owner checked above, and outside a saferegion the
        // collector never takes the node.
        let slot = unsafe { self.satb_slot() };
        self.context.satb_buffer().push(slot, obj);
    }

    /// Number of objects in this mutator's private SATB node.
    #[must_use]
    pub fn satb_node_len(&self) -> usize {
        self.assert_owner("satb_node_len");
        // SAFETY: Owner checked above.
        unsafe { self.satb_slot() }
            .as_ref()
            .map_or(0, |node| node.len())
    }

    /// Drop the buffered entries without handing them to the marker.
    ///
    /// Only correct when the current phase no longer needs them.
    pub fn clear_satb_buffer_node(&self) {
        self.assert_owner("clear_satb_buffer_node");
        // SAFETY: Owner checked above.
        if let Some(node) = unsafe { self.satb_slot() } {
            node.clear();
        }
    }

    /// Hand the private SATB node to the global retired pool.
    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    pub fn flush_satb_buffer(&self) {
        self.assert_owner("flush_satb_buffer");
        // SAFETY: Owner checked above.
        let objects = self
            .context
            .satb_buffer()
            .retire_node_from(unsafe { self.satb_slot() });
        #[cfg(feature = "tracing")]
        crate::log::internal::log_satb_retire(self.id, objects);
    }

    // ------------------------------------------------------------------
    // Raw root slot
    // ------------------------------------------------------------------

    /// Park one object in the mutator's root slot.
    pub fn set_raw_object(&self, obj: Option<ObjectRef>) {
        let raw = obj.map_or(ptr::null_mut(), ObjectRef::as_ptr);
        self.raw_object_slot.store(raw, Ordering::Release);
    }

    /// The object parked in the root slot.
    #[must_use]
    pub fn raw_object(&self) -> Option<ObjectRef> {
        ObjectRef::from_ptr(self.raw_object_slot.load(Ordering::Acquire))
    }

    /// Reset between managed invocations: clear the root slot and retire
    /// the SATB node.
    pub fn reset_mutator(&self) {
        self.set_raw_object(None);
        self.flush_satb_buffer();
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        if let Some(node) = self.satb_node.get_mut().take() {
            self.context.satb_buffer().retire_node(node);
        }
    }
}

impl fmt::Debug for Mutator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutator")
            .field("id", &self.id)
            .field("thread_id", &self.thread_id)
            .field("saferegion", &self.saferegion_state())
            .field("suspension", &self.suspension_flags())
            .field("gc_phase", &self.gc_phase())
            .field("transition", &self.transition_state())
            .finish_non_exhaustive()
    }
}

/// Keeps a mutator's observer count raised while alive.
#[derive(Debug)]
pub struct MutatorObserver<'a> {
    mutator: &'a Mutator,
}

impl MutatorObserver<'_> {
    /// The observed mutator.
    #[must_use]
    pub const fn mutator(&self) -> &Mutator {
        self.mutator
    }
}

impl Drop for MutatorObserver<'_> {
    fn drop(&mut self) {
        self.mutator.observer_count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Enters a saferegion on construction and leaves it on drop.
///
/// If the mutator already was in a saferegion the guard does nothing.
#[must_use = "the saferegion is left when the guard is dropped"]
#[derive(Debug)]
pub struct ScopedEnterSaferegion<'a> {
    mutator: &'a Mutator,
    entered: bool,
}

impl<'a> ScopedEnterSaferegion<'a> {
    /// Enter a saferegion, recording the caller's frame.
    pub fn new(mutator: &'a Mutator) -> Self {
        let entered = mutator.enter_saferegion(true);
        Self { mutator, entered }
    }
}

impl Drop for ScopedEnterSaferegion<'_> {
    fn drop(&mut self) {
        if self.entered {
            self.mutator.leave_saferegion();
        }
    }
}

/// Leaves a saferegion on construction and re-enters it on drop.
///
/// Pending suspension requests are answered on the way out. If the mutator
/// already was running the guard does nothing.
#[must_use = "the saferegion is re-entered when the guard is dropped"]
#[derive(Debug)]
pub struct ScopedLeaveSaferegion<'a> {
    mutator: &'a Mutator,
    left: bool,
}

impl<'a> ScopedLeaveSaferegion<'a> {
    /// Leave the saferegion, polling for suspension requests.
    pub fn new(mutator: &'a Mutator) -> Self {
        let left = mutator.leave_saferegion();
        Self { mutator, left }
    }
}

impl Drop for ScopedLeaveSaferegion<'_> {
    fn drop(&mut self) {
        if self.left {
            self.mutator.enter_saferegion(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::context::RuntimeConfig;
    use crate::heap::ObjectKind;

    fn context() -> Arc<RuntimeContext> {
        RuntimeContext::new(RuntimeConfig {
            heap_size: 4096,
            ..RuntimeConfig::default()
        })
    }

    #[test]
    fn test_new_mutator_starts_in_saferegion() {
        let ctx = context();
        let mutator = Mutator::new_mutator(&ctx);
        assert!(mutator.in_saferegion());
        assert_eq!(mutator.gc_phase(), GcPhase::Idle);
        assert_eq!(ctx.mutators().len(), 1);
        ctx.mutators().unregister(&mutator);
    }

    #[test]
    fn test_enter_and_leave_are_idempotent() {
        let ctx = context();
        let mutator = Mutator::new_mutator(&ctx);
        assert!(mutator.leave_saferegion());
        assert!(!mutator.leave_saferegion());
        assert!(mutator.enter_saferegion(true));
        assert!(!mutator.enter_saferegion(true));
        ctx.mutators().unregister(&mutator);
    }

    #[test]
    fn test_enter_records_unwind_context() {
        let ctx = context();
        let mutator = Mutator::new_mutator(&ctx);
        mutator.leave_saferegion();
        assert_eq!(mutator.unwind_context(), UnwindContext::default());
        mutator.enter_saferegion(true);
        assert_ne!(mutator.unwind_context(), UnwindContext::default());
        ctx.mutators().unregister(&mutator);
    }

    #[test]
    fn test_self_transition_applies_phase_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let ctx = RuntimeContext::builder(RuntimeConfig {
            heap_size: 4096,
            ..RuntimeConfig::default()
        })
        .on_phase_transition(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build();
        let mutator = Mutator::new_mutator(&ctx);

        ctx.set_gc_phase(GcPhase::Marking);
        mutator.set_suspension_flag(SuspensionType::GC_PHASE);
        assert_eq!(
            mutator.transition_state(),
            GcPhaseTransitionState::NeedTransition
        );
        mutator.leave_saferegion();

        assert_eq!(mutator.gc_phase(), GcPhase::Marking);
        assert_eq!(
            mutator.transition_state(),
            GcPhaseTransitionState::FinishTransition
        );
        assert!(!mutator.has_any_suspension_request());
        assert!(!mutator.transition_gc_phase(true));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        ctx.mutators().unregister(&mutator);
    }

    #[test]
    #[should_panic(expected = "transition is in progress")]
    fn test_rearming_during_transition_is_fatal() {
        let ctx = context();
        let mutator = Mutator::new_mutator(&ctx);
        mutator
            .transition_state
            .store(GcPhaseTransitionState::InTransition as u8, Ordering::SeqCst);
        mutator.set_suspension_flag(SuspensionType::GC_PHASE);
    }

    #[test]
    #[should_panic(expected = "does not own it")]
    fn test_foreign_thread_cannot_touch_satb_node() {
        let ctx = context();
        let mutator = Mutator::new_mutator(&ctx);
        let foreign = Arc::clone(&mutator);
        let result = thread::spawn(move || foreign.flush_satb_buffer()).join();
        if let Err(payload) = result {
            std::panic::resume_unwind(payload);
        }
    }

    #[test]
    fn test_observer_guard_tracks_count() {
        let ctx = context();
        let mutator = Mutator::new_mutator(&ctx);
        {
            let _a = mutator.observe();
            let _b = mutator.observe();
            assert_eq!(mutator.observer_count(), 2);
        }
        assert_eq!(mutator.observer_count(), 0);
        mutator.wait_for_observers();
        ctx.mutators().unregister(&mutator);
    }

    #[test]
    fn test_scoped_saferegion_restores_state() {
        let ctx = context();
        let mutator = Mutator::new_mutator(&ctx);
        mutator.leave_saferegion();
        {
            let _guard = ScopedEnterSaferegion::new(&mutator);
            assert!(mutator.in_saferegion());
        }
        assert!(!mutator.in_saferegion());
        ctx.mutators().unregister(&mutator);
    }

    #[test]
    fn test_dropped_mutator_leaves_registry_and_retires_node() {
        let ctx = context();
        let mutator = Mutator::new_mutator(&ctx);
        mutator.leave_saferegion();
        ctx.mutators().transition_all_mutators(GcPhase::Marking);
        let obj = ObjectRef::new(ctx.allocator().allocate(16, ObjectKind::Other).unwrap());
        mutator.remember_object_in_satb_buffer(obj);
        assert_eq!(Arc::strong_count(&ctx), 2);

        // Never unregistered.
        drop(mutator);
        assert!(ctx.mutators().is_empty());
        assert_eq!(ctx.satb_buffer().retired_len(), 1);
        assert_eq!(Arc::strong_count(&ctx), 1);
    }

    #[test]
    #[should_panic(expected = "inside a saferegion")]
    fn test_write_barrier_in_saferegion_is_fatal() {
        let ctx = context();
        let mutator = Mutator::new_mutator(&ctx);
        ctx.mutators().transition_all_mutators(GcPhase::Marking);
        let obj = ObjectRef::new(ctx.allocator().allocate(16, ObjectKind::Other).unwrap());
        mutator.remember_object_in_satb_buffer(obj);
    }

    #[test]
    fn test_scoped_leave_restores_saferegion() {
        let ctx = context();
        let mutator = Mutator::new_mutator(&ctx);
        {
            let _running = ScopedLeaveSaferegion::new(&mutator);
            assert!(!mutator.in_saferegion());
            {
                let _nested = ScopedLeaveSaferegion::new(&mutator);
            }
            assert!(!mutator.in_saferegion());
        }
        assert!(mutator.in_saferegion());
        ctx.mutators().unregister(&mutator);
    }

    #[test]
    fn test_reset_clears_raw_slot() {
        let ctx = context();
        let mutator = Mutator::new_mutator(&ctx);
        let obj = ObjectRef::from_ptr(0x1000 as *const u8).unwrap();
        mutator.set_raw_object(Some(obj));
        assert_eq!(mutator.raw_object(), Some(obj));
        mutator.reset_mutator();
        assert_eq!(mutator.raw_object(), None);
        ctx.mutators().unregister(&mutator);
    }
}
