//! Tests for suspension flags and the collector handshakes.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use gc_mutator::{
    CpuProfileState, GcPhase, GcPhaseTransitionState, Mutator, RuntimeConfig, RuntimeContext,
    SuspensionType, ThreadHolder,
};

const FLAGS: [SuspensionType; 4] = [
    SuspensionType::GC_PHASE,
    SuspensionType::STW,
    SuspensionType::EXIT,
    SuspensionType::CPU_PROFILE,
];

fn config() -> RuntimeConfig {
    RuntimeConfig {
        heap_size: 4096,
        ..RuntimeConfig::default()
    }
}

fn subset(bits: u32) -> Vec<SuspensionType> {
    FLAGS
        .iter()
        .enumerate()
        .filter(|(i, _)| bits & (1 << i) != 0)
        .map(|(_, &flag)| flag)
        .collect()
}

#[test]
fn test_set_then_clear_leaves_difference_for_all_subsets() {
    let ctx = RuntimeContext::new(config());
    let mutator = Mutator::new_mutator(&ctx);
    for s in 0..16u32 {
        for t in 0..16u32 {
            for reversed in [false, true] {
                let mut set = subset(s);
                let mut clear = subset(t);
                if reversed {
                    set.reverse();
                    clear.reverse();
                }
                for &flag in &set {
                    mutator.set_suspension_flag(flag);
                }
                for &flag in &clear {
                    mutator.clear_suspension_flag(flag);
                }
                assert_eq!(
                    mutator.suspension_flags().bits(),
                    s & !t,
                    "S={s:#06b} T={t:#06b}"
                );
                mutator.clear_suspension_flag(SuspensionType::ALL);
            }
        }
    }
    ctx.mutators().unregister(&mutator);
}

#[test]
fn test_arming_flags_arms_handshakes() {
    let ctx = RuntimeContext::new(config());
    let mutator = Mutator::new_mutator(&ctx);
    assert_eq!(mutator.transition_state(), GcPhaseTransitionState::NoTransition);
    assert_eq!(mutator.cpu_profile_state(), CpuProfileState::NoCpuProfile);

    mutator.set_suspension_flag(SuspensionType::GC_PHASE | SuspensionType::CPU_PROFILE);
    assert_eq!(mutator.transition_state(), GcPhaseTransitionState::NeedTransition);
    assert_eq!(mutator.cpu_profile_state(), CpuProfileState::NeedCpuProfile);
    assert!(mutator.has_suspension_request(SuspensionType::CPU_PROFILE));
    assert!(!mutator.has_suspension_request(SuspensionType::STW));

    assert!(mutator.transition_gc_phase(false));
    assert!(!mutator.transition_gc_phase(false));
    assert!(mutator.transition_to_cpu_profile(false));
    assert_eq!(mutator.cpu_profile_state(), CpuProfileState::FinishCpuProfile);
    ctx.mutators().unregister(&mutator);
}

/// Runs a registered mutator that polls until told to stop.
struct Worker {
    stop: Arc<AtomicBool>,
    progress: Arc<AtomicUsize>,
    handle: thread::JoinHandle<()>,
}

impl Worker {
    fn spawn(ctx: &Arc<RuntimeContext>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let progress = Arc::new(AtomicUsize::new(0));
        let handle = thread::spawn({
            let ctx = Arc::clone(ctx);
            let stop = Arc::clone(&stop);
            let progress = Arc::clone(&progress);
            move || {
                let holder = ThreadHolder::register(&ctx);
                let mutator = holder.mutator();
                mutator.leave_saferegion();
                while !stop.load(Ordering::SeqCst) {
                    progress.fetch_add(1, Ordering::SeqCst);
                    mutator.safepoint_poll();
                    thread::yield_now();
                }
                mutator.enter_saferegion(true);
                ThreadHolder::unregister();
            }
        });
        while progress.load(Ordering::SeqCst) == 0 {
            thread::yield_now();
        }
        Self {
            stop,
            progress,
            handle,
        }
    }

    fn progress(&self) -> usize {
        self.progress.load(Ordering::SeqCst)
    }

    fn wait_for_progress_past(&self, mark: usize) {
        while self.progress() <= mark {
            thread::yield_now();
        }
    }

    fn finish(self) {
        self.stop.store(true, Ordering::SeqCst);
        self.handle.join().unwrap();
    }
}

#[test]
fn test_stop_the_world_parks_running_mutators() {
    let ctx = RuntimeContext::new(config());
    let workers: Vec<_> = (0..3).map(|_| Worker::spawn(&ctx)).collect();

    let frozen: Vec<usize>;
    {
        let world = ctx.mutators().stop_the_world();
        assert_eq!(world.mutators().len(), 3);
        assert!(world.mutators().iter().all(|m| m.in_saferegion()));
        frozen = workers.iter().map(Worker::progress).collect();
        thread::sleep(Duration::from_millis(20));
        let now: Vec<usize> = workers.iter().map(Worker::progress).collect();
        assert_eq!(frozen, now);
    }

    for (worker, mark) in workers.iter().zip(&frozen) {
        worker.wait_for_progress_past(*mark);
    }
    for worker in workers {
        worker.finish();
    }
    assert!(ctx.mutators().is_empty());
}

#[test]
fn test_running_mutators_transition_themselves() {
    let calls = Arc::new(AtomicUsize::new(0));
    let ctx = RuntimeContext::builder(config())
        .on_phase_transition({
            let calls = Arc::clone(&calls);
            move |_, phase| {
                assert_eq!(phase, GcPhase::Marking);
                calls.fetch_add(1, Ordering::SeqCst);
            }
        })
        .build();
    let workers: Vec<_> = (0..2).map(|_| Worker::spawn(&ctx)).collect();

    ctx.mutators().transition_all_mutators(GcPhase::Marking);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    ctx.mutators().visit_all_mutators(|m| {
        assert_eq!(m.gc_phase(), GcPhase::Marking);
        assert_eq!(m.transition_state(), GcPhaseTransitionState::FinishTransition);
    });

    for worker in workers {
        worker.finish();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_collector_forces_transition_of_parked_mutator() {
    let applied_on = Arc::new(Mutex::new(Vec::new()));
    let ctx = RuntimeContext::builder(config())
        .on_phase_transition({
            let applied_on = Arc::clone(&applied_on);
            move |_, _| applied_on.lock().unwrap().push(thread::current().id())
        })
        .build();

    let (ready_tx, ready_rx) = mpsc::channel();
    let (go_tx, go_rx) = mpsc::channel::<()>();
    let worker = thread::spawn({
        let ctx = Arc::clone(&ctx);
        move || {
            let holder = ThreadHolder::register(&ctx);
            ready_tx.send(thread::current().id()).unwrap();
            // Blocked in a saferegion until the collector is done.
            go_rx.recv().unwrap();
            let mutator = holder.mutator();
            mutator.leave_saferegion();
            let phase = mutator.gc_phase();
            mutator.enter_saferegion(true);
            ThreadHolder::unregister();
            phase
        }
    });
    let worker_thread = ready_rx.recv().unwrap();

    ctx.mutators().transition_all_mutators(GcPhase::Enum);
    go_tx.send(()).unwrap();
    assert_eq!(worker.join().unwrap(), GcPhase::Enum);

    let applied_on = applied_on.lock().unwrap();
    assert_eq!(applied_on.len(), 1);
    assert_ne!(applied_on[0], worker_thread);
}

#[test]
fn test_cpu_profile_collected_from_every_mutator() {
    let samples = Arc::new(AtomicUsize::new(0));
    let ctx = RuntimeContext::builder(config())
        .on_cpu_profile({
            let samples = Arc::clone(&samples);
            move |_| {
                samples.fetch_add(1, Ordering::SeqCst);
            }
        })
        .build();
    let workers: Vec<_> = (0..2).map(|_| Worker::spawn(&ctx)).collect();

    ctx.mutators().request_cpu_profile_all();
    assert_eq!(samples.load(Ordering::SeqCst), 2);
    ctx.mutators()
        .visit_all_mutators(|m| assert_eq!(m.cpu_profile_state(), CpuProfileState::FinishCpuProfile));

    for worker in workers {
        worker.finish();
    }
}

#[test]
fn test_exit_request_parks_until_resumed() {
    let ctx = RuntimeContext::new(config());
    let worker = Worker::spawn(&ctx);

    ctx.mutators().request_exit_all();
    let mut parked = false;
    while !parked {
        ctx.mutators().visit_all_mutators(|m| parked = m.in_saferegion());
        thread::yield_now();
    }
    let mark = worker.progress();
    thread::sleep(Duration::from_millis(10));
    assert_eq!(worker.progress(), mark);

    ctx.mutators().resume_all(SuspensionType::EXIT);
    worker.wait_for_progress_past(mark);
    worker.finish();
}

/// Runs a mutator that only looks at its safepoint word, like generated
/// code between regular polls.
fn spawn_word_poller(
    ctx: &Arc<RuntimeContext>,
    stop: &Arc<AtomicBool>,
) -> thread::JoinHandle<(GcPhase, usize)> {
    let (ready_tx, ready_rx) = mpsc::channel();
    let handle = thread::spawn({
        let ctx = Arc::clone(ctx);
        let stop = Arc::clone(stop);
        move || {
            let holder = ThreadHolder::register(&ctx);
            let mutator = holder.mutator();
            mutator.leave_saferegion();
            ready_tx.send(()).unwrap();
            let mut raised = 0;
            while !stop.load(Ordering::SeqCst) {
                if mutator.safepoint_active() {
                    raised += 1;
                    mutator.handle_suspension();
                }
                thread::yield_now();
            }
            let phase = mutator.gc_phase();
            mutator.enter_saferegion(true);
            ThreadHolder::unregister();
            (phase, raised)
        }
    });
    ready_rx.recv().unwrap();
    handle
}

#[test]
fn test_phase_change_reaches_mutator_through_safepoint_word() {
    let ctx = RuntimeContext::new(config());
    let stop = Arc::new(AtomicBool::new(false));
    let poller = spawn_word_poller(&ctx, &stop);

    ctx.mutators().transition_all_mutators(GcPhase::Marking);
    ctx.mutators().visit_all_mutators(|m| {
        assert_eq!(m.transition_state(), GcPhaseTransitionState::FinishTransition);
        assert!(!m.safepoint_active());
    });

    stop.store(true, Ordering::SeqCst);
    let (phase, raised) = poller.join().unwrap();
    assert_eq!(phase, GcPhase::Marking);
    assert!(raised >= 1);
}

#[test]
fn test_cpu_profile_reaches_mutator_through_safepoint_word() {
    let samples = Arc::new(AtomicUsize::new(0));
    let ctx = RuntimeContext::builder(config())
        .on_cpu_profile({
            let samples = Arc::clone(&samples);
            move |_| {
                samples.fetch_add(1, Ordering::SeqCst);
            }
        })
        .build();
    let stop = Arc::new(AtomicBool::new(false));
    let poller = spawn_word_poller(&ctx, &stop);

    ctx.mutators().request_cpu_profile_all();
    assert_eq!(samples.load(Ordering::SeqCst), 1);
    ctx.mutators().visit_all_mutators(|m| assert!(!m.safepoint_active()));

    stop.store(true, Ordering::SeqCst);
    let (_, raised) = poller.join().unwrap();
    assert!(raised >= 1);
}

#[test]
fn test_safepoint_word_triggers_poll() {
    let ctx = RuntimeContext::new(config());
    let mutator = Mutator::new_mutator(&ctx);
    mutator.leave_saferegion();
    assert!(!mutator.safepoint_poll());
    mutator.set_safepoint_active(true);
    assert!(mutator.safepoint_active());
    assert!(mutator.safepoint_poll());
    mutator.set_safepoint_active(false);
    assert!(!mutator.safepoint_poll());
    ctx.mutators().unregister(&mutator);
}

#[test]
#[should_panic(expected = "transition is in progress")]
fn test_second_phase_request_during_transition_is_fatal() {
    let ctx = RuntimeContext::builder(config())
        .on_phase_transition(|mutator, _| {
            // Re-arming from inside the exclusive section.
            mutator.set_suspension_flag(SuspensionType::GC_PHASE);
        })
        .build();
    let mutator = Mutator::new_mutator(&ctx);
    mutator.set_suspension_flag(SuspensionType::GC_PHASE);
    mutator.transition_gc_phase(false);
}
