//! The runtime root that every mutator, thread holder and string table is
//! wired to.
//!
//! Instead of process-wide singletons, one [`RuntimeContext`] is built by
//! the embedder and passed down explicitly. It owns the global SATB pool,
//! the mutator registry and the collector's current phase, and it carries
//! the collaborators this crate does not implement itself (allocator, SATB
//! policy, phase and profiling hooks).

use std::fmt;
use std::sync::Arc;

use crate::heap::{Allocator, HeapRange, RegionAllocator};
use crate::mutator::{GcPhase, Mutator, MutatorManager};
use crate::satb::{MarkingPhasePolicy, SatbBuffer, SatbPolicy, DEFAULT_SATB_NODE_CAPACITY};

/// Bytes reserved by the default allocator.
pub const DEFAULT_HEAP_SIZE: usize = 64 * 1024 * 1024;
/// Threads used by the parallel weak sweep.
pub const DEFAULT_SWEEP_WORKERS: usize = 4;

/// Callback run inside a mutator's exclusive phase transition.
pub type PhaseTransitionHook = Box<dyn Fn(&Mutator, GcPhase) + Send + Sync>;

/// Callback run inside a mutator's exclusive CPU profile handshake.
pub type CpuProfileHook = Box<dyn Fn(&Mutator) + Send + Sync>;

/// Tunables for a runtime instance.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    /// Bytes reserved by the default [`RegionAllocator`].
    pub heap_size: usize,
    /// Objects per SATB node.
    pub satb_node_capacity: usize,
    /// Threads used by the parallel weak sweep of the string table.
    pub sweep_workers: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            heap_size: DEFAULT_HEAP_SIZE,
            satb_node_capacity: DEFAULT_SATB_NODE_CAPACITY,
            sweep_workers: DEFAULT_SWEEP_WORKERS,
        }
    }
}

/// Shared state for one managed runtime.
pub struct RuntimeContext {
    config: RuntimeConfig,
    allocator: Arc<dyn Allocator>,
    heap_range: HeapRange,
    satb_policy: Box<dyn SatbPolicy>,
    satb_buffer: SatbBuffer,
    mutators: MutatorManager,
    phase_hook: Option<PhaseTransitionHook>,
    cpu_profile_hook: Option<CpuProfileHook>,
}

impl RuntimeContext {
    /// Build a context with the default region allocator and SATB policy.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        Self::builder(config).build()
    }

    /// Start building a context with injected collaborators.
    #[must_use]
    pub fn builder(config: RuntimeConfig) -> RuntimeContextBuilder {
        RuntimeContextBuilder {
            config,
            allocator: None,
            satb_policy: None,
            phase_hook: None,
            cpu_profile_hook: None,
        }
    }

    /// The configuration this context was built with.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Raw memory source for objects this crate creates.
    #[must_use]
    pub fn allocator(&self) -> &dyn Allocator {
        &*self.allocator
    }

    /// Address range of the managed heap.
    #[must_use]
    pub const fn heap_range(&self) -> HeapRange {
        self.heap_range
    }

    /// Rule deciding which overwritten references are logged.
    #[must_use]
    pub fn satb_policy(&self) -> &dyn SatbPolicy {
        &*self.satb_policy
    }

    /// Global pool of SATB nodes.
    #[must_use]
    pub const fn satb_buffer(&self) -> &SatbBuffer {
        &self.satb_buffer
    }

    /// Registry of live mutators.
    #[must_use]
    pub const fn mutators(&self) -> &MutatorManager {
        &self.mutators
    }

    /// Phase the collector most recently asked mutators to move to.
    #[must_use]
    pub fn gc_phase(&self) -> GcPhase {
        self.mutators.gc_phase()
    }

    /// Publish `phase` without notifying any mutator.
    ///
    /// Mutators pick it up on their next `GC_PHASE` request. Collectors
    /// normally use [`MutatorManager::transition_all_mutators`] instead.
    pub fn set_gc_phase(&self, phase: GcPhase) {
        self.mutators.set_gc_phase(phase);
    }

    pub(crate) fn run_phase_hook(&self, mutator: &Mutator, phase: GcPhase) {
        if let Some(hook) = &self.phase_hook {
            hook(mutator, phase);
        }
    }

    pub(crate) fn run_cpu_profile_hook(&self, mutator: &Mutator) {
        if let Some(hook) = &self.cpu_profile_hook {
            hook(mutator);
        }
    }
}

impl fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("config", &self.config)
            .field("heap_range", &self.heap_range)
            .field("gc_phase", &self.gc_phase())
            .field("mutators", &self.mutators.len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`RuntimeContext`].
pub struct RuntimeContextBuilder {
    config: RuntimeConfig,
    allocator: Option<Arc<dyn Allocator>>,
    satb_policy: Option<Box<dyn SatbPolicy>>,
    phase_hook: Option<PhaseTransitionHook>,
    cpu_profile_hook: Option<CpuProfileHook>,
}

impl RuntimeContextBuilder {
    /// Use `allocator` instead of a fresh [`RegionAllocator`].
    #[must_use]
    pub fn allocator(mut self, allocator: Arc<dyn Allocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Use `policy` instead of [`MarkingPhasePolicy`].
    #[must_use]
    pub fn satb_policy(mut self, policy: impl SatbPolicy + 'static) -> Self {
        self.satb_policy = Some(Box::new(policy));
        self
    }

    /// Run `hook` whenever a mutator applies a new GC phase.
    #[must_use]
    pub fn on_phase_transition(
        mut self,
        hook: impl Fn(&Mutator, GcPhase) + Send + Sync + 'static,
    ) -> Self {
        self.phase_hook = Some(Box::new(hook));
        self
    }

    /// Run `hook` whenever a mutator yields a CPU profile sample.
    #[must_use]
    pub fn on_cpu_profile(mut self, hook: impl Fn(&Mutator) + Send + Sync + 'static) -> Self {
        self.cpu_profile_hook = Some(Box::new(hook));
        self
    }

    /// Finish the context.
    #[must_use]
    pub fn build(self) -> Arc<RuntimeContext> {
        let allocator = self
            .allocator
            .unwrap_or_else(|| Arc::new(RegionAllocator::new(self.config.heap_size)));
        let heap_range = allocator.heap_range();
        Arc::new(RuntimeContext {
            satb_buffer: SatbBuffer::new(self.config.satb_node_capacity),
            config: self.config,
            allocator,
            heap_range,
            satb_policy: self
                .satb_policy
                .unwrap_or_else(|| Box::new(MarkingPhasePolicy)),
            mutators: MutatorManager::new(),
            phase_hook: self.phase_hook,
            cpu_profile_hook: self.cpu_profile_hook,
        })
    }
}

impl fmt::Debug for RuntimeContextBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeContextBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
