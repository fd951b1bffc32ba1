//! Snapshot-at-the-beginning (SATB) write-barrier buffers.
//!
//! While the collector marks concurrently, a pointer store may overwrite
//! the last reference to an object the marker has not reached yet. The
//! write barrier logs such old values so the marker can re-mark them.
//!
//! Each mutator privately owns at most one [`SatbNode`]. Pushing into it
//! needs no synchronisation. When the node fills up, or the mutator resets
//! or goes away, the node is *retired*: ownership moves into the global
//! [`SatbBuffer`]'s retired queue, which the marker drains. Drained nodes go
//! to a free pool and are handed out again with a bumped generation.
//!
//! ```text
//!  mutator A          mutator B
//!  [SatbNode]         [SatbNode]
//!      | retire           | retire
//!      +--------+---------+
//!               v
//!      retired: SegQueue<Box<SatbNode>>  --drain-->  marker
//!               |
//!               v
//!      free: SegQueue<Box<SatbNode>>  --ensure_good_node-->  mutators
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use crossbeam_queue::SegQueue;

use crate::heap::ObjectRef;
use crate::metrics::{SatbCounters, SatbMetrics};
use crate::mutator::GcPhase;

/// Default number of objects a node holds before it is retired.
pub const DEFAULT_SATB_NODE_CAPACITY: usize = 256;

/// Decides whether an overwritten reference must be logged.
///
/// The usual rule is "the collector is in a SATB marking phase and the
/// object is not marked yet". Mark bits live in the object model, which is
/// outside this crate, so the rule is injected.
pub trait SatbPolicy: Send + Sync {
    /// Returns `true` if `obj` must be logged while the mutator is in `phase`.
    fn should_enqueue(&self, obj: ObjectRef, phase: GcPhase) -> bool;
}

/// Logs every heap object while a SATB marking phase is active.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkingPhasePolicy;

impl SatbPolicy for MarkingPhasePolicy {
    fn should_enqueue(&self, _obj: ObjectRef, phase: GcPhase) -> bool {
        phase.is_satb_marking()
    }
}

impl<F> SatbPolicy for F
where
    F: Fn(ObjectRef, GcPhase) -> bool + Send + Sync,
{
    fn should_enqueue(&self, obj: ObjectRef, phase: GcPhase) -> bool {
        self(obj, phase)
    }
}

/// Identity of a node: its arena slot plus how often the slot was reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    /// Stable slot number assigned when the node was first allocated.
    pub slot: u32,
    /// Incremented every time the node returns from the free pool.
    pub generation: u32,
}

/// A bounded set of objects awaiting re-mark, kept ordered by address.
///
/// Lookups and inserts binary-search the ordered storage, so logging the
/// same object twice costs nothing extra for the marker.
pub struct SatbNode {
    id: NodeId,
    capacity: usize,
    objects: Vec<ObjectRef>,
}

impl SatbNode {
    fn new(slot: u32, capacity: usize) -> Self {
        Self {
            id: NodeId { slot, generation: 0 },
            capacity,
            objects: Vec::with_capacity(capacity),
        }
    }

    /// Identity of this node.
    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.id
    }

    /// Insert `obj`. Returns `false` if it was already present.
    ///
    /// The caller checks [`is_full`](Self::is_full) first.
    pub fn push(&mut self, obj: ObjectRef) -> bool {
        debug_assert!(!self.is_full(), "push into a full SATB node");
        match self.objects.binary_search(&obj) {
            Ok(_) => false,
            Err(pos) => {
                self.objects.insert(pos, obj);
                true
            }
        }
    }

    /// Returns `true` if `obj` is logged in this node.
    #[must_use]
    pub fn contains(&self, obj: ObjectRef) -> bool {
        self.objects.binary_search(&obj).is_ok()
    }

    /// Number of logged objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns `true` if nothing is logged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Returns `true` if no further object fits.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.objects.len() >= self.capacity
    }

    /// Logged objects in address order.
    pub fn iter(&self) -> impl Iterator<Item = ObjectRef> + '_ {
        self.objects.iter().copied()
    }

    /// Drop every logged object without processing it.
    pub fn clear(&mut self) {
        self.objects.clear();
    }
}

impl fmt::Debug for SatbNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SatbNode")
            .field("id", &self.id)
            .field("len", &self.objects.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Process-wide pool of retired and free SATB nodes.
///
/// One instance lives in the [`RuntimeContext`](crate::RuntimeContext).
pub struct SatbBuffer {
    node_capacity: usize,
    next_slot: AtomicU32,
    retired: SegQueue<Box<SatbNode>>,
    free: SegQueue<Box<SatbNode>>,
    counters: SatbCounters,
}

impl SatbBuffer {
    /// Create a pool whose nodes hold `node_capacity` objects each.
    ///
    /// # Panics
    ///
    /// Panics if `node_capacity` is zero.
    #[must_use]
    pub fn new(node_capacity: usize) -> Self {
        assert!(node_capacity > 0, "SATB nodes must hold at least one object");
        Self {
            node_capacity,
            next_slot: AtomicU32::new(0),
            retired: SegQueue::new(),
            free: SegQueue::new(),
            counters: SatbCounters::default(),
        }
    }

    /// Objects per node.
    #[must_use]
    pub const fn node_capacity(&self) -> usize {
        self.node_capacity
    }

    /// Make sure `slot` holds a node with room for one more object.
    ///
    /// A full node is retired first. A replacement comes from the free pool
    /// when possible.
    pub fn ensure_good_node<'a>(&self, slot: &'a mut Option<Box<SatbNode>>) -> &'a mut SatbNode {
        if slot.as_ref().is_some_and(|node| node.is_full()) {
            if let Some(full) = slot.take() {
                self.retire_node(full);
            }
        }
        slot.get_or_insert_with(|| self.allocate_node())
    }

    fn allocate_node(&self) -> Box<SatbNode> {
        if let Some(mut node) = self.free.pop() {
            node.id.generation = node.id.generation.wrapping_add(1);
            return node;
        }
        self.counters.record_allocated();
        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
        Box::new(SatbNode::new(slot, self.node_capacity))
    }

    /// Take ownership of a node a mutator no longer uses.
    ///
    /// Non-empty nodes wait for the marker; empty ones are recycled directly.
    pub fn retire_node(&self, node: Box<SatbNode>) {
        if node.is_empty() {
            self.free.push(node);
            return;
        }
        self.counters.record_retired();
        self.retired.push(node);
    }

    /// Retire whatever node `slot` holds, leaving it empty.
    ///
    /// Returns the number of objects the node carried.
    pub fn retire_node_from(&self, slot: &mut Option<Box<SatbNode>>) -> usize {
        slot.take().map_or(0, |node| {
            let objects = node.len();
            self.retire_node(node);
            objects
        })
    }

    /// Log one object into `slot`, allocating or replacing the node as needed.
    pub fn push(&self, slot: &mut Option<Box<SatbNode>>, obj: ObjectRef) {
        if self.ensure_good_node(slot).push(obj) {
            self.counters.record_remembered();
        }
    }

    /// Hand every retired object to `visit`, then recycle the nodes.
    ///
    /// Returns the number of objects visited. Nodes retired concurrently
    /// with the drain may or may not be included; callers that need a
    /// complete view drain again after the mutators have been flushed.
    #[cfg_attr(not(feature = "tracing"), allow(unused_variables, unused_assignments))]
    pub fn drain_retired(&self, mut visit: impl FnMut(ObjectRef)) -> usize {
        let mut nodes = 0;
        let mut objects = 0;
        while let Some(mut node) = self.retired.pop() {
            nodes += 1;
            objects += node.len();
            node.iter().for_each(&mut visit);
            node.clear();
            self.free.push(node);
        }
        self.counters.record_drained(objects);
        #[cfg(feature = "tracing")]
        crate::log::internal::log_satb_drain(nodes, objects);
        objects
    }

    /// Drop every retired entry without visiting it.
    ///
    /// Only correct once marking has finished and the logged objects are
    /// no longer needed.
    pub fn clear_retired(&self) {
        while let Some(mut node) = self.retired.pop() {
            node.clear();
            self.free.push(node);
        }
    }

    /// Number of nodes waiting to be drained.
    #[must_use]
    pub fn retired_len(&self) -> usize {
        self.retired.len()
    }

    /// Number of nodes ready for reuse.
    #[must_use]
    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    /// Current counters.
    #[must_use]
    pub fn metrics(&self) -> SatbMetrics {
        self.counters.snapshot()
    }
}

impl Default for SatbBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_SATB_NODE_CAPACITY)
    }
}

impl fmt::Debug for SatbBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SatbBuffer")
            .field("node_capacity", &self.node_capacity)
            .field("retired", &self.retired.len())
            .field("free", &self.free.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::ptr::NonNull;

    use super::*;

    fn obj(addr: usize) -> ObjectRef {
        ObjectRef::new(NonNull::new(addr as *mut u8).unwrap())
    }

    #[test]
    fn test_node_keeps_objects_ordered_and_unique() {
        let mut node = SatbNode::new(0, 8);
        assert!(node.push(obj(0x300)));
        assert!(node.push(obj(0x100)));
        assert!(!node.push(obj(0x300)));
        assert!(node.push(obj(0x200)));
        let addrs: Vec<_> = node.iter().map(ObjectRef::addr).collect();
        assert_eq!(addrs, vec![0x100, 0x200, 0x300]);
        assert!(node.contains(obj(0x200)));
    }

    #[test]
    fn test_full_node_is_retired_on_next_push() {
        let buffer = SatbBuffer::new(2);
        let mut slot = None;
        buffer.push(&mut slot, obj(0x10));
        buffer.push(&mut slot, obj(0x20));
        assert_eq!(buffer.retired_len(), 0);
        buffer.push(&mut slot, obj(0x30));
        assert_eq!(buffer.retired_len(), 1);
        assert_eq!(slot.as_ref().map(|n| n.len()), Some(1));
    }

    #[test]
    fn test_drain_visits_every_retired_object_and_recycles() {
        let buffer = SatbBuffer::new(4);
        let mut slot = None;
        for addr in [0x10, 0x20, 0x30] {
            buffer.push(&mut slot, obj(addr));
        }
        buffer.retire_node(slot.take().unwrap());

        let mut seen = Vec::new();
        assert_eq!(buffer.drain_retired(|o| seen.push(o.addr())), 3);
        assert_eq!(seen, vec![0x10, 0x20, 0x30]);
        assert_eq!(buffer.retired_len(), 0);
        assert_eq!(buffer.free_len(), 1);

        let reused = buffer.ensure_good_node(&mut slot);
        assert_eq!(reused.id().generation, 1);
        assert!(reused.is_empty());
    }

    #[test]
    fn test_empty_node_skips_retired_queue() {
        let buffer = SatbBuffer::new(4);
        let mut slot = None;
        buffer.ensure_good_node(&mut slot);
        buffer.retire_node(slot.take().unwrap());
        assert_eq!(buffer.retired_len(), 0);
        assert_eq!(buffer.free_len(), 1);
    }

    #[test]
    fn test_clear_retired_drops_entries() {
        let buffer = SatbBuffer::new(4);
        let mut slot = None;
        buffer.push(&mut slot, obj(0x10));
        buffer.retire_node(slot.take().unwrap());
        buffer.clear_retired();
        assert_eq!(buffer.drain_retired(|_| panic!("cleared")), 0);
    }

    #[test]
    fn test_metrics_count_traffic() {
        let buffer = SatbBuffer::new(1);
        let mut slot = None;
        buffer.push(&mut slot, obj(0x10));
        buffer.push(&mut slot, obj(0x20));
        buffer.retire_node(slot.take().unwrap());
        buffer.drain_retired(|_| {});
        let metrics = buffer.metrics();
        assert_eq!(metrics.objects_remembered, 2);
        assert_eq!(metrics.nodes_retired, 2);
        assert_eq!(metrics.nodes_allocated, 2);
        assert_eq!(metrics.objects_drained, 2);
    }
}
