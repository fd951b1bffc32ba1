//! Concurrent 8-way hash trie keyed by 32-bit hashes.
//!
//! Each level consumes [`N_CHILDREN_LOG2`] bits of the hash, starting at the
//! low bits, so a path is at most 11 levels deep. Entries whose full hashes
//! are equal are chained through their `overflow` link instead of growing
//! the trie.
//!
//! # Concurrency
//!
//! - Readers never lock. Every child slot and overflow link is read with an
//!   acquire load and written with a release store, and nodes are fully
//!   built before they are linked in.
//! - One mutex per map serialises structural changes (publishing entries,
//!   expanding a slot into a subtree, weak sweeps). A [`StructureGuard`] is
//!   the proof of holding it.
//! - Readers announce themselves through [`HashTrieMapInUseScope`], which
//!   ends with a `SeqCst` fence. A sweep unlinks with a `SeqCst` store and
//!   then reads the count, and frees an unlinked node immediately only if
//!   no reader is in flight; otherwise the node is parked until a later
//!   sweep (or [`HashTrieMap::reclaim_deferred`]) observes the count at
//!   zero.
//! - Inserts never trust a lock-free lookup: the slot is located again
//!   under the lock.
//!
//! Values are raw, non-owning pointers: the map owns its nodes, never the
//! objects they refer to.

use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{fence, AtomicPtr, AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::log::fatal;

/// Hash bits consumed per level.
pub const N_CHILDREN_LOG2: u32 = 3;
/// Fan-out of an indirect node.
pub const N_CHILDREN: usize = 1 << N_CHILDREN_LOG2;
/// Largest shift at which a level still has hash bits to consume.
const MAX_SHIFT: u32 = 30;

enum Node<T> {
    Entry(Entry<T>),
    Indirect(Indirect<T>),
}

impl<T> Node<T> {
    fn as_entry(&self) -> &Entry<T> {
        match self {
            Self::Entry(entry) => entry,
            Self::Indirect(_) => fatal!("hash trie node is an indirect, expected an entry"),
        }
    }

    fn as_indirect(&self) -> &Indirect<T> {
        match self {
            Self::Indirect(indirect) => indirect,
            Self::Entry(_) => fatal!("hash trie node is an entry, expected an indirect"),
        }
    }
}

struct Entry<T> {
    hash: u32,
    value: AtomicPtr<T>,
    overflow: AtomicPtr<Node<T>>,
}

impl<T> Entry<T> {
    fn new(hash: u32, value: NonNull<T>) -> Self {
        Self {
            hash,
            value: AtomicPtr::new(value.as_ptr()),
            overflow: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Walk this entry and its overflow chain for a match.
    fn find(&self, hash: u32, eq: &mut impl FnMut(NonNull<T>) -> bool) -> Option<NonNull<T>> {
        let mut entry = self;
        loop {
            if entry.hash == hash {
                if let Some(value) = NonNull::new(entry.value.load(Ordering::Acquire)) {
                    if eq(value) {
                        return Some(value);
                    }
                }
            }
            let next = entry.overflow.load(Ordering::Acquire);
            if next.is_null() {
                return None;
            }
            // SAFETY: Linked nodes stay allocated while a reader is in scope.
            entry = unsafe { &*next }.as_entry();
        }
    }
}

struct Indirect<T> {
    children: [AtomicPtr<Node<T>>; N_CHILDREN],
}

impl<T> Indirect<T> {
    fn new() -> Self {
        Self {
            children: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
        }
    }
}

const fn child_index(hash: u32, shift: u32) -> usize {
    ((hash >> shift) as usize) & (N_CHILDREN - 1)
}

/// Decides whether a weakly held value survived collection.
///
/// Returns `false` if the referent died. A surviving referent that moved
/// may be updated in place through `field`.
pub trait WeakRefFieldVisitor<T> {
    /// Visit one value slot.
    fn visit(&self, field: &AtomicPtr<T>) -> bool;
}

impl<T, F> WeakRefFieldVisitor<T> for F
where
    F: Fn(&AtomicPtr<T>) -> bool,
{
    fn visit(&self, field: &AtomicPtr<T>) -> bool {
        self(field)
    }
}

/// Outcome of a weak sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepCounts {
    /// Entries whose referent died and that were unlinked.
    pub swept: usize,
    /// Entries whose referent survived.
    pub kept: usize,
    /// Empty indirect nodes removed from the trie.
    pub pruned: usize,
    /// Unlinked nodes parked because readers were in flight.
    pub deferred: usize,
}

impl std::ops::AddAssign for SweepCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.swept += rhs.swept;
        self.kept += rhs.kept;
        self.pruned += rhs.pruned;
        self.deferred += rhs.deferred;
    }
}

struct RetiredNode<T>(NonNull<Node<T>>);

// SAFETY: A retired node is unreachable from the trie and only freed by
// whoever holds the retired list's lock.
unsafe impl<T> Send for RetiredNode<T> {}

/// Concurrent hash trie map from 32-bit hashes to raw value pointers.
pub struct HashTrieMap<T> {
    root: Indirect<T>,
    lock: Mutex<()>,
    inuse_count: AtomicUsize,
    retired: Mutex<Vec<RetiredNode<T>>>,
    len: AtomicUsize,
}

/// Marks a reader as in flight for its lifetime.
///
/// Nodes unlinked while any scope is alive are not freed until every scope
/// has ended.
pub struct HashTrieMapInUseScope<'a, T> {
    map: &'a HashTrieMap<T>,
}

impl<T> Drop for HashTrieMapInUseScope<'_, T> {
    fn drop(&mut self) {
        self.map.inuse_count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Proof of holding a map's structural lock.
pub struct StructureGuard<'a, T> {
    map: &'a HashTrieMap<T>,
    _guard: MutexGuard<'a, ()>,
}

/// Result of a lookup plus the slot an insert would use.
///
/// Tied to an in-use scope, so the slot it names cannot be freed while the
/// result exists.
pub struct LoadResult<'a, T> {
    value: Option<NonNull<T>>,
    parent: &'a Indirect<T>,
    shift: u32,
    index: usize,
    observed: *mut Node<T>,
}

impl<T> LoadResult<'_, T> {
    /// The matching value, if the lookup hit.
    #[must_use]
    pub const fn value(&self) -> Option<NonNull<T>> {
        self.value
    }

    /// Shift of the level the lookup stopped at.
    #[must_use]
    pub const fn shift(&self) -> u32 {
        self.shift
    }

    /// Child index the lookup stopped at.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }
}

impl<T> fmt::Debug for LoadResult<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadResult")
            .field("value", &self.value)
            .field("shift", &self.shift)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

impl<T> HashTrieMap<T> {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: Indirect::new(),
            lock: Mutex::new(()),
            inuse_count: AtomicUsize::new(0),
            retired: Mutex::new(Vec::new()),
            len: AtomicUsize::new(0),
        }
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Returns `true` if the map holds no entry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Announce a reader.
    pub fn in_use_scope(&self) -> HashTrieMapInUseScope<'_, T> {
        self.inuse_count.fetch_add(1, Ordering::SeqCst);
        // Pairs with the SeqCst unlink store and count load in a sweep:
        // either the sweep sees this reader or the reader's slot loads see
        // the unlink.
        fence(Ordering::SeqCst);
        HashTrieMapInUseScope { map: self }
    }

    /// Number of readers in flight.
    #[must_use]
    pub fn inuse_count(&self) -> usize {
        self.inuse_count.load(Ordering::SeqCst)
    }

    /// Take the structural lock.
    pub fn lock(&self) -> StructureGuard<'_, T> {
        StructureGuard {
            map: self,
            _guard: self.lock.lock(),
        }
    }

    fn check_guard(&self, guard: &StructureGuard<'_, T>) {
        if !ptr::eq(guard.map, self) {
            fatal!("hash trie structure guard belongs to another map");
        }
    }

    /// Find the value stored under `hash` for which `eq` holds.
    pub fn load(&self, hash: u32, mut eq: impl FnMut(NonNull<T>) -> bool) -> Option<NonNull<T>> {
        let _scope = self.in_use_scope();
        self.descend(hash, &mut eq).value
    }

    /// Like [`load`](Self::load), also reporting where an insert would go.
    pub fn load_with_descriptor<'a>(
        &'a self,
        scope: &HashTrieMapInUseScope<'a, T>,
        hash: u32,
        mut eq: impl FnMut(NonNull<T>) -> bool,
    ) -> LoadResult<'a, T> {
        debug_assert!(ptr::eq(scope.map, self));
        self.descend(hash, &mut eq)
    }

    fn descend(&self, hash: u32, eq: &mut impl FnMut(NonNull<T>) -> bool) -> LoadResult<'_, T> {
        let mut parent = &self.root;
        let mut shift = 0;
        loop {
            if shift > MAX_SHIFT {
                fatal!("hash trie: hash bits exhausted while looking up {hash:#010x}");
            }
            let index = child_index(hash, shift);
            let child = parent.children[index].load(Ordering::Acquire);
            if child.is_null() {
                return LoadResult {
                    value: None,
                    parent,
                    shift,
                    index,
                    observed: child,
                };
            }
            // SAFETY: Linked nodes stay allocated while a reader is in scope.
            match unsafe { &*child } {
                Node::Indirect(indirect) => {
                    parent = indirect;
                    shift += N_CHILDREN_LOG2;
                }
                Node::Entry(entry) => {
                    return LoadResult {
                        value: entry.find(hash, eq),
                        parent,
                        shift,
                        index,
                        observed: child,
                    };
                }
            }
        }
    }

    /// Insert the loader's value for `hash`, unless a matching value
    /// appears first.
    ///
    /// A hit in `result` is returned as is. Otherwise the lookup is redone
    /// under the lock: `result` was taken lock-free and may name a level
    /// that a sweep has unlinked since. `loader` runs at most once, under
    /// the lock, and only when no match exists. Returns the value now
    /// stored for the key.
    pub fn store_or_load<'a>(
        &'a self,
        guard: &StructureGuard<'a, T>,
        scope: &HashTrieMapInUseScope<'a, T>,
        hash: u32,
        result: LoadResult<'a, T>,
        mut eq: impl FnMut(NonNull<T>) -> bool,
        loader: impl FnOnce() -> NonNull<T>,
    ) -> NonNull<T> {
        self.check_guard(guard);
        debug_assert!(ptr::eq(scope.map, self));
        if let Some(value) = result.value {
            return value;
        }
        // The structure cannot change while the lock is held.
        let result = self.descend(hash, &mut eq);
        if let Some(value) = result.value {
            return value;
        }

        let slot = &result.parent.children[result.index];
        let current = result.observed;
        let value = loader();
        let new_node = Box::into_raw(Box::new(Node::Entry(Entry::new(hash, value))));
        if current.is_null() {
            slot.store(new_node, Ordering::Release);
        } else {
            // SAFETY: `current` is linked and we hold the lock.
            let old = unsafe { &*current }.as_entry();
            if old.hash == hash {
                // SAFETY: `new_node` is not published yet.
                unsafe { &*new_node }
                    .as_entry()
                    .overflow
                    .store(current, Ordering::Relaxed);
                slot.store(new_node, Ordering::Release);
            } else {
                let subtree = Self::expand(
                    current,
                    old.hash,
                    new_node,
                    hash,
                    result.shift + N_CHILDREN_LOG2,
                );
                slot.store(subtree, Ordering::Release);
            }
        }
        self.len.fetch_add(1, Ordering::Relaxed);
        value
    }

    /// Build the subtree that separates two entries with different hashes,
    /// starting at `shift`.
    fn expand(
        old_entry: *mut Node<T>,
        old_hash: u32,
        new_entry: *mut Node<T>,
        new_hash: u32,
        mut shift: u32,
    ) -> *mut Node<T> {
        let top = Box::into_raw(Box::new(Node::Indirect(Indirect::new())));
        // SAFETY: Nodes of the subtree are private until it is published.
        let mut current = unsafe { &*top }.as_indirect();
        loop {
            if shift > MAX_SHIFT {
                fatal!(
                    "hash trie: hash bits exhausted expanding {old_hash:#010x} and {new_hash:#010x}"
                );
            }
            let old_index = child_index(old_hash, shift);
            let new_index = child_index(new_hash, shift);
            if old_index != new_index {
                current.children[old_index].store(old_entry, Ordering::Relaxed);
                current.children[new_index].store(new_entry, Ordering::Relaxed);
                return top;
            }
            let next = Box::into_raw(Box::new(Node::Indirect(Indirect::new())));
            current.children[old_index].store(next, Ordering::Relaxed);
            // SAFETY: See above.
            current = unsafe { &*next }.as_indirect();
            shift += N_CHILDREN_LOG2;
        }
    }

    /// Find the value for `hash` matching `eq`, inserting the loader's
    /// value if there is none.
    pub fn load_or_store(
        &self,
        hash: u32,
        mut eq: impl FnMut(NonNull<T>) -> bool,
        loader: impl FnOnce() -> NonNull<T>,
    ) -> NonNull<T> {
        let scope = self.in_use_scope();
        let result = self.load_with_descriptor(&scope, hash, &mut eq);
        if let Some(value) = result.value {
            return value;
        }
        let guard = self.lock();
        self.store_or_load(&guard, &scope, hash, result, eq, loader)
    }

    /// Weak sweep of the subtree under root slot `index`.
    ///
    /// Entries the visitor reports dead are unlinked; indirect nodes left
    /// empty are removed when no reader is in flight.
    ///
    /// # Safety
    ///
    /// No other sweep may run on the same `index` concurrently. Sweeps on
    /// distinct indices may run in parallel under one guard.
    pub unsafe fn clear_node_from_gc(
        &self,
        guard: &StructureGuard<'_, T>,
        index: usize,
        visitor: &impl WeakRefFieldVisitor<T>,
    ) -> SweepCounts {
        self.check_guard(guard);
        let mut counts = SweepCounts::default();
        self.clear_slot(&self.root.children[index], visitor, &mut counts);
        let swept = counts.swept;
        self.len.fetch_sub(swept, Ordering::Relaxed);
        counts
    }

    /// Serial weak sweep of the whole map. Takes the structural lock.
    pub fn sweep_weak(&self, visitor: &impl WeakRefFieldVisitor<T>) -> SweepCounts {
        let guard = self.lock();
        let mut counts = SweepCounts::default();
        for index in 0..N_CHILDREN {
            // SAFETY: Single-threaded pass over distinct indices.
            counts += unsafe { self.clear_node_from_gc(&guard, index, visitor) };
        }
        self.reclaim_deferred();
        counts
    }

    /// Returns `true` if the slot is empty afterwards.
    fn clear_slot(
        &self,
        slot: &AtomicPtr<Node<T>>,
        visitor: &impl WeakRefFieldVisitor<T>,
        counts: &mut SweepCounts,
    ) -> bool {
        let child = slot.load(Ordering::Acquire);
        if child.is_null() {
            return true;
        }
        // SAFETY: Sweeps hold the structural lock, so nothing frees `child`.
        match unsafe { &*child } {
            Node::Indirect(indirect) => {
                let mut all_empty = true;
                for grandchild in &indirect.children {
                    all_empty &= self.clear_slot(grandchild, visitor, counts);
                }
                if all_empty && self.inuse_count() == 0 {
                    slot.store(ptr::null_mut(), Ordering::SeqCst);
                    counts.pruned += 1;
                    self.retire(child, counts);
                    return true;
                }
                false
            }
            Node::Entry(_) => {
                let mut link = slot;
                loop {
                    let current = link.load(Ordering::Acquire);
                    if current.is_null() {
                        break;
                    }
                    // SAFETY: As above.
                    let entry = unsafe { &*current }.as_entry();
                    if visitor.visit(&entry.value) {
                        counts.kept += 1;
                        link = &entry.overflow;
                    } else {
                        let next = entry.overflow.load(Ordering::Acquire);
                        link.store(next, Ordering::SeqCst);
                        counts.swept += 1;
                        self.retire(current, counts);
                    }
                }
                slot.load(Ordering::Acquire).is_null()
            }
        }
    }

    /// Free an unlinked node now, or park it while readers are in flight.
    fn retire(&self, node: *mut Node<T>, counts: &mut SweepCounts) {
        // The unlink store and this load are both SeqCst: a reader that
        // starts after this load can no longer reach `node`.
        if self.inuse_count() == 0 {
            // SAFETY: Unlinked, and no reader can still hold it.
            drop(unsafe { Box::from_raw(node) });
        } else if let Some(node) = NonNull::new(node) {
            counts.deferred += 1;
            self.retired.lock().push(RetiredNode(node));
        }
    }

    /// Free parked nodes if no reader is in flight. Returns how many were
    /// freed.
    pub fn reclaim_deferred(&self) -> usize {
        let mut retired = self.retired.lock();
        if retired.is_empty() || self.inuse_count() != 0 {
            return 0;
        }
        let freed = retired.len();
        for RetiredNode(node) in retired.drain(..) {
            // SAFETY: Unlinked before the in-use count was seen at zero.
            drop(unsafe { Box::from_raw(node.as_ptr()) });
        }
        freed
    }

    /// Number of unlinked nodes waiting to be freed.
    #[must_use]
    pub fn deferred_len(&self) -> usize {
        self.retired.lock().len()
    }

    /// Number of indirect levels on the longest path, counting the root.
    #[must_use]
    pub fn height(&self) -> usize {
        fn level<T>(indirect: &Indirect<T>) -> usize {
            let deepest = indirect
                .children
                .iter()
                .filter_map(|child| {
                    // SAFETY: Caller holds an in-use scope.
                    let node = unsafe { child.load(Ordering::Acquire).as_ref() }?;
                    match node {
                        Node::Indirect(inner) => Some(level(inner)),
                        Node::Entry(_) => None,
                    }
                })
                .max()
                .unwrap_or(0);
            deepest + 1
        }
        let _scope = self.in_use_scope();
        level(&self.root)
    }

    /// Call `visit` on every stored value.
    pub fn for_each_value(&self, mut visit: impl FnMut(NonNull<T>)) {
        fn walk<T>(slot: &AtomicPtr<Node<T>>, visit: &mut impl FnMut(NonNull<T>)) {
            // SAFETY: Caller holds an in-use scope.
            let Some(node) = (unsafe { slot.load(Ordering::Acquire).as_ref() }) else {
                return;
            };
            match node {
                Node::Indirect(indirect) => {
                    for child in &indirect.children {
                        walk(child, visit);
                    }
                }
                Node::Entry(entry) => {
                    let mut entry = entry;
                    loop {
                        if let Some(value) = NonNull::new(entry.value.load(Ordering::Acquire)) {
                            visit(value);
                        }
                        // SAFETY: As above.
                        match unsafe { entry.overflow.load(Ordering::Acquire).as_ref() } {
                            Some(next) => entry = next.as_entry(),
                            None => break,
                        }
                    }
                }
            }
        }
        let _scope = self.in_use_scope();
        for child in &self.root.children {
            walk(child, &mut visit);
        }
    }
}

impl<T> Default for HashTrieMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Free a linked subtree. Only valid once nothing can reach it.
unsafe fn free_subtree<T>(node: *mut Node<T>) {
    if node.is_null() {
        return;
    }
    // SAFETY: The caller owns the subtree.
    let node = unsafe { Box::from_raw(node) };
    match &*node {
        Node::Indirect(indirect) => {
            for child in &indirect.children {
                // SAFETY: Children are owned by their parent.
                unsafe { free_subtree(child.load(Ordering::Relaxed)) };
            }
        }
        Node::Entry(entry) => {
            // SAFETY: The overflow successor is owned by its predecessor.
            unsafe { free_subtree(entry.overflow.load(Ordering::Relaxed)) };
        }
    }
}

impl<T> Drop for HashTrieMap<T> {
    fn drop(&mut self) {
        for child in &self.root.children {
            // SAFETY: `&mut self` proves no reader or sweep is running.
            unsafe { free_subtree(child.load(Ordering::Relaxed)) };
        }
        for RetiredNode(node) in self.retired.get_mut().drain(..) {
            // SAFETY: Retired nodes are unlinked and freed one by one.
            drop(unsafe { Box::from_raw(node.as_ptr()) });
        }
    }
}

impl<T> fmt::Debug for HashTrieMap<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashTrieMap")
            .field("len", &self.len())
            .field("inuse_count", &self.inuse_count())
            .field("deferred", &self.deferred_len())
            .finish_non_exhaustive()
    }
}
