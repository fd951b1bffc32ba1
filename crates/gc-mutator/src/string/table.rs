//! The string interning table.
//!
//! [`BaseStringTable`] maps string content to one canonical heap string.
//! Lookups are lock-free; creating a canonical string happens under the
//! trie's structural lock, so concurrent interning of equal content
//! allocates exactly once.
//!
//! Entries are weak: the collector sweeps them through
//! [`BaseStringTableCleaner`](super::BaseStringTableCleaner). A lookup that
//! hits while the collector is marking logs the canonical string into the
//! caller's SATB buffer, so a string that was only reachable from the table
//! survives once a mutator picks it up again.
//!
//! Every operation runs with the caller outside its saferegion. A caller
//! that is in one leaves it for the duration of the call (answering
//! pending suspension requests) and is put back afterwards.
//!
//! String fields are read through the table's [`ReadBarrier`], so a moving
//! collector can forward tree and slice children before they are compared.

use std::fmt;
use std::sync::Arc;

use super::base_string::{
    can_be_compressed_utf16, can_be_compressed_utf8, create_line_string, create_tree_string,
    BaseString, NoReadBarrier, ReadBarrier, StringContent, StringKind, StringRef,
};
use super::hash_trie_map::{HashTrieMap, StructureGuard};
use crate::context::RuntimeContext;
use crate::log::fatal;
use crate::metrics::{StringTableCounters, StringTableMetrics};
use crate::mutator::{Mutator, ScopedLeaveSaferegion};

/// A rooted reference to a freshly created string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StringHandle {
    string: StringRef,
}

impl StringHandle {
    /// Wrap a string the handle creator has rooted.
    #[must_use]
    pub const fn new(string: StringRef) -> Self {
        Self { string }
    }

    /// The string, at its current address.
    #[must_use]
    pub const fn get(self) -> StringRef {
        self.string
    }
}

/// Roots a string across the window between allocation and publication.
///
/// The runtime decides what a handle is (a handle scope slot, a stack
/// root); the table only needs the rooted string back.
pub trait HandleCreator: Send + Sync {
    /// Root `string` on behalf of `mutator`.
    fn create_handle(&self, mutator: &Mutator, string: StringRef) -> StringHandle;
}

/// Roots through the mutator's raw object slot.
///
/// The slot holds the most recently created string until the next one
/// replaces it or the mutator is reset.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawSlotHandleCreator;

impl HandleCreator for RawSlotHandleCreator {
    fn create_handle(&self, mutator: &Mutator, string: StringRef) -> StringHandle {
        mutator.set_raw_object(Some(string.object()));
        StringHandle::new(string)
    }
}

/// Weak table of canonical strings.
pub struct BaseStringTable<H = RawSlotHandleCreator, B = NoReadBarrier> {
    context: Arc<RuntimeContext>,
    map: HashTrieMap<BaseString>,
    handle_creator: H,
    barrier: B,
    counters: StringTableCounters,
}

impl BaseStringTable {
    /// Create an empty table rooting new strings through the mutator's raw
    /// object slot.
    #[must_use]
    pub fn new(context: Arc<RuntimeContext>) -> Self {
        Self::with_handle_creator(context, RawSlotHandleCreator)
    }
}

impl<H: HandleCreator> BaseStringTable<H> {
    /// Create an empty table with an injected handle creator.
    #[must_use]
    pub fn with_handle_creator(context: Arc<RuntimeContext>, handle_creator: H) -> Self {
        Self {
            context,
            map: HashTrieMap::new(),
            handle_creator,
            barrier: NoReadBarrier,
            counters: StringTableCounters::default(),
        }
    }

    /// Read string fields through `barrier` from now on.
    ///
    /// Meant to be called while the table is still empty, before it is
    /// shared.
    #[must_use]
    pub fn with_read_barrier<R: ReadBarrier>(self, barrier: R) -> BaseStringTable<H, R> {
        BaseStringTable {
            context: self.context,
            map: self.map,
            handle_creator: self.handle_creator,
            barrier,
            counters: self.counters,
        }
    }
}

impl<H: HandleCreator, B: ReadBarrier> BaseStringTable<H, B> {
    /// The barrier string fields are read through.
    #[must_use]
    pub const fn read_barrier(&self) -> &B {
        &self.barrier
    }

    /// The runtime this table allocates from.
    #[must_use]
    pub const fn context(&self) -> &Arc<RuntimeContext> {
        &self.context
    }

    pub(crate) const fn map(&self) -> &HashTrieMap<BaseString> {
        &self.map
    }

    pub(crate) const fn counters(&self) -> &StringTableCounters {
        &self.counters
    }

    /// Number of canonical strings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if nothing is interned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Current counters.
    #[must_use]
    pub fn metrics(&self) -> StringTableMetrics {
        self.counters.snapshot()
    }

    /// Canonical string for UTF-8 `data`.
    ///
    /// With `can_be_compress` the bytes are stored one per code unit;
    /// otherwise they are decoded to UTF-16.
    pub fn get_or_intern_string_utf8(
        &self,
        mutator: &Mutator,
        data: &[u8],
        can_be_compress: bool,
    ) -> StringRef {
        debug_assert!(!can_be_compress || can_be_compressed_utf8(data));
        let _running = ScopedLeaveSaferegion::new(mutator);
        self.get_or_intern_content(mutator, &StringContent::from_utf8(data, can_be_compress))
    }

    /// Canonical string for UTF-16 `data`.
    pub fn get_or_intern_string_utf16(
        &self,
        mutator: &Mutator,
        data: &[u16],
        can_be_compress: bool,
    ) -> StringRef {
        debug_assert!(!can_be_compress || can_be_compressed_utf16(data));
        let _running = ScopedLeaveSaferegion::new(mutator);
        self.get_or_intern_content(mutator, &StringContent::from_utf16(data, can_be_compress))
    }

    /// Canonical string equal to `string`.
    ///
    /// On a miss a flat `string` becomes the canonical copy itself; tree
    /// and sliced strings are flattened into a new line string first.
    pub fn get_or_intern_existing(&self, mutator: &Mutator, string: StringRef) -> StringRef {
        if string.is_interned() {
            return string;
        }
        let _running = ScopedLeaveSaferegion::new(mutator);
        let handle = self.handle_creator.create_handle(mutator, string);
        let content = handle.get().content(&self.barrier);
        if handle.get().kind() != StringKind::Line {
            return self.get_or_intern_content(mutator, &content);
        }
        self.intern_with(mutator, &content, || {
            let string = handle.get();
            string.set_interned();
            string
        })
    }

    /// Canonical string for the concatenation of `first` and `second`.
    pub fn get_or_intern_concat(
        &self,
        mutator: &Mutator,
        first: StringRef,
        second: StringRef,
    ) -> StringRef {
        let _running = ScopedLeaveSaferegion::new(mutator);
        let first = self.handle_creator.create_handle(mutator, first);
        let second = self.handle_creator.create_handle(mutator, second);
        let tree = create_tree_string(self.context.allocator(), first.get(), second.get())
            .unwrap_or_else(|| fatal!("string table: heap exhausted building a concatenation"));
        let content = tree.content(&self.barrier);
        self.get_or_intern_content(mutator, &content)
    }

    /// Canonical string for `len` code units of `string` starting at
    /// `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds.
    pub fn get_or_intern_substring(
        &self,
        mutator: &Mutator,
        string: StringRef,
        offset: usize,
        len: usize,
    ) -> StringRef {
        assert!(offset + len <= string.len(), "substring out of bounds");
        let _running = ScopedLeaveSaferegion::new(mutator);
        let source = self.handle_creator.create_handle(mutator, string);
        let content = source.get().content(&self.barrier).substring(offset, len);
        self.get_or_intern_content(mutator, &content)
    }

    /// The canonical string equal to `string`, if one exists.
    pub fn try_get_intern_string(&self, mutator: &Mutator, string: StringRef) -> Option<StringRef> {
        if string.is_interned() {
            return Some(string);
        }
        let _running = ScopedLeaveSaferegion::new(mutator);
        let content = string.content(&self.barrier);
        let found = self.lookup(&content);
        match found {
            Some(canonical) => {
                self.counters.record_hit();
                mutator.remember_object_in_satb_buffer(canonical.object());
            }
            None => self.counters.record_miss(),
        }
        found
    }

    fn lookup(&self, content: &StringContent<'_>) -> Option<StringRef> {
        let hash = content.hash();
        self.map
            .load(hash, |candidate| self.matches(candidate, content))
            // SAFETY: The table only stores live string objects.
            .map(|ptr| unsafe { StringRef::from_raw(ptr) })
    }

    fn matches(&self, candidate: std::ptr::NonNull<BaseString>, content: &StringContent<'_>) -> bool {
        // SAFETY: The table only stores live string objects.
        let candidate = unsafe { StringRef::from_raw(candidate) };
        candidate.len() == content.len() && candidate.content(&self.barrier) == *content
    }

    fn get_or_intern_content(&self, mutator: &Mutator, content: &StringContent<'_>) -> StringRef {
        self.intern_with(mutator, content, || {
            let string = create_line_string(self.context.allocator(), content)
                .unwrap_or_else(|| {
                    fatal!(
                        "string table: heap exhausted interning a string of {} code units",
                        content.len()
                    )
                });
            let string = self.handle_creator.create_handle(mutator, string).get();
            string.set_interned();
            string
        })
    }

    /// Find the canonical string for `content`, publishing the result of
    /// `create` on a miss.
    fn intern_with(
        &self,
        mutator: &Mutator,
        content: &StringContent<'_>,
        create: impl FnOnce() -> StringRef,
    ) -> StringRef {
        let hash = content.hash();
        let scope = self.map.in_use_scope();
        let result = self
            .map
            .load_with_descriptor(&scope, hash, |candidate| self.matches(candidate, content));
        if let Some(found) = result.value() {
            // SAFETY: The table only stores live string objects.
            let found = unsafe { StringRef::from_raw(found) };
            self.counters.record_hit();
            mutator.remember_object_in_satb_buffer(found.object());
            return found;
        }
        self.counters.record_miss();

        let guard = self.lock_in_saferegion(mutator);
        let mut created = false;
        let stored = self.map.store_or_load(
            &guard,
            &scope,
            hash,
            result,
            |candidate| self.matches(candidate, content),
            || {
                created = true;
                create().as_non_null()
            },
        );
        drop(guard);
        // SAFETY: The table only stores live string objects.
        let stored = unsafe { StringRef::from_raw(stored) };
        if created {
            self.counters.record_created();
        } else {
            mutator.remember_object_in_satb_buffer(stored.object());
        }
        stored
    }

    /// Take the structural lock without ever blocking a stop-the-world
    /// request.
    ///
    /// The running mutator waits for the lock inside a saferegion. Once it
    /// has the lock it leaves the saferegion; if a suspension request
    /// arrived in the meantime, it releases the lock before answering it
    /// and retries.
    fn lock_in_saferegion(&self, mutator: &Mutator) -> StructureGuard<'_, BaseString> {
        loop {
            mutator.enter_saferegion(true);
            let guard = self.map.lock();
            mutator.do_leave_saferegion();
            if !mutator.has_any_suspension_request() {
                return guard;
            }
            drop(guard);
            mutator.handle_suspension();
        }
    }
}

impl<H, B> fmt::Debug for BaseStringTable<H, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseStringTable")
            .field("len", &self.map.len())
            .field("metrics", &self.counters.snapshot())
            .finish_non_exhaustive()
    }
}
