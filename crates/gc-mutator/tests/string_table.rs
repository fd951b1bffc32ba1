//! Integration tests for string interning.

use std::collections::HashSet;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use gc_mutator::string::base_string::{
    create_line_string, create_sliced_string, create_tree_string,
};
use gc_mutator::string::{
    BaseString, NoReadBarrier, ReadBarrier, StringContent, StringKind,
};
use gc_mutator::{
    Allocator, BaseStringTable, GcPhase, HeapRange, ObjectKind, RegionAllocator, RuntimeConfig,
    RuntimeContext, StringRef, ThreadHolder,
};

/// Counts line string allocations on top of a region allocator.
struct CountingAllocator {
    inner: RegionAllocator,
    line_strings: AtomicUsize,
}

impl CountingAllocator {
    fn new(size: usize) -> Self {
        Self {
            inner: RegionAllocator::new(size),
            line_strings: AtomicUsize::new(0),
        }
    }

    fn line_strings(&self) -> usize {
        self.line_strings.load(Ordering::SeqCst)
    }
}

impl Allocator for CountingAllocator {
    fn allocate(&self, size: usize, kind: ObjectKind) -> Option<NonNull<u8>> {
        if kind == ObjectKind::LineString {
            self.line_strings.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.allocate(size, kind)
    }

    fn heap_range(&self) -> HeapRange {
        self.inner.heap_range()
    }
}

fn counting_context(heap_size: usize) -> (Arc<RuntimeContext>, Arc<CountingAllocator>) {
    let allocator = Arc::new(CountingAllocator::new(heap_size));
    let ctx = RuntimeContext::builder(RuntimeConfig::default())
        .allocator(allocator.clone())
        .build();
    (ctx, allocator)
}

fn line(ctx: &RuntimeContext, text: &str) -> StringRef {
    create_line_string(ctx.allocator(), &StringContent::from_utf8(text.as_bytes(), true)).unwrap()
}

#[test]
fn test_prefixes_intern_to_distinct_entries() {
    let (ctx, _) = counting_context(64 * 1024);
    let holder = ThreadHolder::register(&ctx);
    let mutator = holder.mutator();
    mutator.leave_saferegion();
    let table = BaseStringTable::new(Arc::clone(&ctx));

    let a = table.get_or_intern_string_utf8(mutator, b"a", true);
    let ab = table.get_or_intern_string_utf8(mutator, b"ab", true);
    let abc = table.get_or_intern_string_utf8(mutator, b"abc", true);
    assert_eq!(table.len(), 3);
    assert_ne!(a, ab);
    assert_ne!(ab, abc);

    let lookup = line(&ctx, "ab");
    assert_ne!(lookup, ab);
    assert_eq!(table.try_get_intern_string(mutator, lookup), Some(ab));
    assert_eq!(table.try_get_intern_string(mutator, line(&ctx, "abcd")), None);

    let metrics = table.metrics();
    assert_eq!(metrics.created, 3);
    assert_eq!(metrics.hits, 1);
    assert_eq!(metrics.misses, 4);

    mutator.enter_saferegion(true);
    ThreadHolder::unregister();
}

#[test]
fn test_utf8_and_utf16_inputs_share_canonical_string() {
    let (ctx, _) = counting_context(64 * 1024);
    let holder = ThreadHolder::register(&ctx);
    let mutator = holder.mutator();
    let table = BaseStringTable::new(Arc::clone(&ctx));

    let from_utf8 = table.get_or_intern_string_utf8(mutator, b"runtime", true);
    let units: Vec<u16> = "runtime".encode_utf16().collect();
    let from_utf16 = table.get_or_intern_string_utf16(mutator, &units, true);
    assert_eq!(from_utf8, from_utf16);
    assert!(from_utf8.is_interned());
    assert!(from_utf8.is_compressed());

    let wide: Vec<u16> = "h\u{e9}llo".encode_utf16().collect();
    let first = table.get_or_intern_string_utf16(mutator, &wide, false);
    let second = table.get_or_intern_string_utf8(mutator, "h\u{e9}llo".as_bytes(), false);
    assert_eq!(first, second);
    assert!(!first.is_compressed());
    assert_eq!(table.len(), 2);
    ThreadHolder::unregister();
}

#[test]
fn test_existing_strings_of_every_kind_canonicalize() {
    let (ctx, _) = counting_context(64 * 1024);
    let holder = ThreadHolder::register(&ctx);
    let mutator = holder.mutator();
    let table = BaseStringTable::new(Arc::clone(&ctx));

    let hello = line(&ctx, "hello");
    let canonical = table.get_or_intern_existing(mutator, hello);
    assert_eq!(canonical, hello, "a line string is interned in place");
    assert!(hello.is_interned());

    let world = line(&ctx, " world");
    let joined = table.get_or_intern_concat(mutator, hello, world);
    assert_eq!(joined.kind(), StringKind::Line);
    assert_eq!(
        joined,
        table.get_or_intern_string_utf8(mutator, b"hello world", true)
    );

    let slice = create_sliced_string(ctx.allocator(), joined, 6, 5).unwrap();
    let from_slice = table.get_or_intern_existing(mutator, slice);
    assert_ne!(from_slice, slice);
    assert_eq!(from_slice, table.get_or_intern_string_utf8(mutator, b"world", true));

    let sub = table.get_or_intern_substring(mutator, joined, 0, 5);
    assert_eq!(sub, hello);
    assert_eq!(table.len(), 3);
    ThreadHolder::unregister();
}

#[test]
fn test_contended_intern_allocates_once() {
    const THREADS: usize = 8;
    let (ctx, allocator) = counting_context(64 * 1024);
    let table = Arc::new(BaseStringTable::new(Arc::clone(&ctx)));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let ctx = Arc::clone(&ctx);
            let table = Arc::clone(&table);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let holder = ThreadHolder::register(&ctx);
                let mutator = holder.mutator();
                mutator.leave_saferegion();
                barrier.wait();
                let string = table.get_or_intern_string_utf8(mutator, b"contended", true);
                mutator.enter_saferegion(true);
                ThreadHolder::unregister();
                string
            })
        })
        .collect();

    let results: Vec<StringRef> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(results.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(allocator.line_strings(), 1);
    assert_eq!(table.len(), 1);
    assert_eq!(table.metrics().created, 1);
}

#[test]
fn test_concurrent_interning_of_overlapping_key_sets() {
    const THREADS: usize = 4;
    const KEYS: usize = 200;
    let (ctx, allocator) = counting_context(1024 * 1024);
    let table = Arc::new(BaseStringTable::new(Arc::clone(&ctx)));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let ctx = Arc::clone(&ctx);
            let table = Arc::clone(&table);
            thread::spawn(move || {
                let holder = ThreadHolder::register(&ctx);
                let mutator = holder.mutator();
                mutator.leave_saferegion();
                // Each thread walks the keys from a different starting point.
                let addrs: Vec<usize> = (0..KEYS)
                    .map(|i| {
                        let key = format!("key-{}", (i + t * 50) % KEYS);
                        let string = table.get_or_intern_string_utf8(mutator, key.as_bytes(), true);
                        string.as_ptr() as usize
                    })
                    .collect();
                mutator.enter_saferegion(true);
                ThreadHolder::unregister();
                addrs
            })
        })
        .collect();

    let mut all = HashSet::new();
    for handle in handles {
        all.extend(handle.join().unwrap());
    }
    assert_eq!(all.len(), KEYS);
    assert_eq!(table.len(), KEYS);
    assert_eq!(allocator.line_strings(), KEYS);
}

#[test]
fn test_hit_during_marking_is_logged_for_the_marker() {
    let (ctx, _) = counting_context(64 * 1024);
    let holder = ThreadHolder::register(&ctx);
    let mutator = holder.mutator();
    let table = BaseStringTable::new(Arc::clone(&ctx));
    let interned = table.get_or_intern_string_utf8(mutator, b"weakly-held", true);
    assert_eq!(mutator.satb_node_len(), 0);

    ctx.mutators().transition_all_mutators(GcPhase::Marking);
    let again = table.get_or_intern_string_utf8(mutator, b"weakly-held", true);
    assert_eq!(again, interned);
    assert_eq!(mutator.satb_node_len(), 1);

    mutator.flush_satb_buffer();
    let mut logged = Vec::new();
    ctx.satb_buffer().drain_retired(|obj| logged.push(obj));
    assert_eq!(logged, vec![interned.object()]);
    ThreadHolder::unregister();
}

#[test]
fn test_new_string_is_rooted_in_raw_slot() {
    let (ctx, _) = counting_context(64 * 1024);
    let holder = ThreadHolder::register(&ctx);
    let mutator = holder.mutator();
    let table = BaseStringTable::new(Arc::clone(&ctx));

    let string = table.get_or_intern_string_utf8(mutator, b"rooted", true);
    assert_eq!(mutator.raw_object(), Some(string.object()));
    mutator.reset_mutator();
    assert_eq!(mutator.raw_object(), None);
    ThreadHolder::unregister();
}

#[test]
fn test_interning_from_a_saferegion_runs_outside_it() {
    let (ctx, _) = counting_context(64 * 1024);
    let holder = ThreadHolder::register(&ctx);
    let mutator = holder.mutator();
    let table = BaseStringTable::new(Arc::clone(&ctx));
    ctx.mutators().transition_all_mutators(GcPhase::Marking);
    assert!(mutator.in_saferegion());

    let first = table.get_or_intern_string_utf8(mutator, b"x", true);
    let second = table.get_or_intern_string_utf8(mutator, b"x", true);
    assert_eq!(first, second);
    // Back in the saferegion, with the pending phase request answered and
    // the hit logged while the mutator was running.
    assert!(mutator.in_saferegion());
    assert!(!mutator.has_any_suspension_request());
    assert_eq!(mutator.gc_phase(), GcPhase::Marking);
    assert_eq!(mutator.satb_node_len(), 1);
    ThreadHolder::unregister();
}

/// Forwards one stale string to its new copy and counts field reads.
struct Forwarding {
    from: StringRef,
    to: StringRef,
    reads: AtomicUsize,
}

impl ReadBarrier for Forwarding {
    fn read_string_field(&self, holder: StringRef, field: &AtomicPtr<BaseString>) -> StringRef {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let target = NoReadBarrier.read_string_field(holder, field);
        if target == self.from {
            self.to
        } else {
            target
        }
    }
}

#[test]
fn test_read_barrier_resolves_moved_children() {
    let (ctx, _) = counting_context(64 * 1024);
    let holder = ThreadHolder::register(&ctx);
    let mutator = holder.mutator();
    // `stale` is the abandoned copy of a string that now lives at `moved`.
    let stale = line(&ctx, "xxxxxx");
    let moved = line(&ctx, "foobar");
    let table = BaseStringTable::new(Arc::clone(&ctx)).with_read_barrier(Forwarding {
        from: stale,
        to: moved,
        reads: AtomicUsize::new(0),
    });

    let bar = table.get_or_intern_string_utf8(mutator, b"bar", true);
    let slice = create_sliced_string(ctx.allocator(), stale, 3, 3).unwrap();
    assert_eq!(table.try_get_intern_string(mutator, slice), Some(bar));

    let tree = create_tree_string(ctx.allocator(), stale, bar).unwrap();
    let joined = table.get_or_intern_existing(mutator, tree);
    assert_eq!(joined.content(&NoReadBarrier).to_string_lossy(), "foobarbar");
    assert_eq!(
        table.get_or_intern_string_utf8(mutator, b"foobarbar", true),
        joined
    );
    assert!(table.read_barrier().reads.load(Ordering::SeqCst) >= 3);
    ThreadHolder::unregister();
}
