//! The narrow heap interface this crate consumes.
//!
//! Object layout and allocation policy belong to the surrounding runtime.
//! This module only names what the mutator side needs: an address-sized
//! object reference, the kinds of objects it asks for, the address range
//! the managed heap occupies, and an [`Allocator`] that hands out raw memory.
//!
//! [`RegionAllocator`] is a simple bump allocator over one reserved region.
//! It is what [`RuntimeContext::new`](crate::RuntimeContext::new) wires in
//! when the embedder does not inject its own allocator.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Alignment of every object handed out by [`RegionAllocator`].
pub const OBJECT_ALIGNMENT: usize = 8;

/// An untyped reference to a managed heap object.
///
/// This is the address of the object header. It carries no ownership;
/// liveness is decided by the collector.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectRef(NonNull<u8>);

// SAFETY: An `ObjectRef` is an address. Dereferencing it is always an
// explicit unsafe operation performed under the heap's own rules.
unsafe impl Send for ObjectRef {}
// SAFETY: See `Send`.
unsafe impl Sync for ObjectRef {}

impl ObjectRef {
    /// Wrap a raw object address.
    #[must_use]
    pub const fn new(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    /// Wrap a raw object address, returning `None` for null.
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Option<Self> {
        NonNull::new(ptr.cast_mut().cast::<u8>()).map(Self)
    }

    /// The object's address.
    #[must_use]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// The object's address as a raw pointer.
    #[must_use]
    pub const fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.addr())
    }
}

/// What an allocation request is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectKind {
    /// A flat string owning its code units.
    LineString = 0,
    /// A lazy concatenation of two strings.
    TreeString = 1,
    /// A view into a parent line string.
    SlicedString = 2,
    /// Anything else the runtime allocates.
    Other = 3,
}

/// Half-open address range `[start, end)` occupied by the managed heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapRange {
    /// First address inside the heap.
    pub start: usize,
    /// First address past the heap.
    pub end: usize,
}

impl HeapRange {
    /// Build a range from its bounds.
    #[must_use]
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// A range that contains every address. Used when the embedder's heap is
    /// not contiguous and filtering is left to the SATB policy.
    #[must_use]
    pub const fn unbounded() -> Self {
        Self {
            start: 0,
            end: usize::MAX,
        }
    }

    /// Returns `true` if `addr` lies inside the heap.
    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Size of the range in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    /// Returns `true` if the range holds no addresses.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Raw memory source for objects created by this crate.
///
/// Implementations decide placement (regions, TLABs, bump pointers). The
/// returned memory must be aligned to [`OBJECT_ALIGNMENT`], at least `size`
/// bytes long, and stay valid until the collector reclaims it.
pub trait Allocator: Send + Sync {
    /// Allocate `size` bytes for an object of `kind`, or `None` when the heap
    /// is exhausted.
    fn allocate(&self, size: usize, kind: ObjectKind) -> Option<NonNull<u8>>;

    /// The address range objects from this allocator live in.
    fn heap_range(&self) -> HeapRange;
}

/// Bump-pointer allocator over a single reserved region.
///
/// Individual objects are never freed; the whole region is released when
/// the allocator is dropped.
pub struct RegionAllocator {
    base: NonNull<u8>,
    layout: Layout,
    cursor: AtomicUsize,
}

// SAFETY: The region is only handed out through the atomic bump cursor, so
// no two callers ever receive overlapping memory.
unsafe impl Send for RegionAllocator {}
// SAFETY: See `Send`.
unsafe impl Sync for RegionAllocator {}

impl RegionAllocator {
    /// Reserve a region of `size` bytes (rounded up to [`OBJECT_ALIGNMENT`]).
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero or the layout is invalid. Aborts through
    /// [`alloc::handle_alloc_error`] if the system cannot provide the region.
    #[must_use]
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "heap region must not be empty");
        let size = size.next_multiple_of(OBJECT_ALIGNMENT);
        let layout = Layout::from_size_align(size, OBJECT_ALIGNMENT)
            .expect("heap region layout overflow");
        // SAFETY: `layout` has a non-zero size.
        let ptr = unsafe { alloc::alloc(layout) };
        let Some(base) = NonNull::new(ptr) else {
            alloc::handle_alloc_error(layout);
        };
        Self {
            base,
            layout,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Bytes handed out so far.
    #[must_use]
    pub fn used(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }

    /// Total size of the region.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.layout.size()
    }
}

impl Allocator for RegionAllocator {
    fn allocate(&self, size: usize, _kind: ObjectKind) -> Option<NonNull<u8>> {
        let size = size.max(1).checked_next_multiple_of(OBJECT_ALIGNMENT)?;
        let mut current = self.cursor.load(Ordering::Relaxed);
        loop {
            let end = current.checked_add(size)?;
            if end > self.capacity() {
                return None;
            }
            match self.cursor.compare_exchange_weak(
                current,
                end,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                // SAFETY: `current + size <= capacity`, so the offset stays
                // inside the region.
                Ok(_) => return Some(unsafe { self.base.add(current) }),
                Err(actual) => current = actual,
            }
        }
    }

    fn heap_range(&self) -> HeapRange {
        let start = self.base.as_ptr() as usize;
        HeapRange::new(start, start + self.capacity())
    }
}

impl Drop for RegionAllocator {
    fn drop(&mut self) {
        // SAFETY: `base` was returned by `alloc::alloc` with `layout`.
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}

impl fmt::Debug for RegionAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionAllocator")
            .field("range", &self.heap_range())
            .field("used", &self.used())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_allocations_are_aligned_and_disjoint() {
        let region = RegionAllocator::new(1024);
        let a = region.allocate(3, ObjectKind::Other).unwrap();
        let b = region.allocate(17, ObjectKind::Other).unwrap();
        assert_eq!(a.as_ptr() as usize % OBJECT_ALIGNMENT, 0);
        assert_eq!(b.as_ptr() as usize % OBJECT_ALIGNMENT, 0);
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 8);
        assert_eq!(region.used(), 32);
    }

    #[test]
    fn test_region_exhaustion_returns_none() {
        let region = RegionAllocator::new(64);
        assert!(region.allocate(64, ObjectKind::Other).is_some());
        assert!(region.allocate(1, ObjectKind::Other).is_none());
    }

    #[test]
    fn test_heap_range_contains_allocations() {
        let region = RegionAllocator::new(256);
        let range = region.heap_range();
        let obj = region.allocate(16, ObjectKind::LineString).unwrap();
        assert!(range.contains(obj.as_ptr() as usize));
        assert!(!range.contains(range.end));
        assert_eq!(range.len(), 256);
    }
}
