//! Heap layout of string objects and the content operations the table
//! needs.
//!
//! Three representations share one header:
//!
//! ```text
//! LineString    [BaseString | code units ...]
//! TreeString    [BaseString | first | second]        lazy concatenation
//! SlicedString  [BaseString | parent | start]         view into a LineString
//! ```
//!
//! A *compressed* string stores one byte per code unit (all units are in
//! `1..=0x7F`); otherwise it stores UTF-16 code units. Hash and equality are
//! defined over code units, so a compressed string and a UTF-16 string with
//! the same units hash and compare equal.
//!
//! Strings are allocated through the runtime's [`Allocator`] and never
//! freed by this crate.

use std::borrow::Cow;
use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

use crate::heap::{Allocator, ObjectKind, ObjectRef};

/// Representation tag of a string object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StringKind {
    /// Flat string owning its code units.
    Line = 0,
    /// Concatenation of two strings.
    Tree = 1,
    /// Substring view of a line string.
    Sliced = 2,
}

const FLAG_INTERNED: u8 = 1 << 0;
const FLAG_COMPRESSED: u8 = 1 << 1;

/// Header shared by every string representation.
#[repr(C)]
pub struct BaseString {
    kind: StringKind,
    flags: AtomicU8,
    length: u32,
    mix_hash: u32,
}

#[repr(C)]
struct TreeString {
    base: BaseString,
    first: AtomicPtr<BaseString>,
    second: AtomicPtr<BaseString>,
}

#[repr(C)]
struct SlicedString {
    base: BaseString,
    parent: AtomicPtr<BaseString>,
    start: u32,
}

/// Byte offset of a line string's code units.
const LINE_DATA_OFFSET: usize = mem::size_of::<BaseString>();

/// Read hook for reference fields inside string objects.
///
/// A concurrent copying collector may need to forward or mark a child
/// before it is used; the hook lets it do that without this crate knowing
/// its policy.
pub trait ReadBarrier {
    /// Read the string reference stored in `field` of `holder`.
    fn read_string_field(&self, holder: StringRef, field: &AtomicPtr<BaseString>) -> StringRef;
}

/// Plain acquire load, for collectors that never move strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoReadBarrier;

impl ReadBarrier for NoReadBarrier {
    fn read_string_field(&self, holder: StringRef, field: &AtomicPtr<BaseString>) -> StringRef {
        match NonNull::new(field.load(Ordering::Acquire)) {
            Some(ptr) => StringRef(ptr),
            None => crate::log::fatal!("string {holder:?} has a null reference field"),
        }
    }
}

/// `hash = hash * 31 + unit` over code units.
#[must_use]
pub fn compute_hash_utf8(data: &[u8]) -> u32 {
    data.iter()
        .fold(0u32, |h, &unit| h.wrapping_mul(31).wrapping_add(u32::from(unit)))
}

/// `hash = hash * 31 + unit` over UTF-16 code units.
#[must_use]
pub fn compute_hash_utf16(data: &[u16]) -> u32 {
    data.iter()
        .fold(0u32, |h, &unit| h.wrapping_mul(31).wrapping_add(u32::from(unit)))
}

/// Hash of `a ++ b` from the hashes of its halves.
const fn concat_hash(first: u32, second: u32, second_len: u32) -> u32 {
    first
        .wrapping_mul(31u32.wrapping_pow(second_len))
        .wrapping_add(second)
}

/// Returns `true` if every byte is a non-NUL ASCII character.
#[must_use]
pub fn can_be_compressed_utf8(data: &[u8]) -> bool {
    data.iter().all(|&b| (1..=0x7F).contains(&b))
}

/// Returns `true` if every code unit is a non-NUL ASCII character.
#[must_use]
pub fn can_be_compressed_utf16(data: &[u16]) -> bool {
    data.iter().all(|&u| (1..=0x7F).contains(&u))
}

/// Flattened code units of a string.
#[derive(Debug, Clone)]
pub enum StringContent<'a> {
    /// One byte per code unit.
    Compressed(Cow<'a, [u8]>),
    /// UTF-16 code units.
    Utf16(Cow<'a, [u16]>),
}

impl<'a> StringContent<'a> {
    /// Content of raw UTF-8 input.
    ///
    /// With `can_be_compress` the bytes are taken as compressed code units
    /// as-is. Otherwise they are decoded to UTF-16, replacing invalid
    /// sequences with U+FFFD.
    #[must_use]
    pub fn from_utf8(data: &'a [u8], can_be_compress: bool) -> Self {
        if can_be_compress {
            Self::Compressed(Cow::Borrowed(data))
        } else {
            Self::Utf16(Cow::Owned(
                String::from_utf8_lossy(data).encode_utf16().collect(),
            ))
        }
    }

    /// Content of raw UTF-16 input, narrowed to bytes with `can_be_compress`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_utf16(data: &'a [u16], can_be_compress: bool) -> Self {
        if can_be_compress {
            Self::Compressed(Cow::Owned(data.iter().map(|&u| u as u8).collect()))
        } else {
            Self::Utf16(Cow::Borrowed(data))
        }
    }

    /// Number of code units.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Compressed(data) => data.len(),
            Self::Utf16(data) => data.len(),
        }
    }

    /// Returns `true` if there are no code units.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` for the one-byte representation.
    #[must_use]
    pub const fn is_compressed(&self) -> bool {
        matches!(self, Self::Compressed(_))
    }

    /// Code unit at `index`.
    #[must_use]
    pub fn code_unit(&self, index: usize) -> Option<u16> {
        match self {
            Self::Compressed(data) => data.get(index).map(|&b| u16::from(b)),
            Self::Utf16(data) => data.get(index).copied(),
        }
    }

    /// Hash over the code units.
    #[must_use]
    pub fn hash(&self) -> u32 {
        match self {
            Self::Compressed(data) => compute_hash_utf8(data),
            Self::Utf16(data) => compute_hash_utf16(data),
        }
    }

    /// Copy of the code units in `start..start + len`, in the same
    /// representation.
    #[must_use]
    pub fn substring(&self, start: usize, len: usize) -> StringContent<'static> {
        match self {
            Self::Compressed(data) => {
                StringContent::Compressed(Cow::Owned(data[start..start + len].to_vec()))
            }
            Self::Utf16(data) => StringContent::Utf16(Cow::Owned(data[start..start + len].to_vec())),
        }
    }

    /// Decode to a Rust string, replacing unpaired surrogates.
    #[must_use]
    pub fn to_string_lossy(&self) -> String {
        match self {
            Self::Compressed(data) => data.iter().map(|&b| char::from(b)).collect(),
            Self::Utf16(data) => String::from_utf16_lossy(data),
        }
    }
}

impl PartialEq for StringContent<'_> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Compressed(a), Self::Compressed(b)) => a == b,
            (Self::Utf16(a), Self::Utf16(b)) => a == b,
            (Self::Compressed(bytes), Self::Utf16(units))
            | (Self::Utf16(units), Self::Compressed(bytes)) => {
                bytes.len() == units.len()
                    && bytes.iter().zip(units.iter()).all(|(&b, &u)| u16::from(b) == u)
            }
        }
    }
}

impl Eq for StringContent<'_> {}

/// Reference to a string object on the managed heap.
///
/// Carries no ownership; the collector decides how long the object lives.
/// All accessors assume the object is still alive.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StringRef(NonNull<BaseString>);

// SAFETY: A `StringRef` is an address. The header fields it reads are
// immutable after publication except `flags`, which is atomic.
unsafe impl Send for StringRef {}
// SAFETY: See `Send`.
unsafe impl Sync for StringRef {}

impl StringRef {
    /// Wrap a raw pointer to a string header.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a string object created by this module that the
    /// collector keeps alive while the returned reference is used.
    #[must_use]
    pub const unsafe fn from_raw(ptr: NonNull<BaseString>) -> Self {
        Self(ptr)
    }

    /// The raw header pointer.
    #[must_use]
    pub const fn as_ptr(self) -> *mut BaseString {
        self.0.as_ptr()
    }

    /// The raw header pointer as a non-null pointer.
    #[must_use]
    pub const fn as_non_null(self) -> NonNull<BaseString> {
        self.0
    }

    /// The object as seen by the write barrier.
    #[must_use]
    pub const fn object(self) -> ObjectRef {
        ObjectRef::new(self.0.cast())
    }

    fn header(&self) -> &BaseString {
        // SAFETY: Liveness is part of the type's contract.
        unsafe { self.0.as_ref() }
    }

    /// Representation of the object.
    #[must_use]
    pub fn kind(self) -> StringKind {
        self.header().kind
    }

    /// Number of code units.
    #[must_use]
    pub fn len(self) -> usize {
        self.header().length as usize
    }

    /// Returns `true` for the empty string.
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.header().length == 0
    }

    /// Hash over the code units, computed at creation.
    #[must_use]
    pub fn hash(self) -> u32 {
        self.header().mix_hash
    }

    /// Returns `true` for the one-byte representation.
    #[must_use]
    pub fn is_compressed(self) -> bool {
        self.header().flags.load(Ordering::Acquire) & FLAG_COMPRESSED != 0
    }

    /// Returns `true` if this object is the canonical copy in a string table.
    #[must_use]
    pub fn is_interned(self) -> bool {
        self.header().flags.load(Ordering::Acquire) & FLAG_INTERNED != 0
    }

    pub(crate) fn set_interned(self) {
        self.header().flags.fetch_or(FLAG_INTERNED, Ordering::AcqRel);
    }

    fn as_tree(&self) -> &TreeString {
        debug_assert_eq!(self.kind(), StringKind::Tree);
        // SAFETY: The kind tag says the object has the tree layout.
        unsafe { self.0.cast::<TreeString>().as_ref() }
    }

    fn as_sliced(&self) -> &SlicedString {
        debug_assert_eq!(self.kind(), StringKind::Sliced);
        // SAFETY: The kind tag says the object has the sliced layout.
        unsafe { self.0.cast::<SlicedString>().as_ref() }
    }

    /// Code units of a line string.
    fn line_content<'a>(self) -> StringContent<'a> {
        debug_assert_eq!(self.kind(), StringKind::Line);
        let len = self.len();
        // SAFETY: Line strings are followed by `len` code units, written
        // before the object was published.
        unsafe {
            let data = self.0.cast::<u8>().as_ptr().add(LINE_DATA_OFFSET);
            if self.is_compressed() {
                StringContent::Compressed(Cow::Borrowed(slice::from_raw_parts(data, len)))
            } else {
                StringContent::Utf16(Cow::Borrowed(slice::from_raw_parts(
                    data.cast::<u16>(),
                    len,
                )))
            }
        }
    }

    /// Returns `true` if the content lives contiguously in one object.
    #[must_use]
    pub fn is_flat(self) -> bool {
        self.kind() != StringKind::Tree
    }

    /// First and second half of a tree string.
    #[must_use]
    pub fn tree_children(self, barrier: &impl ReadBarrier) -> Option<(Self, Self)> {
        (self.kind() == StringKind::Tree).then(|| {
            let tree = self.as_tree();
            (
                barrier.read_string_field(self, &tree.first),
                barrier.read_string_field(self, &tree.second),
            )
        })
    }

    /// Parent and start offset of a sliced string.
    #[must_use]
    pub fn slice_parent(self, barrier: &impl ReadBarrier) -> Option<(Self, usize)> {
        (self.kind() == StringKind::Sliced).then(|| {
            let sliced = self.as_sliced();
            (
                barrier.read_string_field(self, &sliced.parent),
                sliced.start as usize,
            )
        })
    }

    /// Flattened code units.
    ///
    /// Borrowed for line and sliced strings, copied for trees. The borrow
    /// is valid while the object is alive.
    #[must_use]
    pub fn content<'a>(self, barrier: &impl ReadBarrier) -> StringContent<'a> {
        match self.kind() {
            StringKind::Line => self.line_content(),
            StringKind::Sliced => {
                let sliced = self.as_sliced();
                let parent = barrier.read_string_field(self, &sliced.parent);
                let start = sliced.start as usize;
                let end = start + self.len();
                match parent.line_content() {
                    StringContent::Compressed(Cow::Borrowed(data)) => {
                        StringContent::Compressed(Cow::Borrowed(&data[start..end]))
                    }
                    StringContent::Utf16(Cow::Borrowed(data)) => {
                        StringContent::Utf16(Cow::Borrowed(&data[start..end]))
                    }
                    owned => owned.substring(start, self.len()),
                }
            }
            StringKind::Tree => self.flatten_tree(barrier),
        }
    }

    fn flatten_tree<'a>(self, barrier: &impl ReadBarrier) -> StringContent<'a> {
        let compressed = self.is_compressed();
        let mut bytes = Vec::new();
        let mut units = Vec::new();
        let mut pending = vec![self];
        while let Some(node) = pending.pop() {
            if let Some((first, second)) = node.tree_children(barrier) {
                pending.push(second);
                pending.push(first);
                continue;
            }
            match node.content(barrier) {
                StringContent::Compressed(data) if compressed => bytes.extend_from_slice(&data),
                StringContent::Compressed(data) => units.extend(data.iter().map(|&b| u16::from(b))),
                StringContent::Utf16(data) => units.extend_from_slice(&data),
            }
        }
        if compressed {
            StringContent::Compressed(Cow::Owned(bytes))
        } else {
            StringContent::Utf16(Cow::Owned(units))
        }
    }

    /// Content equality, independent of representation.
    #[must_use]
    pub fn equals(self, other: Self, barrier: &impl ReadBarrier) -> bool {
        self == other
            || (self.len() == other.len()
                && self.hash() == other.hash()
                && self.content(barrier) == other.content(barrier))
    }
}

impl fmt::Debug for StringRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StringRef")
            .field("addr", &self.0)
            .field("kind", &self.kind())
            .field("len", &self.len())
            .finish()
    }
}

fn header(kind: StringKind, length: usize, hash: u32, compressed: bool) -> BaseString {
    let length = u32::try_from(length)
        .unwrap_or_else(|_| crate::log::fatal!("string of {length} code units is too long"));
    BaseString {
        kind,
        flags: AtomicU8::new(if compressed { FLAG_COMPRESSED } else { 0 }),
        length,
        mix_hash: hash,
    }
}

/// Allocate a flat string holding `content`.
///
/// Returns `None` when the allocator is exhausted.
pub fn create_line_string(allocator: &dyn Allocator, content: &StringContent<'_>) -> Option<StringRef> {
    let unit_size = if content.is_compressed() { 1 } else { 2 };
    let size = LINE_DATA_OFFSET + content.len() * unit_size;
    let raw = allocator.allocate(size, ObjectKind::LineString)?;
    let base = header(
        StringKind::Line,
        content.len(),
        content.hash(),
        content.is_compressed(),
    );
    // SAFETY: `raw` is a fresh, suitably aligned block of `size` bytes.
    unsafe {
        ptr::write(raw.cast::<BaseString>().as_ptr(), base);
        let data = raw.as_ptr().add(LINE_DATA_OFFSET);
        match content {
            StringContent::Compressed(bytes) => {
                ptr::copy_nonoverlapping(bytes.as_ptr(), data, bytes.len());
            }
            StringContent::Utf16(units) => {
                ptr::copy_nonoverlapping(units.as_ptr(), data.cast::<u16>(), units.len());
            }
        }
    }
    Some(StringRef(raw.cast()))
}

/// Allocate the lazy concatenation `first ++ second`.
pub fn create_tree_string(
    allocator: &dyn Allocator,
    first: StringRef,
    second: StringRef,
) -> Option<StringRef> {
    let raw = allocator.allocate(mem::size_of::<TreeString>(), ObjectKind::TreeString)?;
    #[allow(clippy::cast_possible_truncation)]
    let hash = concat_hash(first.hash(), second.hash(), second.len() as u32);
    let tree = TreeString {
        base: header(
            StringKind::Tree,
            first.len() + second.len(),
            hash,
            first.is_compressed() && second.is_compressed(),
        ),
        first: AtomicPtr::new(first.as_ptr()),
        second: AtomicPtr::new(second.as_ptr()),
    };
    // SAFETY: `raw` is a fresh, suitably aligned block for a `TreeString`.
    unsafe { ptr::write(raw.cast::<TreeString>().as_ptr(), tree) };
    Some(StringRef(raw.cast()))
}

/// Allocate a view of `len` code units of `parent` starting at `start`.
///
/// Slices of slices point at the underlying line string. Tree parents
/// cannot be sliced; the caller flattens them first.
///
/// # Panics
///
/// Panics if the range is out of bounds or `parent` is a tree string.
#[allow(clippy::cast_possible_truncation)]
pub fn create_sliced_string(
    allocator: &dyn Allocator,
    parent: StringRef,
    start: usize,
    len: usize,
) -> Option<StringRef> {
    assert!(start + len <= parent.len(), "slice out of bounds");
    let (root, offset) = match parent.kind() {
        StringKind::Line => (parent, start),
        StringKind::Sliced => {
            let sliced = parent.as_sliced();
            let root = NoReadBarrier.read_string_field(parent, &sliced.parent);
            (root, sliced.start as usize + start)
        }
        StringKind::Tree => panic!("cannot slice a tree string"),
    };
    let hash = parent.content(&NoReadBarrier).substring(start, len).hash();
    let raw = allocator.allocate(mem::size_of::<SlicedString>(), ObjectKind::SlicedString)?;
    let sliced = SlicedString {
        base: header(StringKind::Sliced, len, hash, root.is_compressed()),
        parent: AtomicPtr::new(root.as_ptr()),
        start: offset as u32,
    };
    // SAFETY: `raw` is a fresh, suitably aligned block for a `SlicedString`.
    unsafe { ptr::write(raw.cast::<SlicedString>().as_ptr(), sliced) };
    Some(StringRef(raw.cast()))
}
