//! String objects and the concurrent interning table.

pub mod base_string;
pub mod cleaner;
pub mod hash_trie_map;
pub mod table;

pub use base_string::{BaseString, NoReadBarrier, ReadBarrier, StringContent, StringKind, StringRef};
pub use cleaner::{BaseStringTableCleaner, SweepReport, WeakRootVisitor};
pub use hash_trie_map::{HashTrieMap, HashTrieMapInUseScope, LoadResult, WeakRefFieldVisitor};
pub use table::{BaseStringTable, HandleCreator, RawSlotHandleCreator, StringHandle};
