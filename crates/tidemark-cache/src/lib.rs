//! Memory-managed cache tables.
//!
//! [`CacheTable`] is a concurrent hash table whose entries the
//! [`tidemark_memory::MemoryManager`] may evict under pressure. Entries can be
//! pinned with [`CacheTable::lock`], and a negative lookup can be memoised so
//! that [`CacheTable::find`] reports it as [`CacheError::NotFound`].
//!
//! [`SecondaryCache`] holds caches derived from other objects, keyed by the
//! owner's identity or by a [`CacheGroup`] key. [`CommonData`] deduplicates
//! equal immutable values shared by many entries.

mod common;
mod error;
mod key;
mod secondary;
mod table;

pub use common::{CommonData, Interner};
pub use error::{CacheError, Result};
pub use key::CacheKey;
pub use secondary::{CacheGroup, SecondaryCache};
pub use table::{CacheStats, CacheTable, CacheTableBuilder, TableStrategy, Weigher};
