use std::hash::Hash;
use std::path::PathBuf;
use std::sync::Arc;

/// Types usable as cache keys.
///
/// Keys must hash and compare stably for as long as they are cached, which
/// rules out mutable containers; this trait is deliberately not implemented
/// for collections.
pub trait CacheKey: Hash + Eq + Clone + Send + Sync + 'static {
    /// The key as a 64-bit integer, for the long-keyed table strategy.
    fn long_key(&self) -> Option<i64> {
        None
    }
}

macro_rules! integer_keys {
    ($($ty:ty),* $(,)?) => {
        $(
            impl CacheKey for $ty {
                fn long_key(&self) -> Option<i64> {
                    Some(*self as i64)
                }
            }
        )*
    };
}

integer_keys!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

impl CacheKey for bool {}
impl CacheKey for char {}
impl CacheKey for String {}
impl CacheKey for Box<str> {}
impl CacheKey for Arc<str> {}
impl CacheKey for &'static str {}
impl CacheKey for PathBuf {}

impl<A: CacheKey, B: CacheKey> CacheKey for (A, B) {}
