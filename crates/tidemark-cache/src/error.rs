pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by cache lookups.
///
/// A plain miss is never an error; lookups return `Ok(None)` for that.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// The cache holds a memoised negative lookup for the key.
    #[error("{table}: not found ({reason})")]
    NotFound { table: String, reason: String },
}
