use std::time::Duration;

pub type Result<T> = std::result::Result<T, MemoryError>;

/// A single failed read from the host memory introspection interface.
///
/// These are expected to be transient (pools being resized, counters read
/// mid-update) and are retried by the manager.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("host memory introspection failed: {message}")]
pub struct HostError {
    pub message: String,
}

impl HostError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Errors surfaced by the memory manager.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("host memory introspection failed after {attempts} attempts: {source}")]
    Introspection {
        attempts: u32,
        #[source]
        source: HostError,
    },

    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout {
        what: &'static str,
        waited: Duration,
    },

    #[error("interrupted while waiting for {what}")]
    Interrupted { what: &'static str },

    #[error("invalid value for {key}: {message}")]
    InvalidSetting { key: String, message: String },
}
