//! Shared store abstraction.
//!
//! Bucket state lives in a key-value store that can run a pre-loaded routine
//! atomically. The engine only ever touches bucket state through such a
//! routine, so the store is responsible for serializing concurrent checks on
//! the same key.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::{RedisStore, RetryPolicy};

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

/// Opaque handle to a routine loaded into a store (a content hash).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScriptHandle(String);

impl ScriptHandle {
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScriptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors reported by a shared store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store does not know the routine handle (e.g. it restarted).
    #[error("script not found: {0}")]
    ScriptNotFound(String),

    /// The store could not be reached; the command was never sent.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The connection failed after the command may have been sent.
    #[error("store connection lost: {0}")]
    Interrupted(String),

    /// The store did not answer within the command timeout.
    #[error("store command timed out after {0}ms")]
    Timeout(u64),

    /// The store answered with an error or an unexpected reply.
    #[error("store rejected command: {0}")]
    Rejected(String),
}

impl StoreError {
    /// Whether this is the "routine not found" condition that warrants a reload.
    pub fn is_script_not_found(&self) -> bool {
        matches!(self, StoreError::ScriptNotFound(_))
    }
}

/// A key-value store able to run atomic, pre-loaded routines.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Load a routine body and return the handle used to invoke it.
    async fn load_script(&self, body: &str) -> Result<ScriptHandle, StoreError>;

    /// Run a loaded routine atomically against `keys` with string arguments.
    ///
    /// Returns [`StoreError::ScriptNotFound`] if the handle is unknown.
    async fn eval_script(
        &self,
        handle: &ScriptHandle,
        keys: &[&str],
        args: &[String],
    ) -> Result<i64, StoreError>;

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;
}
