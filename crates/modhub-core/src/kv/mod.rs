//! Key/value store capability.
//!
//! The registry persists module records and reads pipeline configs through
//! [`KvStore`]. Implementations live in [`crate::backend`].

mod watch;

pub use watch::PrefixWatch;

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// A single key and its decoded value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: String,
}

/// Result of one blocking-query round over a prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvListing {
    /// Store-wide modification index observed for this prefix.
    pub index: u64,
    pub entries: Vec<KvEntry>,
}

/// Hierarchical key/value store with blocking prefix queries.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch the raw value at `key`.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// All keys starting with `prefix`, in lexical order.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// List the entries under `prefix`, blocking until the prefix index moves
    /// past `after_index` or `wait` elapses. `after_index == 0` returns at once.
    async fn list_prefix_blocking(
        &self,
        prefix: &str,
        after_index: u64,
        wait: Duration,
    ) -> Result<KvListing>;
}
