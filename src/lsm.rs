use std::future::Future;

use crate::kv::{Entry, ValuePointer, ValueStruct};

/// Contract consumed from the LSM tree sitting above this subsystem.
///
/// `get` receives a key with the 8-byte commit timestamp appended and must
/// return the latest version at or below that timestamp; an absent key is
/// reported as `ValueStruct::default()`, not as an error. `batch_set`
/// inserts a group of entries atomically through the normal write path (it
/// is the route by which GC rewrites and discard-stats flushes become
/// durable) and fails with `LogError::TxnTooBig` when the group exceeds the
/// transaction limits. `scan_prefix` enumerates the latest version of every
/// key under a prefix, which the GC uses to sweep stale move keys.
/// `persisted_head` is the durable high-water mark the WAL cleaner trusts.
pub trait LsmStore: Send + Sync + 'static {
    fn get(&self, key: &[u8]) -> impl Future<Output = anyhow::Result<ValueStruct>> + Send;

    fn batch_set(&self, entries: Vec<Entry>) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn scan_prefix(
        &self,
        prefix: &[u8],
    ) -> impl Future<Output = anyhow::Result<Vec<(Vec<u8>, ValueStruct)>>> + Send;

    fn persisted_head(&self) -> impl Future<Output = anyhow::Result<ValuePointer>> + Send;
}
