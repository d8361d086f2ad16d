//! Record source contract consumed by the sync engine.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::connection::WatchInfo;
use crate::error::Result;
use crate::protocol::{BlobDatabase, BlobStatus, BlobWrite};
use crate::transport::TransportId;

/// One record as the watch sees it.
pub trait BlobItem: Send + Sync + fmt::Debug {
    fn key(&self) -> Bytes;

    /// Serialized value for this watch, `None` when the record cannot be
    /// represented on its platform or capability set.
    fn value(&self, watch: &WatchInfo) -> Option<Bytes>;

    /// Hash of the record content; equal hashes mean a resend is a no-op.
    fn content_hash(&self) -> u64;
}

/// xxh3 of serialized content, the default record hash.
pub fn content_hash(bytes: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64(bytes)
}

/// Snapshot of a dirty record returned by a query.
#[derive(Debug, Clone)]
pub struct BlobRecord {
    pub key: Bytes,
    pub hash: u64,
    pub item: Arc<dyn BlobItem>,
}

impl BlobRecord {
    pub fn new(item: Arc<dyn BlobItem>) -> Self {
        Self {
            key: item.key(),
            hash: item.content_hash(),
            item,
        }
    }
}

/// Query results compare by identity and content, not by item pointer.
impl PartialEq for BlobRecord {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.hash == other.hash
    }
}

impl Eq for BlobRecord {}

/// A persisted local store backing one watch database.
///
/// Dirty means the local content hash differs from the hash last synced to
/// that watch. Tombstones stay until every watch that had the record has
/// confirmed the delete.
#[async_trait]
pub trait RecordSource: Send + Sync + 'static {
    fn database(&self) -> BlobDatabase;

    /// Records to insert or update on `watch`. Sources that only push records
    /// created after the session started compare against `only_after_ms`.
    async fn dirty_for_insert(
        &self,
        watch: &TransportId,
        now_ms: i64,
        only_after_ms: i64,
    ) -> Result<Vec<BlobRecord>>;

    /// Records present on `watch` that must be removed.
    async fn dirty_for_delete(&self, watch: &TransportId, now_ms: i64) -> Result<Vec<BlobRecord>>;

    async fn mark_synced(&self, watch: &TransportId, record: &BlobRecord, hash: u64) -> Result<()>;

    async fn mark_deleted(&self, watch: &TransportId, record: &BlobRecord, hash: u64) -> Result<()>;

    /// Forget everything synced to `watch`, forcing a full push.
    async fn mark_all_deleted(&self, watch: &TransportId) -> Result<()>;

    /// Evict local records last written before `before_ms`.
    async fn delete_stale(&self, before_ms: i64) -> Result<()>;

    /// Apply a watch-initiated write; the status is echoed to the watch.
    async fn handle_inbound_write(&self, write: &BlobWrite, watch: &TransportId) -> BlobStatus;
}
