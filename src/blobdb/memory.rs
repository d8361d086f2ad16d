//! In-memory record source.
//!
//! Backs tests, the simulator and applications that keep their records
//! elsewhere and mirror them in. Each entry tracks, per watch, the hash last
//! synced there; deleted entries stay as tombstones until every watch that
//! held them has confirmed the delete.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::source::{content_hash, BlobItem, BlobRecord, RecordSource};
use crate::clock::{duration_ms, SharedClock};
use crate::connection::WatchInfo;
use crate::error::Result;
use crate::protocol::{BlobDatabase, BlobStatus, BlobWrite};
use crate::transport::TransportId;

/// Turns a watch-initiated write into a local record.
pub type WriteDecoder = Arc<dyn Fn(&BlobWrite) -> anyhow::Result<Arc<dyn BlobItem>> + Send + Sync>;

/// Which records belong on the watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePolicy {
    /// Records written longer ago than this are not shown on the watch
    pub window_before: Option<Duration>,
    /// Records timestamped further in the future than this are held back
    pub window_after: Option<Duration>,
    /// Only push records written after the session started
    pub only_insert_after: bool,
    /// Propagate local removals; when false, removed records are forgotten
    pub send_deletions: bool,
}

impl Default for SourcePolicy {
    fn default() -> Self {
        Self {
            window_before: None,
            window_after: None,
            only_insert_after: false,
            send_deletions: true,
        }
    }
}

/// Opaque key/value record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawItem {
    pub key: Bytes,
    pub value: Bytes,
}

impl RawItem {
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl BlobItem for RawItem {
    fn key(&self) -> Bytes {
        self.key.clone()
    }

    fn value(&self, _watch: &WatchInfo) -> Option<Bytes> {
        Some(self.value.clone())
    }

    fn content_hash(&self) -> u64 {
        content_hash(&self.value)
    }
}

struct Entry {
    item: Arc<dyn BlobItem>,
    hash: u64,
    timestamp_ms: i64,
    deleted: bool,
    synced: HashMap<TransportId, u64>,
}

pub struct MemoryRecordSource {
    database: BlobDatabase,
    policy: SourcePolicy,
    clock: SharedClock,
    decoder: Option<WriteDecoder>,
    entries: Mutex<BTreeMap<Bytes, Entry>>,
}

impl fmt::Debug for MemoryRecordSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRecordSource")
            .field("database", &self.database)
            .field("policy", &self.policy)
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}

impl MemoryRecordSource {
    pub fn new(database: BlobDatabase, clock: SharedClock) -> Self {
        Self {
            database,
            policy: SourcePolicy::default(),
            clock,
            decoder: None,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_policy(mut self, policy: SourcePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Without a decoder, inbound writes are stored as [`RawItem`]s.
    pub fn with_write_decoder(mut self, decoder: WriteDecoder) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// Insert or replace a record, timestamped now.
    pub fn upsert(&self, item: Arc<dyn BlobItem>) {
        let now = self.clock.now_ms();
        self.upsert_at(item, now);
    }

    /// Insert or replace a record with an explicit write timestamp.
    pub fn upsert_at(&self, item: Arc<dyn BlobItem>, timestamp_ms: i64) {
        let key = item.key();
        let hash = item.content_hash();
        let mut entries = self.entries.lock();
        match entries.get_mut(&key) {
            Some(entry) => {
                entry.item = item;
                entry.hash = hash;
                entry.timestamp_ms = timestamp_ms;
                entry.deleted = false;
            }
            None => {
                entries.insert(
                    key,
                    Entry {
                        item,
                        hash,
                        timestamp_ms,
                        deleted: false,
                        synced: HashMap::new(),
                    },
                );
            }
        }
    }

    pub fn insert_raw(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.upsert(Arc::new(RawItem::new(key, value)));
    }

    /// Remove a record. It becomes a tombstone while any watch still holds it.
    pub fn remove(&self, key: &[u8]) {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        if entry.synced.is_empty() || !self.policy.send_deletions {
            entries.remove(key);
        } else {
            entry.deleted = true;
            entry.timestamp_ms = now;
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<Arc<dyn BlobItem>> {
        self.entries
            .lock()
            .get(key)
            .filter(|e| !e.deleted)
            .map(|e| e.item.clone())
    }

    /// Hash last confirmed on `watch` for `key`.
    pub fn synced_hash(&self, watch: &TransportId, key: &[u8]) -> Option<u64> {
        self.entries
            .lock()
            .get(key)
            .and_then(|e| e.synced.get(watch).copied())
    }

    pub fn is_tombstoned(&self, key: &[u8]) -> bool {
        self.entries.lock().get(key).is_some_and(|e| e.deleted)
    }

    /// Entries including tombstones.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn in_window(&self, timestamp_ms: i64, now_ms: i64) -> bool {
        if let Some(before) = self.policy.window_before {
            if timestamp_ms < now_ms.saturating_sub(duration_ms(before)) {
                return false;
            }
        }
        if let Some(after) = self.policy.window_after {
            if timestamp_ms > now_ms.saturating_add(duration_ms(after)) {
                return false;
            }
        }
        true
    }

    fn store_from_watch(&self, item: Arc<dyn BlobItem>, watch: &TransportId) {
        let key = item.key();
        let hash = item.content_hash();
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        let entry = entries.entry(key).or_insert_with(|| Entry {
            item: item.clone(),
            hash,
            timestamp_ms: now,
            deleted: false,
            synced: HashMap::new(),
        });
        entry.item = item;
        entry.hash = hash;
        entry.timestamp_ms = now;
        entry.deleted = false;
        entry.synced.insert(watch.clone(), hash);
    }
}

#[async_trait]
impl RecordSource for MemoryRecordSource {
    fn database(&self) -> BlobDatabase {
        self.database
    }

    async fn dirty_for_insert(
        &self,
        watch: &TransportId,
        now_ms: i64,
        only_after_ms: i64,
    ) -> Result<Vec<BlobRecord>> {
        let entries = self.entries.lock();
        Ok(entries
            .values()
            .filter(|e| !e.deleted)
            .filter(|e| self.in_window(e.timestamp_ms, now_ms))
            .filter(|e| !self.policy.only_insert_after || e.timestamp_ms >= only_after_ms)
            .filter(|e| e.synced.get(watch) != Some(&e.hash))
            .map(|e| BlobRecord::new(e.item.clone()))
            .collect())
    }

    async fn dirty_for_delete(&self, watch: &TransportId, now_ms: i64) -> Result<Vec<BlobRecord>> {
        if !self.policy.send_deletions {
            return Ok(Vec::new());
        }
        let entries = self.entries.lock();
        Ok(entries
            .values()
            .filter(|e| e.synced.contains_key(watch))
            .filter(|e| e.deleted || !self.in_window(e.timestamp_ms, now_ms))
            .map(|e| BlobRecord::new(e.item.clone()))
            .collect())
    }

    async fn mark_synced(&self, watch: &TransportId, record: &BlobRecord, hash: u64) -> Result<()> {
        let mut entries = self.entries.lock();
        match entries.get_mut(&record.key) {
            Some(entry) if !entry.deleted => {
                entry.synced.insert(watch.clone(), hash);
            }
            _ => debug!(db = ?self.database, "synced record no longer present"),
        }
        Ok(())
    }

    async fn mark_deleted(&self, watch: &TransportId, record: &BlobRecord, _hash: u64) -> Result<()> {
        let mut entries = self.entries.lock();
        let purge = match entries.get_mut(&record.key) {
            Some(entry) => {
                entry.synced.remove(watch);
                entry.deleted && entry.synced.is_empty()
            }
            None => false,
        };
        if purge {
            entries.remove(&record.key);
        }
        Ok(())
    }

    async fn mark_all_deleted(&self, watch: &TransportId) -> Result<()> {
        let mut entries = self.entries.lock();
        for entry in entries.values_mut() {
            entry.synced.remove(watch);
        }
        entries.retain(|_, e| !(e.deleted && e.synced.is_empty()));
        Ok(())
    }

    async fn delete_stale(&self, before_ms: i64) -> Result<()> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| {
            let expired = e.deleted || !self.in_window(e.timestamp_ms, now);
            !(expired && e.timestamp_ms < before_ms)
        });
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(db = ?self.database, evicted, "evicted stale records");
        }
        Ok(())
    }

    async fn handle_inbound_write(&self, write: &BlobWrite, watch: &TransportId) -> BlobStatus {
        let item: Arc<dyn BlobItem> = match &self.decoder {
            None => Arc::new(RawItem::new(write.key.clone(), write.value.clone())),
            Some(decode) => match decode(write) {
                Ok(item) => item,
                Err(e) => {
                    // acknowledged anyway so the watch does not resend forever
                    warn!(db = ?self.database, %watch, "ignoring undecodable watch write: {e:#}");
                    return BlobStatus::Success;
                }
            },
        };
        self.store_from_watch(item, watch);
        BlobStatus::Success
    }
}
