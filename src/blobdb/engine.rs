//! Per-session BlobDB reconciliation.
//!
//! Startup, in order:
//!
//! 1. On a first connection or an unfaithful watch, forget everything synced
//!    to it so every record is pushed again.
//! 2. Ask the watch to write back the databases it owns and wait (bounded)
//!    for each to report done.
//! 3. On a full resync, clear every clearable database on the watch.
//! 4. Evict locally stale records.
//! 5. Start an insert loop and a delete loop per record source.
//!
//! Watch-initiated writes are applied and acknowledged throughout. Every
//! command to the watch goes through one session-wide lock, so at most one
//! blob operation is ever awaiting a response.

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::source::{BlobRecord, RecordSource};
use crate::clock::{duration_ms, SharedClock};
use crate::config::BlobDbConfig;
use crate::connection::WatchInfo;
use crate::error::{LinkError, Result};
use crate::protocol::blobdb::{max_insert_value_len, MAX_KEY_LEN};
use crate::protocol::{BlobDatabase, BlobOp, BlobStatus, BlobWrite, ProtocolCaps};
use crate::services::blobdb::{BlobDbInbound, BlobDbService};
use crate::transport::TransportId;

/// What the session knows about this watch's sync history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncFlags {
    /// The watch reported its stored state cannot be trusted
    pub unfaithful: bool,
    /// This phone has connected to the watch before
    pub previously_connected: bool,
}

impl SyncFlags {
    pub fn needs_full_resync(&self) -> bool {
        self.unfaithful || !self.previously_connected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryKind {
    Insert,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Synced,
    /// Not representable or too large; left alone until it changes
    Skipped,
    /// Timed out or rejected; retried on the next refresh
    Failed,
}

pub struct BlobDbEngine {
    watch_id: TransportId,
    watch: WatchInfo,
    service: Arc<BlobDbService>,
    sources: Vec<Arc<dyn RecordSource>>,
    clock: SharedClock,
    config: BlobDbConfig,
    started_at_ms: i64,
    write_lock: Mutex<()>,
    awaiting_sync: watch::Sender<BTreeSet<BlobDatabase>>,
}

impl BlobDbEngine {
    pub fn new(
        watch_id: TransportId,
        watch: WatchInfo,
        service: Arc<BlobDbService>,
        sources: Vec<Arc<dyn RecordSource>>,
        clock: SharedClock,
        config: BlobDbConfig,
    ) -> Arc<Self> {
        let started_at_ms = clock.now_ms();
        let (awaiting_sync, _) = watch::channel(BTreeSet::new());
        Arc::new(Self {
            watch_id,
            watch,
            service,
            sources,
            clock,
            config,
            started_at_ms,
            write_lock: Mutex::new(()),
            awaiting_sync,
        })
    }

    /// Run until cancelled. Returns an error only when the link is gone.
    pub async fn run(
        self: Arc<Self>,
        inbound: BlobDbInbound,
        flags: SyncFlags,
        cancel: CancellationToken,
    ) -> Result<()> {
        let full = flags.needs_full_resync();
        if full {
            info!(
                watch = %self.watch_id,
                unfaithful = flags.unfaithful,
                "full resync: forgetting synced state"
            );
            for source in &self.sources {
                if let Err(e) = source.mark_all_deleted(&self.watch_id).await {
                    warn!(db = ?source.database(), "mark_all_deleted failed: {e}");
                }
            }
        }

        let mut tasks = JoinSet::new();
        let BlobDbInbound { writes, sync_done } = inbound;
        tasks.spawn(self.clone().handle_writes(writes));
        tasks.spawn(self.clone().track_sync_done(sync_done));

        let startup = self.startup(full);
        tokio::pin!(startup);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                Some(joined) = tasks.join_next() => Self::check(joined)?,
                result = &mut startup => {
                    result?;
                    break;
                }
            }
        }

        for source in &self.sources {
            tasks.spawn(self.clone().query_loop(source.clone(), QueryKind::Insert));
            tasks.spawn(self.clone().query_loop(source.clone(), QueryKind::Delete));
        }
        debug!(watch = %self.watch_id, sources = self.sources.len(), "blobdb sync running");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                joined = tasks.join_next() => match joined {
                    Some(joined) => Self::check(joined)?,
                    None => return Ok(()),
                },
            }
        }
    }

    fn check(joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
        match joined {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(LinkError::Other(anyhow::anyhow!("blobdb task panicked: {e}"))),
        }
    }

    async fn startup(&self, full: bool) -> Result<()> {
        self.initial_sync().await?;
        if full {
            self.clear_watch().await?;
        }
        let horizon = self
            .clock
            .now_ms()
            .saturating_sub(duration_ms(self.config.stale_horizon()));
        for source in &self.sources {
            if let Err(e) = source.delete_stale(horizon).await {
                warn!(db = ?source.database(), "stale eviction failed: {e}");
            }
        }
        Ok(())
    }

    /// Ask the watch to write back the databases it owns.
    async fn initial_sync(&self) -> Result<()> {
        let databases: BTreeSet<BlobDatabase> = self
            .sources
            .iter()
            .map(|s| s.database())
            .filter(|db| db.syncs_from_watch())
            .collect();
        if databases.is_empty() || !self.watch.capabilities.contains(ProtocolCaps::SETTINGS_SYNC) {
            return Ok(());
        }

        self.awaiting_sync.send_replace(databases.clone());
        let mut pending = self.awaiting_sync.subscribe();
        for db in &databases {
            debug!(?db, "requesting watch sync");
            self.service.start_sync(*db).await?;
        }

        let finished = timeout(
            self.config.initial_sync_timeout(),
            pending.wait_for(|set| set.is_empty()),
        )
        .await
        .map(|r| r.is_ok());
        match finished {
            Ok(true) => debug!(watch = %self.watch_id, "watch sync complete"),
            _ => warn!(watch = %self.watch_id, "watch sync did not complete, continuing"),
        }
        Ok(())
    }

    async fn track_sync_done(self: Arc<Self>, mut sync_done: mpsc::Receiver<u8>) -> Result<()> {
        while let Some(raw) = sync_done.recv().await {
            match BlobDatabase::from_u8(raw) {
                Some(db) => {
                    self.awaiting_sync.send_modify(|set| {
                        set.remove(&db);
                    });
                }
                None => debug!(db = raw, "sync done for unknown database"),
            }
        }
        Ok(())
    }

    async fn clear_watch(&self) -> Result<()> {
        for db in BlobDatabase::ALL.into_iter().filter(|db| db.sends_clear()) {
            let _guard = self.write_lock.lock().await;
            debug!(?db, "clearing watch database");
            self.send_op(db, BlobOp::Clear).await?;
        }
        Ok(())
    }

    async fn handle_writes(self: Arc<Self>, mut writes: mpsc::Receiver<BlobWrite>) -> Result<()> {
        while let Some(write) = writes.recv().await {
            let source = BlobDatabase::from_u8(write.database)
                .and_then(|db| self.sources.iter().find(|s| s.database() == db));
            let status = match source {
                Some(source) => source.handle_inbound_write(&write, &self.watch_id).await,
                None => {
                    debug!(db = write.database, "write for unmanaged database, acknowledging");
                    BlobStatus::Success
                }
            };
            trace!(db = write.database, token = write.token, ?status, "answering watch write");
            self.service
                .respond_write(write.kind, write.token, status)
                .await?;
        }
        Ok(())
    }

    async fn query(&self, source: &dyn RecordSource, kind: QueryKind) -> Option<Vec<BlobRecord>> {
        let now = self.clock.now_ms();
        let result = match kind {
            QueryKind::Insert => {
                source
                    .dirty_for_insert(&self.watch_id, now, self.started_at_ms)
                    .await
            }
            QueryKind::Delete => source.dirty_for_delete(&self.watch_id, now).await,
        };
        match result {
            Ok(records) => Some(records),
            Err(e) => {
                warn!(db = ?source.database(), ?kind, "dirty query failed: {e}");
                None
            }
        }
    }

    /// Poll one dirty query; act only when its result changes, and once per
    /// refresh period regardless.
    async fn query_loop(self: Arc<Self>, source: Arc<dyn RecordSource>, kind: QueryKind) -> Result<()> {
        let mut ticker = interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let refresh = self.config.query_refresh_period();
        let mut refreshed_at = Instant::now();
        let mut last_seen: Option<Vec<BlobRecord>> = None;

        loop {
            ticker.tick().await;
            if refreshed_at.elapsed() >= refresh {
                trace!(db = ?source.database(), ?kind, "refreshing dirty query");
                last_seen = None;
                refreshed_at = Instant::now();
            }

            let Some(dirty) = self.query(&*source, kind).await else {
                continue;
            };
            if last_seen.as_ref() == Some(&dirty) {
                continue;
            }
            if dirty.is_empty() {
                last_seen = Some(dirty);
                continue;
            }

            sleep(self.config.debounce()).await;
            let Some(dirty) = self.query(&*source, kind).await else {
                continue;
            };

            let mut unsynced = Vec::new();
            for record in dirty {
                let outcome = match kind {
                    QueryKind::Insert => self.sync_insert(&*source, &record).await?,
                    QueryKind::Delete => self.sync_delete(&*source, &record).await?,
                };
                if outcome != Outcome::Synced {
                    unsynced.push(record);
                }
            }
            last_seen = Some(unsynced);
        }
    }

    async fn sync_insert(&self, source: &dyn RecordSource, record: &BlobRecord) -> Result<Outcome> {
        let db = source.database();
        let Some(value) = record.item.value(&self.watch) else {
            debug!(?db, key = %self.key_summary(db, &record.key), "not representable on this watch");
            return Ok(Outcome::Skipped);
        };
        if record.key.len() > MAX_KEY_LEN || value.len() > max_insert_value_len(record.key.len()) {
            warn!(
                ?db,
                key = %self.key_summary(db, &record.key),
                value_len = value.len(),
                "record too large for the watch"
            );
            return Ok(Outcome::Skipped);
        }

        let _guard = self.write_lock.lock().await;
        if self.config.log_record_contents {
            debug!(?db, key = %self.key_summary(db, &record.key), value = %hex::encode(&value), "insert");
        } else {
            debug!(?db, key = %self.key_summary(db, &record.key), hash = record.hash, "insert");
        }
        let op = BlobOp::Insert {
            key: record.key.clone(),
            value,
        };
        if self.send_op(db, op).await? != Some(BlobStatus::Success) {
            return Ok(Outcome::Failed);
        }
        if let Err(e) = source.mark_synced(&self.watch_id, record, record.hash).await {
            warn!(?db, "mark_synced failed: {e}");
            return Ok(Outcome::Failed);
        }
        Ok(Outcome::Synced)
    }

    async fn sync_delete(&self, source: &dyn RecordSource, record: &BlobRecord) -> Result<Outcome> {
        let db = source.database();
        let _guard = self.write_lock.lock().await;
        debug!(?db, key = %self.key_summary(db, &record.key), "delete");
        let op = BlobOp::Delete {
            key: record.key.clone(),
        };
        if self.send_op(db, op).await? != Some(BlobStatus::Success) {
            return Ok(Outcome::Failed);
        }
        if let Err(e) = source.mark_deleted(&self.watch_id, record, record.hash).await {
            warn!(?db, "mark_deleted failed: {e}");
            return Ok(Outcome::Failed);
        }
        Ok(Outcome::Synced)
    }

    /// Send one command. Caller holds the write lock. `None` on timeout.
    async fn send_op(&self, db: BlobDatabase, op: BlobOp) -> Result<Option<BlobStatus>> {
        let name = op.name();
        match self.service.send(db, op, self.config.response_timeout()).await {
            Ok(BlobStatus::Success) => Ok(Some(BlobStatus::Success)),
            Ok(status) => {
                warn!(?db, op = name, ?status, "watch rejected blob command");
                Ok(Some(status))
            }
            Err(e) if e.is_timeout() => {
                warn!(?db, op = name, "no response from watch, will retry");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn key_summary(&self, db: BlobDatabase, key: &Bytes) -> String {
        if db.key_is_uuid() {
            if let Ok(uuid) = uuid::Uuid::from_slice(key) {
                return uuid.to_string();
            }
        }
        match std::str::from_utf8(key) {
            Ok(s) if s.chars().all(|c| c.is_ascii_graphic()) => s.to_owned(),
            _ => hex::encode(key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_resync_rules() {
        assert!(SyncFlags::default().needs_full_resync());
        assert!(!SyncFlags { unfaithful: false, previously_connected: true }.needs_full_resync());
        assert!(SyncFlags { unfaithful: true, previously_connected: true }.needs_full_resync());
    }
}
