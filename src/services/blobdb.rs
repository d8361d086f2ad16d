//! BlobDB request/response correlation and watch-initiated traffic.
//!
//! Every command carries a fresh random token; the reply is matched back by
//! token. A timed-out token is forgotten, so a late reply is ignored.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::await_reply;
use crate::error::Result;
use crate::protocol::{
    BlobCommand, BlobDatabase, BlobDb2Message, BlobOp, BlobResponse, BlobStatus, BlobWrite,
    Endpoint, Packet, ProtocolHandler, WriteKind,
};

/// Capacity of the write and sync-done channels handed to the engine.
pub const INBOUND_CHANNEL_SIZE: usize = 32;

/// Watch-initiated traffic for the sync engine.
#[derive(Debug)]
pub struct BlobDbInbound {
    pub writes: mpsc::Receiver<BlobWrite>,
    /// Raw database ids the watch finished syncing back
    pub sync_done: mpsc::Receiver<u8>,
}

type PendingMap = Mutex<HashMap<u16, oneshot::Sender<BlobStatus>>>;

pub struct BlobDbService {
    handler: Arc<ProtocolHandler>,
    pending: PendingMap,
}

/// Forgets a token when its request is abandoned.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    token: u16,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.token);
    }
}

impl BlobDbService {
    pub fn start(
        handler: Arc<ProtocolHandler>,
        cancel: CancellationToken,
    ) -> (Arc<Self>, BlobDbInbound) {
        let inbound = handler.subscribe(&[Endpoint::BlobDb, Endpoint::BlobDb2]);
        let (writes_tx, writes) = mpsc::channel(INBOUND_CHANNEL_SIZE);
        let (sync_done_tx, sync_done) = mpsc::channel(INBOUND_CHANNEL_SIZE);

        let service = Arc::new(Self {
            handler,
            pending: Mutex::new(HashMap::new()),
        });
        let worker = service.clone();
        tokio::spawn(async move {
            worker.run(inbound, writes_tx, sync_done_tx, cancel).await;
        });

        (service, BlobDbInbound { writes, sync_done })
    }

    async fn run(
        &self,
        mut inbound: mpsc::Receiver<Packet>,
        writes: mpsc::Sender<BlobWrite>,
        sync_done: mpsc::Sender<u8>,
        cancel: CancellationToken,
    ) {
        loop {
            let packet = tokio::select! {
                _ = cancel.cancelled() => break,
                packet = inbound.recv() => match packet {
                    Some(p) => p,
                    None => break,
                },
            };

            match packet {
                Packet::BlobResponse(BlobResponse { token, status }) => {
                    match self.pending.lock().remove(&token) {
                        Some(tx) => {
                            let _ = tx.send(status);
                        }
                        None => debug!(token, ?status, "blob response with no pending request"),
                    }
                }
                Packet::BlobDb2(BlobDb2Message::Write(write)) => {
                    trace!(token = write.token, db = write.database, "watch write");
                    if writes.send(write).await.is_err() {
                        break;
                    }
                }
                Packet::BlobDb2(BlobDb2Message::SyncDone { token, database }) => {
                    debug!(db = database, "watch finished sync");
                    let ack = BlobDb2Message::SyncDoneResponse {
                        token,
                        status: BlobStatus::Success,
                    };
                    if self.handler.send(Packet::BlobDb2(ack)).await.is_err() {
                        break;
                    }
                    if sync_done.send(database).await.is_err() {
                        break;
                    }
                }
                Packet::BlobDb2(BlobDb2Message::StartSyncResponse { token, status }) => {
                    if status != BlobStatus::Success {
                        warn!(token, ?status, "watch refused sync");
                    }
                }
                other => trace!(endpoint = other.endpoint_id(), "unhandled blobdb packet"),
            }
        }
    }

    fn next_token(&self) -> (u16, oneshot::Receiver<BlobStatus>) {
        let mut pending = self.pending.lock();
        let token = loop {
            let candidate: u16 = rand::random();
            if !pending.contains_key(&candidate) {
                break candidate;
            }
        };
        let (tx, rx) = oneshot::channel();
        pending.insert(token, tx);
        (token, rx)
    }

    /// Send one command and wait for its status.
    pub async fn send(
        &self,
        database: BlobDatabase,
        op: BlobOp,
        timeout: Duration,
    ) -> Result<BlobStatus> {
        let (token, rx) = self.next_token();
        let _guard = PendingGuard {
            pending: &self.pending,
            token,
        };
        self.handler
            .send(Packet::BlobCommand(BlobCommand {
                token,
                database,
                op,
            }))
            .await?;
        await_reply(rx, timeout, "blobdb response").await
    }

    /// Ask the watch to write back its copy of `database`.
    pub async fn start_sync(&self, database: BlobDatabase) -> Result<()> {
        let token: u16 = rand::random();
        self.handler
            .send(Packet::BlobDb2(BlobDb2Message::StartSync {
                token,
                database: database as u8,
            }))
            .await
    }

    pub async fn respond_write(&self, kind: WriteKind, token: u16, status: BlobStatus) -> Result<()> {
        self.handler
            .send(Packet::BlobDb2(BlobDb2Message::WriteResponse {
                kind,
                token,
                status,
            }))
            .await
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}
