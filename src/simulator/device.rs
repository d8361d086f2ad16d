//! Watch-side protocol handling for one simulated device.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use uuid::Uuid;

use super::{BlobPolicy, WatchProfile};
use crate::config::PpogConfig;
use crate::error::{LinkError, Result};
use crate::ppog::{PpogStream, Role};
use crate::protocol::{
    AppRunStateMessage, BlobCommand, BlobDatabase, BlobDb2Message, BlobOp, BlobResponse,
    BlobStatus, BlobWrite, Endpoint, FirmwareUpdateStartStatus, ObjectType, Origin, Packet,
    PhoneAppVersion, PhoneVersionMessage, PingMessage, ProtocolHandler, PutBytesCommand,
    PutBytesResponse, PutBytesResult, SystemMessage, WatchVersionMessage, WriteKind,
};
use crate::transport::{loopback, LoopbackPeer, LoopbackTransport, PeerLink, TransportId};

/// Capacity of the loopback channels between phone and simulated watch.
pub const SIM_LINK_CAPACITY: usize = 256;

/// An object the phone committed and then installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledObject {
    pub object_type: ObjectType,
    pub cookie: u32,
    pub size: u32,
    pub crc: u32,
}

#[derive(Debug)]
struct Transfer {
    object_type: ObjectType,
    size: u32,
    /// Bytes this session must carry; less than `size` when resuming
    expected: u32,
    received: u32,
    crc: u32,
    committed: Option<u32>,
}

/// Everything the simulated watch has stored or observed. Survives links.
#[derive(Debug, Default)]
pub struct SimState {
    pub links: usize,
    pub databases: BTreeMap<BlobDatabase, BTreeMap<Bytes, Bytes>>,
    /// Phone-initiated BlobDB commands in arrival order, dropped ones included
    pub blob_commands: Vec<BlobCommand>,
    pub in_flight: usize,
    pub max_in_flight: usize,
    /// Phone replies to watch-initiated writes
    pub write_responses: Vec<(WriteKind, u16, BlobStatus)>,
    pub sync_requests: Vec<u8>,
    pub putbytes_commands: usize,
    pub installed: Vec<InstalledObject>,
    pub aborted: Vec<u32>,
    pub commit_failures: usize,
    pub firmware_starts: Vec<(u32, u32)>,
    pub firmware_completed: usize,
    pub firmware_failed: usize,
    pub launched: Vec<Uuid>,
    pub pings: usize,
    pub phone_version: Option<PhoneAppVersion>,
    transfers: HashMap<u32, Transfer>,
    firmware_update: Option<(u32, u32)>,
}

impl SimState {
    pub fn records(&self, database: BlobDatabase) -> Vec<(Bytes, Bytes)> {
        self.databases
            .get(&database)
            .map(|db| db.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    pub fn commands_for(&self, database: BlobDatabase) -> Vec<&BlobCommand> {
        self.blob_commands
            .iter()
            .filter(|c| c.database == database)
            .collect()
    }

    fn apply_blob(&mut self, command: &BlobCommand) -> BlobStatus {
        let db = self.databases.entry(command.database).or_default();
        match &command.op {
            BlobOp::Insert { key, value } => {
                db.insert(key.clone(), value.clone());
            }
            BlobOp::Delete { key } => {
                if db.remove(key).is_none() {
                    return BlobStatus::KeyDoesNotExist;
                }
            }
            BlobOp::Clear => db.clear(),
        }
        BlobStatus::Success
    }

    fn begin_flight(&mut self) {
        self.in_flight += 1;
        self.max_in_flight = self.max_in_flight.max(self.in_flight);
    }

    fn end_flight(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    /// Bytes the phone will actually send for an object, given a resumed
    /// firmware update. Firmware precedes resources in the update stream.
    fn expected_size(&self, object_type: ObjectType, size: u32) -> u32 {
        let Some((offset, total)) = self.firmware_update else {
            return size;
        };
        let preceding = match object_type {
            ObjectType::Firmware | ObjectType::Recovery => 0,
            ObjectType::SystemResources => total.saturating_sub(size),
            _ => return size,
        };
        size - offset.saturating_sub(preceding).min(size)
    }

    fn putbytes(&mut self, command: PutBytesCommand) -> PutBytesResponse {
        self.putbytes_commands += 1;
        let reply = |result, cookie| PutBytesResponse { result, cookie };
        match command {
            PutBytesCommand::Init {
                size, object_type, ..
            }
            | PutBytesCommand::AppInit {
                size, object_type, ..
            } => {
                let cookie = loop {
                    let candidate: u32 = rand::random();
                    if candidate != 0 && !self.transfers.contains_key(&candidate) {
                        break candidate;
                    }
                };
                let expected = self.expected_size(object_type, size);
                self.transfers.insert(
                    cookie,
                    Transfer {
                        object_type,
                        size,
                        expected,
                        received: 0,
                        crc: 0,
                        committed: None,
                    },
                );
                reply(PutBytesResult::Ack, cookie)
            }
            PutBytesCommand::Put { cookie, data } => match self.transfers.get_mut(&cookie) {
                Some(t) if t.committed.is_none() && t.received as usize + data.len() <= t.size as usize => {
                    let mut crc = crc32fast::Hasher::new_with_initial(t.crc);
                    crc.update(&data);
                    t.crc = crc.finalize();
                    t.received += data.len() as u32;
                    reply(PutBytesResult::Ack, cookie)
                }
                _ => reply(PutBytesResult::Nack, cookie),
            },
            PutBytesCommand::Commit { cookie, crc } => match self.transfers.get_mut(&cookie) {
                Some(t) if t.received == t.expected && t.crc == crc => {
                    t.committed = Some(crc);
                    reply(PutBytesResult::Ack, cookie)
                }
                Some(t) => {
                    debug!(cookie, received = t.received, expected = t.expected, "commit rejected");
                    self.transfers.remove(&cookie);
                    self.commit_failures += 1;
                    reply(PutBytesResult::Nack, cookie)
                }
                None => reply(PutBytesResult::Nack, cookie),
            },
            PutBytesCommand::Abort { cookie } => {
                self.transfers.remove(&cookie);
                self.aborted.push(cookie);
                reply(PutBytesResult::Ack, cookie)
            }
            PutBytesCommand::Install { cookie } => {
                let installed = self.transfers.get(&cookie).and_then(|t| {
                    t.committed.map(|crc| InstalledObject {
                        object_type: t.object_type,
                        cookie,
                        size: t.size,
                        crc,
                    })
                });
                match installed {
                    Some(object) => {
                        self.transfers.remove(&cookie);
                        self.installed.push(object);
                        reply(PutBytesResult::Ack, cookie)
                    }
                    None => reply(PutBytesResult::Nack, cookie),
                }
            }
        }
    }
}

struct ActiveLink {
    handler: Arc<ProtocolHandler>,
    peer: PeerLink,
    generation: usize,
}

pub struct SimulatedWatch {
    id: TransportId,
    config: PpogConfig,
    profile: Mutex<WatchProfile>,
    policy: Mutex<BlobPolicy>,
    firmware_start_status: Mutex<FirmwareUpdateStartStatus>,
    reboot_on_complete: AtomicBool,
    /// Records written back when the phone asks for a sync, per raw db id
    sync_records: Mutex<BTreeMap<u8, Vec<(Bytes, Bytes)>>>,
    state: Mutex<SimState>,
    changes: watch::Sender<u64>,
    link: Mutex<Option<ActiveLink>>,
    cancel: CancellationToken,
}

impl SimulatedWatch {
    /// Create a watch and the phone-side transport that reaches it.
    pub fn spawn(
        id: TransportId,
        profile: WatchProfile,
        config: PpogConfig,
    ) -> (Arc<Self>, Arc<LoopbackTransport>) {
        let (transport, mut peers) = loopback(id.clone(), SIM_LINK_CAPACITY);
        let (changes, _) = watch::channel(0);
        let watch = Arc::new(Self {
            id,
            config,
            profile: Mutex::new(profile),
            policy: Mutex::new(BlobPolicy::Succeed),
            firmware_start_status: Mutex::new(FirmwareUpdateStartStatus::Started),
            reboot_on_complete: AtomicBool::new(true),
            sync_records: Mutex::new(BTreeMap::new()),
            state: Mutex::new(SimState::default()),
            changes,
            link: Mutex::new(None),
            cancel: CancellationToken::new(),
        });

        let acceptor = watch.clone();
        tokio::spawn(async move {
            loop {
                let peer = tokio::select! {
                    _ = acceptor.cancel.cancelled() => break,
                    peer = peers.recv() => match peer {
                        Some(peer) => peer,
                        None => break,
                    },
                };
                tokio::spawn(acceptor.clone().serve(peer));
            }
        });
        (watch, transport)
    }

    pub fn id(&self) -> &TransportId {
        &self.id
    }

    pub fn set_profile(&self, profile: WatchProfile) {
        *self.profile.lock() = profile;
    }

    pub fn set_blob_policy(&self, policy: BlobPolicy) {
        *self.policy.lock() = policy;
    }

    pub fn set_firmware_start_status(&self, status: FirmwareUpdateStartStatus) {
        *self.firmware_start_status.lock() = status;
    }

    /// Drop the link once a firmware update completes. On by default.
    pub fn set_reboot_on_complete(&self, reboot: bool) {
        self.reboot_on_complete.store(reboot, Ordering::SeqCst);
    }

    /// Records the watch writes back when asked to sync `database`.
    pub fn seed_sync_records(&self, database: BlobDatabase, records: Vec<(Bytes, Bytes)>) {
        self.sync_records.lock().insert(database as u8, records);
    }

    pub fn is_linked(&self) -> bool {
        self.link.lock().as_ref().is_some_and(|l| l.peer.is_up())
    }

    /// Simulate the watch going out of range.
    pub fn drop_link(&self) {
        if let Some(link) = self.link.lock().as_ref() {
            info!(watch = %self.id, "simulated link drop");
            link.peer.drop_link();
        }
    }

    /// Stop accepting links and end the current one.
    pub fn shutdown(&self) {
        self.drop_link();
        self.cancel.cancel();
    }

    pub fn inspect<R>(&self, f: impl FnOnce(&SimState) -> R) -> R {
        f(&self.state.lock())
    }

    fn update<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        let result = f(&mut self.state.lock());
        self.changes.send_modify(|n| *n += 1);
        result
    }

    /// Wait until `check` holds for the watch state. `false` on timeout.
    pub async fn wait_until(&self, within: Duration, mut check: impl FnMut(&SimState) -> bool) -> bool {
        let mut changes = self.changes.subscribe();
        let wait = async {
            loop {
                if check(&self.state.lock()) {
                    return;
                }
                if changes.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        };
        timeout(within, wait).await.is_ok()
    }

    /// Send a watch-initiated write on the current link. Returns its token.
    pub async fn write_record(
        &self,
        database: u8,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Result<u16> {
        let handler = self
            .link
            .lock()
            .as_ref()
            .map(|l| l.handler.clone())
            .ok_or(LinkError::Disconnected)?;
        let token: u16 = rand::random();
        let write = BlobWrite {
            kind: WriteKind::Write,
            token,
            database,
            timestamp: 0,
            key: key.into(),
            value: value.into(),
        };
        handler.send(Packet::BlobDb2(BlobDb2Message::Write(write))).await?;
        Ok(token)
    }

    async fn serve(self: Arc<Self>, peer: LoopbackPeer) {
        let peer_link = peer.link();
        let LoopbackPeer {
            from_phone,
            to_phone,
            ..
        } = peer;
        let cancel = self.cancel.child_token();
        let (channels, mut stream) = PpogStream::spawn(
            Role::Server,
            self.config.clone(),
            Arc::new(to_phone),
            from_phone,
            cancel.clone(),
        );
        let handler = ProtocolHandler::new(Origin::Watch, channels.outbound);
        let mut inbound = handler.subscribe(&[
            Endpoint::WatchVersion,
            Endpoint::PhoneVersion,
            Endpoint::SystemMessage,
            Endpoint::AppRunState,
            Endpoint::Ping,
            Endpoint::BlobDb,
            Endpoint::BlobDb2,
            Endpoint::PutBytes,
        ]);
        let router = handler.clone();
        let delivered = channels.delivered;
        tokio::spawn(async move {
            let _ = router.run_inbound(delivered).await;
        });

        let generation = self.update(|s| {
            s.links += 1;
            s.links
        });
        *self.link.lock() = Some(ActiveLink {
            handler: handler.clone(),
            peer: peer_link.clone(),
            generation,
        });
        info!(watch = %self.id, generation, "simulated link up");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                ended = &mut stream => {
                    debug!(watch = %self.id, ?ended, "simulated stream ended");
                    break;
                }
                packet = inbound.recv() => {
                    let Some(packet) = packet else { break };
                    if let Err(e) = self.handle(&handler, &peer_link, packet).await {
                        debug!(watch = %self.id, "simulated link stopping: {e}");
                        break;
                    }
                }
            }
        }

        cancel.cancel();
        let mut link = self.link.lock();
        if link.as_ref().is_some_and(|l| l.generation == generation) {
            *link = None;
        }
    }

    async fn handle(
        self: &Arc<Self>,
        handler: &Arc<ProtocolHandler>,
        peer: &PeerLink,
        packet: Packet,
    ) -> Result<()> {
        match packet {
            Packet::WatchVersion(WatchVersionMessage::Request) => {
                let response = self.profile.lock().version_response();
                handler
                    .send(Packet::WatchVersion(WatchVersionMessage::Response(Box::new(response))))
                    .await?;
                handler
                    .send(Packet::PhoneVersion(PhoneVersionMessage::Request))
                    .await?;
            }
            Packet::PhoneVersion(PhoneVersionMessage::Response(version)) => {
                self.update(|s| s.phone_version = Some(version));
            }
            Packet::Ping(PingMessage::Ping { cookie, .. }) => {
                self.update(|s| s.pings += 1);
                handler.send(Packet::Ping(PingMessage::Pong { cookie })).await?;
            }
            Packet::AppRunState(AppRunStateMessage::Start(uuid)) => {
                self.update(|s| s.launched.push(uuid));
                handler
                    .send(Packet::AppRunState(AppRunStateMessage::Start(uuid)))
                    .await?;
            }
            Packet::AppRunState(AppRunStateMessage::Request) => {
                let running = self.inspect(|s| s.launched.last().copied());
                if let Some(uuid) = running {
                    handler
                        .send(Packet::AppRunState(AppRunStateMessage::Start(uuid)))
                        .await?;
                }
            }
            Packet::System(SystemMessage::FirmwareUpdateStart { offset, total }) => {
                self.update(|s| {
                    s.firmware_starts.push((offset, total));
                    s.firmware_update = Some((offset, total));
                });
                let status = *self.firmware_start_status.lock();
                handler
                    .send(Packet::System(SystemMessage::FirmwareUpdateStartResponse { status }))
                    .await?;
            }
            Packet::System(SystemMessage::FirmwareUpdateComplete) => {
                self.update(|s| {
                    s.firmware_completed += 1;
                    s.firmware_update = None;
                });
                if self.reboot_on_complete.load(Ordering::SeqCst) {
                    info!(watch = %self.id, "firmware installed, rebooting");
                    peer.drop_link();
                }
            }
            Packet::System(SystemMessage::FirmwareUpdateFailed) => {
                self.update(|s| {
                    s.firmware_failed += 1;
                    s.firmware_update = None;
                });
            }
            Packet::BlobCommand(command) => self.blob_command(handler, command).await?,
            Packet::BlobDb2(message) => self.blob_db2(handler, message).await?,
            Packet::PutBytesCommand(command) => {
                let response = self.update(|s| s.putbytes(command));
                handler.send(Packet::PutBytesResponse(response)).await?;
            }
            other => trace!(endpoint = other.endpoint_id(), "simulated watch ignoring packet"),
        }
        Ok(())
    }

    async fn blob_command(self: &Arc<Self>, handler: &Arc<ProtocolHandler>, command: BlobCommand) -> Result<()> {
        let policy = {
            let mut policy = self.policy.lock();
            let current = policy.clone();
            if let BlobPolicy::DropNext(n) = &mut *policy {
                *n = n.saturating_sub(1);
                if *n == 0 {
                    *policy = BlobPolicy::Succeed;
                }
            }
            current
        };
        let token = command.token;
        self.update(|s| s.blob_commands.push(command.clone()));

        let status = match policy {
            BlobPolicy::DropNext(n) if n > 0 => {
                debug!(token, op = command.op.name(), "dropping blob command");
                return Ok(());
            }
            BlobPolicy::Delay(delay) => {
                self.update(SimState::begin_flight);
                let watch = self.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    sleep(delay).await;
                    let status = watch.update(|s| {
                        s.end_flight();
                        s.apply_blob(&command)
                    });
                    let _ = handler
                        .send(Packet::BlobResponse(BlobResponse { token, status }))
                        .await;
                });
                return Ok(());
            }
            BlobPolicy::Respond(status) => {
                self.update(|s| {
                    s.begin_flight();
                    s.end_flight();
                });
                status
            }
            BlobPolicy::Succeed | BlobPolicy::DropNext(_) => self.update(|s| {
                s.begin_flight();
                s.end_flight();
                s.apply_blob(&command)
            }),
        };
        handler
            .send(Packet::BlobResponse(BlobResponse { token, status }))
            .await
    }

    async fn blob_db2(&self, handler: &Arc<ProtocolHandler>, message: BlobDb2Message) -> Result<()> {
        match message {
            BlobDb2Message::StartSync { token, database } => {
                self.update(|s| s.sync_requests.push(database));
                handler
                    .send(Packet::BlobDb2(BlobDb2Message::StartSyncResponse {
                        token,
                        status: BlobStatus::Success,
                    }))
                    .await?;
                let records = self
                    .sync_records
                    .lock()
                    .get(&database)
                    .cloned()
                    .unwrap_or_default();
                for (key, value) in records {
                    let write = BlobWrite {
                        kind: WriteKind::WriteBack,
                        token: rand::random(),
                        database,
                        timestamp: 0,
                        key,
                        value,
                    };
                    handler.send(Packet::BlobDb2(BlobDb2Message::Write(write))).await?;
                }
                handler
                    .send(Packet::BlobDb2(BlobDb2Message::SyncDone {
                        token: rand::random(),
                        database,
                    }))
                    .await?;
            }
            BlobDb2Message::WriteResponse {
                kind,
                token,
                status,
            } => {
                self.update(|s| s.write_responses.push((kind, token, status)));
            }
            other => trace!(?other, "simulated watch ignoring blobdb2 message"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(cookie: u32, data: &'static [u8]) -> PutBytesCommand {
        PutBytesCommand::Put {
            cookie,
            data: Bytes::from_static(data),
        }
    }

    fn init(state: &mut SimState, object_type: ObjectType, size: u32) -> u32 {
        let response = state.putbytes(PutBytesCommand::Init {
            size,
            object_type,
            bank: 0,
            filename: String::new(),
        });
        assert!(response.is_ack());
        response.cookie
    }

    #[test]
    fn test_putbytes_commit_checks_crc_and_length() {
        let mut state = SimState::default();
        let cookie = init(&mut state, ObjectType::File, 10);
        assert!(state.putbytes(put(cookie, b"hello")).is_ack());
        assert!(state.putbytes(put(cookie, b"world")).is_ack());
        assert!(!state.putbytes(put(cookie, b"!")).is_ack());
        let crc = crc32fast::hash(b"helloworld");
        assert!(state.putbytes(PutBytesCommand::Commit { cookie, crc }).is_ack());
        assert!(state.putbytes(PutBytesCommand::Install { cookie }).is_ack());
        assert_eq!(state.installed[0].crc, crc);

        let short = init(&mut state, ObjectType::File, 10);
        state.putbytes(put(short, b"hello"));
        let crc = crc32fast::hash(b"hello");
        assert!(!state.putbytes(PutBytesCommand::Commit { cookie: short, crc }).is_ack());
        assert_eq!(state.commit_failures, 1);
    }

    #[test]
    fn test_resumed_update_expects_remaining_bytes() {
        let mut state = SimState {
            firmware_update: Some((700, 1000)),
            ..Default::default()
        };
        // 600 bytes of firmware already on the watch are skipped entirely
        assert_eq!(state.expected_size(ObjectType::Firmware, 600), 0);
        assert_eq!(state.expected_size(ObjectType::SystemResources, 400), 300);
        state.firmware_update = Some((100, 1000));
        assert_eq!(state.expected_size(ObjectType::Firmware, 600), 500);
        assert_eq!(state.expected_size(ObjectType::SystemResources, 400), 400);
        assert_eq!(state.expected_size(ObjectType::AppExecutable, 400), 400);
    }

    #[test]
    fn test_blob_delete_of_missing_key() {
        let mut state = SimState::default();
        let delete = BlobCommand {
            token: 1,
            database: BlobDatabase::Notification,
            op: BlobOp::Delete {
                key: Bytes::from_static(b"k"),
            },
        };
        assert_eq!(state.apply_blob(&delete), BlobStatus::KeyDoesNotExist);
        let insert = BlobCommand {
            token: 2,
            database: BlobDatabase::Notification,
            op: BlobOp::Insert {
                key: Bytes::from_static(b"k"),
                value: Bytes::from_static(b"v"),
            },
        };
        assert_eq!(state.apply_blob(&insert), BlobStatus::Success);
        assert_eq!(state.records(BlobDatabase::Notification).len(), 1);
        assert_eq!(state.apply_blob(&delete), BlobStatus::Success);
    }
}
