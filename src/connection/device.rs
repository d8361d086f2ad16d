//! Handles valid only while a session is connected.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::{ConnectionContext, WatchInfo};
use crate::error::Result;
use crate::protocol::{Endpoint, Packet, ProtocolCaps};
use crate::putbytes::{AppBundle, FirmwareBundle, FirmwareUpdateStatus, PutBytesSession};
use crate::transport::TransportId;

/// Budget for a ping round trip.
pub const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Start a firmware update in the session's scope and hand back its status.
fn spawn_firmware_update(
    context: &Arc<ConnectionContext>,
    bundle: FirmwareBundle,
    offset: u64,
) -> watch::Receiver<FirmwareUpdateStatus> {
    let status = context.firmware.status();
    let context = context.clone();
    tokio::spawn(async move {
        if let Err(e) = context.firmware.update(&bundle, offset, &context.cancel).await {
            debug!(watch = %context.id, "firmware update ended: {e}");
        }
    });
    status
}

/// A fully negotiated watch running normal firmware.
#[derive(Clone)]
pub struct ConnectedWatch {
    context: Arc<ConnectionContext>,
}

impl fmt::Debug for ConnectedWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectedWatch")
            .field("id", &self.context.id)
            .field("info", &self.context.info)
            .finish()
    }
}

impl ConnectedWatch {
    pub(crate) fn new(context: Arc<ConnectionContext>) -> Self {
        Self { context }
    }

    pub fn id(&self) -> &TransportId {
        &self.context.id
    }

    pub fn info(&self) -> &WatchInfo {
        &self.context.info
    }

    pub fn supports(&self, caps: ProtocolCaps) -> bool {
        self.context.supports(caps)
    }

    pub async fn send(&self, packet: Packet) -> Result<()> {
        self.context.handler.send(packet).await
    }

    /// Inbound packets for the given endpoints, decoded.
    pub fn subscribe(&self, endpoints: &[Endpoint]) -> mpsc::Receiver<Packet> {
        self.context.handler.subscribe(endpoints)
    }

    /// Inbound packets for raw endpoint ids this crate has no codec for.
    pub fn subscribe_raw(&self, endpoint_ids: &[u16]) -> mpsc::Receiver<Packet> {
        self.context.handler.subscribe_ids(endpoint_ids)
    }

    pub async fn ping(&self, cookie: u32) -> Result<u32> {
        self.context.system.ping(cookie, PING_TIMEOUT).await
    }

    pub async fn launch_app(&self, uuid: Uuid) -> Result<()> {
        self.context.system.launch_app(uuid).await
    }

    pub fn running_app(&self) -> watch::Receiver<Option<Uuid>> {
        self.context.system.running_app()
    }

    pub fn update_firmware(&self, bundle: FirmwareBundle) -> watch::Receiver<FirmwareUpdateStatus> {
        spawn_firmware_update(&self.context, bundle, 0)
    }

    /// Continue an interrupted update from a previously reported byte offset.
    pub fn resume_firmware_update(
        &self,
        bundle: FirmwareBundle,
        offset: u64,
    ) -> watch::Receiver<FirmwareUpdateStatus> {
        spawn_firmware_update(&self.context, bundle, offset)
    }

    pub fn firmware_status(&self) -> FirmwareUpdateStatus {
        self.context.firmware.last_status()
    }

    /// The connection's single PutBytes session, for plain file transfers.
    pub fn putbytes(&self) -> &Arc<PutBytesSession> {
        &self.context.putbytes
    }

    /// Cancelled when the session tears down.
    pub fn cancel_token(&self) -> CancellationToken {
        self.context.cancel.clone()
    }

    pub async fn sideload(&self, app: &AppBundle) -> Result<()> {
        self.context.apps.sideload(app, &self.context.cancel).await
    }

    /// Ask the session to tear down. The registry will reconnect if the
    /// connect goal is still set.
    pub fn disconnect(&self) {
        self.context.cancel.cancel();
    }
}

/// A watch running its recovery image: firmware update and ping only.
#[derive(Clone)]
pub struct RecoveryWatch {
    context: Arc<ConnectionContext>,
}

impl fmt::Debug for RecoveryWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryWatch")
            .field("id", &self.context.id)
            .field("info", &self.context.info)
            .finish()
    }
}

impl RecoveryWatch {
    pub(crate) fn new(context: Arc<ConnectionContext>) -> Self {
        Self { context }
    }

    pub fn id(&self) -> &TransportId {
        &self.context.id
    }

    pub fn info(&self) -> &WatchInfo {
        &self.context.info
    }

    pub async fn ping(&self, cookie: u32) -> Result<u32> {
        self.context.system.ping(cookie, PING_TIMEOUT).await
    }

    pub fn update_firmware(&self, bundle: FirmwareBundle) -> watch::Receiver<FirmwareUpdateStatus> {
        spawn_firmware_update(&self.context, bundle, 0)
    }

    pub fn firmware_status(&self) -> FirmwareUpdateStatus {
        self.context.firmware.last_status()
    }

    pub fn disconnect(&self) {
        self.context.cancel.cancel();
    }
}
