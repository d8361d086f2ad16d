//! Resources created fresh for one negotiated session and dropped with it.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::WatchInfo;
use crate::config::LinkConfig;
use crate::error::ErrorTracker;
use crate::protocol::{ProtocolCaps, ProtocolHandler};
use crate::putbytes::{AppInstaller, FirmwareUpdater, PutBytesSession};
use crate::services::blobdb::{BlobDbInbound, BlobDbService};
use crate::services::putbytes::PutBytesService;
use crate::services::system::SystemService;
use crate::transport::TransportId;

pub struct ConnectionContext {
    pub id: TransportId,
    pub info: WatchInfo,
    pub handler: Arc<ProtocolHandler>,
    pub system: Arc<SystemService>,
    pub blobdb: Arc<BlobDbService>,
    pub putbytes: Arc<PutBytesSession>,
    pub firmware: Arc<FirmwareUpdater>,
    pub apps: Arc<AppInstaller>,
    /// Cancelled when the session starts tearing down
    pub cancel: CancellationToken,
}

impl ConnectionContext {
    /// Start the per-session services on top of a negotiated handler.
    /// Returns the BlobDB inbound streams for the sync engine.
    pub fn build(
        id: TransportId,
        info: WatchInfo,
        handler: Arc<ProtocolHandler>,
        system: Arc<SystemService>,
        config: &LinkConfig,
        errors: ErrorTracker,
        cancel: CancellationToken,
    ) -> (Arc<Self>, BlobDbInbound) {
        let (blobdb, inbound) = BlobDbService::start(handler.clone(), cancel.clone());
        let putbytes_service = PutBytesService::start(handler.clone(), cancel.clone());
        let putbytes = Arc::new(PutBytesSession::new(putbytes_service, config.putbytes.clone()));
        let firmware = Arc::new(FirmwareUpdater::new(
            system.clone(),
            putbytes.clone(),
            info.platform,
            config.firmware.clone(),
        ));
        let apps = Arc::new(AppInstaller::new(putbytes.clone(), system.clone(), errors));
        let context = Arc::new(Self {
            id,
            info,
            handler,
            system,
            blobdb,
            putbytes,
            firmware,
            apps,
            cancel,
        });
        (context, inbound)
    }

    pub fn supports(&self, caps: ProtocolCaps) -> bool {
        self.info.capabilities.contains(caps)
    }
}
