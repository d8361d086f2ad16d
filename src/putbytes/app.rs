//! App sideloading: push each app part in its own PutBytes app session,
//! install it, then launch the app.

use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::session::{PutBytesSession, PutBytesTarget};
use crate::error::{ErrorTracker, LinkError, Result, UserFacingError};
use crate::protocol::ObjectType;
use crate::services::system::SystemService;

#[derive(Debug, Clone)]
pub struct AppBundle {
    pub uuid: Uuid,
    /// Install slot id assigned by the watch's app database
    pub app_id: u32,
    pub binary: Bytes,
    pub resources: Option<Bytes>,
    pub worker: Option<Bytes>,
}

impl AppBundle {
    fn parts(&self) -> impl Iterator<Item = (ObjectType, &Bytes)> {
        std::iter::once((ObjectType::AppExecutable, &self.binary))
            .chain(self.resources.iter().map(|r| (ObjectType::AppResources, r)))
            .chain(self.worker.iter().map(|w| (ObjectType::Worker, w)))
    }
}

pub struct AppInstaller {
    putbytes: Arc<PutBytesSession>,
    system: Arc<SystemService>,
    errors: ErrorTracker,
}

impl AppInstaller {
    pub fn new(putbytes: Arc<PutBytesSession>, system: Arc<SystemService>, errors: ErrorTracker) -> Self {
        Self {
            putbytes,
            system,
            errors,
        }
    }

    pub async fn sideload(&self, app: &AppBundle, cancel: &CancellationToken) -> Result<()> {
        match self.install_parts(app, cancel).await {
            Ok(()) => {}
            Err(LinkError::Cancelled) => return Err(LinkError::Cancelled),
            Err(e) => {
                warn!(app = %app.uuid, "sideload failed: {e}");
                self.errors
                    .report(UserFacingError::FailedToSideloadApp(app.uuid.to_string()));
                return Err(e);
            }
        }
        info!(app = %app.uuid, "app installed, launching");
        self.system.launch_app(app.uuid).await
    }

    async fn install_parts(&self, app: &AppBundle, cancel: &CancellationToken) -> Result<()> {
        for (object_type, data) in app.parts() {
            let size = u32::try_from(data.len())
                .map_err(|_| LinkError::Protocol(format!("{object_type:?} too large")))?;
            let target = PutBytesTarget::App {
                object_type,
                app_id: app.app_id,
            };
            self.putbytes
                .transfer(target, size, data, true, cancel, |_| {})
                .await?;
        }
        Ok(())
    }
}
