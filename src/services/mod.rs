//! Endpoint services: correlate requests with watch replies and fan inbound
//! traffic out to the components that consume it.
//!
//! Each service subscribes on construction and runs one dispatch task bound
//! to the session's cancellation token.

pub mod blobdb;
pub mod putbytes;
pub mod system;

use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{LinkError, Result};

pub use blobdb::{BlobDbInbound, BlobDbService};
pub use putbytes::PutBytesService;
pub use system::SystemService;

/// Wait for a correlated reply. A dropped sender means the session went away.
pub(crate) async fn await_reply<T>(
    rx: oneshot::Receiver<T>,
    timeout: Duration,
    what: &'static str,
) -> Result<T> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(_)) => Err(LinkError::Disconnected),
        Err(_) => Err(LinkError::Timeout(timeout, what)),
    }
}
