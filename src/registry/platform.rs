//! What the registry needs from the host platform's radio stack.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::transport::{Transport, TransportId};

#[async_trait]
pub trait Platform: Send + Sync + 'static {
    /// Release the radio before pairing and connecting.
    async fn stop_scanning(&self);

    /// Create (or confirm) the OS-level bond for a watch.
    async fn bond(&self, id: &TransportId) -> Result<()>;

    /// A transport for a watch, or `None` when the OS does not know the
    /// address any more.
    fn create_transport(&self, id: &TransportId) -> Option<Arc<dyn Transport>>;
}
