//! Platform stand-in that hands out loopback transports to simulated watches.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::SimulatedWatch;
use crate::error::{LinkError, Result};
use crate::registry::Platform;
use crate::transport::{LoopbackTransport, Transport, TransportId};

#[derive(Default)]
pub struct SimPlatform {
    transports: Mutex<HashMap<TransportId, Arc<LoopbackTransport>>>,
    failing_bonds: Mutex<HashSet<TransportId>>,
    stalled_bonds: Mutex<HashSet<TransportId>>,
    scan_stops: AtomicUsize,
    bonds: AtomicUsize,
    transports_created: AtomicUsize,
}

impl SimPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a simulated watch reachable through this platform.
    pub fn attach(&self, watch: &SimulatedWatch, transport: Arc<LoopbackTransport>) {
        self.transports.lock().insert(watch.id().clone(), transport);
    }

    /// Forget a transport, as if the OS dropped the pairing.
    pub fn detach(&self, id: &TransportId) {
        self.transports.lock().remove(id);
    }

    pub fn transport(&self, id: &TransportId) -> Option<Arc<LoopbackTransport>> {
        self.transports.lock().get(id).cloned()
    }

    pub fn fail_bonding(&self, id: TransportId) {
        self.failing_bonds.lock().insert(id);
    }

    /// Bond requests for `id` never complete until [`resume_bonding`](Self::resume_bonding).
    pub fn stall_bonding(&self, id: TransportId) {
        self.stalled_bonds.lock().insert(id);
    }

    pub fn resume_bonding(&self, id: &TransportId) {
        self.stalled_bonds.lock().remove(id);
    }

    pub fn scan_stops(&self) -> usize {
        self.scan_stops.load(Ordering::SeqCst)
    }

    pub fn bonds(&self) -> usize {
        self.bonds.load(Ordering::SeqCst)
    }

    pub fn transports_created(&self) -> usize {
        self.transports_created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Platform for SimPlatform {
    async fn stop_scanning(&self) {
        self.scan_stops.fetch_add(1, Ordering::SeqCst);
    }

    async fn bond(&self, id: &TransportId) -> Result<()> {
        self.bonds.fetch_add(1, Ordering::SeqCst);
        if self.failing_bonds.lock().contains(id) {
            return Err(LinkError::Transport(format!("bonding with {id} failed")));
        }
        if self.stalled_bonds.lock().contains(id) {
            debug!(watch = %id, "bond request stalled");
            futures::future::pending::<()>().await;
        }
        debug!(watch = %id, "simulated bond created");
        Ok(())
    }

    fn create_transport(&self, id: &TransportId) -> Option<Arc<dyn Transport>> {
        let transport = self.transports.lock().get(id).cloned()?;
        self.transports_created.fetch_add(1, Ordering::SeqCst);
        Some(transport)
    }
}
