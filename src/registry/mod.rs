//! Candidate watches, connect arbitration and known-device persistence.
//!
//! One owning task holds the canonical candidate map. Every trigger (scan
//! results, user requests, session state changes, radio state) arrives as a
//! [`Command`] and is applied serially, after which the task reconciles
//! sessions against connect goals and republishes the merged device list.

pub mod platform;
pub mod store;

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::connection::{
    ConnectedWatch, ConnectionState, RecoveryWatch, SessionEnv, StateKind, WatchInfo, WatchSession,
};
use crate::error::{LinkError, Result};
use crate::putbytes::FirmwareUpdateStatus;
use crate::transport::TransportId;

pub use platform::Platform;
pub use store::{JsonDeviceStore, KnownDevice, KnownDeviceStore, MemoryDeviceStore};

/// Capacity of the registry command channel.
pub const COMMAND_CHANNEL_SIZE: usize = 256;

/// Capacity of the lifecycle event stream.
pub const EVENT_CHANNEL_SIZE: usize = 64;

/// One advertisement sighting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub id: TransportId,
    pub name: String,
    pub rssi: i16,
    pub seen_at_ms: i64,
}

/// Lifecycle of a candidate as seen from outside the registry.
#[derive(Debug, Clone)]
pub enum DeviceStatus {
    /// Seen in a scan, never paired
    Discovered,
    /// Paired before, no session
    Known,
    Bonding,
    Connecting,
    Negotiating,
    Connected(ConnectedWatch),
    ConnectedInRecovery(RecoveryWatch),
    Disconnecting,
}

impl DeviceStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_) | Self::ConnectedInRecovery(_))
    }
}

/// Merged view of one candidate.
#[derive(Debug, Clone)]
pub struct WatchDevice {
    pub id: TransportId,
    pub name: String,
    pub scan: Option<ScanResult>,
    pub known: Option<KnownDevice>,
    pub connect_goal: bool,
    pub status: DeviceStatus,
    /// Firmware update status captured when the last session left `Connected`
    pub last_firmware_update: Option<FirmwareUpdateStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Connected { id: TransportId, info: WatchInfo },
    Disconnected { id: TransportId },
}

enum Command {
    AddScan(ScanResult),
    ClearScanResults,
    Connect(TransportId),
    Disconnect(TransportId),
    Forget(TransportId),
    Bonded {
        id: TransportId,
        result: Result<()>,
    },
    SessionState {
        id: TransportId,
        generation: u64,
        state: ConnectionState,
    },
    SessionEnded {
        id: TransportId,
        generation: u64,
    },
    RetryDue,
    Shutdown(oneshot::Sender<()>),
}

struct ActiveSession {
    session: Arc<WatchSession>,
    generation: u64,
    state: ConnectionState,
    /// Left the initial `Disconnected` at least once
    progressed: bool,
    connected_emitted: bool,
}

struct Candidate {
    id: TransportId,
    scan: Option<ScanResult>,
    known: Option<KnownDevice>,
    connect_goal: bool,
    bonding: bool,
    forget_pending: bool,
    retry_after: Option<Instant>,
    session: Option<ActiveSession>,
    last_firmware_update: Option<FirmwareUpdateStatus>,
}

impl Candidate {
    fn new(id: TransportId) -> Self {
        Self {
            id,
            scan: None,
            known: None,
            connect_goal: false,
            bonding: false,
            forget_pending: false,
            retry_after: None,
            session: None,
            last_firmware_update: None,
        }
    }

    fn name(&self) -> String {
        self.known
            .as_ref()
            .map(|k| k.name.clone())
            .or_else(|| self.scan.as_ref().map(|s| s.name.clone()))
            .unwrap_or_default()
    }

    fn status(&self) -> DeviceStatus {
        if let Some(active) = &self.session {
            return match &active.state {
                ConnectionState::Disconnected if active.progressed => DeviceStatus::Disconnecting,
                ConnectionState::Disconnected | ConnectionState::Connecting => DeviceStatus::Connecting,
                ConnectionState::Negotiating => DeviceStatus::Negotiating,
                ConnectionState::Connected(w) => DeviceStatus::Connected(w.clone()),
                ConnectionState::ConnectedInRecovery(w) => DeviceStatus::ConnectedInRecovery(w.clone()),
                ConnectionState::Disconnecting => DeviceStatus::Disconnecting,
            };
        }
        if self.bonding {
            DeviceStatus::Bonding
        } else if self.known.is_some() {
            DeviceStatus::Known
        } else {
            DeviceStatus::Discovered
        }
    }

    fn view(&self) -> WatchDevice {
        WatchDevice {
            id: self.id.clone(),
            name: self.name(),
            scan: self.scan.clone(),
            known: self.known.clone(),
            connect_goal: self.connect_goal,
            status: self.status(),
            last_firmware_update: self.last_firmware_update.clone(),
        }
    }

    /// Capture the firmware update status of a connected state being left.
    fn snapshot_firmware(&mut self, leaving: &ConnectionState) {
        let status = match leaving {
            ConnectionState::Connected(w) => w.firmware_status(),
            ConnectionState::ConnectedInRecovery(w) => w.firmware_status(),
            _ => return,
        };
        self.last_firmware_update = Some(status);
    }
}

/// Handle to the registry task. Cheap to clone.
#[derive(Clone)]
pub struct WatchRegistry {
    commands: mpsc::Sender<Command>,
    devices: watch::Receiver<Vec<WatchDevice>>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl WatchRegistry {
    /// Load known devices and start the owning task.
    ///
    /// `radio` reports whether the platform radio is enabled; sessions are
    /// only opened while it is `true`.
    pub async fn start(
        env: SessionEnv,
        platform: Arc<dyn Platform>,
        store: Arc<dyn KnownDeviceStore>,
        radio: watch::Receiver<bool>,
    ) -> Result<(Self, JoinHandle<()>)> {
        let known = store.list().await?;
        let mut candidates = BTreeMap::new();
        for device in known {
            let mut candidate = Candidate::new(device.id.clone());
            candidate.connect_goal = device.connect_goal;
            candidate.known = Some(device);
            candidates.insert(candidate.id.clone(), candidate);
        }
        info!(known = candidates.len(), "watch registry starting");

        let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (devices_tx, devices) = watch::channel(Vec::new());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        let task = RegistryTask {
            env,
            platform,
            store,
            candidates,
            commands: commands.clone(),
            devices: devices_tx,
            events: events.clone(),
            next_generation: 0,
        };
        let handle = tokio::spawn(task.run(command_rx, radio));

        Ok((
            Self {
                commands,
                devices,
                events,
            },
            handle,
        ))
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| LinkError::Disconnected)
    }

    /// Record a scan sighting. Never connects by itself.
    pub async fn add_candidate(&self, scan: ScanResult) -> Result<()> {
        self.send(Command::AddScan(scan)).await
    }

    /// Drop scan-only candidates and scan info on known ones.
    pub async fn clear_scan_results(&self) -> Result<()> {
        self.send(Command::ClearScanResults).await
    }

    pub async fn request_connect(&self, id: TransportId) -> Result<()> {
        self.send(Command::Connect(id)).await
    }

    pub async fn request_disconnect(&self, id: TransportId) -> Result<()> {
        self.send(Command::Disconnect(id)).await
    }

    /// Disconnect and remove from the store once no session is active.
    pub async fn forget(&self, id: TransportId) -> Result<()> {
        self.send(Command::Forget(id)).await
    }

    /// Live merged device list, sorted by id.
    pub fn devices(&self) -> watch::Receiver<Vec<WatchDevice>> {
        self.devices.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Disconnect every session and stop the registry task.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Shutdown(tx)).await?;
        rx.await.map_err(|_| LinkError::Disconnected)
    }
}

struct RegistryTask {
    env: SessionEnv,
    platform: Arc<dyn Platform>,
    store: Arc<dyn KnownDeviceStore>,
    candidates: BTreeMap<TransportId, Candidate>,
    commands: mpsc::Sender<Command>,
    devices: watch::Sender<Vec<WatchDevice>>,
    events: broadcast::Sender<LifecycleEvent>,
    next_generation: u64,
}

impl RegistryTask {
    async fn run(mut self, mut command_rx: mpsc::Receiver<Command>, mut radio: watch::Receiver<bool>) {
        let mut radio_open = true;
        let mut radio_on = *radio.borrow_and_update();
        self.reconcile(radio_on).await;
        self.publish();

        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(Command::Shutdown(done)) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.apply(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                changed = radio.changed(), if radio_open => match changed {
                    Ok(()) => {
                        radio_on = *radio.borrow_and_update();
                        info!(enabled = radio_on, "radio state changed");
                    }
                    Err(_) => radio_open = false,
                },
            }
            self.reconcile(radio_on).await;
            self.publish();
        }
        debug!("watch registry stopped");
    }

    fn publish(&self) {
        let view: Vec<WatchDevice> = self.candidates.values().map(Candidate::view).collect();
        self.devices.send_replace(view);
    }

    async fn apply(&mut self, command: Command) {
        match command {
            Command::AddScan(scan) => {
                let candidate = self
                    .candidates
                    .entry(scan.id.clone())
                    .or_insert_with(|| Candidate::new(scan.id.clone()));
                candidate.scan = Some(scan);
            }
            Command::ClearScanResults => self.clear_scan_results(),
            Command::Connect(id) => self.connect(id).await,
            Command::Disconnect(id) => {
                let Some(candidate) = self.candidates.get_mut(&id) else {
                    return;
                };
                candidate.connect_goal = false;
                if let Some(active) = &candidate.session {
                    active.session.request_disconnect();
                }
                self.persist_goal(&id).await;
            }
            Command::Forget(id) => self.forget(id).await,
            Command::Bonded { id, result } => {
                let Some(candidate) = self.candidates.get_mut(&id) else {
                    return;
                };
                candidate.bonding = false;
                if let Err(e) = result {
                    warn!(watch = %id, "bonding failed, dropping connect request: {e}");
                    candidate.connect_goal = false;
                    self.persist_goal(&id).await;
                }
            }
            Command::SessionState {
                id,
                generation,
                state,
            } => self.session_state(id, generation, state).await,
            Command::SessionEnded { id, generation } => self.session_ended(id, generation).await,
            Command::RetryDue => {}
            Command::Shutdown(_) => {}
        }
    }

    fn clear_scan_results(&mut self) {
        for candidate in self.candidates.values_mut() {
            candidate.scan = None;
        }
        self.candidates
            .retain(|_, c| c.known.is_some() || c.session.is_some() || c.bonding);
    }

    async fn connect(&mut self, id: TransportId) {
        let multi = self.env.config.registry.multiple_connected_watches;
        let Some(candidate) = self.candidates.get(&id) else {
            warn!(watch = %id, "connect requested for unknown watch");
            return;
        };
        if candidate.connect_goal && (candidate.session.is_some() || candidate.bonding) {
            debug!(watch = %id, "already connecting");
            return;
        }

        if !multi {
            let others: Vec<TransportId> = self
                .candidates
                .values_mut()
                .filter(|c| c.id != id && c.connect_goal)
                .map(|c| {
                    c.connect_goal = false;
                    c.id.clone()
                })
                .collect();
            for other in others {
                debug!(watch = %other, "clearing connect goal for single-watch mode");
                self.persist_goal(&other).await;
            }
        }

        let has_session = match self.candidates.get_mut(&id) {
            Some(candidate) => {
                candidate.connect_goal = true;
                candidate.forget_pending = false;
                candidate.retry_after = None;
                candidate.bonding = candidate.session.is_none();
                candidate.session.is_some()
            }
            None => return,
        };
        self.persist_goal(&id).await;
        if has_session {
            return;
        }

        self.platform.stop_scanning().await;
        let platform = self.platform.clone();
        let commands = self.commands.clone();
        let limit = self.env.config.connection.connect_timeout();
        tokio::spawn(async move {
            let result = match timeout(limit, platform.bond(&id)).await {
                Ok(result) => result,
                Err(_) => Err(LinkError::Timeout(limit, "bonding")),
            };
            let _ = commands.send(Command::Bonded { id, result }).await;
        });
    }

    async fn forget(&mut self, id: TransportId) {
        let Some(candidate) = self.candidates.get_mut(&id) else {
            return;
        };
        candidate.connect_goal = false;
        candidate.forget_pending = true;
        if let Some(active) = &candidate.session {
            info!(watch = %id, "forgetting after session ends");
            active.session.request_disconnect();
            return;
        }
        self.remove(&id).await;
    }

    async fn remove(&mut self, id: &TransportId) {
        info!(watch = %id, "forgetting watch");
        self.candidates.remove(id);
        if let Err(e) = self.store.remove(id).await {
            error!(watch = %id, "failed to remove known device: {e}");
        }
    }

    /// Write the candidate's connect goal through to its stored record.
    async fn persist_goal(&mut self, id: &TransportId) {
        let Some(candidate) = self.candidates.get_mut(id) else {
            return;
        };
        let goal = candidate.connect_goal;
        let Some(known) = candidate.known.as_mut() else {
            return;
        };
        if known.connect_goal == goal {
            return;
        }
        known.connect_goal = goal;
        let known = known.clone();
        if let Err(e) = self.store.upsert(known).await {
            error!(watch = %id, "failed to persist connect goal: {e}");
        }
    }

    async fn session_state(&mut self, id: TransportId, generation: u64, state: ConnectionState) {
        let now_ms = self.env.clock.now_ms();
        let Some(candidate) = self.candidates.get_mut(&id) else {
            return;
        };
        let Some(active) = candidate.session.as_mut() else {
            return;
        };
        if active.generation != generation {
            return;
        }

        let previous = std::mem::replace(&mut active.state, state);
        active.progressed |= active.state.kind() != StateKind::Disconnected;
        let entered = active.state.watch_info().cloned();
        let first_connect = entered.is_some() && !active.connected_emitted;
        if first_connect {
            active.connected_emitted = true;
        }
        if previous.is_connected() && !active.state.is_connected() {
            candidate.snapshot_firmware(&previous);
        }

        let Some(info) = entered.filter(|_| first_connect) else {
            return;
        };
        let was_scan_only = candidate.known.is_none();
        let mut known = candidate
            .known
            .clone()
            .unwrap_or_else(|| KnownDevice::new(id.clone(), candidate.name()));
        known.serial = info.serial.clone();
        known.firmware_version = info.running_firmware.clone();
        known.platform = info.platform;
        known.last_connected_ms = Some(now_ms);
        known.connect_goal = candidate.connect_goal;
        candidate.known = Some(known.clone());

        info!(watch = %id, firmware = %info.running_firmware, "watch connected");
        let _ = self.events.send(LifecycleEvent::Connected {
            id: id.clone(),
            info,
        });
        if let Err(e) = self.store.upsert(known).await {
            error!(watch = %id, "failed to persist watch properties: {e}");
        }
        if was_scan_only {
            self.clear_scan_results();
        }
    }

    async fn session_ended(&mut self, id: TransportId, generation: u64) {
        let Some(candidate) = self.candidates.get_mut(&id) else {
            return;
        };
        if candidate.session.as_ref().map(|a| a.generation) != Some(generation) {
            return;
        }
        let Some(active) = candidate.session.take() else {
            return;
        };
        candidate.snapshot_firmware(&active.state);
        if let Some(reason) = active.session.fatal_error() {
            debug!(watch = %id, "session ended: {reason}");
        }
        if active.connected_emitted {
            let _ = self
                .events
                .send(LifecycleEvent::Disconnected { id: id.clone() });
        }

        if candidate.forget_pending {
            self.remove(&id).await;
            return;
        }
        if candidate.known.is_none() && candidate.scan.is_none() && !candidate.bonding {
            self.candidates.remove(&id);
            return;
        }

        let delay = self.env.config.registry.reconnect_delay();
        if !delay.is_zero() && candidate.connect_goal {
            candidate.retry_after = Some(Instant::now() + delay);
            let commands = self.commands.clone();
            tokio::spawn(async move {
                sleep(delay).await;
                let _ = commands.send(Command::RetryDue).await;
            });
        }
    }

    /// Open and close sessions so they match connect goals. Idempotent.
    async fn reconcile(&mut self, radio_on: bool) {
        let multi = self.env.config.registry.multiple_connected_watches;
        let now = Instant::now();
        let mut active = self.candidates.values().filter(|c| c.session.is_some()).count();

        let ids: Vec<TransportId> = self.candidates.keys().cloned().collect();
        for id in ids {
            let Some(candidate) = self.candidates.get_mut(&id) else {
                continue;
            };
            if let Some(session) = &candidate.session {
                if !candidate.connect_goal || !radio_on {
                    session.session.request_disconnect();
                }
                continue;
            }
            let waiting = candidate.retry_after.is_some_and(|t| t > now);
            if !candidate.connect_goal || !radio_on || candidate.bonding || waiting {
                continue;
            }
            if !multi && active > 0 {
                continue;
            }
            candidate.retry_after = None;

            let Some(transport) = self.platform.create_transport(&id) else {
                warn!(watch = %id, "platform cannot create a transport");
                if candidate.known.is_some() {
                    self.remove(&id).await;
                } else {
                    candidate.connect_goal = false;
                }
                continue;
            };

            let previously_connected = candidate
                .known
                .as_ref()
                .is_some_and(|k| k.last_connected_ms.is_some());
            let session = WatchSession::new(transport, self.env.clone(), previously_connected);
            self.next_generation += 1;
            let generation = self.next_generation;
            candidate.session = Some(ActiveSession {
                session: session.clone(),
                generation,
                state: ConnectionState::Disconnected,
                progressed: false,
                connected_emitted: false,
            });
            active += 1;
            info!(watch = %id, generation, "opening session");
            self.spawn_session(id, generation, session);
        }
    }

    /// Run the session and forward its state changes to the owning task.
    fn spawn_session(&self, id: TransportId, generation: u64, session: Arc<WatchSession>) {
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let mut state = session.state();
            let mut handle = session.start();
            loop {
                tokio::select! {
                    biased;
                    changed = state.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let current = state.borrow_and_update().clone();
                        let update = Command::SessionState { id: id.clone(), generation, state: current };
                        if commands.send(update).await.is_err() {
                            break;
                        }
                    }
                    _ = &mut handle => break,
                }
            }
            if !handle.is_finished() {
                let _ = handle.await;
            }
            let _ = commands.send(Command::SessionEnded { id, generation }).await;
        });
    }

    async fn shutdown(&mut self) {
        let sessions: Vec<Arc<WatchSession>> = self
            .candidates
            .values()
            .filter_map(|c| c.session.as_ref().map(|a| a.session.clone()))
            .collect();
        info!(sessions = sessions.len(), "watch registry shutting down");
        for session in &sessions {
            session.request_disconnect();
        }
        let bound = self.env.config.registry.disconnect_timeout() * 2;
        let all_ended = futures::future::join_all(sessions.iter().map(|s| s.ended()));
        if timeout(bound, all_ended).await.is_err() {
            warn!("sessions did not end before shutdown deadline");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(addr: &str) -> Candidate {
        Candidate::new(TransportId::Ble(addr.into()))
    }

    #[test]
    fn test_candidate_status_without_session() {
        let mut c = candidate("AA");
        assert!(matches!(c.status(), DeviceStatus::Discovered));
        c.bonding = true;
        assert!(matches!(c.status(), DeviceStatus::Bonding));
        c.bonding = false;
        c.known = Some(KnownDevice::new(c.id.clone(), "Pebble 2"));
        assert!(matches!(c.status(), DeviceStatus::Known));
        assert_eq!(c.view().name, "Pebble 2");
    }

    #[test]
    fn test_candidate_name_prefers_known() {
        let mut c = candidate("AA");
        c.scan = Some(ScanResult {
            id: c.id.clone(),
            name: "Pebble Time 1A2B".into(),
            rssi: -60,
            seen_at_ms: 0,
        });
        assert_eq!(c.name(), "Pebble Time 1A2B");
        c.known = Some(KnownDevice::new(c.id.clone(), "Kitchen watch"));
        assert_eq!(c.name(), "Kitchen watch");
    }
}
