//! Shared setup for integration tests: short timeouts and simulated watches.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::time::timeout;

use watchlink::blobdb::RecordSource;
use watchlink::connection::{ConnectedWatch, ConnectionState, SessionEnv, WatchSession};
use watchlink::simulator::{SimulatedWatch, WatchProfile};
use watchlink::transport::LoopbackTransport;
use watchlink::{LinkConfig, ManualClock, SharedClock, TransportId};

pub const WAIT: Duration = Duration::from_secs(30);

pub fn test_config() -> LinkConfig {
    let mut config = LinkConfig::default();
    config.registry.disconnect_timeout_ms = 500;
    config.registry.reconnect_delay_ms = 200;
    config.connection.connect_timeout_ms = 2_000;
    config.connection.negotiation_timeout_ms = 3_000;
    config.blobdb.response_timeout_ms = 500;
    config.blobdb.query_refresh_period_secs = 2;
    config.blobdb.poll_interval_ms = 100;
    config.blobdb.debounce_ms = 50;
    config.blobdb.initial_sync_timeout_ms = 1_000;
    config.putbytes.response_timeout_ms = 1_000;
    config.firmware.reboot_timeout_ms = 2_000;
    config
}

pub fn clock() -> SharedClock {
    Arc::new(ManualClock::new(1_700_000_000_000))
}

pub fn sim_watch(name: &str, profile: WatchProfile) -> (Arc<SimulatedWatch>, Arc<LoopbackTransport>) {
    SimulatedWatch::spawn(
        TransportId::Socket(name.to_owned()),
        profile,
        test_config().ppog,
    )
}

pub fn env_with(sources: Vec<Arc<dyn RecordSource>>, clock: SharedClock) -> SessionEnv {
    SessionEnv::new(Arc::new(test_config()), clock).with_sources(sources)
}

/// Start a session and wait until it reaches a connected state.
pub async fn connect(
    transport: Arc<LoopbackTransport>,
    env: SessionEnv,
    previously_connected: bool,
) -> Result<(Arc<WatchSession>, ConnectionState)> {
    let session = WatchSession::new(transport, env, previously_connected);
    session.start();
    let mut state = session.state();
    let reached = timeout(WAIT, state.wait_for(|s| s.is_connected())).await;
    let current = match reached {
        Ok(Ok(current)) => current.clone(),
        _ => bail!(
            "session did not connect: {:?}",
            session.fatal_error().unwrap_or_default()
        ),
    };
    Ok((session, current))
}

/// Start a session against a watch running normal firmware.
pub async fn connect_normal(
    transport: Arc<LoopbackTransport>,
    env: SessionEnv,
    previously_connected: bool,
) -> Result<(Arc<WatchSession>, ConnectedWatch)> {
    let (session, state) = connect(transport, env, previously_connected).await?;
    match state {
        ConnectionState::Connected(watch) => Ok((session, watch)),
        other => bail!("expected a normal connection, got {:?}", other.kind()),
    }
}
