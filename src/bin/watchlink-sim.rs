//! Drive the registry against simulated watches.
//!
//! Spawns simulated watches, connects to one through the registry, pushes a
//! batch of generated notifications through BlobDB and optionally runs a
//! firmware update with a progress bar.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use watchlink::blobdb::{watch_prefs_source, MemoryRecordSource, RecordSource};
use watchlink::connection::SessionEnv;
use watchlink::protocol::BlobDatabase;
use watchlink::putbytes::{FirmwareBundle, FirmwareUpdateStatus};
use watchlink::registry::{
    DeviceStatus, JsonDeviceStore, KnownDeviceStore, LifecycleEvent, MemoryDeviceStore,
    ScanResult, WatchRegistry,
};
use watchlink::simulator::{SimPlatform, SimulatedWatch, WatchProfile};
use watchlink::{Clock, LinkConfig, SharedClock, SystemClock, TransportId};

#[derive(Parser, Debug)]
#[command(name = "watchlink-sim")]
#[command(about = "Connect to simulated watches and exercise sync and firmware update", long_about = None)]
struct Cli {
    /// Config file (TOML). Defaults apply when absent
    #[arg(short, long, env = "WATCHLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Number of simulated watches to discover
    #[arg(short, long, default_value_t = 2)]
    watches: usize,

    /// Notifications to sync to the connected watch
    #[arg(short, long, default_value_t = 25)]
    records: usize,

    /// Size of a generated firmware image to install, in KiB (0 skips the update)
    #[arg(long, default_value_t = 0)]
    firmware_kib: usize,

    /// Persist known devices to this JSON file instead of memory
    #[arg(long)]
    store: Option<PathBuf>,

    /// Seconds to wait for each phase
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    tokio::select! {
        result = run(cli) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            Ok(())
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => LinkConfig::load(path)?,
        None => match LinkConfig::default_path() {
            Some(path) => LinkConfig::load_or_default(&path)?,
            None => LinkConfig::default(),
        },
    };
    let phase = Duration::from_secs(cli.timeout_secs);
    let clock: SharedClock = Arc::new(SystemClock);

    let platform = Arc::new(SimPlatform::new());
    let mut watches = Vec::new();
    for i in 0..cli.watches.max(1) {
        let id = TransportId::Socket(format!("sim-{i}"));
        let profile = WatchProfile {
            serial: format!("Q40244SIM{i:03}"),
            ..Default::default()
        };
        let (watch, transport) = SimulatedWatch::spawn(id, profile, config.ppog.clone());
        platform.attach(&watch, transport);
        watches.push(watch);
    }

    let notifications = Arc::new(MemoryRecordSource::new(BlobDatabase::Notification, clock.clone()));
    for i in 0..cli.records {
        notifications.insert_raw(
            Bytes::copy_from_slice(Uuid::new_v4().as_bytes()),
            Bytes::from(format!("notification #{i}")),
        );
    }
    let prefs = Arc::new(watch_prefs_source(clock.clone()));
    let sources: Vec<Arc<dyn RecordSource>> = vec![notifications, prefs];

    let store: Arc<dyn KnownDeviceStore> = match &cli.store {
        Some(path) => Arc::new(JsonDeviceStore::new(path.clone())),
        None => Arc::new(MemoryDeviceStore::new()),
    };
    let env = SessionEnv::new(Arc::new(config), clock.clone()).with_sources(sources);
    let (_radio_tx, radio) = watch::channel(true);
    let (registry, registry_task) = WatchRegistry::start(env, platform.clone(), store, radio).await?;
    let mut events = registry.events();

    for watch in &watches {
        registry
            .add_candidate(ScanResult {
                id: watch.id().clone(),
                name: format!("Pebble {}", watch.id().address()),
                rssi: -55,
                seen_at_ms: clock.now_ms(),
            })
            .await?;
    }

    let target = watches[0].clone();
    info!(watch = %target.id(), "requesting connection");
    registry.request_connect(target.id().clone()).await?;

    let connected = timeout(phase, async {
        loop {
            match events.recv().await {
                Ok(LifecycleEvent::Connected { id, info }) => return Ok((id, info)),
                Ok(_) => {}
                Err(e) => bail!("event stream closed: {e}"),
            }
        }
    })
    .await
    .context("timed out waiting for the watch to connect")??;
    println!(
        "connected to {} running {} (serial {})",
        connected.0, connected.1.running_firmware, connected.1.serial
    );

    let expected = cli.records;
    let synced = target
        .wait_until(phase, |s| s.records(BlobDatabase::Notification).len() >= expected)
        .await;
    let (on_watch, commands) = target.inspect(|s| {
        (
            s.records(BlobDatabase::Notification).len(),
            s.blob_commands.len(),
        )
    });
    println!("{on_watch}/{expected} notifications on the watch after {commands} BlobDB commands");
    if !synced {
        bail!("BlobDB sync did not converge");
    }

    if cli.firmware_kib > 0 {
        run_firmware_update(&registry, &target, cli.firmware_kib * 1024, phase).await?;
    }

    registry.shutdown().await?;
    registry_task.await.context("registry task panicked")?;
    for watch in &watches {
        watch.shutdown();
    }
    Ok(())
}

async fn run_firmware_update(
    registry: &WatchRegistry,
    target: &SimulatedWatch,
    size: usize,
    phase: Duration,
) -> Result<()> {
    let device = registry
        .devices()
        .borrow()
        .iter()
        .find(|d| &d.id == target.id())
        .map(|d| d.status.clone());
    let Some(DeviceStatus::Connected(watch)) = device else {
        bail!("{} is not connected", target.id());
    };

    let firmware: Vec<u8> = (0..size).map(|_| rand::random::<u8>()).collect();
    let resources: Vec<u8> = (0..size / 4).map(|_| rand::random::<u8>()).collect();
    let bundle = FirmwareBundle::from_images(
        watch.info().platform,
        Bytes::from(firmware),
        Some(Bytes::from(resources)),
    );

    let bar = ProgressBar::new(1000);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.green} {msg} [{bar:40.cyan/blue}] {percent}%")
            .context("invalid progress template")?
            .progress_chars("=> "),
    );
    bar.set_message("firmware");
    bar.enable_steady_tick(Duration::from_millis(120));

    let mut status = watch.update_firmware(bundle);
    let outcome = timeout(phase, async {
        loop {
            let current = status.borrow_and_update().clone();
            match current {
                FirmwareUpdateStatus::InProgress(done) => bar.set_position((done * 1000.0) as u64),
                FirmwareUpdateStatus::WaitingForReboot => bar.set_message("waiting for reboot"),
                FirmwareUpdateStatus::Rebooting => return Ok(()),
                FirmwareUpdateStatus::ErrorStarting(e) => bail!("firmware update refused: {e}"),
                FirmwareUpdateStatus::Failed {
                    message,
                    bytes_transferred,
                } => bail!("firmware update failed after {bytes_transferred} bytes: {message}"),
                FirmwareUpdateStatus::Idle | FirmwareUpdateStatus::WaitingToStart => {}
            }
            if status.changed().await.is_err() {
                bail!("session ended before the watch rebooted");
            }
        }
    })
    .await
    .context("timed out waiting for the firmware update")?;

    match outcome {
        Ok(()) => {
            bar.finish_with_message("installed, watch rebooting");
            let installed = target.inspect(|s| s.installed.len());
            println!("{installed} objects installed");
            Ok(())
        }
        Err(e) => {
            bar.abandon_with_message("failed");
            Err(e)
        }
    }
}
