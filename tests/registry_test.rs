mod common;

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::{broadcast, watch};
    use tokio::task::JoinHandle;
    use tokio::time::{sleep, timeout};

    use super::common::{clock, sim_watch, test_config, WAIT};
    use watchlink::connection::SessionEnv;
    use watchlink::registry::{
        DeviceStatus, KnownDevice, KnownDeviceStore, LifecycleEvent, MemoryDeviceStore,
        ScanResult, WatchDevice, WatchRegistry,
    };
    use watchlink::simulator::{SimPlatform, SimulatedWatch, WatchProfile};
    use watchlink::{Clock, LinkConfig, SharedClock, TransportId};

    struct Rig {
        clock: SharedClock,
        platform: Arc<SimPlatform>,
        store: Arc<MemoryDeviceStore>,
        watches: Vec<Arc<SimulatedWatch>>,
        registry: WatchRegistry,
        task: JoinHandle<()>,
        radio: watch::Sender<bool>,
        events: broadcast::Receiver<LifecycleEvent>,
    }

    impl Rig {
        async fn start(names: &[&str], known: Vec<KnownDevice>) -> anyhow::Result<Self> {
            Self::start_with(names, known, test_config()).await
        }

        async fn start_with(
            names: &[&str],
            known: Vec<KnownDevice>,
            config: LinkConfig,
        ) -> anyhow::Result<Self> {
            let clock = clock();
            let platform = Arc::new(SimPlatform::new());
            let mut watches = Vec::new();
            for name in names {
                let (watch, transport) = sim_watch(name, WatchProfile::default());
                platform.attach(&watch, transport);
                watches.push(watch);
            }
            let store = Arc::new(MemoryDeviceStore::with_devices(known));
            let env = SessionEnv::new(Arc::new(config), clock.clone());
            let (radio, radio_rx) = watch::channel(true);
            let (registry, task) =
                WatchRegistry::start(env, platform.clone(), store.clone(), radio_rx).await?;
            let events = registry.events();
            Ok(Self {
                clock,
                platform,
                store,
                watches,
                registry,
                task,
                radio,
                events,
            })
        }

        fn id(&self, index: usize) -> TransportId {
            self.watches[index].id().clone()
        }

        async fn scan(&self, index: usize) -> anyhow::Result<()> {
            let id = self.id(index);
            self.registry
                .add_candidate(ScanResult {
                    name: format!("Pebble {}", id.address()),
                    id,
                    rssi: -60,
                    seen_at_ms: self.clock.now_ms(),
                })
                .await?;
            Ok(())
        }

        async fn next_event(&mut self) -> anyhow::Result<LifecycleEvent> {
            Ok(timeout(WAIT, self.events.recv()).await??)
        }

        async fn expect_connected(&mut self, index: usize) -> anyhow::Result<()> {
            let expected = self.id(index);
            match self.next_event().await? {
                LifecycleEvent::Connected { id, .. } if id == expected => Ok(()),
                other => anyhow::bail!("expected {expected} to connect, got {other:?}"),
            }
        }

        async fn expect_disconnected(&mut self, index: usize) -> anyhow::Result<()> {
            let expected = self.id(index);
            match self.next_event().await? {
                LifecycleEvent::Disconnected { id } if id == expected => Ok(()),
                other => anyhow::bail!("expected {expected} to disconnect, got {other:?}"),
            }
        }

        async fn wait_devices(&self, check: impl FnMut(&Vec<WatchDevice>) -> bool) -> anyhow::Result<()> {
            let mut devices = self.registry.devices();
            timeout(WAIT, devices.wait_for(check)).await??;
            Ok(())
        }

        async fn stop(self) -> anyhow::Result<()> {
            self.registry.shutdown().await?;
            self.task.await?;
            for watch in &self.watches {
                watch.shutdown();
            }
            Ok(())
        }
    }

    fn known(watch: &SimulatedWatch, goal: bool) -> KnownDevice {
        let mut device = KnownDevice::new(watch.id().clone(), "Pebble Time");
        device.firmware_version = "v4.3.0".into();
        device.last_connected_ms = Some(1_600_000_000_000);
        device.connect_goal = goal;
        device
    }

    fn in_session(status: &DeviceStatus) -> bool {
        !matches!(
            status,
            DeviceStatus::Discovered | DeviceStatus::Known | DeviceStatus::Bonding
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_known_watch_with_goal_connects_and_persists() -> anyhow::Result<()> {
        let (seed, _) = sim_watch("reg-a", WatchProfile::default());
        let mut rig = Rig::start(&["reg-a"], vec![known(&seed, true)]).await?;
        let id = rig.id(0);

        match rig.next_event().await? {
            LifecycleEvent::Connected { id: connected, info } => {
                assert_eq!(connected, id);
                assert_eq!(info.running_firmware, "v4.4.0");
            }
            other => anyhow::bail!("unexpected event {other:?}"),
        }
        rig.wait_devices(|d| d.iter().any(|w| w.status.is_connected()))
            .await?;

        let stored = rig.store.get(&id).ok_or_else(|| anyhow::anyhow!("not stored"))?;
        assert_eq!(stored.firmware_version, "v4.4.0");
        assert_eq!(stored.serial, "Q402445E009M");
        assert_eq!(stored.platform, 9);
        assert_eq!(stored.last_connected_ms, Some(rig.clock.now_ms()));
        assert!(stored.connect_goal);
        // a stored goal connects without bonding again
        assert_eq!(rig.platform.bonds(), 0);

        rig.registry.request_disconnect(id.clone()).await?;
        rig.expect_disconnected(0).await?;
        rig.wait_devices(|d| matches!(d[0].status, DeviceStatus::Known))
            .await?;
        assert!(!rig.store.get(&id).is_some_and(|d| d.connect_goal));
        assert!(rig.events.try_recv().is_err());
        rig.stop().await
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_connect_opens_one_session() -> anyhow::Result<()> {
        let mut rig = Rig::start(&["reg-b"], vec![]).await?;
        rig.scan(0).await?;
        let id = rig.id(0);

        rig.registry.request_connect(id.clone()).await?;
        rig.registry.request_connect(id.clone()).await?;
        rig.expect_connected(0).await?;
        sleep(Duration::from_secs(2)).await;

        assert_eq!(rig.platform.bonds(), 1);
        assert_eq!(rig.platform.transports_created(), 1);
        assert_eq!(rig.platform.scan_stops(), 1);
        assert!(rig.events.try_recv().is_err());

        // first connection of a scanned watch makes it known
        let stored = rig.store.get(&id).ok_or_else(|| anyhow::anyhow!("not stored"))?;
        assert!(stored.connect_goal);
        rig.stop().await
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_watch_mode_never_overlaps_sessions() -> anyhow::Result<()> {
        let mut rig = Rig::start(&["reg-c", "reg-d"], vec![]).await?;
        rig.scan(0).await?;
        rig.scan(1).await?;

        let mut devices = rig.registry.devices();
        let monitor = tokio::spawn(async move {
            let mut most = 0;
            while devices.changed().await.is_ok() {
                let sessions = devices
                    .borrow_and_update()
                    .iter()
                    .filter(|d| in_session(&d.status))
                    .count();
                most = most.max(sessions);
            }
            most
        });

        rig.registry.request_connect(rig.id(0)).await?;
        rig.expect_connected(0).await?;
        rig.registry.request_connect(rig.id(1)).await?;
        rig.expect_disconnected(0).await?;
        rig.expect_connected(1).await?;

        let first = rig.id(0);
        let second = rig.id(1);
        assert!(!rig.store.get(&first).is_some_and(|d| d.connect_goal));
        assert!(rig.store.get(&second).is_some_and(|d| d.connect_goal));
        assert!(!rig.watches[0].is_linked());

        rig.stop().await?;
        assert_eq!(monitor.await?, 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_multiple_watch_mode_connects_both() -> anyhow::Result<()> {
        let mut config = test_config();
        config.registry.multiple_connected_watches = true;
        let mut rig = Rig::start_with(&["reg-e", "reg-f"], vec![], config).await?;
        rig.scan(0).await?;
        rig.scan(1).await?;

        rig.registry.request_connect(rig.id(0)).await?;
        rig.expect_connected(0).await?;
        rig.registry.request_connect(rig.id(1)).await?;
        rig.expect_connected(1).await?;
        rig.wait_devices(|d| d.iter().filter(|w| w.status.is_connected()).count() == 2)
            .await?;
        rig.stop().await
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_bond_clears_connect_goal() -> anyhow::Result<()> {
        let (seed, _) = sim_watch("reg-g", WatchProfile::default());
        let rig = Rig::start(&["reg-g"], vec![known(&seed, false)]).await?;
        let id = rig.id(0);
        rig.platform.fail_bonding(id.clone());

        rig.registry.request_connect(id.clone()).await?;
        while rig.platform.bonds() == 0 {
            sleep(Duration::from_millis(10)).await;
        }
        rig.wait_devices(|d| !d[0].connect_goal && matches!(d[0].status, DeviceStatus::Known))
            .await?;
        sleep(Duration::from_secs(1)).await;

        assert_eq!(rig.platform.transports_created(), 0);
        assert!(!rig.store.get(&id).is_some_and(|d| d.connect_goal));
        rig.stop().await
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_bond_times_out_and_allows_retry() -> anyhow::Result<()> {
        let (seed, _) = sim_watch("reg-stall", WatchProfile::default());
        let mut rig = Rig::start(&["reg-stall"], vec![known(&seed, false)]).await?;
        let id = rig.id(0);
        rig.platform.stall_bonding(id.clone());

        rig.registry.request_connect(id.clone()).await?;
        rig.wait_devices(|d| matches!(d[0].status, DeviceStatus::Bonding)).await?;
        // gives up after the connect timeout
        rig.wait_devices(|d| !d[0].connect_goal && matches!(d[0].status, DeviceStatus::Known))
            .await?;
        assert_eq!(rig.platform.bonds(), 1);
        assert_eq!(rig.platform.transports_created(), 0);

        rig.platform.resume_bonding(&id);
        rig.registry.request_connect(id.clone()).await?;
        rig.expect_connected(0).await?;
        assert_eq!(rig.platform.bonds(), 2);
        rig.stop().await
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_known_watch_is_forgotten() -> anyhow::Result<()> {
        let (orphan, _) = sim_watch("reg-h", WatchProfile::default());
        let rig = Rig::start(&[], vec![known(&orphan, true)]).await?;

        sleep(Duration::from_millis(500)).await;
        assert!(rig.store.list().await?.is_empty());
        assert!(rig.registry.devices().borrow().is_empty());
        rig.stop().await
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_waits_for_session_to_end() -> anyhow::Result<()> {
        let (seed, _) = sim_watch("reg-i", WatchProfile::default());
        let mut rig = Rig::start(&["reg-i"], vec![known(&seed, true)]).await?;
        let id = rig.id(0);
        rig.expect_connected(0).await?;

        rig.registry.forget(id.clone()).await?;
        rig.expect_disconnected(0).await?;
        rig.wait_devices(|d| d.is_empty()).await?;
        assert!(rig.store.get(&id).is_none());

        let transport = rig
            .platform
            .transport(&id)
            .ok_or_else(|| anyhow::anyhow!("transport detached"))?;
        assert_eq!(transport.close_count(), 1);
        sleep(Duration::from_secs(2)).await;
        assert_eq!(rig.platform.transports_created(), 1);
        rig.stop().await
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_reconnects_while_goal_is_set() -> anyhow::Result<()> {
        let (seed, _) = sim_watch("reg-j", WatchProfile::default());
        let mut rig = Rig::start(&["reg-j"], vec![known(&seed, true)]).await?;
        rig.expect_connected(0).await?;

        rig.watches[0].drop_link();
        rig.expect_disconnected(0).await?;
        rig.expect_connected(0).await?;
        assert_eq!(rig.platform.transports_created(), 2);
        assert_eq!(rig.watches[0].inspect(|s| s.links), 2);
        rig.stop().await
    }

    #[tokio::test(start_paused = true)]
    async fn test_radio_off_closes_and_radio_on_reopens() -> anyhow::Result<()> {
        let (seed, _) = sim_watch("reg-k", WatchProfile::default());
        let mut rig = Rig::start(&["reg-k"], vec![known(&seed, true)]).await?;
        rig.expect_connected(0).await?;

        rig.radio.send_replace(false);
        rig.expect_disconnected(0).await?;
        sleep(Duration::from_secs(2)).await;
        assert_eq!(rig.platform.transports_created(), 1);

        rig.radio.send_replace(true);
        rig.expect_connected(0).await?;
        assert_eq!(rig.platform.transports_created(), 2);
        rig.stop().await
    }

    #[tokio::test(start_paused = true)]
    async fn test_connecting_scanned_watch_clears_other_scan_results() -> anyhow::Result<()> {
        let mut rig = Rig::start(&["reg-l", "reg-m"], vec![]).await?;
        rig.scan(0).await?;
        rig.scan(1).await?;
        rig.wait_devices(|d| d.len() == 2).await?;

        rig.registry.request_connect(rig.id(0)).await?;
        rig.expect_connected(0).await?;
        let id = rig.id(0);
        rig.wait_devices(|d| d.len() == 1 && d[0].id == id && d[0].known.is_some())
            .await?;
        rig.stop().await
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_disconnects_every_session() -> anyhow::Result<()> {
        let (seed, _) = sim_watch("reg-n", WatchProfile::default());
        let mut rig = Rig::start(&["reg-n"], vec![known(&seed, true)]).await?;
        rig.expect_connected(0).await?;
        let transport = rig
            .platform
            .transport(&rig.id(0))
            .ok_or_else(|| anyhow::anyhow!("transport detached"))?;

        rig.registry.shutdown().await?;
        timeout(WAIT, &mut rig.task).await??;
        assert_eq!(transport.close_count(), 1);
        assert!(rig.registry.request_connect(rig.id(0)).await.is_err());
        Ok(())
    }
}
