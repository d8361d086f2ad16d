//! Version exchange, firmware update signalling, ping and app run state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use super::await_reply;
use crate::error::Result;
use crate::protocol::{
    AppRunStateMessage, Endpoint, FirmwareUpdateStartStatus, Packet, PhoneAppVersion,
    PhoneVersionMessage, PingMessage, ProtocolCaps, ProtocolHandler, SystemMessage,
    WatchVersionMessage, WatchVersionResponse,
};

pub struct SystemService {
    handler: Arc<ProtocolHandler>,
    phone_caps: ProtocolCaps,
    watch_version: Mutex<Option<oneshot::Sender<WatchVersionResponse>>>,
    firmware_start: Mutex<Option<oneshot::Sender<FirmwareUpdateStartStatus>>>,
    pings: Mutex<HashMap<u32, oneshot::Sender<()>>>,
    running_app: watch::Sender<Option<Uuid>>,
}

impl SystemService {
    pub fn start(
        handler: Arc<ProtocolHandler>,
        phone_caps: ProtocolCaps,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let inbound = handler.subscribe(&[
            Endpoint::WatchVersion,
            Endpoint::PhoneVersion,
            Endpoint::SystemMessage,
            Endpoint::Ping,
            Endpoint::AppRunState,
        ]);
        let (running_app, _) = watch::channel(None);
        let service = Arc::new(Self {
            handler,
            phone_caps,
            watch_version: Mutex::new(None),
            firmware_start: Mutex::new(None),
            pings: Mutex::new(HashMap::new()),
            running_app,
        });

        let worker = service.clone();
        tokio::spawn(async move { worker.run(inbound, cancel).await });
        service
    }

    async fn run(&self, mut inbound: mpsc::Receiver<Packet>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                packet = inbound.recv() => {
                    let Some(packet) = packet else { break };
                    if let Err(e) = self.handle(packet).await {
                        debug!("system service stopping: {e}");
                        break;
                    }
                }
            }
        }
    }

    async fn handle(&self, packet: Packet) -> Result<()> {
        match packet {
            Packet::WatchVersion(WatchVersionMessage::Response(response)) => {
                if let Some(tx) = self.watch_version.lock().take() {
                    let _ = tx.send(*response);
                }
            }
            Packet::PhoneVersion(PhoneVersionMessage::Request) => {
                debug!("watch requested phone version");
                let reply = PhoneAppVersion::current(self.phone_caps);
                self.handler
                    .send(Packet::PhoneVersion(PhoneVersionMessage::Response(reply)))
                    .await?;
            }
            Packet::System(SystemMessage::FirmwareUpdateStartResponse { status }) => {
                if let Some(tx) = self.firmware_start.lock().take() {
                    let _ = tx.send(status);
                }
            }
            Packet::Ping(PingMessage::Pong { cookie }) => {
                if let Some(tx) = self.pings.lock().remove(&cookie) {
                    let _ = tx.send(());
                }
            }
            Packet::Ping(PingMessage::Ping { cookie, .. }) => {
                self.handler
                    .send(Packet::Ping(PingMessage::Pong { cookie }))
                    .await?;
            }
            Packet::AppRunState(AppRunStateMessage::Start(uuid)) => {
                self.running_app.send_replace(Some(uuid));
            }
            Packet::AppRunState(AppRunStateMessage::Stop(uuid)) => {
                self.running_app.send_if_modified(|current| {
                    if *current == Some(uuid) {
                        *current = None;
                        true
                    } else {
                        false
                    }
                });
            }
            other => trace!(endpoint = other.endpoint_id(), "unhandled system packet"),
        }
        Ok(())
    }

    pub async fn request_watch_version(&self, timeout: Duration) -> Result<WatchVersionResponse> {
        let (tx, rx) = oneshot::channel();
        *self.watch_version.lock() = Some(tx);
        self.handler
            .send(Packet::WatchVersion(WatchVersionMessage::Request))
            .await?;
        await_reply(rx, timeout, "watch version").await
    }

    /// Round-trip a ping; returns the echoed cookie.
    pub async fn ping(&self, cookie: u32, timeout: Duration) -> Result<u32> {
        let (tx, rx) = oneshot::channel();
        self.pings.lock().insert(cookie, tx);
        let sent = self
            .handler
            .send(Packet::Ping(PingMessage::Ping {
                cookie,
                idle: false,
            }))
            .await;
        let result = match sent {
            Ok(()) => await_reply(rx, timeout, "pong").await,
            Err(e) => Err(e),
        };
        if result.is_err() {
            self.pings.lock().remove(&cookie);
        }
        result.map(|()| cookie)
    }

    pub async fn firmware_update_start(
        &self,
        offset: u32,
        total: u32,
        timeout: Duration,
    ) -> Result<FirmwareUpdateStartStatus> {
        let (tx, rx) = oneshot::channel();
        *self.firmware_start.lock() = Some(tx);
        self.handler
            .send(Packet::System(SystemMessage::FirmwareUpdateStart {
                offset,
                total,
            }))
            .await?;
        await_reply(rx, timeout, "firmware update start").await
    }

    pub async fn firmware_update_complete(&self) -> Result<()> {
        self.handler
            .send(Packet::System(SystemMessage::FirmwareUpdateComplete))
            .await
    }

    pub async fn firmware_update_failed(&self) -> Result<()> {
        self.handler
            .send(Packet::System(SystemMessage::FirmwareUpdateFailed))
            .await
    }

    pub async fn launch_app(&self, uuid: Uuid) -> Result<()> {
        self.handler
            .send(Packet::AppRunState(AppRunStateMessage::Start(uuid)))
            .await
    }

    pub fn running_app(&self) -> watch::Receiver<Option<Uuid>> {
        self.running_app.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LinkError;
    use crate::protocol::{Origin, RawFrame};
    use bytes::Bytes;

    fn decode_sent(frame: Bytes) -> Packet {
        let raw = RawFrame {
            endpoint: u16::from_be_bytes([frame[2], frame[3]]),
            payload: frame.slice(4..),
        };
        Packet::decode(Origin::Phone, raw).unwrap()
    }

    #[tokio::test]
    async fn test_answers_phone_version_request() {
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let handler = ProtocolHandler::new(Origin::Phone, out_tx);
        let (in_tx, in_rx) = mpsc::channel(8);
        let runner = handler.clone();
        tokio::spawn(async move { runner.run_inbound(in_rx).await });
        let _service =
            SystemService::start(handler, ProtocolCaps::APP_MESSAGE_8K, CancellationToken::new());

        in_tx.send(PhoneVersionMessage::Request.encode()).await.unwrap();
        match decode_sent(out_rx.recv().await.unwrap()) {
            Packet::PhoneVersion(PhoneVersionMessage::Response(v)) => {
                assert_eq!(v.protocol_caps, ProtocolCaps::APP_MESSAGE_8K);
                assert_eq!(v.protocol_version, u32::MAX);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_times_out_and_clears() {
        let (out_tx, _out_rx) = mpsc::channel(8);
        let handler = ProtocolHandler::new(Origin::Phone, out_tx);
        let service = SystemService::start(handler, ProtocolCaps::empty(), CancellationToken::new());
        let err = service.ping(3, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, LinkError::Timeout(..)));
        assert!(service.pings.lock().is_empty());
    }

    #[tokio::test]
    async fn test_tracks_running_app() {
        let (out_tx, _out_rx) = mpsc::channel(8);
        let handler = ProtocolHandler::new(Origin::Phone, out_tx);
        let (in_tx, in_rx) = mpsc::channel(8);
        let runner = handler.clone();
        tokio::spawn(async move { runner.run_inbound(in_rx).await });
        let service = SystemService::start(handler, ProtocolCaps::empty(), CancellationToken::new());
        let mut running = service.running_app();

        let app = Uuid::new_v4();
        in_tx.send(AppRunStateMessage::Start(app).encode()).await.unwrap();
        running.changed().await.unwrap();
        assert_eq!(*running.borrow(), Some(app));

        in_tx.send(AppRunStateMessage::Stop(app).encode()).await.unwrap();
        running.changed().await.unwrap();
        assert_eq!(*running.borrow(), None);
    }
}
