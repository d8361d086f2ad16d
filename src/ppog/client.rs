//! Phone-side binding of the stream to a transport.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::stream::{PpogChannels, PpogStream, Role};
use super::PacketSender;
use crate::config::PpogConfig;
use crate::error::Result;
use crate::transport::Transport;

pub struct PpogClient {
    transport: Arc<dyn Transport>,
}

#[async_trait]
impl PacketSender for PpogClient {
    async fn send_packet(&self, packet: Bytes) -> bool {
        let accepted = self.transport.write(packet).await;
        if !accepted {
            debug!(watch = %self.transport.id(), "write without response refused");
        }
        accepted
    }
}

impl PpogClient {
    /// Subscribe to the transport's notifications and start the client stream.
    ///
    /// Notifications are forwarded in arrival order into a bounded channel;
    /// a full channel blocks the forwarder rather than dropping frames.
    pub fn start(
        transport: Arc<dyn Transport>,
        config: &PpogConfig,
        cancel: CancellationToken,
    ) -> Result<(PpogChannels, JoinHandle<Result<()>>)> {
        let mut notifications = transport.subscribe()?;
        let (inbound_tx, inbound_rx) = mpsc::channel(config.channel_size);

        let forward_cancel = cancel.clone();
        let watch = transport.id().clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = forward_cancel.cancelled() => break,
                    frame = notifications.recv() => {
                        let Some(frame) = frame else { break };
                        trace!(%watch, len = frame.len(), "inbound PPoG frame");
                        if inbound_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!(%watch, "PPoG notification forwarder stopped");
        });

        let client = Arc::new(PpogClient { transport });
        Ok(PpogStream::spawn(
            Role::Client,
            config.clone(),
            client,
            inbound_rx,
            cancel,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ppog::packet::PpogPacket;
    use crate::transport::{loopback, TransportId};

    #[tokio::test(start_paused = true)]
    async fn test_client_resets_over_transport() {
        let (transport, mut peers) = loopback(TransportId::Socket("ppog".into()), 64);
        transport.open().await.unwrap();
        let mut peer = peers.recv().await.unwrap();

        let (mut channels, _task) =
            PpogClient::start(transport.clone(), &PpogConfig::default(), CancellationToken::new())
                .unwrap();

        let first = PpogPacket::decode(peer.from_phone.recv().await.unwrap()).unwrap();
        assert!(matches!(first, PpogPacket::ResetRequest { rx_window: 25, .. }));

        peer.to_phone
            .send(PpogPacket::ResetComplete { rx_window: 8, tx_window: 8 }.encode())
            .await
            .unwrap();
        channels.ready.wait_for(|r| *r).await.unwrap();

        peer.to_phone
            .send(PpogPacket::Data { seq: 0, payload: Bytes::from_static(b"abc") }.encode())
            .await
            .unwrap();
        assert_eq!(channels.delivered.recv().await.unwrap(), Bytes::from_static(b"abc"));
        let ack = PpogPacket::decode(peer.from_phone.recv().await.unwrap()).unwrap();
        assert_eq!(ack, PpogPacket::Ack { seq: 0 });
    }
}
