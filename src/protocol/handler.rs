//! Packet send path and inbound routing by endpoint.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::{frame_fits, Endpoint, Origin, Packet, PacketAssembler, RawFrame};
use crate::error::{LinkError, Result};

/// Capacity of each subscriber channel.
pub const ROUTE_CHANNEL_SIZE: usize = 64;

pub struct ProtocolHandler {
    local: Origin,
    outbound: mpsc::Sender<Bytes>,
    routes: Mutex<HashMap<u16, Vec<mpsc::Sender<Packet>>>>,
}

impl ProtocolHandler {
    /// `local` is the side this handler speaks for; inbound frames are
    /// decoded as coming from the other side.
    pub fn new(local: Origin, outbound: mpsc::Sender<Bytes>) -> Arc<Self> {
        Arc::new(Self {
            local,
            outbound,
            routes: Mutex::new(HashMap::new()),
        })
    }

    pub async fn send(&self, packet: Packet) -> Result<()> {
        trace!(endpoint = packet.endpoint_id(), "send packet");
        self.send_raw(packet.encode()).await
    }

    /// Send an already-framed packet. Oversized frames are refused before
    /// they reach the stream.
    pub async fn send_raw(&self, frame: Bytes) -> Result<()> {
        if !frame_fits(&frame) {
            return Err(LinkError::Protocol(format!(
                "frame of {} bytes exceeds the maximum payload",
                frame.len()
            )));
        }
        self.outbound
            .send(frame)
            .await
            .map_err(|_| LinkError::Disconnected)
    }

    /// Receive every inbound packet for the given endpoints.
    pub fn subscribe(&self, endpoints: &[Endpoint]) -> mpsc::Receiver<Packet> {
        let ids: Vec<u16> = endpoints.iter().map(|e| e.id()).collect();
        self.subscribe_ids(&ids)
    }

    /// Same as [`subscribe`](Self::subscribe) for endpoints the codec does not know.
    pub fn subscribe_ids(&self, ids: &[u16]) -> mpsc::Receiver<Packet> {
        let (tx, rx) = mpsc::channel(ROUTE_CHANNEL_SIZE);
        let mut routes = self.routes.lock();
        for id in ids {
            routes.entry(*id).or_default().push(tx.clone());
        }
        rx
    }

    /// Consume the in-order byte stream until it ends.
    pub async fn run_inbound(&self, mut delivered: mpsc::Receiver<Bytes>) -> Result<()> {
        let mut assembler = PacketAssembler::default();
        while let Some(chunk) = delivered.recv().await {
            for frame in assembler.push(&chunk) {
                self.dispatch(frame).await;
            }
        }
        debug!(side = ?self.local, "inbound stream ended");
        Err(LinkError::Disconnected)
    }

    async fn dispatch(&self, frame: RawFrame) {
        let endpoint = frame.endpoint;
        let packet = match Packet::decode(self.local.peer(), frame) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(endpoint, "dropping undecodable packet: {e:#}");
                return;
            }
        };

        let targets = self
            .routes
            .lock()
            .get(&endpoint)
            .cloned()
            .unwrap_or_default();
        if targets.is_empty() {
            debug!(endpoint, "no subscriber for packet");
            return;
        }

        let mut saw_closed = false;
        for tx in targets {
            if tx.send(packet.clone()).await.is_err() {
                saw_closed = true;
            }
        }
        if saw_closed {
            if let Some(list) = self.routes.lock().get_mut(&endpoint) {
                list.retain(|tx| !tx.is_closed());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BlobResponse, BlobStatus, PingMessage};

    #[tokio::test]
    async fn test_routes_by_endpoint() {
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let handler = ProtocolHandler::new(Origin::Phone, out_tx);
        let mut blob = handler.subscribe(&[Endpoint::BlobDb]);
        let mut raw = handler.subscribe_ids(&[0x4242]);

        let (in_tx, in_rx) = mpsc::channel(8);
        let runner = handler.clone();
        let task = tokio::spawn(async move { runner.run_inbound(in_rx).await });

        let response = BlobResponse {
            token: 5,
            status: BlobStatus::Success,
        }
        .encode();
        // split across two stream chunks
        in_tx.send(response.slice(..2)).await.unwrap();
        in_tx.send(response.slice(2..)).await.unwrap();
        in_tx.send(crate::protocol::frame(0x4242, b"?")).await.unwrap();

        assert_eq!(
            blob.recv().await.unwrap(),
            Packet::BlobResponse(BlobResponse {
                token: 5,
                status: BlobStatus::Success
            })
        );
        assert!(matches!(
            raw.recv().await.unwrap(),
            Packet::Unknown { endpoint: 0x4242, .. }
        ));

        handler
            .send(Packet::Ping(PingMessage::Pong { cookie: 1 }))
            .await
            .unwrap();
        assert_eq!(out_rx.recv().await.unwrap().len(), 9);

        drop(in_tx);
        assert!(matches!(task.await.unwrap(), Err(LinkError::Disconnected)));
    }

    #[tokio::test]
    async fn test_oversized_packet_is_refused() {
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let handler = ProtocolHandler::new(Origin::Phone, out_tx);

        let result = handler
            .send(Packet::Unknown {
                endpoint: 0x4242,
                payload: Bytes::from(vec![0; 70_000]),
            })
            .await;
        assert!(matches!(result, Err(LinkError::Protocol(_))));
        assert!(out_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let (out_tx, _out_rx) = mpsc::channel(8);
        let handler = ProtocolHandler::new(Origin::Watch, out_tx);
        drop(handler.subscribe(&[Endpoint::Ping]));
        let mut live = handler.subscribe(&[Endpoint::Ping]);

        let (in_tx, in_rx) = mpsc::channel(8);
        let runner = handler.clone();
        tokio::spawn(async move { runner.run_inbound(in_rx).await });
        in_tx
            .send(PingMessage::Ping { cookie: 9, idle: false }.encode())
            .await
            .unwrap();
        assert!(matches!(live.recv().await.unwrap(), Packet::Ping(_)));
        // second packet is only routed after the first dispatch finished pruning
        in_tx
            .send(PingMessage::Pong { cookie: 9 }.encode())
            .await
            .unwrap();
        assert!(matches!(live.recv().await.unwrap(), Packet::Ping(_)));
        assert_eq!(handler.routes.lock().get(&Endpoint::Ping.id()).unwrap().len(), 1);
    }
}
