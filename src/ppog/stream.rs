//! Reliable stream state machine.
//!
//! Reset handshake, then go-back-N: at most `tx_window` data packets in
//! flight, cumulative acks, and a retransmit timer that re-sends everything
//! unacknowledged. The receiver only accepts the next expected sequence and
//! re-acks the last in-order packet for anything else.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::packet::{next_seq, PpogPacket, PPOG_VERSION};
use super::PacketSender;
use crate::config::PpogConfig;
use crate::error::{LinkError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Phone side: initiates the reset handshake
    Client,
    /// Watch side: answers the reset
    Server,
}

/// Application-facing ends of a running stream.
#[derive(Debug)]
pub struct PpogChannels {
    /// Bytes to send; split into data packets as the window allows
    pub outbound: mpsc::Sender<Bytes>,
    /// Bytes received, in order, with no gaps
    pub delivered: mpsc::Receiver<Bytes>,
    /// Flips to `true` once the reset handshake completes
    pub ready: watch::Receiver<bool>,
}

pub struct PpogStream {
    role: Role,
    config: PpogConfig,
    sender: Arc<dyn PacketSender>,
    negotiated: bool,
    tx_window: u8,
    rx_window: u8,
    next_tx: u8,
    unacked: VecDeque<(u8, Bytes)>,
    pending: VecDeque<Bytes>,
    expected_rx: u8,
    last_delivered: Option<u8>,
    retries: u32,
    deadline: Option<Instant>,
    ready: watch::Sender<bool>,
}

impl PpogStream {
    /// Spawn the stream task. It ends cleanly on cancellation or when the
    /// application drops its channel ends, and with an error when the link
    /// goes away or retransmission gives up.
    pub fn spawn(
        role: Role,
        config: PpogConfig,
        sender: Arc<dyn PacketSender>,
        inbound: mpsc::Receiver<Bytes>,
        cancel: CancellationToken,
    ) -> (PpogChannels, JoinHandle<Result<()>>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.channel_size);
        let (delivered_tx, delivered_rx) = mpsc::channel(config.channel_size);
        let (ready_tx, ready_rx) = watch::channel(false);

        let stream = Self {
            role,
            tx_window: config.max_window,
            rx_window: config.max_window,
            config,
            sender,
            negotiated: false,
            next_tx: 0,
            unacked: VecDeque::new(),
            pending: VecDeque::new(),
            expected_rx: 0,
            last_delivered: None,
            retries: 0,
            deadline: None,
            ready: ready_tx,
        };

        let handle = tokio::spawn(stream.run(inbound, outbound_rx, delivered_tx, cancel));
        (
            PpogChannels {
                outbound: outbound_tx,
                delivered: delivered_rx,
                ready: ready_rx,
            },
            handle,
        )
    }

    fn pending_limit(&self) -> usize {
        self.tx_window as usize * 2
    }

    async fn run(
        mut self,
        mut inbound: mpsc::Receiver<Bytes>,
        mut outbound: mpsc::Receiver<Bytes>,
        delivered: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
    ) -> Result<()> {
        if self.role == Role::Client {
            self.send_reset().await?;
        }

        loop {
            let deadline = self.deadline;
            let accept_outbound = self.negotiated && self.pending.len() < self.pending_limit();

            tokio::select! {
                biased;

                _ = cancel.cancelled() => return Ok(()),

                frame = inbound.recv() => {
                    let Some(frame) = frame else {
                        debug!(role = ?self.role, "PPoG inbound closed");
                        return Err(LinkError::Disconnected);
                    };
                    match PpogPacket::decode(frame) {
                        Ok(packet) => {
                            if !self.handle(packet, &delivered).await? {
                                return Ok(());
                            }
                        }
                        Err(e) => warn!(role = ?self.role, "dropping malformed PPoG packet: {e:#}"),
                    }
                }

                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_timeout().await?;
                }

                bytes = outbound.recv(), if accept_outbound => {
                    let Some(bytes) = bytes else { return Ok(()) };
                    self.enqueue(bytes);
                    self.pump().await?;
                }
            }
        }
    }

    /// Returns `false` when the application side has gone away.
    async fn handle(&mut self, packet: PpogPacket, delivered: &mpsc::Sender<Bytes>) -> Result<bool> {
        match packet {
            PpogPacket::Data { seq, payload } => {
                if !self.negotiated {
                    debug!(role = ?self.role, seq, "data before reset, ignoring");
                    return Ok(true);
                }
                if seq == self.expected_rx {
                    if delivered.send(payload).await.is_err() {
                        return Ok(false);
                    }
                    self.send(PpogPacket::Ack { seq }).await?;
                    self.last_delivered = Some(seq);
                    self.expected_rx = next_seq(seq);
                } else if let Some(last) = self.last_delivered {
                    trace!(role = ?self.role, seq, expected = self.expected_rx, "out of order, re-acking");
                    self.send(PpogPacket::Ack { seq: last }).await?;
                }
            }
            PpogPacket::Ack { seq } => self.on_ack(seq).await?,
            PpogPacket::ResetRequest {
                version,
                rx_window,
                tx_window,
            } => {
                if self.role == Role::Client {
                    warn!("unexpected ResetRequest on client stream");
                    return Ok(true);
                }
                debug!(version, rx_window, tx_window, "PPoG reset requested");
                self.reset_state();
                self.tx_window = rx_window.clamp(1, self.config.max_window);
                self.rx_window = tx_window.clamp(1, self.config.max_window);
                self.send(PpogPacket::ResetComplete {
                    rx_window: self.rx_window,
                    tx_window: self.tx_window,
                })
                .await?;
                self.ready.send_replace(true);
                self.pump().await?;
            }
            PpogPacket::ResetComplete {
                rx_window,
                tx_window,
            } => {
                if self.role == Role::Server {
                    warn!("unexpected ResetComplete on server stream");
                    return Ok(true);
                }
                // answer to a retried request; the window is already live
                if self.negotiated {
                    debug!(rx_window, tx_window, "duplicate ResetComplete, ignoring");
                    return Ok(true);
                }
                self.reset_state();
                // Our transmit window is bounded by what the peer can receive
                self.tx_window = rx_window.clamp(1, self.config.max_window);
                self.rx_window = tx_window.clamp(1, self.config.max_window);
                debug!(tx_window = self.tx_window, rx_window = self.rx_window, "PPoG stream ready");
                self.ready.send_replace(true);
                self.pump().await?;
            }
        }
        Ok(true)
    }

    fn reset_state(&mut self) {
        self.negotiated = true;
        self.next_tx = 0;
        self.unacked.clear();
        self.expected_rx = 0;
        self.last_delivered = None;
        self.retries = 0;
        self.deadline = None;
    }

    async fn on_ack(&mut self, seq: u8) -> Result<()> {
        let Some(pos) = self.unacked.iter().position(|(s, _)| *s == seq) else {
            trace!(role = ?self.role, seq, "stale ack");
            return Ok(());
        };
        self.unacked.drain(..=pos);
        self.retries = 0;
        self.deadline = if self.unacked.is_empty() {
            None
        } else {
            Some(Instant::now() + self.config.retransmit_timeout())
        };
        self.pump().await
    }

    async fn on_timeout(&mut self) -> Result<()> {
        self.retries += 1;
        if self.retries > self.config.max_retransmits {
            return Err(LinkError::Timeout(
                self.config.retransmit_timeout() * self.retries,
                "PPoG acknowledgement",
            ));
        }

        if !self.negotiated {
            debug!(attempt = self.retries, "PPoG reset timed out, retrying");
            return self.send_reset().await;
        }

        debug!(
            role = ?self.role,
            attempt = self.retries,
            in_flight = self.unacked.len(),
            "PPoG retransmit"
        );
        let resend: Vec<(u8, Bytes)> = self.unacked.iter().cloned().collect();
        for (seq, payload) in resend {
            self.send(PpogPacket::Data { seq, payload }).await?;
        }
        self.deadline = Some(Instant::now() + self.config.retransmit_timeout());
        Ok(())
    }

    fn enqueue(&mut self, mut bytes: Bytes) {
        let max = self.config.max_payload();
        while !bytes.is_empty() {
            let n = bytes.len().min(max);
            self.pending.push_back(bytes.split_to(n));
        }
    }

    async fn pump(&mut self) -> Result<()> {
        while self.negotiated && self.unacked.len() < self.tx_window as usize {
            let Some(payload) = self.pending.pop_front() else {
                break;
            };
            let seq = self.next_tx;
            self.next_tx = next_seq(seq);
            self.send(PpogPacket::Data {
                seq,
                payload: payload.clone(),
            })
            .await?;
            self.unacked.push_back((seq, payload));
            if self.deadline.is_none() {
                self.deadline = Some(Instant::now() + self.config.retransmit_timeout());
            }
        }
        Ok(())
    }

    async fn send_reset(&mut self) -> Result<()> {
        self.send(PpogPacket::ResetRequest {
            version: PPOG_VERSION,
            rx_window: self.config.max_window,
            tx_window: self.config.max_window,
        })
        .await?;
        self.deadline = Some(Instant::now() + self.config.retransmit_timeout());
        Ok(())
    }

    async fn send(&self, packet: PpogPacket) -> Result<()> {
        if self.sender.send_packet(packet.encode()).await {
            Ok(())
        } else {
            Err(LinkError::Transport("characteristic write rejected".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn config(mtu: usize, window: u8) -> PpogConfig {
        PpogConfig {
            mtu,
            max_window: window,
            retransmit_timeout_ms: 200,
            max_retransmits: 3,
            channel_size: 256,
        }
    }

    /// Forwards packets, dropping the n-th data packet once.
    struct Lossy {
        tx: mpsc::Sender<Bytes>,
        drop_data_index: Option<usize>,
        data_seen: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl PacketSender for Lossy {
        async fn send_packet(&self, packet: Bytes) -> bool {
            if packet[0] & 0x07 == 0 {
                let n = self.data_seen.fetch_add(1, Ordering::SeqCst);
                if Some(n) == self.drop_data_index {
                    return true;
                }
            }
            self.tx.send(packet).await.is_ok()
        }
    }

    fn pair(
        client_config: PpogConfig,
        server_config: PpogConfig,
        drop_client_data: Option<usize>,
    ) -> (PpogChannels, PpogChannels, CancellationToken) {
        let cancel = CancellationToken::new();
        let (to_server, server_in) = mpsc::channel(256);
        let (to_client, client_in) = mpsc::channel(256);
        let client_sender = Arc::new(Lossy {
            tx: to_server,
            drop_data_index: drop_client_data,
            data_seen: AtomicUsize::new(0),
        });
        let (client, _) = PpogStream::spawn(
            Role::Client,
            client_config,
            client_sender,
            client_in,
            cancel.clone(),
        );
        let (server, _) = PpogStream::spawn(
            Role::Server,
            server_config,
            Arc::new(to_client),
            server_in,
            cancel.clone(),
        );
        (client, server, cancel)
    }

    async fn read_exact(rx: &mut mpsc::Receiver<Bytes>, len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < len {
            out.extend_from_slice(&rx.recv().await.unwrap());
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_negotiates_smaller_window() {
        let (mut client, mut server, _cancel) = pair(config(185, 25), config(185, 4), None);
        client.ready.wait_for(|r| *r).await.unwrap();
        server.ready.wait_for(|r| *r).await.unwrap();

        client.outbound.send(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(server.delivered.recv().await.unwrap(), Bytes::from_static(b"hello"));

        server.outbound.send(Bytes::from_static(b"world")).await.unwrap();
        assert_eq!(client.delivered.recv().await.unwrap(), Bytes::from_static(b"world"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_order_across_sequence_wrap() {
        // 20-byte MTU -> 16 byte payloads; 2000 bytes is 125 packets, several wraps
        let (client, mut server, _cancel) = pair(config(20, 5), config(20, 5), None);
        let data: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        client.outbound.send(Bytes::from(data.clone())).await.unwrap();
        assert_eq!(read_exact(&mut server.delivered, data.len()).await, data);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_from_dropped_packet() {
        let (client, mut server, _cancel) = pair(config(20, 4), config(20, 4), Some(2));
        let data: Vec<u8> = (0..160u8).collect();
        client.outbound.send(Bytes::from(data.clone())).await.unwrap();
        assert_eq!(read_exact(&mut server.delivered, data.len()).await, data);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_reset_complete_keeps_window() {
        let cancel = CancellationToken::new();
        let (to_peer, mut from_client) = mpsc::channel(64);
        let (to_client, inbound) = mpsc::channel(64);
        let (mut client, _handle) =
            PpogStream::spawn(Role::Client, config(185, 4), Arc::new(to_peer), inbound, cancel);
        let next = |packet: Option<Bytes>| PpogPacket::decode(packet.unwrap()).unwrap();
        let complete = PpogPacket::ResetComplete {
            rx_window: 4,
            tx_window: 4,
        }
        .encode();

        assert!(matches!(
            next(from_client.recv().await),
            PpogPacket::ResetRequest { .. }
        ));
        to_client.send(complete.clone()).await.unwrap();
        client.ready.wait_for(|r| *r).await.unwrap();

        client.outbound.send(Bytes::from_static(b"abc")).await.unwrap();
        assert_eq!(
            next(from_client.recv().await),
            PpogPacket::Data {
                seq: 0,
                payload: Bytes::from_static(b"abc")
            }
        );

        // late answer to a retried reset, then the ack for seq 0
        to_client.send(complete).await.unwrap();
        to_client.send(PpogPacket::Ack { seq: 0 }.encode()).await.unwrap();

        client.outbound.send(Bytes::from_static(b"def")).await.unwrap();
        assert_eq!(
            next(from_client.recv().await),
            PpogPacket::Data {
                seq: 1,
                payload: Bytes::from_static(b"def")
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_without_peer() {
        let cancel = CancellationToken::new();
        let (to_nowhere, _keep) = mpsc::channel(64);
        let (_inbound_tx, inbound) = mpsc::channel(64);
        let (_channels, handle) = PpogStream::spawn(
            Role::Client,
            config(185, 25),
            Arc::new(to_nowhere),
            inbound,
            cancel,
        );
        let result = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(LinkError::Timeout(..))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_close_is_disconnect() {
        let cancel = CancellationToken::new();
        let (to_nowhere, _keep) = mpsc::channel(64);
        let (inbound_tx, inbound) = mpsc::channel(64);
        let (_channels, handle) = PpogStream::spawn(
            Role::Server,
            config(185, 25),
            Arc::new(to_nowhere),
            inbound,
            cancel,
        );
        drop(inbound_tx);
        assert!(matches!(handle.await.unwrap(), Err(LinkError::Disconnected)));
    }
}
