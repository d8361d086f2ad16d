//! PPoG: an ordered, acknowledged byte stream over a pair of MTU-limited
//! characteristics.
//!
//! [`stream::PpogStream`] holds the sequencing, windowing and retransmission
//! logic and is role-symmetric; [`client::PpogClient`] binds the phone side to
//! a [`crate::transport::Transport`].

pub mod client;
pub mod packet;
pub mod stream;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

pub use client::PpogClient;
pub use packet::PpogPacket;
pub use stream::{PpogChannels, PpogStream, Role};

/// One characteristic write without response.
#[async_trait]
pub trait PacketSender: Send + Sync + 'static {
    /// `true` if the radio accepted the write. Not a delivery confirmation.
    async fn send_packet(&self, packet: Bytes) -> bool;
}

#[async_trait]
impl PacketSender for mpsc::Sender<Bytes> {
    async fn send_packet(&self, packet: Bytes) -> bool {
        self.send(packet).await.is_ok()
    }
}
