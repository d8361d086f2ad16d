//! Byte transport to one physical watch.
//!
//! The platform layer (GATT client, RFCOMM socket, emulator socket) implements
//! [`Transport`]; the core only opens, writes frames, subscribes to inbound
//! notifications and watches the link state.

pub mod loopback;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::error::Result;

pub use loopback::{loopback, LoopbackPeer, LoopbackTransport, PeerLink};

/// Platform address of a watch. Stable across reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "address", rename_all = "snake_case")]
pub enum TransportId {
    /// BLE MAC address or platform UUID
    Ble(String),
    /// Classic Bluetooth (RFCOMM) address
    Classic(String),
    /// Emulator or bridge socket address
    Socket(String),
}

impl TransportId {
    pub fn address(&self) -> &str {
        match self {
            Self::Ble(a) | Self::Classic(a) | Self::Socket(a) => a,
        }
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ble(a) => write!(f, "ble:{a}"),
            Self::Classic(a) => write!(f, "bt:{a}"),
            Self::Socket(a) => write!(f, "socket:{a}"),
        }
    }
}

/// Link-level connection as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Down,
    Up,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn id(&self) -> &TransportId;

    /// Establish the link. Resolves once the platform reports it up.
    async fn open(&self) -> Result<()>;

    /// Tear the link down. Idempotent.
    async fn close(&self);

    /// Write one frame without response. `false` when the radio refused it.
    async fn write(&self, frame: Bytes) -> bool;

    /// Inbound notifications for the current link, in arrival order.
    /// Only one subscriber per link.
    fn subscribe(&self) -> Result<mpsc::Receiver<Bytes>>;

    fn link_state(&self) -> watch::Receiver<LinkState>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_id_display_and_serde() {
        let id = TransportId::Ble("AA:BB:CC:DD:EE:FF".into());
        assert_eq!(id.to_string(), "ble:AA:BB:CC:DD:EE:FF");
        assert_eq!(id.address(), "AA:BB:CC:DD:EE:FF");

        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, r#"{"kind":"ble","address":"AA:BB:CC:DD:EE:FF"}"#);
        let back: TransportId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
