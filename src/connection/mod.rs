//! Per-watch connection lifecycle.
//!
//! A [`WatchSession`] drives one transport through
//! `Disconnected -> Connecting -> Negotiating -> Connected -> Disconnecting ->
//! Disconnected`. Each state carries exactly the handles valid in it, so
//! capability access is a match on [`ConnectionState`].

pub mod context;
pub mod device;
pub mod session;

use std::fmt;

use crate::protocol::{ProtocolCaps, WatchVersionResponse};

pub use context::ConnectionContext;
pub use device::{ConnectedWatch, RecoveryWatch};
pub use session::{SessionEnv, WatchSession};

/// What negotiation learned about the watch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WatchInfo {
    pub running_firmware: String,
    pub recovery_firmware: String,
    /// Raw hardware platform id of the running image
    pub platform: u8,
    pub board: String,
    pub serial: String,
    pub capabilities: ProtocolCaps,
    pub in_recovery: bool,
    /// Stored state on the watch cannot be trusted
    pub unfaithful: bool,
}

impl From<&WatchVersionResponse> for WatchInfo {
    fn from(v: &WatchVersionResponse) -> Self {
        Self {
            running_firmware: v.running.version.clone(),
            recovery_firmware: v.recovery.version.clone(),
            platform: v.running.hardware_platform,
            board: v.board.clone(),
            serial: v.serial.clone(),
            capabilities: v.capabilities,
            in_recovery: v.in_recovery(),
            unfaithful: v.is_unfaithful.unwrap_or(false),
        }
    }
}

/// State without its payload, for transition streams and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKind {
    Disconnected,
    Connecting,
    Negotiating,
    Connected,
    ConnectedInRecovery,
    Disconnecting,
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Negotiating => "negotiating",
            Self::Connected => "connected",
            Self::ConnectedInRecovery => "connected (recovery)",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Negotiating,
    Connected(ConnectedWatch),
    ConnectedInRecovery(RecoveryWatch),
    Disconnecting,
}

impl ConnectionState {
    pub fn kind(&self) -> StateKind {
        match self {
            Self::Disconnected => StateKind::Disconnected,
            Self::Connecting => StateKind::Connecting,
            Self::Negotiating => StateKind::Negotiating,
            Self::Connected(_) => StateKind::Connected,
            Self::ConnectedInRecovery(_) => StateKind::ConnectedInRecovery,
            Self::Disconnecting => StateKind::Disconnecting,
        }
    }

    pub fn watch_info(&self) -> Option<&WatchInfo> {
        match self {
            Self::Connected(w) => Some(w.info()),
            Self::ConnectedInRecovery(w) => Some(w.info()),
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_) | Self::ConnectedInRecovery(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FirmwareRecord;

    #[test]
    fn test_watch_info_from_version() {
        let version = WatchVersionResponse {
            running: FirmwareRecord {
                version: "v4.4.0".into(),
                hardware_platform: 9,
                ..Default::default()
            },
            serial: "Q402445E009M".into(),
            is_unfaithful: Some(true),
            ..Default::default()
        };
        let info = WatchInfo::from(&version);
        assert_eq!(info.running_firmware, "v4.4.0");
        assert_eq!(info.platform, 9);
        assert!(info.unfaithful);
        assert!(!info.in_recovery);
    }

    #[test]
    fn test_state_kind() {
        assert_eq!(ConnectionState::default().kind(), StateKind::Disconnected);
        assert!(!ConnectionState::Negotiating.is_connected());
        assert_eq!(StateKind::ConnectedInRecovery.to_string(), "connected (recovery)");
    }
}
