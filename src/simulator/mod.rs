//! In-process watch that speaks the watch side of the wire protocol.
//!
//! A [`SimulatedWatch`] sits behind a loopback transport: every time the
//! phone opens the transport it runs a PPoG server stream and answers version,
//! ping, BlobDB, PutBytes, firmware and app-launch traffic. Its observable
//! state survives reconnects so tests can inspect what the phone sent.

pub mod device;
pub mod platform;

use std::time::Duration;

use crate::protocol::{BlobStatus, FirmwareRecord, ProtocolCaps, WatchVersionResponse};

pub use device::{InstalledObject, SimState, SimulatedWatch};
pub use platform::SimPlatform;

/// How the simulated watch answers phone-initiated BlobDB commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobPolicy {
    Succeed,
    /// Reply with this status and apply nothing
    Respond(BlobStatus),
    /// Swallow the next `n` commands without any reply
    DropNext(usize),
    /// Reply with success after a pause
    Delay(Duration),
}

/// What the watch reports about itself during negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchProfile {
    pub firmware_version: String,
    pub recovery_version: String,
    pub platform: u8,
    pub board: String,
    pub serial: String,
    pub in_recovery: bool,
    pub unfaithful: Option<bool>,
    pub capabilities: ProtocolCaps,
}

impl Default for WatchProfile {
    fn default() -> Self {
        Self {
            firmware_version: "v4.4.0".into(),
            recovery_version: "v4.3.0-prf".into(),
            platform: 9,
            board: "snowy_s3".into(),
            serial: "Q402445E009M".into(),
            in_recovery: false,
            unfaithful: Some(false),
            capabilities: ProtocolCaps::APP_RUN_STATE
                | ProtocolCaps::INFINITE_LOG_DUMPING
                | ProtocolCaps::EXTENDED_NOTIFICATION_SERVICE
                | ProtocolCaps::WEATHER
                | ProtocolCaps::SETTINGS_SYNC,
        }
    }
}

impl WatchProfile {
    pub fn version_response(&self) -> WatchVersionResponse {
        let recovery = FirmwareRecord {
            timestamp: 1_650_000_000,
            version: self.recovery_version.clone(),
            git_hash: "0b4ca1f".into(),
            is_recovery: true,
            hardware_platform: self.platform,
            metadata_version: 1,
        };
        let running = if self.in_recovery {
            recovery.clone()
        } else {
            FirmwareRecord {
                timestamp: 1_700_000_000,
                version: self.firmware_version.clone(),
                git_hash: "8e2d3c9".into(),
                is_recovery: false,
                hardware_platform: self.platform,
                metadata_version: 1,
            }
        };
        WatchVersionResponse {
            running,
            recovery,
            bootloader_timestamp: 1_600_000_000,
            board: self.board.clone(),
            serial: self.serial.clone(),
            bt_address: [0xB0, 0xB4, 0x48, 0x12, 0x34, 0x56],
            resource_crc: 0,
            resource_timestamp: 0,
            language: "en_US".into(),
            language_version: 1,
            capabilities: self.capabilities,
            is_unfaithful: self.unfaithful,
        }
    }
}
