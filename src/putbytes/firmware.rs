//! Firmware update: firmware image, then optional system resources, both over
//! PutBytes, installed together only once both have transferred.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::session::{PutBytesSession, PutBytesTarget, SessionState};
use crate::config::FirmwareConfig;
use crate::error::{LinkError, Result};
use crate::protocol::{FirmwareUpdateStartStatus, ObjectType};
use crate::services::system::SystemService;

/// Budget for the watch to acknowledge the start of an update.
const START_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwarePart {
    pub name: String,
    /// `normal` or `recovery`
    #[serde(rename = "type")]
    pub kind: String,
    pub size: u64,
    pub crc: u64,
    /// Hardware platform id the image was built for
    #[serde(rename = "hwrev")]
    pub hw_platform: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePart {
    pub name: String,
    pub size: u64,
    pub crc: u64,
}

/// Bundle description, as shipped alongside the images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareManifest {
    pub firmware: FirmwarePart,
    #[serde(default)]
    pub resources: Option<ResourcePart>,
}

impl FirmwareManifest {
    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn total_size(&self) -> u64 {
        self.firmware.size + self.resources.as_ref().map_or(0, |r| r.size)
    }
}

#[derive(Debug, Clone)]
pub struct FirmwareBundle {
    pub manifest: FirmwareManifest,
    pub firmware: Bytes,
    pub resources: Option<Bytes>,
}

impl FirmwareBundle {
    /// Build a bundle whose manifest describes the given images.
    pub fn from_images(hw_platform: u8, firmware: Bytes, resources: Option<Bytes>) -> Self {
        let manifest = FirmwareManifest {
            firmware: FirmwarePart {
                name: "tintin_fw.bin".into(),
                kind: "normal".into(),
                size: firmware.len() as u64,
                crc: crc32fast::hash(&firmware) as u64,
                hw_platform,
            },
            resources: resources.as_ref().map(|r| ResourcePart {
                name: "system_resources.pbpack".into(),
                size: r.len() as u64,
                crc: crc32fast::hash(r) as u64,
            }),
        };
        Self {
            manifest,
            firmware,
            resources,
        }
    }

    /// Reject anything that must not reach the watch.
    pub fn check(&self, watch_platform: u8) -> Result<()> {
        let fw = &self.manifest.firmware;
        let fail = |msg: String| Err(LinkError::SafetyCheck(msg));
        if fw.kind != "normal" && fw.kind != "recovery" {
            return fail(format!("invalid firmware type: {}", fw.kind));
        }
        if fw.size == 0 || fw.size > u32::MAX as u64 {
            return fail(format!("invalid firmware size: {}", fw.size));
        }
        if fw.crc == 0 {
            return fail("invalid firmware CRC: 0".into());
        }
        if fw.size != self.firmware.len() as u64 || fw.crc != crc32fast::hash(&self.firmware) as u64 {
            return fail("firmware image does not match manifest".into());
        }
        match (&self.manifest.resources, &self.resources) {
            (Some(res), Some(data)) => {
                if res.size == 0 || res.size > u32::MAX as u64 {
                    return fail(format!("invalid resources size: {}", res.size));
                }
                if res.crc == 0 {
                    return fail("invalid resources CRC: 0".into());
                }
                if res.size != data.len() as u64 || res.crc != crc32fast::hash(data) as u64 {
                    return fail("resources do not match manifest".into());
                }
            }
            (None, None) => {}
            _ => return fail("resources present in only one of manifest and bundle".into()),
        }
        if fw.hw_platform != watch_platform {
            return fail(format!(
                "firmware board {} does not match watch board {watch_platform}",
                fw.hw_platform
            ));
        }
        Ok(())
    }

    fn object_type(&self) -> ObjectType {
        if self.manifest.firmware.kind == "recovery" {
            ObjectType::Recovery
        } else {
            ObjectType::Firmware
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FirmwareUpdateStatus {
    Idle,
    WaitingToStart,
    /// 0..1 across firmware and resources
    InProgress(f32),
    WaitingForReboot,
    /// The watch dropped the link to install
    Rebooting,
    /// Rejected before any transfer
    ErrorStarting(String),
    /// Transfer failed; retry with `bytes_transferred` as the resume offset
    Failed {
        message: String,
        bytes_transferred: u64,
    },
}

pub struct FirmwareUpdater {
    system: Arc<SystemService>,
    putbytes: Arc<PutBytesSession>,
    platform: u8,
    config: FirmwareConfig,
    running: AtomicBool,
    status: watch::Sender<FirmwareUpdateStatus>,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl FirmwareUpdater {
    pub fn new(
        system: Arc<SystemService>,
        putbytes: Arc<PutBytesSession>,
        platform: u8,
        config: FirmwareConfig,
    ) -> Self {
        let (status, _) = watch::channel(FirmwareUpdateStatus::Idle);
        Self {
            system,
            putbytes,
            platform,
            config,
            running: AtomicBool::new(false),
            status,
        }
    }

    pub fn status(&self) -> watch::Receiver<FirmwareUpdateStatus> {
        self.status.subscribe()
    }

    pub fn last_status(&self) -> FirmwareUpdateStatus {
        self.status.borrow().clone()
    }

    /// Transfer and install `bundle`, starting `offset` bytes in.
    ///
    /// After install the watch reboots; this resolves once `disconnected`
    /// fires or fails after the reboot timeout. `disconnected` also cancels
    /// an in-flight transfer.
    pub async fn update(
        &self,
        bundle: &FirmwareBundle,
        offset: u64,
        disconnected: &CancellationToken,
    ) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(LinkError::Busy("firmware update"));
        }
        let _running = RunningGuard(&self.running);

        let total = bundle.manifest.total_size();
        let checked = bundle.check(self.platform).and_then(|()| {
            if offset >= total {
                Err(LinkError::SafetyCheck(format!(
                    "resume offset {offset} beyond transfer size {total}"
                )))
            } else {
                Ok(())
            }
        });
        if let Err(e) = checked {
            warn!("firmware update refused: {e}");
            self.status.send_replace(FirmwareUpdateStatus::ErrorStarting(e.to_string()));
            return Err(e);
        }

        self.status.send_replace(FirmwareUpdateStatus::WaitingToStart);
        let started = match self
            .system
            .firmware_update_start(offset as u32, total as u32, START_TIMEOUT)
            .await
        {
            Ok(status) => status,
            Err(e) => {
                self.status.send_replace(FirmwareUpdateStatus::ErrorStarting(e.to_string()));
                return Err(e);
            }
        };
        if started != FirmwareUpdateStartStatus::Started {
            let e = LinkError::Protocol(format!("watch refused firmware update: {started:?}"));
            self.status.send_replace(FirmwareUpdateStatus::ErrorStarting(e.to_string()));
            return Err(e);
        }
        info!(offset, total, "firmware update started");

        match self.send_parts(bundle, offset, disconnected).await {
            Ok(()) => {}
            Err(LinkError::Cancelled) => {
                debug!("firmware update cancelled");
                self.status.send_replace(FirmwareUpdateStatus::Idle);
                return Err(LinkError::Cancelled);
            }
            Err(e) => {
                let bytes_transferred = match &e {
                    LinkError::TransferFailed {
                        bytes_transferred, ..
                    } => *bytes_transferred,
                    _ => offset,
                };
                let _ = self.system.firmware_update_failed().await;
                self.status.send_replace(FirmwareUpdateStatus::Failed {
                    message: e.to_string(),
                    bytes_transferred,
                });
                return Err(e);
            }
        }

        self.status.send_replace(FirmwareUpdateStatus::WaitingForReboot);
        self.system.firmware_update_complete().await?;
        info!("firmware transferred, waiting for reboot");
        match timeout(self.config.reboot_timeout(), disconnected.cancelled()).await {
            Ok(()) => {
                self.status.send_replace(FirmwareUpdateStatus::Rebooting);
                Ok(())
            }
            Err(_) => Err(LinkError::Timeout(self.config.reboot_timeout(), "watch reboot")),
        }
    }

    async fn send_parts(
        &self,
        bundle: &FirmwareBundle,
        offset: u64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let fw_size = bundle.manifest.firmware.size;
        let split = bundle.resources.is_some();
        let mut firmware_cookie = None;

        if offset < fw_size {
            let skip = offset as usize;
            let target = PutBytesTarget::Object {
                object_type: bundle.object_type(),
                bank: 0,
                filename: String::new(),
            };
            let status = &self.status;
            let report = |state: SessionState| {
                if let SessionState::Sending { sent, .. } = state {
                    let done = (offset + sent) as f32 / fw_size as f32;
                    status.send_replace(FirmwareUpdateStatus::InProgress(if split { done / 2.0 } else { done }));
                }
            };
            let cookie = self
                .putbytes
                .transfer(target, fw_size as u32, &bundle.firmware[skip..], false, cancel, report)
                .await
                .map_err(|e| resumable(e, offset))?;
            firmware_cookie = Some(cookie);
            debug!("firmware image transferred");
        } else {
            debug!("firmware image already on the watch, skipping");
        }

        let mut resources_cookie = None;
        if let Some(resources) = &bundle.resources {
            let res_size = resources.len() as u64;
            let res_offset = offset.saturating_sub(fw_size);
            let target = PutBytesTarget::Object {
                object_type: ObjectType::SystemResources,
                bank: 0,
                filename: String::new(),
            };
            let status = &self.status;
            status.send_replace(FirmwareUpdateStatus::InProgress(0.5));
            let report = |state: SessionState| {
                if let SessionState::Sending { sent, .. } = state {
                    let done = (res_offset + sent) as f32 / res_size as f32;
                    status.send_replace(FirmwareUpdateStatus::InProgress(0.5 + done / 2.0));
                }
            };
            let cookie = self
                .putbytes
                .transfer(
                    target,
                    res_size as u32,
                    &resources[res_offset as usize..],
                    false,
                    cancel,
                    report,
                )
                .await
                .map_err(|e| resumable(e, fw_size + res_offset))?;
            resources_cookie = Some(cookie);
            debug!("resources transferred");
        }

        // both parts are on the watch; only now install either
        for cookie in firmware_cookie.into_iter().chain(resources_cookie) {
            self.putbytes
                .install(cookie)
                .await
                .map_err(|e| resumable(e, offset))?;
        }
        Ok(())
    }
}

/// Shift a session-relative byte count to an offset into the whole update.
fn resumable(err: LinkError, base: u64) -> LinkError {
    match err {
        LinkError::TransferFailed {
            message,
            bytes_transferred,
        } => LinkError::TransferFailed {
            message,
            bytes_transferred: base + bytes_transferred,
        },
        LinkError::Cancelled => LinkError::Cancelled,
        other => LinkError::TransferFailed {
            message: other.to_string(),
            bytes_transferred: base,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle() -> FirmwareBundle {
        FirmwareBundle::from_images(
            7,
            Bytes::from_static(b"firmware-image"),
            Some(Bytes::from_static(b"resources")),
        )
    }

    #[test]
    fn test_valid_bundle_passes() {
        bundle().check(7).unwrap();
        assert_eq!(bundle().manifest.total_size(), 23);
    }

    #[test]
    fn test_platform_mismatch_rejected() {
        let err = bundle().check(3).unwrap_err();
        assert!(matches!(err, LinkError::SafetyCheck(msg) if msg.contains("board")));
    }

    #[test]
    fn test_corrupt_manifest_rejected() {
        let mut b = bundle();
        b.manifest.firmware.kind = "beta".into();
        assert!(matches!(b.check(7), Err(LinkError::SafetyCheck(_))));

        let mut b = bundle();
        b.manifest.firmware.crc += 1;
        assert!(matches!(b.check(7), Err(LinkError::SafetyCheck(_))));

        let mut b = bundle();
        b.resources = None;
        assert!(matches!(b.check(7), Err(LinkError::SafetyCheck(_))));
    }

    #[test]
    fn test_manifest_json() {
        let json = r#"{
            "firmware": {"name": "fw.bin", "type": "recovery", "size": 10, "crc": 5, "hwrev": 2}
        }"#;
        let manifest = FirmwareManifest::from_json(json).unwrap();
        assert_eq!(manifest.firmware.hw_platform, 2);
        assert!(manifest.resources.is_none());
        assert_eq!(manifest.total_size(), 10);
    }

    #[test]
    fn test_resumable_offsets() {
        let err = resumable(
            LinkError::TransferFailed {
                message: "x".into(),
                bytes_transferred: 4,
            },
            10,
        );
        assert!(matches!(err, LinkError::TransferFailed { bytes_transferred: 14, .. }));
        assert!(matches!(resumable(LinkError::Cancelled, 3), LinkError::Cancelled));
    }
}
