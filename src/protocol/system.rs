//! Version exchange, system messages, ping and app run state.

use anyhow::{Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use super::{ensure, frame, get_fixed_str, get_uuid, put_fixed_str, Endpoint};

// =============================================================================
// Protocol capabilities
// =============================================================================

bitflags::bitflags! {
    /// Capability bits exchanged in both version messages (u64, little-endian).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct ProtocolCaps: u64 {
        const APP_RUN_STATE = 1 << 0;
        const INFINITE_LOG_DUMPING = 1 << 1;
        const UPDATED_MUSIC_PROTOCOL = 1 << 2;
        const EXTENDED_NOTIFICATION_SERVICE = 1 << 3;
        const LANGUAGE_PACKS = 1 << 4;
        const APP_MESSAGE_8K = 1 << 5;
        const HEALTH = 1 << 6;
        const VOICE = 1 << 7;
        const WEATHER = 1 << 8;
        const SETTINGS_SYNC = 1 << 9;
    }
}

// =============================================================================
// Ping (2001)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PingMessage {
    /// cmd 0: cookie u32 BE, idle u8
    Ping { cookie: u32, idle: bool },
    /// cmd 1: cookie u32 BE
    Pong { cookie: u32 },
}

impl PingMessage {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(6);
        match self {
            Self::Ping { cookie, idle } => {
                buf.put_u8(0);
                buf.put_u32(*cookie);
                buf.put_u8(*idle as u8);
            }
            Self::Pong { cookie } => {
                buf.put_u8(1);
                buf.put_u32(*cookie);
            }
        }
        frame(Endpoint::Ping.id(), &buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        ensure(&payload, 5, "Ping")?;
        let cmd = payload.get_u8();
        let cookie = payload.get_u32();
        match cmd {
            0 => Ok(Self::Ping {
                cookie,
                idle: payload.has_remaining() && payload.get_u8() != 0,
            }),
            1 => Ok(Self::Pong { cookie }),
            other => anyhow::bail!("unknown ping command {other}"),
        }
    }
}

// =============================================================================
// Watch version (16)
// =============================================================================

const VERSION_TAG_LEN: usize = 32;
const GIT_HASH_LEN: usize = 8;
const BOARD_LEN: usize = 9;
const SERIAL_LEN: usize = 12;
const LANGUAGE_LEN: usize = 6;
const FIRMWARE_RECORD_LEN: usize = 4 + VERSION_TAG_LEN + GIT_HASH_LEN + 3;

/// One firmware slot as reported by the watch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FirmwareRecord {
    /// Build timestamp, u32 BE
    pub timestamp: u32,
    /// e.g. `v4.4.0`
    pub version: String,
    pub git_hash: String,
    pub is_recovery: bool,
    pub hardware_platform: u8,
    pub metadata_version: u8,
}

impl FirmwareRecord {
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32(self.timestamp);
        put_fixed_str(buf, &self.version, VERSION_TAG_LEN);
        put_fixed_str(buf, &self.git_hash, GIT_HASH_LEN);
        buf.put_u8(self.is_recovery as u8);
        buf.put_u8(self.hardware_platform);
        buf.put_u8(self.metadata_version);
    }

    fn get(buf: &mut Bytes) -> Self {
        Self {
            timestamp: buf.get_u32(),
            version: get_fixed_str(buf, VERSION_TAG_LEN),
            git_hash: get_fixed_str(buf, GIT_HASH_LEN),
            is_recovery: buf.get_u8() != 0,
            hardware_platform: buf.get_u8(),
            metadata_version: buf.get_u8(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WatchVersionResponse {
    pub running: FirmwareRecord,
    pub recovery: FirmwareRecord,
    pub bootloader_timestamp: u32,
    pub board: String,
    pub serial: String,
    pub bt_address: [u8; 6],
    pub resource_crc: u32,
    pub resource_timestamp: u32,
    pub language: String,
    pub language_version: u16,
    pub capabilities: ProtocolCaps,
    /// Trailing byte, absent on older firmware
    pub is_unfaithful: Option<bool>,
}

impl WatchVersionResponse {
    const FIXED_LEN: usize =
        FIRMWARE_RECORD_LEN * 2 + 4 + BOARD_LEN + SERIAL_LEN + 6 + 4 + 4 + LANGUAGE_LEN + 2 + 8;

    /// The watch booted its recovery image.
    pub fn in_recovery(&self) -> bool {
        self.running.is_recovery
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchVersionMessage {
    Request,
    Response(Box<WatchVersionResponse>),
}

impl WatchVersionMessage {
    pub fn encode(&self) -> Bytes {
        match self {
            Self::Request => frame(Endpoint::WatchVersion.id(), &[0]),
            Self::Response(r) => {
                let mut buf = BytesMut::with_capacity(2 + WatchVersionResponse::FIXED_LEN);
                buf.put_u8(1);
                r.running.put(&mut buf);
                r.recovery.put(&mut buf);
                buf.put_u32(r.bootloader_timestamp);
                put_fixed_str(&mut buf, &r.board, BOARD_LEN);
                put_fixed_str(&mut buf, &r.serial, SERIAL_LEN);
                buf.put_slice(&r.bt_address);
                buf.put_u32(r.resource_crc);
                buf.put_u32(r.resource_timestamp);
                put_fixed_str(&mut buf, &r.language, LANGUAGE_LEN);
                buf.put_u16(r.language_version);
                buf.put_u64_le(r.capabilities.bits());
                if let Some(unfaithful) = r.is_unfaithful {
                    buf.put_u8(unfaithful as u8);
                }
                frame(Endpoint::WatchVersion.id(), &buf)
            }
        }
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        ensure(&payload, 1, "WatchVersion")?;
        match payload.get_u8() {
            0 => Ok(Self::Request),
            1 => {
                ensure(&payload, WatchVersionResponse::FIXED_LEN, "WatchVersionResponse")?;
                let running = FirmwareRecord::get(&mut payload);
                let recovery = FirmwareRecord::get(&mut payload);
                let bootloader_timestamp = payload.get_u32();
                let board = get_fixed_str(&mut payload, BOARD_LEN);
                let serial = get_fixed_str(&mut payload, SERIAL_LEN);
                let mut bt_address = [0u8; 6];
                payload.copy_to_slice(&mut bt_address);
                let resource_crc = payload.get_u32();
                let resource_timestamp = payload.get_u32();
                let language = get_fixed_str(&mut payload, LANGUAGE_LEN);
                let language_version = payload.get_u16();
                let capabilities = ProtocolCaps::from_bits_retain(payload.get_u64_le());
                let is_unfaithful = payload.has_remaining().then(|| payload.get_u8() != 0);
                Ok(Self::Response(Box::new(WatchVersionResponse {
                    running,
                    recovery,
                    bootloader_timestamp,
                    board,
                    serial,
                    bt_address,
                    resource_crc,
                    resource_timestamp,
                    language,
                    language_version,
                    capabilities,
                    is_unfaithful,
                })))
            }
            other => anyhow::bail!("unknown watch version command {other}"),
        }
    }
}

// =============================================================================
// Phone version (17)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneAppVersion {
    pub protocol_version: u32,
    pub session_caps: u32,
    pub platform_flags: u32,
    pub response_version: u8,
    pub major: u8,
    pub minor: u8,
    pub bugfix: u8,
    pub protocol_caps: ProtocolCaps,
}

impl PhoneAppVersion {
    /// What this library announces when the watch asks.
    pub fn current(protocol_caps: ProtocolCaps) -> Self {
        Self {
            protocol_version: u32::MAX,
            session_caps: 0,
            platform_flags: 0,
            response_version: 2,
            major: 4,
            minor: 4,
            bugfix: 2,
            protocol_caps,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhoneVersionMessage {
    Request,
    Response(PhoneAppVersion),
}

impl PhoneVersionMessage {
    pub fn encode(&self) -> Bytes {
        match self {
            Self::Request => frame(Endpoint::PhoneVersion.id(), &[0]),
            Self::Response(v) => {
                let mut buf = BytesMut::with_capacity(25);
                buf.put_u8(1);
                buf.put_u32(v.protocol_version);
                buf.put_u32(v.session_caps);
                buf.put_u32(v.platform_flags);
                buf.put_u8(v.response_version);
                buf.put_u8(v.major);
                buf.put_u8(v.minor);
                buf.put_u8(v.bugfix);
                buf.put_u64_le(v.protocol_caps.bits());
                frame(Endpoint::PhoneVersion.id(), &buf)
            }
        }
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        ensure(&payload, 1, "PhoneVersion")?;
        match payload.get_u8() {
            0 => Ok(Self::Request),
            1 => {
                ensure(&payload, 24, "PhoneAppVersion")?;
                Ok(Self::Response(PhoneAppVersion {
                    protocol_version: payload.get_u32(),
                    session_caps: payload.get_u32(),
                    platform_flags: payload.get_u32(),
                    response_version: payload.get_u8(),
                    major: payload.get_u8(),
                    minor: payload.get_u8(),
                    bugfix: payload.get_u8(),
                    protocol_caps: ProtocolCaps::from_bits_retain(payload.get_u64_le()),
                }))
            }
            other => anyhow::bail!("unknown phone version command {other}"),
        }
    }
}

// =============================================================================
// System message (18)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FirmwareUpdateStartStatus {
    Started = 0,
    Busy = 1,
    Rejected = 2,
}

impl FirmwareUpdateStartStatus {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Started),
            1 => Some(Self::Busy),
            2 => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// Payload: `0x00 | type:u8 | fields`, integers big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemMessage {
    /// 0x0A
    FirmwareUpdateStart { offset: u32, total: u32 },
    /// 0x0B
    FirmwareUpdateComplete,
    /// 0x0C
    FirmwareUpdateFailed,
    /// 0x0D
    FirmwareUpdateStartResponse { status: FirmwareUpdateStartStatus },
}

impl SystemMessage {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(10);
        buf.put_u8(0);
        match self {
            Self::FirmwareUpdateStart { offset, total } => {
                buf.put_u8(0x0A);
                buf.put_u32(*offset);
                buf.put_u32(*total);
            }
            Self::FirmwareUpdateComplete => buf.put_u8(0x0B),
            Self::FirmwareUpdateFailed => buf.put_u8(0x0C),
            Self::FirmwareUpdateStartResponse { status } => {
                buf.put_u8(0x0D);
                buf.put_u8(*status as u8);
            }
        }
        frame(Endpoint::SystemMessage.id(), &buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        ensure(&payload, 2, "SystemMessage")?;
        payload.advance(1);
        match payload.get_u8() {
            0x0A => {
                ensure(&payload, 8, "FirmwareUpdateStart")?;
                Ok(Self::FirmwareUpdateStart {
                    offset: payload.get_u32(),
                    total: payload.get_u32(),
                })
            }
            0x0B => Ok(Self::FirmwareUpdateComplete),
            0x0C => Ok(Self::FirmwareUpdateFailed),
            0x0D => {
                ensure(&payload, 1, "FirmwareUpdateStartResponse")?;
                let raw = payload.get_u8();
                let status = FirmwareUpdateStartStatus::from_u8(raw)
                    .with_context(|| format!("unknown firmware start status {raw}"))?;
                Ok(Self::FirmwareUpdateStartResponse { status })
            }
            other => anyhow::bail!("unknown system message type {other:#04x}"),
        }
    }
}

// =============================================================================
// App run state (52)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppRunStateMessage {
    /// 0x01 + uuid
    Start(Uuid),
    /// 0x02 + uuid
    Stop(Uuid),
    /// 0x03
    Request,
}

impl AppRunStateMessage {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(17);
        match self {
            Self::Start(uuid) => {
                buf.put_u8(0x01);
                buf.put_slice(uuid.as_bytes());
            }
            Self::Stop(uuid) => {
                buf.put_u8(0x02);
                buf.put_slice(uuid.as_bytes());
            }
            Self::Request => buf.put_u8(0x03),
        }
        frame(Endpoint::AppRunState.id(), &buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        ensure(&payload, 1, "AppRunState")?;
        match payload.get_u8() {
            0x01 => {
                ensure(&payload, 16, "AppRunState start")?;
                Ok(Self::Start(get_uuid(&mut payload)))
            }
            0x02 => {
                ensure(&payload, 16, "AppRunState stop")?;
                Ok(Self::Stop(get_uuid(&mut payload)))
            }
            0x03 => Ok(Self::Request),
            other => anyhow::bail!("unknown app run state command {other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_of(frame: Bytes) -> Bytes {
        frame.slice(4..)
    }

    #[test]
    fn test_watch_version_layout() {
        let response = WatchVersionResponse {
            running: FirmwareRecord {
                timestamp: 1_700_000_000,
                version: "v4.4.0".into(),
                git_hash: "abc1234".into(),
                hardware_platform: 14,
                ..Default::default()
            },
            serial: "Q402445E00AB".into(),
            board: "snowy_dvt".into(),
            capabilities: ProtocolCaps::APP_RUN_STATE | ProtocolCaps::SETTINGS_SYNC,
            is_unfaithful: Some(true),
            ..Default::default()
        };
        let encoded = WatchVersionMessage::Response(Box::new(response.clone())).encode();
        // cmd + fixed body + unfaithful byte
        assert_eq!(encoded.len(), 4 + 1 + WatchVersionResponse::FIXED_LEN + 1);

        // capabilities are little-endian, just before the trailing byte
        let caps_at = encoded.len() - 9;
        assert_eq!(encoded[caps_at], 0x01);
        assert_eq!(encoded[caps_at + 1], 0x02);

        match WatchVersionMessage::decode(payload_of(encoded)).unwrap() {
            WatchVersionMessage::Response(decoded) => assert_eq!(*decoded, response),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_watch_version_without_unfaithful_byte() {
        let encoded = WatchVersionMessage::Response(Box::default()).encode();
        assert_eq!(encoded.len(), 4 + 1 + WatchVersionResponse::FIXED_LEN);
        let decoded = WatchVersionMessage::decode(payload_of(encoded)).unwrap();
        match decoded {
            WatchVersionMessage::Response(r) => assert_eq!(r.is_unfaithful, None),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_short_watch_version_rejected() {
        assert!(WatchVersionMessage::decode(Bytes::from_static(&[1, 0, 0])).is_err());
    }

    #[test]
    fn test_firmware_start_is_big_endian() {
        let encoded = SystemMessage::FirmwareUpdateStart {
            offset: 0x0102,
            total: 0x0A0B0C0D,
        }
        .encode();
        assert_eq!(&encoded[4..], &[0, 0x0A, 0, 0, 1, 2, 0x0A, 0x0B, 0x0C, 0x0D]);
    }

    #[test]
    fn test_app_run_state_uuid_big_endian() {
        let uuid = Uuid::parse_str("00112233-4455-6677-8899-aabbccddeeff").unwrap();
        let encoded = AppRunStateMessage::Start(uuid).encode();
        assert_eq!(encoded[5], 0x00);
        assert_eq!(encoded[20], 0xff);
        assert_eq!(
            AppRunStateMessage::decode(payload_of(encoded)).unwrap(),
            AppRunStateMessage::Start(uuid)
        );
    }

    #[test]
    fn test_ping_pong() {
        let pong = PingMessage::Pong { cookie: 77 };
        assert_eq!(PingMessage::decode(payload_of(pong.encode())).unwrap(), pong);
        assert!(PingMessage::decode(Bytes::from_static(&[9, 0, 0, 0, 1])).is_err());
    }
}
