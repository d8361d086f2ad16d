//! BlobDB wire messages.
//!
//! BlobDB (0xB1DB): phone commands `cmd:u8 | token:u16 LE | database:u8 | ...`,
//! watch responses `token:u16 LE | status:u8`. Keys carry a u8 length, values
//! a u16 LE length.
//!
//! BlobDB v2 (0xB2DB): watch-initiated writes and sync control. Responses use
//! the command byte with the high bit set.

use anyhow::{Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{ensure, frame, Endpoint, MAX_PAYLOAD_LEN};

/// Longest key the u8 length prefix can carry.
pub const MAX_KEY_LEN: usize = u8::MAX as usize;

/// Insert payload bytes besides key and value: command, token, database,
/// key length, value length.
pub const INSERT_OVERHEAD: usize = 1 + 2 + 1 + 1 + 2;

/// Longest value an insert with a `key_len` key can carry in one frame.
pub fn max_insert_value_len(key_len: usize) -> usize {
    MAX_PAYLOAD_LEN.saturating_sub(INSERT_OVERHEAD + key_len)
}

// =============================================================================
// Databases and status codes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum BlobDatabase {
    Test = 0,
    Pin = 1,
    App = 2,
    Reminder = 3,
    Notification = 4,
    Weather = 5,
    CannedResponses = 6,
    HealthParams = 7,
    Contacts = 8,
    AppConfigs = 9,
    HealthStats = 10,
    AppGlance = 11,
    WatchPrefs = 12,
}

impl BlobDatabase {
    pub const ALL: [Self; 13] = [
        Self::Test,
        Self::Pin,
        Self::App,
        Self::Reminder,
        Self::Notification,
        Self::Weather,
        Self::CannedResponses,
        Self::HealthParams,
        Self::Contacts,
        Self::AppConfigs,
        Self::HealthStats,
        Self::AppGlance,
        Self::WatchPrefs,
    ];

    pub fn from_u8(b: u8) -> Option<Self> {
        Self::ALL.get(b as usize).copied()
    }

    /// Wiped on the watch when its state cannot be trusted.
    pub fn sends_clear(self) -> bool {
        matches!(
            self,
            Self::Pin
                | Self::App
                | Self::Reminder
                | Self::Notification
                | Self::Weather
                | Self::CannedResponses
                | Self::Contacts
                | Self::AppGlance
        )
    }

    /// Keys are 16-byte UUIDs.
    pub fn key_is_uuid(self) -> bool {
        matches!(self, Self::Pin | Self::App | Self::Reminder | Self::Notification)
    }

    /// The watch holds the authoritative copy and is asked to sync it back.
    pub fn syncs_from_watch(self) -> bool {
        matches!(self, Self::WatchPrefs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlobStatus {
    Success = 1,
    GeneralFailure = 2,
    InvalidOperation = 3,
    InvalidDatabaseId = 4,
    InvalidData = 5,
    KeyDoesNotExist = 6,
    DatabaseFull = 7,
    DataStale = 8,
    NotSupported = 9,
    Locked = 10,
    TryLater = 11,
}

impl BlobStatus {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Success),
            2 => Some(Self::GeneralFailure),
            3 => Some(Self::InvalidOperation),
            4 => Some(Self::InvalidDatabaseId),
            5 => Some(Self::InvalidData),
            6 => Some(Self::KeyDoesNotExist),
            7 => Some(Self::DatabaseFull),
            8 => Some(Self::DataStale),
            9 => Some(Self::NotSupported),
            10 => Some(Self::Locked),
            11 => Some(Self::TryLater),
            _ => None,
        }
    }

    fn read(buf: &mut Bytes) -> Result<Self> {
        let raw = buf.get_u8();
        Self::from_u8(raw).with_context(|| format!("unknown blob status {raw}"))
    }
}

// =============================================================================
// BlobDB commands (phone -> watch)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobOp {
    /// cmd 0x01
    Insert { key: Bytes, value: Bytes },
    /// cmd 0x04
    Delete { key: Bytes },
    /// cmd 0x05
    Clear,
}

impl BlobOp {
    fn command_byte(&self) -> u8 {
        match self {
            Self::Insert { .. } => 0x01,
            Self::Delete { .. } => 0x04,
            Self::Clear => 0x05,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Insert { .. } => "insert",
            Self::Delete { .. } => "delete",
            Self::Clear => "clear",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobCommand {
    pub token: u16,
    pub database: BlobDatabase,
    pub op: BlobOp,
}

impl BlobCommand {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u8(self.op.command_byte());
        buf.put_u16_le(self.token);
        buf.put_u8(self.database as u8);
        match &self.op {
            BlobOp::Insert { key, value } => {
                buf.put_u8(key.len() as u8);
                buf.put_slice(key);
                buf.put_u16_le(value.len() as u16);
                buf.put_slice(value);
            }
            BlobOp::Delete { key } => {
                buf.put_u8(key.len() as u8);
                buf.put_slice(key);
            }
            BlobOp::Clear => {}
        }
        frame(Endpoint::BlobDb.id(), &buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        ensure(&payload, 4, "BlobCommand")?;
        let cmd = payload.get_u8();
        let token = payload.get_u16_le();
        let raw_db = payload.get_u8();
        let database = BlobDatabase::from_u8(raw_db)
            .with_context(|| format!("unknown blob database {raw_db}"))?;
        let op = match cmd {
            0x01 => {
                let key = get_key(&mut payload)?;
                let value = get_value(&mut payload)?;
                BlobOp::Insert { key, value }
            }
            0x04 => BlobOp::Delete {
                key: get_key(&mut payload)?,
            },
            0x05 => BlobOp::Clear,
            other => anyhow::bail!("unknown blob command {other:#04x}"),
        };
        Ok(Self {
            token,
            database,
            op,
        })
    }
}

fn get_key(buf: &mut Bytes) -> Result<Bytes> {
    ensure(buf, 1, "blob key length")?;
    let len = buf.get_u8() as usize;
    ensure(buf, len, "blob key")?;
    Ok(buf.split_to(len))
}

fn get_value(buf: &mut Bytes) -> Result<Bytes> {
    ensure(buf, 2, "blob value length")?;
    let len = buf.get_u16_le() as usize;
    ensure(buf, len, "blob value")?;
    Ok(buf.split_to(len))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobResponse {
    pub token: u16,
    pub status: BlobStatus,
}

impl BlobResponse {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(3);
        buf.put_u16_le(self.token);
        buf.put_u8(self.status as u8);
        frame(Endpoint::BlobDb.id(), &buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        ensure(&payload, 3, "BlobResponse")?;
        let token = payload.get_u16_le();
        let status = BlobStatus::read(&mut payload)?;
        Ok(Self { token, status })
    }
}

// =============================================================================
// BlobDB v2
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// 0x06: the watch changed a record
    Write,
    /// 0x07: the watch is echoing back a record during sync
    WriteBack,
}

impl WriteKind {
    fn command_byte(self) -> u8 {
        match self {
            Self::Write => 0x06,
            Self::WriteBack => 0x07,
        }
    }
}

/// A record written by the watch. `database` stays raw so unknown ids can
/// still be acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobWrite {
    pub kind: WriteKind,
    pub token: u16,
    pub database: u8,
    /// Seconds since epoch on the watch, u32 LE
    pub timestamp: u32,
    pub key: Bytes,
    pub value: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobDb2Message {
    Write(BlobWrite),
    /// 0x86 / 0x87
    WriteResponse {
        kind: WriteKind,
        token: u16,
        status: BlobStatus,
    },
    /// 0x08
    StartSync { token: u16, database: u8 },
    /// 0x88
    StartSyncResponse { token: u16, status: BlobStatus },
    /// 0x09
    SyncDone { token: u16, database: u8 },
    /// 0x89
    SyncDoneResponse { token: u16, status: BlobStatus },
}

impl BlobDb2Message {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(12);
        match self {
            Self::Write(w) => {
                buf.put_u8(w.kind.command_byte());
                buf.put_u16_le(w.token);
                buf.put_u8(w.database);
                buf.put_u32_le(w.timestamp);
                buf.put_u8(w.key.len() as u8);
                buf.put_slice(&w.key);
                buf.put_u16_le(w.value.len() as u16);
                buf.put_slice(&w.value);
            }
            Self::WriteResponse {
                kind,
                token,
                status,
            } => {
                buf.put_u8(kind.command_byte() | 0x80);
                buf.put_u16_le(*token);
                buf.put_u8(*status as u8);
            }
            Self::StartSync { token, database } => {
                buf.put_u8(0x08);
                buf.put_u16_le(*token);
                buf.put_u8(*database);
            }
            Self::StartSyncResponse { token, status } => {
                buf.put_u8(0x88);
                buf.put_u16_le(*token);
                buf.put_u8(*status as u8);
            }
            Self::SyncDone { token, database } => {
                buf.put_u8(0x09);
                buf.put_u16_le(*token);
                buf.put_u8(*database);
            }
            Self::SyncDoneResponse { token, status } => {
                buf.put_u8(0x89);
                buf.put_u16_le(*token);
                buf.put_u8(*status as u8);
            }
        }
        frame(Endpoint::BlobDb2.id(), &buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        ensure(&payload, 4, "BlobDB2")?;
        let cmd = payload.get_u8();
        let token = payload.get_u16_le();
        match cmd {
            0x06 | 0x07 => {
                ensure(&payload, 5, "BlobDB2 write")?;
                let database = payload.get_u8();
                let timestamp = payload.get_u32_le();
                let key = get_key(&mut payload)?;
                let value = get_value(&mut payload)?;
                let kind = if cmd == 0x06 {
                    WriteKind::Write
                } else {
                    WriteKind::WriteBack
                };
                Ok(Self::Write(BlobWrite {
                    kind,
                    token,
                    database,
                    timestamp,
                    key,
                    value,
                }))
            }
            0x86 | 0x87 => {
                let kind = if cmd == 0x86 {
                    WriteKind::Write
                } else {
                    WriteKind::WriteBack
                };
                Ok(Self::WriteResponse {
                    kind,
                    token,
                    status: BlobStatus::read(&mut payload)?,
                })
            }
            0x08 => Ok(Self::StartSync {
                token,
                database: payload.get_u8(),
            }),
            0x88 => Ok(Self::StartSyncResponse {
                token,
                status: BlobStatus::read(&mut payload)?,
            }),
            0x09 => Ok(Self::SyncDone {
                token,
                database: payload.get_u8(),
            }),
            0x89 => Ok(Self::SyncDoneResponse {
                token,
                status: BlobStatus::read(&mut payload)?,
            }),
            other => anyhow::bail!("unknown BlobDB2 command {other:#04x}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{frame_fits, Origin, Packet, PacketAssembler};

    #[test]
    fn test_largest_insert_fits_one_frame() {
        let key = Bytes::from_static(&[7; 16]);
        let insert = |value_len: usize| {
            BlobCommand {
                token: 1,
                database: BlobDatabase::Notification,
                op: BlobOp::Insert {
                    key: key.clone(),
                    value: Bytes::from(vec![0x5A; value_len]),
                },
            }
            .encode()
        };

        let limit = max_insert_value_len(key.len());
        let encoded = insert(limit);
        assert!(frame_fits(&encoded));
        let mut assembler = PacketAssembler::default();
        let frames = assembler.push(&encoded);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload.len(), encoded.len() - 4);
        assert_eq!(assembler.buffered(), 0);
        match Packet::decode(Origin::Phone, frames[0].clone()).unwrap() {
            Packet::BlobCommand(cmd) => {
                assert!(matches!(cmd.op, BlobOp::Insert { ref value, .. } if value.len() == limit))
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(!frame_fits(&insert(limit + 1)));
    }

    #[test]
    fn test_insert_layout() {
        let cmd = BlobCommand {
            token: 0x1234,
            database: BlobDatabase::Notification,
            op: BlobOp::Insert {
                key: Bytes::from_static(b"a"),
                value: Bytes::from_static(b"xyz"),
            },
        };
        let encoded = cmd.encode();
        assert_eq!(
            &encoded[..],
            &[0, 11, 0xB1, 0xDB, 0x01, 0x34, 0x12, 4, 1, b'a', 3, 0, b'x', b'y', b'z']
        );
        assert_eq!(BlobCommand::decode(encoded.slice(4..)).unwrap(), cmd);
    }

    #[test]
    fn test_clear_and_delete() {
        let clear = BlobCommand {
            token: 7,
            database: BlobDatabase::Pin,
            op: BlobOp::Clear,
        };
        assert_eq!(&clear.encode()[4..], &[0x05, 7, 0, 1]);

        let delete = BlobCommand {
            token: 8,
            database: BlobDatabase::App,
            op: BlobOp::Delete {
                key: Bytes::from_static(&[9; 16]),
            },
        };
        assert_eq!(BlobCommand::decode(delete.encode().slice(4..)).unwrap(), delete);
    }

    #[test]
    fn test_truncated_insert_rejected() {
        // key length says 5, only 2 bytes follow
        let payload = Bytes::from_static(&[0x01, 0, 0, 4, 5, b'a', b'b']);
        assert!(BlobCommand::decode(payload).is_err());
    }

    #[test]
    fn test_response_status() {
        let resp = BlobResponse::decode(Bytes::from_static(&[0xCD, 0xAB, 11])).unwrap();
        assert_eq!(resp.token, 0xABCD);
        assert_eq!(resp.status, BlobStatus::TryLater);
        assert!(BlobResponse::decode(Bytes::from_static(&[0, 0, 99])).is_err());
    }

    #[test]
    fn test_watch_write_keeps_unknown_database() {
        let write = BlobDb2Message::Write(BlobWrite {
            kind: WriteKind::WriteBack,
            token: 3,
            database: 200,
            timestamp: 1_700_000_000,
            key: Bytes::from_static(b"k"),
            value: Bytes::from_static(b"v"),
        });
        assert_eq!(BlobDb2Message::decode(write.encode().slice(4..)).unwrap(), write);
    }

    #[test]
    fn test_write_response_sets_high_bit() {
        let resp = BlobDb2Message::WriteResponse {
            kind: WriteKind::WriteBack,
            token: 1,
            status: BlobStatus::Success,
        };
        assert_eq!(resp.encode()[4], 0x87);
    }

    #[test]
    fn test_database_policies() {
        assert_eq!(BlobDatabase::from_u8(12), Some(BlobDatabase::WatchPrefs));
        assert_eq!(BlobDatabase::from_u8(13), None);
        assert!(BlobDatabase::Notification.sends_clear());
        assert!(!BlobDatabase::WatchPrefs.sends_clear());
        assert!(BlobDatabase::WatchPrefs.syncs_from_watch());
        assert!(BlobDatabase::Pin.key_is_uuid());
    }
}
