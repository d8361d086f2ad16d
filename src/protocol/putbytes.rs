//! PutBytes (0xBEEF) bulk transfer messages. Integers are big-endian.

use anyhow::{Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{ensure, frame, get_cstr, Endpoint, MAX_PAYLOAD_LEN};

/// Set on the object type byte of app-bound inits.
const APP_INIT_FLAG: u8 = 0x80;

/// Largest data chunk one Put frame can carry after command, cookie and length.
pub const MAX_CHUNK_LEN: usize = MAX_PAYLOAD_LEN - (1 + 4 + 4);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjectType {
    Firmware = 1,
    Recovery = 2,
    SystemResources = 3,
    AppResources = 4,
    AppExecutable = 5,
    File = 6,
    Worker = 7,
}

impl ObjectType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Firmware),
            2 => Some(Self::Recovery),
            3 => Some(Self::SystemResources),
            4 => Some(Self::AppResources),
            5 => Some(Self::AppExecutable),
            6 => Some(Self::File),
            7 => Some(Self::Worker),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutBytesCommand {
    /// 0x01: size, type, bank, NUL-terminated filename
    Init {
        size: u32,
        object_type: ObjectType,
        bank: u8,
        filename: String,
    },
    /// 0x01: size, type | 0x80, app install id
    AppInit {
        size: u32,
        object_type: ObjectType,
        app_id: u32,
    },
    /// 0x02: cookie, length, data
    Put { cookie: u32, data: Bytes },
    /// 0x03: cookie, crc32
    Commit { cookie: u32, crc: u32 },
    /// 0x04
    Abort { cookie: u32 },
    /// 0x05
    Install { cookie: u32 },
}

impl PutBytesCommand {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        match self {
            Self::Init {
                size,
                object_type,
                bank,
                filename,
            } => {
                buf.put_u8(0x01);
                buf.put_u32(*size);
                buf.put_u8(*object_type as u8);
                buf.put_u8(*bank);
                buf.put_slice(filename.as_bytes());
                buf.put_u8(0);
            }
            Self::AppInit {
                size,
                object_type,
                app_id,
            } => {
                buf.put_u8(0x01);
                buf.put_u32(*size);
                buf.put_u8(*object_type as u8 | APP_INIT_FLAG);
                buf.put_u32(*app_id);
            }
            Self::Put { cookie, data } => {
                buf.reserve(data.len());
                buf.put_u8(0x02);
                buf.put_u32(*cookie);
                buf.put_u32(data.len() as u32);
                buf.put_slice(data);
            }
            Self::Commit { cookie, crc } => {
                buf.put_u8(0x03);
                buf.put_u32(*cookie);
                buf.put_u32(*crc);
            }
            Self::Abort { cookie } => {
                buf.put_u8(0x04);
                buf.put_u32(*cookie);
            }
            Self::Install { cookie } => {
                buf.put_u8(0x05);
                buf.put_u32(*cookie);
            }
        }
        frame(Endpoint::PutBytes.id(), &buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        ensure(&payload, 5, "PutBytes")?;
        let cmd = payload.get_u8();
        match cmd {
            0x01 => {
                let size = payload.get_u32();
                ensure(&payload, 1, "PutBytes init")?;
                let raw_type = payload.get_u8();
                let object_type = ObjectType::from_u8(raw_type & !APP_INIT_FLAG)
                    .with_context(|| format!("unknown object type {raw_type:#04x}"))?;
                if raw_type & APP_INIT_FLAG != 0 {
                    ensure(&payload, 4, "PutBytes app init")?;
                    Ok(Self::AppInit {
                        size,
                        object_type,
                        app_id: payload.get_u32(),
                    })
                } else {
                    ensure(&payload, 1, "PutBytes init bank")?;
                    let bank = payload.get_u8();
                    let filename = get_cstr(&mut payload).context("PutBytes init filename")?;
                    Ok(Self::Init {
                        size,
                        object_type,
                        bank,
                        filename,
                    })
                }
            }
            0x02 => {
                let cookie = payload.get_u32();
                ensure(&payload, 4, "PutBytes put length")?;
                let len = payload.get_u32() as usize;
                ensure(&payload, len, "PutBytes put data")?;
                Ok(Self::Put {
                    cookie,
                    data: payload.split_to(len),
                })
            }
            0x03 => {
                let cookie = payload.get_u32();
                ensure(&payload, 4, "PutBytes commit crc")?;
                Ok(Self::Commit {
                    cookie,
                    crc: payload.get_u32(),
                })
            }
            0x04 => Ok(Self::Abort {
                cookie: payload.get_u32(),
            }),
            0x05 => Ok(Self::Install {
                cookie: payload.get_u32(),
            }),
            other => anyhow::bail!("unknown PutBytes command {other:#04x}"),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Init { .. } | Self::AppInit { .. } => "init",
            Self::Put { .. } => "put",
            Self::Commit { .. } => "commit",
            Self::Abort { .. } => "abort",
            Self::Install { .. } => "install",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PutBytesResult {
    Ack = 1,
    Nack = 2,
}

/// Watch reply: `result:u8 | cookie:u32 BE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutBytesResponse {
    pub result: PutBytesResult,
    pub cookie: u32,
}

impl PutBytesResponse {
    pub fn is_ack(&self) -> bool {
        self.result == PutBytesResult::Ack
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u8(self.result as u8);
        buf.put_u32(self.cookie);
        frame(Endpoint::PutBytes.id(), &buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        ensure(&payload, 5, "PutBytesResponse")?;
        let result = match payload.get_u8() {
            1 => PutBytesResult::Ack,
            2 => PutBytesResult::Nack,
            other => anyhow::bail!("unknown PutBytes result {other}"),
        };
        Ok(Self {
            result,
            cookie: payload.get_u32(),
        })
    }
}
