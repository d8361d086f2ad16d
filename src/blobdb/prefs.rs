//! Watch preferences database.
//!
//! Keys are preference ids as ASCII. Values are typed: NUL-terminated
//! strings, 16-byte UUIDs, single bytes, or little-endian i16. The watch is
//! authoritative for this database and writes changes back.

use std::sync::Arc;

use anyhow::{bail, Context};
use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use super::memory::MemoryRecordSource;
use super::source::{content_hash, BlobItem};
use crate::clock::SharedClock;
use crate::connection::WatchInfo;
use crate::protocol::{BlobDatabase, BlobWrite};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrefType {
    String,
    Uuid,
    Uint8,
    Int16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchPref {
    TimezoneSource,
    AutomaticTimezoneId,
    TextStyle,
    LightTimeoutMs,
    LightIntensity,
    LightAmbientThreshold,
    Watchface,
    QuickLaunchUp,
    QuickLaunchDown,
    QuickLaunchSelect,
    QuickLaunchBack,
    Worker,
}

impl WatchPref {
    pub const ALL: [Self; 12] = [
        Self::TimezoneSource,
        Self::AutomaticTimezoneId,
        Self::TextStyle,
        Self::LightTimeoutMs,
        Self::LightIntensity,
        Self::LightAmbientThreshold,
        Self::Watchface,
        Self::QuickLaunchUp,
        Self::QuickLaunchDown,
        Self::QuickLaunchSelect,
        Self::QuickLaunchBack,
        Self::Worker,
    ];

    /// Key as stored on the watch.
    pub fn id(self) -> &'static str {
        match self {
            Self::TimezoneSource => "timezoneSource",
            Self::AutomaticTimezoneId => "automaticTimezoneID",
            Self::TextStyle => "textStyle",
            Self::LightTimeoutMs => "lightTimeoutMs",
            Self::LightIntensity => "lightIntensity",
            Self::LightAmbientThreshold => "lightAmbientThreshold",
            Self::Watchface => "watchface",
            Self::QuickLaunchUp => "qlUp",
            Self::QuickLaunchDown => "qlDown",
            Self::QuickLaunchSelect => "qlSelect",
            Self::QuickLaunchBack => "qlBack",
            Self::Worker => "workerId",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.id() == id)
    }

    pub fn pref_type(self) -> PrefType {
        match self {
            Self::AutomaticTimezoneId => PrefType::Int16,
            Self::Watchface
            | Self::QuickLaunchUp
            | Self::QuickLaunchDown
            | Self::QuickLaunchSelect
            | Self::QuickLaunchBack
            | Self::Worker => PrefType::Uuid,
            _ => PrefType::Uint8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefValue {
    String(String),
    Uuid(Uuid),
    Uint8(u8),
    Int16(i16),
}

impl PrefValue {
    pub fn pref_type(&self) -> PrefType {
        match self {
            Self::String(_) => PrefType::String,
            Self::Uuid(_) => PrefType::Uuid,
            Self::Uint8(_) => PrefType::Uint8,
            Self::Int16(_) => PrefType::Int16,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Self::String(s) => {
                buf.put_slice(s.as_bytes());
                buf.put_u8(0);
            }
            Self::Uuid(u) => buf.put_slice(u.as_bytes()),
            Self::Uint8(v) => buf.put_u8(*v),
            Self::Int16(v) => buf.put_i16_le(*v),
        }
        buf.freeze()
    }

    pub fn decode(ty: PrefType, raw: &[u8]) -> anyhow::Result<Self> {
        Ok(match ty {
            PrefType::String => {
                let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                let s = std::str::from_utf8(&raw[..end]).context("pref string is not UTF-8")?;
                Self::String(s.to_owned())
            }
            PrefType::Uuid => {
                let bytes: [u8; 16] = raw
                    .try_into()
                    .with_context(|| format!("uuid pref has {} bytes", raw.len()))?;
                Self::Uuid(Uuid::from_bytes(bytes))
            }
            PrefType::Uint8 => match raw {
                [v] => Self::Uint8(*v),
                _ => bail!("u8 pref has {} bytes", raw.len()),
            },
            PrefType::Int16 => match raw {
                [lo, hi] => Self::Int16(i16::from_le_bytes([*lo, *hi])),
                _ => bail!("i16 pref has {} bytes", raw.len()),
            },
        })
    }
}

/// One typed preference record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchPrefItem {
    pref: WatchPref,
    value: PrefValue,
}

impl WatchPrefItem {
    pub fn new(pref: WatchPref, value: PrefValue) -> anyhow::Result<Self> {
        if value.pref_type() != pref.pref_type() {
            bail!(
                "{} expects {:?}, got {:?}",
                pref.id(),
                pref.pref_type(),
                value.pref_type()
            );
        }
        Ok(Self { pref, value })
    }

    pub fn pref(&self) -> WatchPref {
        self.pref
    }

    pub fn pref_value(&self) -> &PrefValue {
        &self.value
    }
}

impl BlobItem for WatchPrefItem {
    fn key(&self) -> Bytes {
        Bytes::from_static(self.pref.id().as_bytes())
    }

    fn value(&self, _watch: &WatchInfo) -> Option<Bytes> {
        Some(self.value.encode())
    }

    fn content_hash(&self) -> u64 {
        content_hash(&self.value.encode())
    }
}

/// Decode a watch-initiated preference write.
pub fn decode_pref_write(write: &BlobWrite) -> anyhow::Result<Arc<dyn BlobItem>> {
    let id = std::str::from_utf8(&write.key)
        .context("pref key is not UTF-8")?
        .trim_end_matches('\0');
    let pref = WatchPref::from_id(id).with_context(|| format!("unknown pref {id:?}"))?;
    let value = PrefValue::decode(pref.pref_type(), &write.value)
        .with_context(|| format!("decoding {id}"))?;
    Ok(Arc::new(WatchPrefItem { pref, value }))
}

/// Preferences source that applies watch writes.
pub fn watch_prefs_source(clock: SharedClock) -> MemoryRecordSource {
    MemoryRecordSource::new(BlobDatabase::WatchPrefs, clock).with_write_decoder(Arc::new(decode_pref_write))
}
