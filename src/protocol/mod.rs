//! Watch wire protocol.
//!
//! Wire format: every packet is `length:u16 BE | endpoint:u16 BE | payload`,
//! where `length` counts payload bytes only. Field endianness varies per
//! message and is noted on each type. UUIDs are 16 bytes big-endian.

pub mod blobdb;
pub mod handler;
pub mod putbytes;
pub mod system;

use anyhow::{Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub use blobdb::{
    BlobCommand, BlobDatabase, BlobDb2Message, BlobOp, BlobResponse, BlobStatus, BlobWrite,
    WriteKind,
};
pub use handler::ProtocolHandler;
pub use putbytes::{ObjectType, PutBytesCommand, PutBytesResponse, PutBytesResult};
pub use system::{
    AppRunStateMessage, FirmwareRecord, FirmwareUpdateStartStatus, PhoneAppVersion,
    PhoneVersionMessage, PingMessage, ProtocolCaps, SystemMessage, WatchVersionMessage,
    WatchVersionResponse,
};

/// Bytes of framing before each payload.
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest payload a frame can describe.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

// =============================================================================
// Endpoints
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Endpoint {
    WatchVersion = 16,
    PhoneVersion = 17,
    SystemMessage = 18,
    AppRunState = 52,
    Ping = 2001,
    BlobDb = 0xB1DB,
    BlobDb2 = 0xB2DB,
    PutBytes = 0xBEEF,
}

impl Endpoint {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            16 => Some(Self::WatchVersion),
            17 => Some(Self::PhoneVersion),
            18 => Some(Self::SystemMessage),
            52 => Some(Self::AppRunState),
            2001 => Some(Self::Ping),
            0xB1DB => Some(Self::BlobDb),
            0xB2DB => Some(Self::BlobDb2),
            0xBEEF => Some(Self::PutBytes),
            _ => None,
        }
    }

    pub fn id(self) -> u16 {
        self as u16
    }
}

/// Which side sent a packet. Some endpoints use different layouts per direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Phone,
    Watch,
}

impl Origin {
    pub fn peer(self) -> Self {
        match self {
            Self::Phone => Self::Watch,
            Self::Watch => Self::Phone,
        }
    }
}

// =============================================================================
// Framing
// =============================================================================

/// Wrap a payload in the frame header.
///
/// A payload over [`MAX_PAYLOAD_LEN`] cannot be described; its header
/// saturates and [`frame_fits`] reports it so the send path can refuse it.
pub fn frame(endpoint: u16, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u16(u16::try_from(payload.len()).unwrap_or(u16::MAX));
    buf.put_u16(endpoint);
    buf.put_slice(payload);
    buf.freeze()
}

/// Whether a framed packet's header describes its payload exactly.
pub fn frame_fits(frame: &[u8]) -> bool {
    frame.len() >= FRAME_HEADER_LEN && frame.len() - FRAME_HEADER_LEN <= MAX_PAYLOAD_LEN
}

/// One framed packet, not yet decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub endpoint: u16,
    pub payload: Bytes,
}

/// Reassembles frames from stream chunks that may split or merge frames.
#[derive(Debug, Default)]
pub struct PacketAssembler {
    buf: BytesMut,
}

impl PacketAssembler {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<RawFrame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while self.buf.len() >= FRAME_HEADER_LEN {
            let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
            if self.buf.len() < FRAME_HEADER_LEN + len {
                break;
            }
            let mut raw = self.buf.split_to(FRAME_HEADER_LEN + len).freeze();
            raw.advance(2);
            let endpoint = raw.get_u16();
            frames.push(RawFrame {
                endpoint,
                payload: raw,
            });
        }
        frames
    }

    /// Bytes held waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

// =============================================================================
// Packet
// =============================================================================

/// Every packet the core understands, plus a raw fallback.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Ping(PingMessage),
    WatchVersion(WatchVersionMessage),
    PhoneVersion(PhoneVersionMessage),
    System(SystemMessage),
    AppRunState(AppRunStateMessage),
    BlobCommand(BlobCommand),
    BlobResponse(BlobResponse),
    BlobDb2(BlobDb2Message),
    PutBytesCommand(PutBytesCommand),
    PutBytesResponse(PutBytesResponse),
    Unknown { endpoint: u16, payload: Bytes },
}

impl Packet {
    pub fn endpoint_id(&self) -> u16 {
        match self {
            Self::Ping(_) => Endpoint::Ping.id(),
            Self::WatchVersion(_) => Endpoint::WatchVersion.id(),
            Self::PhoneVersion(_) => Endpoint::PhoneVersion.id(),
            Self::System(_) => Endpoint::SystemMessage.id(),
            Self::AppRunState(_) => Endpoint::AppRunState.id(),
            Self::BlobCommand(_) | Self::BlobResponse(_) => Endpoint::BlobDb.id(),
            Self::BlobDb2(_) => Endpoint::BlobDb2.id(),
            Self::PutBytesCommand(_) | Self::PutBytesResponse(_) => Endpoint::PutBytes.id(),
            Self::Unknown { endpoint, .. } => *endpoint,
        }
    }

    /// Full frame, header included.
    pub fn encode(&self) -> Bytes {
        match self {
            Self::Ping(m) => m.encode(),
            Self::WatchVersion(m) => m.encode(),
            Self::PhoneVersion(m) => m.encode(),
            Self::System(m) => m.encode(),
            Self::AppRunState(m) => m.encode(),
            Self::BlobCommand(m) => m.encode(),
            Self::BlobResponse(m) => m.encode(),
            Self::BlobDb2(m) => m.encode(),
            Self::PutBytesCommand(m) => m.encode(),
            Self::PutBytesResponse(m) => m.encode(),
            Self::Unknown { endpoint, payload } => frame(*endpoint, payload),
        }
    }

    /// Decode a frame sent by `origin`.
    pub fn decode(origin: Origin, raw: RawFrame) -> Result<Self> {
        let RawFrame { endpoint, payload } = raw;
        let Some(ep) = Endpoint::from_u16(endpoint) else {
            return Ok(Self::Unknown { endpoint, payload });
        };
        let packet = match (ep, origin) {
            (Endpoint::Ping, _) => Self::Ping(PingMessage::decode(payload)?),
            (Endpoint::WatchVersion, _) => Self::WatchVersion(WatchVersionMessage::decode(payload)?),
            (Endpoint::PhoneVersion, _) => Self::PhoneVersion(PhoneVersionMessage::decode(payload)?),
            (Endpoint::SystemMessage, _) => Self::System(SystemMessage::decode(payload)?),
            (Endpoint::AppRunState, _) => Self::AppRunState(AppRunStateMessage::decode(payload)?),
            (Endpoint::BlobDb, Origin::Phone) => Self::BlobCommand(BlobCommand::decode(payload)?),
            (Endpoint::BlobDb, Origin::Watch) => Self::BlobResponse(BlobResponse::decode(payload)?),
            (Endpoint::BlobDb2, _) => Self::BlobDb2(BlobDb2Message::decode(payload)?),
            (Endpoint::PutBytes, Origin::Phone) => {
                Self::PutBytesCommand(PutBytesCommand::decode(payload)?)
            }
            (Endpoint::PutBytes, Origin::Watch) => {
                Self::PutBytesResponse(PutBytesResponse::decode(payload)?)
            }
        };
        Ok(packet)
    }
}

// =============================================================================
// Field helpers
// =============================================================================

pub(crate) fn ensure(buf: &Bytes, n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        anyhow::bail!("{what}: need {n} bytes, have {}", buf.remaining());
    }
    Ok(())
}

/// Fixed-width, NUL-padded string field.
pub(crate) fn put_fixed_str(buf: &mut BytesMut, s: &str, width: usize) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(width);
    buf.put_slice(&bytes[..n]);
    buf.put_bytes(0, width - n);
}

pub(crate) fn get_fixed_str(buf: &mut Bytes, width: usize) -> String {
    let raw = buf.split_to(width);
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// NUL-terminated string; the terminator is consumed.
pub(crate) fn get_cstr(buf: &mut Bytes) -> Result<String> {
    let end = buf
        .iter()
        .position(|b| *b == 0)
        .context("missing NUL terminator")?;
    let raw = buf.split_to(end);
    buf.advance(1);
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

pub(crate) fn get_uuid(buf: &mut Bytes) -> uuid::Uuid {
    let mut raw = [0u8; 16];
    buf.copy_to_slice(&mut raw);
    uuid::Uuid::from_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assembler_splits_and_merges() {
        let a = frame(Endpoint::Ping.id(), &[0, 0, 0, 0, 1, 0]);
        let b = frame(0x1234, b"xyz");
        let mut stream = BytesMut::new();
        stream.extend_from_slice(&a);
        stream.extend_from_slice(&b);

        let mut assembler = PacketAssembler::default();
        assert!(assembler.push(&stream[..3]).is_empty());
        let frames = assembler.push(&stream[3..12]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].endpoint, 2001);
        assert_eq!(assembler.buffered(), 2);

        let frames = assembler.push(&stream[12..]);
        assert_eq!(
            frames,
            vec![RawFrame {
                endpoint: 0x1234,
                payload: Bytes::from_static(b"xyz")
            }]
        );
        assert_eq!(assembler.buffered(), 0);
    }

    #[test]
    fn test_unknown_endpoint_is_raw() {
        let raw = RawFrame {
            endpoint: 9999,
            payload: Bytes::from_static(b"\x01\x02"),
        };
        let packet = Packet::decode(Origin::Watch, raw).unwrap();
        assert_eq!(packet.endpoint_id(), 9999);
        assert_eq!(&packet.encode()[..], &[0, 2, 0x27, 0x0F, 1, 2]);
    }

    #[test]
    fn test_fixed_str_pads_and_trims() {
        let mut buf = BytesMut::new();
        put_fixed_str(&mut buf, "v4.3", 8);
        assert_eq!(buf.len(), 8);
        let mut bytes = buf.freeze();
        assert_eq!(get_fixed_str(&mut bytes, 8), "v4.3");
        assert!(bytes.is_empty());
    }
}
