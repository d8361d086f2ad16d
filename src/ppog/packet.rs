//! PPoG packet format.
//!
//! Wire format: one header byte `sequence << 3 | type`, then the payload.
//! Sequence numbers are 5 bits and wrap modulo 32.

use anyhow::{Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the sequence space.
pub const SEQUENCE_MODULO: u8 = 32;

/// Largest window either side may offer. Must stay below the sequence space.
pub const MAX_WINDOW: u8 = 25;

/// Stream protocol version sent in reset requests.
pub const PPOG_VERSION: u8 = 1;

/// Bytes of header per packet.
pub const HEADER_LEN: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Data = 0,
    Ack = 1,
    ResetRequest = 2,
    ResetComplete = 3,
}

impl PacketType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Data),
            1 => Some(Self::Ack),
            2 => Some(Self::ResetRequest),
            3 => Some(Self::ResetComplete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PpogPacket {
    Data { seq: u8, payload: Bytes },
    /// Cumulative: acknowledges `seq` and everything before it
    Ack { seq: u8 },
    ResetRequest { version: u8, rx_window: u8, tx_window: u8 },
    ResetComplete { rx_window: u8, tx_window: u8 },
}

/// Next sequence number after `seq`.
pub fn next_seq(seq: u8) -> u8 {
    (seq + 1) % SEQUENCE_MODULO
}

/// Sequence number before `seq`.
pub fn prev_seq(seq: u8) -> u8 {
    (seq + SEQUENCE_MODULO - 1) % SEQUENCE_MODULO
}

fn header(seq: u8, kind: PacketType) -> u8 {
    ((seq % SEQUENCE_MODULO) << 3) | kind as u8
}

impl PpogPacket {
    pub fn encode(&self) -> Bytes {
        match self {
            Self::Data { seq, payload } => {
                let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
                buf.put_u8(header(*seq, PacketType::Data));
                buf.put_slice(payload);
                buf.freeze()
            }
            Self::Ack { seq } => Bytes::copy_from_slice(&[header(*seq, PacketType::Ack)]),
            Self::ResetRequest {
                version,
                rx_window,
                tx_window,
            } => Bytes::copy_from_slice(&[
                header(0, PacketType::ResetRequest),
                *version,
                *rx_window,
                *tx_window,
            ]),
            Self::ResetComplete {
                rx_window,
                tx_window,
            } => Bytes::copy_from_slice(&[
                header(0, PacketType::ResetComplete),
                *rx_window,
                *tx_window,
            ]),
        }
    }

    pub fn decode(mut frame: Bytes) -> Result<Self> {
        if !frame.has_remaining() {
            anyhow::bail!("empty PPoG packet");
        }
        let h = frame.get_u8();
        let seq = h >> 3;
        let kind = PacketType::from_u8(h & 0x07)
            .with_context(|| format!("unknown PPoG packet type {}", h & 0x07))?;

        match kind {
            PacketType::Data => Ok(Self::Data {
                seq,
                payload: frame,
            }),
            PacketType::Ack => Ok(Self::Ack { seq }),
            PacketType::ResetRequest => {
                if frame.remaining() < 3 {
                    anyhow::bail!("ResetRequest payload too short");
                }
                Ok(Self::ResetRequest {
                    version: frame.get_u8(),
                    rx_window: frame.get_u8(),
                    tx_window: frame.get_u8(),
                })
            }
            PacketType::ResetComplete => {
                if frame.remaining() < 2 {
                    anyhow::bail!("ResetComplete payload too short");
                }
                Ok(Self::ResetComplete {
                    rx_window: frame.get_u8(),
                    tx_window: frame.get_u8(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_header_layout() {
        let data = PpogPacket::Data {
            seq: 5,
            payload: Bytes::from_static(b"hi"),
        };
        assert_eq!(&data.encode()[..], &[5 << 3, b'h', b'i']);
        assert_eq!(&PpogPacket::Ack { seq: 31 }.encode()[..], &[(31 << 3) | 1]);
    }

    #[test]
    fn test_reset_complete_decode() {
        let frame = Bytes::from_static(&[0x03, 10, 12]);
        assert_eq!(
            PpogPacket::decode(frame).unwrap(),
            PpogPacket::ResetComplete {
                rx_window: 10,
                tx_window: 12
            }
        );
    }

    #[test]
    fn test_rejects_bad_frames() {
        assert!(PpogPacket::decode(Bytes::new()).is_err());
        assert!(PpogPacket::decode(Bytes::from_static(&[0x07])).is_err());
        assert!(PpogPacket::decode(Bytes::from_static(&[0x02, 1])).is_err());
    }

    #[test]
    fn test_sequence_wraps() {
        assert_eq!(next_seq(31), 0);
        assert_eq!(prev_seq(0), 31);
    }

    proptest! {
        #[test]
        fn prop_data_preserves_seq_and_payload(seq in 0u8..32, payload in proptest::collection::vec(any::<u8>(), 0..180)) {
            let packet = PpogPacket::Data { seq, payload: Bytes::from(payload) };
            prop_assert_eq!(PpogPacket::decode(packet.encode()).unwrap(), packet);
        }
    }
}
