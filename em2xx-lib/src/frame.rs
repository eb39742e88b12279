//! 512-byte framed message codec for the EM220 bulk protocol.
//!
//! Every message on the bulk pipe is carried in a frame of at most 512 bytes:
//! an 8-byte header, up to 125 32-bit payload words, and a 32-bit trailing
//! frame check (always zero over USB, which provides its own CRC). Link
//! control and acknowledgement frames are 8 bytes total: the first four
//! header bytes followed by a 32-bit link check in place of payload and
//! footer.
//!
//! All multi-byte fields are little-endian on the wire. The header carries
//! two short parity words, `length_check` and `link_check`, chosen so that a
//! data frame is unlikely to be mistaken for a link frame after corruption.

use crate::error::EmError;
use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive};
use tracing::warn;

/// First start-of-frame byte.
pub const SOF1: u8 = 0x55;
/// Second start-of-frame nibble (upper nibble of byte 1).
pub const SOF2: u8 = 0x00;
/// Mask selecting the SOF2 nibble.
pub const SOF2_MASK: u8 = 0xF0;
/// Total frame size on the bulk pipe.
pub const FRAME_SIZE: usize = 512;
/// Header size in bytes.
pub const HEADER_SIZE: usize = 8;
/// Footer (frame check) size in bytes.
pub const FOOTER_SIZE: usize = 4;
/// Link control / acknowledgement frame size in bytes.
pub const LINK_FRAME_SIZE: usize = 8;
/// Maximum data payload length in 32-bit words.
pub const PAYLOAD_WORDS_MAX: usize = 125;
/// Maximum data payload length in bytes.
pub const PAYLOAD_BYTES_MAX: usize = PAYLOAD_WORDS_MAX * 4;
/// Frame ids are 11 bits, modulo 2048.
pub const FRAME_ID_MAX: u16 = (1 << 11) - 1;

/// Service type for data frames, carried in the low nibble of byte 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum ServiceType {
    Invalid = 0,
    Link = 1,
    Trace = 2,
    PubSub = 3,
    Throughput = 4,

    #[num_enum(catch_all)]
    Unknown(u8),
}

/// The 5-bit frame type.
///
/// Values are chosen to minimize the chance that a corrupted data frame is
/// accepted as a link frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x00,
    AckAll = 0x0F,
    AckOne = 0x17,
    NackFrameId = 0x1B,
    Control = 0x1E,

    #[num_enum(catch_all)]
    Unknown(u8),
}

/// Link control subtype, carried in the frame id field of control frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum LinkCtrl {
    ResetRequest = 0x00,
    ResetAck = 0x01,
    DisconnectRequest = 0x02,
    DisconnectAck = 0x03,

    #[num_enum(catch_all)]
    Unknown(u8),
}

/// Message type for link-service data frames, in `metadata[7:0]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum LinkMsg {
    Invalid = 0,
    Status = 1,
    TimesyncReq = 2,
    TimesyncRsp = 3,
    Ping = 4,
    Pong = 5,

    #[num_enum(catch_all)]
    Unknown(u8),
}

/// Compute the length check for a length field value.
///
/// `length` is `((payload_bytes + 3) >> 2) - 1`. The function is injective
/// over 0..=127.
pub fn length_check(length: u8) -> u8 {
    (((length as u32) * 0xD8D9) >> 11) as u8
}

/// Compute the 32-bit link check over the type/id word of a link frame.
pub fn link_check(type_id_word: u16) -> u32 {
    0xCBA9u32.wrapping_mul(type_id_word as u32)
}

/// A decoded view onto a single received frame.
///
/// Data payloads borrow from the input buffer; the view lives only as long
/// as the buffer it was decoded from.
#[derive(Debug, PartialEq)]
pub enum FrameRef<'a> {
    Data {
        frame_id: u16,
        service: ServiceType,
        metadata: u16,
        /// Word-aligned payload; the exact byte count, when it matters, is
        /// recovered from service-specific metadata.
        payload: &'a [u8],
    },
    Control {
        subtype: LinkCtrl,
    },
    Ack {
        frame_type: FrameType,
        frame_id: u16,
    },
}

/// Receive/transmit statistics kept by the codec.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub frames_rx: u64,
    pub frames_tx: u64,
    pub frame_id_gaps: u64,
    pub length_check_errors: u64,
}

/// Frame encoder/decoder with frame-id tracking.
///
/// Outbound frame ids increment modulo 2048 per encoded data frame. On the
/// receive side the codec tracks the expected next frame id; a mismatch is
/// reported and the expected id resynchronizes to `received + 1` without
/// discarding the payload.
#[derive(Debug, Default)]
pub struct FrameCodec {
    out_frame_id: u16,
    in_frame_id: u16,
    stats: FrameStats,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next outbound frame id (the one the next `encode_data` will use).
    pub fn out_frame_id(&self) -> u16 {
        self.out_frame_id
    }

    /// Expected next inbound frame id.
    pub fn in_frame_id(&self) -> u16 {
        self.in_frame_id
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    /// Encode a data frame.
    ///
    /// `payload` is padded with zeros to a 32-bit boundary; the exact byte
    /// count is the caller's to communicate through `metadata` where the
    /// service requires it. Fails with `PayloadSize` unless the padded
    /// payload is 1..=125 words.
    pub fn encode_data(&mut self, service: ServiceType, metadata: u16, payload: &[u8]) -> Result<Bytes, EmError> {
        let words = (payload.len() + 3) >> 2;
        if words == 0 || words > PAYLOAD_WORDS_MAX {
            return Err(EmError::PayloadSize(payload.len()));
        }
        let length = (words - 1) as u8;
        let frame_id = self.out_frame_id;
        self.out_frame_id = (self.out_frame_id + 1) & FRAME_ID_MAX;
        self.stats.frames_tx += 1;

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + words * 4 + FOOTER_SIZE);
        buf.put_u8(SOF1);
        buf.put_u8(SOF2 | u8::from(service));
        buf.put_u16_le(((u8::from(FrameType::Data) as u16) << 11) | frame_id);
        buf.put_u8(length);
        buf.put_u8(length_check(length));
        buf.put_u16_le(metadata);
        buf.put_slice(payload);
        for _ in payload.len()..words * 4 {
            buf.put_u8(0);
        }
        buf.put_u32_le(0); // frame check unused over USB
        Ok(buf.freeze())
    }

    /// Encode an 8-byte link control frame for the given subtype.
    pub fn encode_control(&mut self, subtype: LinkCtrl) -> Bytes {
        let type_id = ((u8::from(FrameType::Control) as u16) << 11) | (u8::from(subtype) as u16);
        self.stats.frames_tx += 1;
        let mut buf = BytesMut::with_capacity(LINK_FRAME_SIZE);
        buf.put_u8(SOF1);
        buf.put_u8(SOF2);
        buf.put_u16_le(type_id);
        buf.put_u32_le(link_check(type_id));
        buf.freeze()
    }

    /// Decode a single received frame.
    ///
    /// SOF and link-check violations fail and the frame must be skipped. A
    /// length-check mismatch or a frame-id gap is logged and counted but the
    /// payload is still delivered.
    pub fn decode<'a>(&mut self, frame: &'a [u8]) -> Result<FrameRef<'a>, EmError> {
        if frame.len() < LINK_FRAME_SIZE {
            return Err(EmError::Framing(format!("frame too short: {}", frame.len())));
        }
        if frame[0] != SOF1 {
            return Err(EmError::Framing(format!("SOF1 mismatch: 0x{:02x}", frame[0])));
        }
        if frame[1] & SOF2_MASK != SOF2 {
            return Err(EmError::Framing(format!("SOF2 mismatch: 0x{:02x}", frame[1])));
        }
        let type_id = u16::from_le_bytes([frame[2], frame[3]]);
        let frame_type = FrameType::from_primitive((type_id >> 11) as u8);
        let frame_id = type_id & FRAME_ID_MAX;

        if frame_type != FrameType::Data {
            // link-class frame: the last four bytes are the link check
            let expected = link_check(type_id);
            let actual = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
            if expected != actual {
                return Err(EmError::LinkCheck { expected, actual });
            }
            return match frame_type {
                FrameType::Control => Ok(FrameRef::Control {
                    subtype: LinkCtrl::from_primitive(frame_id as u8),
                }),
                FrameType::AckAll | FrameType::AckOne | FrameType::NackFrameId => {
                    Ok(FrameRef::Ack { frame_type, frame_id })
                }
                _ => Err(EmError::Framing(format!("invalid frame type: 0x{:02x}", u8::from(frame_type)))),
            };
        }

        let length = frame[4];
        let check = length_check(length);
        if check != frame[5] {
            warn!("frame length check mismatch: 0x{:02x} != 0x{:02x}", check, frame[5]);
            self.stats.length_check_errors += 1;
        }
        let words = length as usize + 1;
        if HEADER_SIZE + words * 4 > frame.len() {
            return Err(EmError::Framing(format!(
                "payload length {} exceeds frame size {}",
                words * 4,
                frame.len()
            )));
        }

        if frame_id != self.in_frame_id {
            warn!("in frame_id mismatch: expected {}, received {}", self.in_frame_id, frame_id);
            self.stats.frame_id_gaps += 1;
        }
        self.in_frame_id = (frame_id + 1) & FRAME_ID_MAX;
        self.stats.frames_rx += 1;

        Ok(FrameRef::Data {
            frame_id,
            service: ServiceType::from_primitive(frame[1] & !SOF2_MASK),
            metadata: u16::from_le_bytes([frame[6], frame[7]]),
            payload: &frame[HEADER_SIZE..HEADER_SIZE + words * 4],
        })
    }
}
