//! Windowed read/write/erase of on-device memory regions.
//!
//! Memory operations ride the memory control port (port 3). Each message is
//! a 12-byte [`Port3Header`] followed by up to [`PORT3_DATA_SIZE_MAX`] bytes
//! of data. The device acknowledges every operation with `op = ack` and the
//! original operation in `arg`; write data flows host→device inside a send
//! window bounded by the device-side buffer, read data flows device→host
//! with explicit offsets.
//!
//! Only one operation can be active per device. A new request aborts the
//! one in flight with an `Aborted` status on its originating topic.

use crate::error::ErrorCode;
use crate::pubsub::{Message, Value, TOPIC_SUFFIX_RETURN_CODE};
use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive};
use tracing::{info, warn};
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Maximum bytes in one memory transfer.
pub const MEM_SIZE_MAX: u32 = 512 * 1024;
/// Maximum data bytes per port-3 message: a 512-byte frame minus protocol
/// framing, the stream header, and the port-3 header. With this cap the
/// stream frame fills the framed transport's 125-word payload exactly.
pub const PORT3_DATA_SIZE_MAX: usize = 484;
/// Device-side receive buffer; bounds the write send window.
pub const PORT3_BUFFER_SIZE: usize = 8192;

/// Port-3 operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum MemOp {
    None = 0,
    Erase = 1,
    WriteStart = 2,
    WriteData = 3,
    WriteFinalize = 4,
    ReadReq = 5,
    ReadData = 6,
    Ack = 7,

    #[num_enum(catch_all)]
    Unknown(u8),
}

/// Header of every port-3 message, little-endian on the wire.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct Port3Header {
    pub op: u8,
    pub region: u8,
    pub status: u8,
    /// For acks: the operation being acknowledged.
    pub arg: u8,
    pub offset: U32,
    pub length: U32,
}

pub const PORT3_HEADER_SIZE: usize = core::mem::size_of::<Port3Header>();

/// Controller memory regions, in `h/mem/c/<region>/...` order.
pub static MEM_REGIONS_CONTROLLER: &[(&str, u8)] = &[
    ("app", 0x01),
    ("upd1", 0x02),
    ("upd2", 0x03),
    ("storage", 0x04),
    ("log", 0x05),
    ("acfg", 0x06),
    ("bcfg", 0x07),
    ("pers", 0x08),
];

/// Sensor memory regions, in `h/mem/s/<region>/...` order.
pub static MEM_REGIONS_SENSOR: &[(&str, u8)] = &[
    ("app1", 0x81),
    ("app2", 0x82),
    ("cal_t", 0x83),
    ("cal_a", 0x84),
    ("cal_f", 0x85),
    ("pers", 0x86),
];

/// Outputs produced by a coordinator step: port-3 payloads for the wire and
/// messages for the broker (topics still need the device prefix).
#[derive(Debug, Default)]
pub struct MemEffects {
    pub frames: Vec<Bytes>,
    pub messages: Vec<Message>,
}

impl MemEffects {
    fn frame(&mut self, hdr: Port3Header, data: &[u8]) {
        let mut buf = BytesMut::with_capacity(PORT3_HEADER_SIZE + data.len());
        buf.put_slice(hdr.as_bytes());
        buf.put_slice(data);
        self.frames.push(buf.freeze());
    }
}

/// State of the single in-flight memory operation.
#[derive(Debug)]
pub struct MemoryCoordinator {
    op: MemOp,
    region: u8,
    topic: String,
    data: Vec<u8>,
    offset_valid: u32,
    offset_sent: u32,
    length: u32,
    status: i32,
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self {
            op: MemOp::None,
            region: 0,
            topic: String::new(),
            data: Vec::new(),
            offset_valid: 0,
            offset_sent: 0,
            length: 0,
            status: 0,
        }
    }

    pub fn active(&self) -> bool {
        self.op != MemOp::None
    }

    /// Current completed offset (for tests and diagnostics).
    pub fn offset_valid(&self) -> u32 {
        self.offset_valid
    }

    /// Current sent offset (for tests and diagnostics).
    pub fn offset_sent(&self) -> u32 {
        self.offset_sent
    }

    /// Handle a `h/mem/...` request. `topic` is the prefix-stripped request
    /// topic; `value` carries write data or the read length.
    pub fn request(&mut self, topic: &str, value: &Value) -> MemEffects {
        let mut fx = MemEffects::default();
        if self.active() {
            warn!("aborting ongoing memory operation for {}", self.topic);
            self.complete(ErrorCode::Aborted.as_i32(), &mut fx);
        }
        self.topic = topic.to_string();

        let Some((region, verb)) = parse_mem_topic(topic) else {
            warn!("invalid mem topic: {}", topic);
            self.complete(ErrorCode::ParameterInvalid.as_i32(), &mut fx);
            return fx;
        };
        self.region = region;

        match verb {
            "!erase" => {
                self.op = MemOp::Erase;
                self.length = 0;
                fx.frame(self.header(MemOp::Erase, 0, 0), &[]);
            }
            "!write" => {
                let Some(data) = value.as_bytes() else {
                    warn!("mem write without binary data: {}", topic);
                    self.complete(ErrorCode::ParameterInvalid.as_i32(), &mut fx);
                    return fx;
                };
                if data.len() as u32 > MEM_SIZE_MAX {
                    warn!("mem write too big: {} > {}", data.len(), MEM_SIZE_MAX);
                    self.complete(ErrorCode::ParameterInvalid.as_i32(), &mut fx);
                    return fx;
                }
                self.op = MemOp::WriteStart;
                self.data = data.to_vec();
                self.length = data.len() as u32;
                self.offset_valid = 0;
                self.offset_sent = 0;
                fx.frame(self.header(MemOp::WriteStart, 0, self.length), &[]);
            }
            "!read" => {
                let length = value.as_u32().filter(|&v| v != 0).unwrap_or(MEM_SIZE_MAX);
                if length > MEM_SIZE_MAX {
                    warn!("mem read too big: {} > {}", length, MEM_SIZE_MAX);
                    self.complete(ErrorCode::ParameterInvalid.as_i32(), &mut fx);
                    return fx;
                }
                self.op = MemOp::ReadReq;
                self.data = Vec::with_capacity(length as usize);
                self.length = length;
                self.offset_valid = 0;
                self.offset_sent = 0;
                fx.frame(self.header(MemOp::ReadReq, 0, length), &[]);
            }
            other => {
                warn!("invalid mem op: {}", other);
                self.complete(ErrorCode::ParameterInvalid.as_i32(), &mut fx);
                return fx;
            }
        }
        info!("mem {}: region=0x{:02x}, length={}", verb, self.region, self.length);
        fx
    }

    /// Handle an inbound port-3 payload.
    pub fn handle_port3(&mut self, payload: &[u8]) -> MemEffects {
        let mut fx = MemEffects::default();
        let Ok((hdr, data)) = Port3Header::read_from_prefix(payload) else {
            warn!("port3 message too small: {}", payload.len());
            return fx;
        };
        let op = MemOp::from_primitive(hdr.op);
        let arg = MemOp::from_primitive(hdr.arg);

        if op == MemOp::Ack && arg == self.op {
            let status = if self.status != 0 { self.status } else { hdr.status as i32 };
            match arg {
                MemOp::Erase | MemOp::WriteFinalize => self.complete(status, &mut fx),
                MemOp::WriteStart => {
                    if status != 0 {
                        self.complete(status, &mut fx);
                    } else {
                        self.op = MemOp::WriteData;
                        self.write_next(0, &mut fx);
                    }
                }
                MemOp::WriteData => {
                    if status != 0 {
                        self.complete(status, &mut fx);
                    } else {
                        self.write_next(hdr.offset.get(), &mut fx);
                    }
                }
                MemOp::ReadReq => {
                    // truncate to what actually arrived
                    self.length = self.offset_valid;
                    self.complete(status, &mut fx);
                }
                _ => warn!("unsupported ack arg: {:?}", arg),
            }
        } else if op == MemOp::ReadData && self.op == MemOp::ReadReq {
            self.read_data(&hdr, data);
        } else {
            warn!("port3 op {:?} while {:?} active", op, self.op);
            if self.active() {
                self.complete(ErrorCode::Aborted.as_i32(), &mut fx);
            }
        }
        fx
    }

    /// Advance the write window after an ack reporting `last_offset` as the
    /// end of the last accepted chunk.
    fn write_next(&mut self, last_offset: u32, fx: &mut MemEffects) {
        if last_offset > self.offset_sent {
            warn!("ack offset > sent offset: {} > {}", last_offset, self.offset_sent);
            self.complete(ErrorCode::Synchronization.as_i32(), fx);
            return;
        }
        if last_offset < self.offset_valid {
            warn!("stale ack offset: {} < {}", last_offset, self.offset_valid);
            return;
        }
        self.offset_valid = last_offset;
        loop {
            if self.offset_sent >= self.length {
                break;
            }
            let offset = self.offset_sent;
            let chunk = (self.length - offset).min(PORT3_DATA_SIZE_MAX as u32);
            // keep sent - valid within the device buffer, less one chunk
            if ((self.offset_sent - self.offset_valid + chunk) as usize) > PORT3_BUFFER_SIZE - PORT3_DATA_SIZE_MAX {
                break;
            }
            let hdr = self.header(MemOp::WriteData, offset, chunk);
            fx.frame(hdr, &self.data[offset as usize..(offset + chunk) as usize]);
            self.offset_sent += chunk;
        }
        if self.offset_valid == self.length {
            self.op = MemOp::WriteFinalize;
            fx.frame(self.header(MemOp::WriteFinalize, self.length, 0), &[]);
        }
    }

    /// Accept one inbound read-data chunk.
    fn read_data(&mut self, hdr: &Port3Header, data: &[u8]) {
        let offset = hdr.offset.get();
        let length = hdr.length.get();
        if offset != self.offset_valid {
            warn!("read data expected offset {}, received {}", self.offset_valid, offset);
            self.note_status(ErrorCode::Synchronization.as_i32());
        } else if length as usize > PORT3_DATA_SIZE_MAX || (length as usize) > data.len() {
            warn!("read data length too long: {}", length);
            self.note_status(ErrorCode::ParameterInvalid.as_i32());
        } else {
            let remaining = self.length - self.offset_valid;
            let take = length.min(remaining);
            if take > 0 {
                self.data.extend_from_slice(&data[..take as usize]);
                self.offset_valid += take;
            } else {
                warn!("ignoring extra read data at offset {}", offset);
            }
        }
    }

    fn note_status(&mut self, status: i32) {
        if self.status == 0 {
            self.status = status;
        }
    }

    /// Finish the active operation: emit the `!rdata` payload for completed
    /// reads, then the return code on the request topic, and clear state.
    fn complete(&mut self, status: i32, fx: &mut MemEffects) {
        if self.op == MemOp::None && self.topic.is_empty() {
            return;
        }
        if status == 0 && self.op == MemOp::ReadReq {
            let rdata_topic = match self.topic.rsplit_once('/') {
                Some((base, _)) => format!("{}/!rdata", base),
                None => "!rdata".to_string(),
            };
            info!("{} with {} bytes", rdata_topic, self.length);
            let data = std::mem::take(&mut self.data);
            fx.messages.push(Message::new(rdata_topic, Value::Bin(Bytes::from(data))));
        }
        fx.messages.push(Message::new(
            format!("{}{}", self.topic, TOPIC_SUFFIX_RETURN_CODE),
            Value::I32(status),
        ));
        self.op = MemOp::None;
        self.region = 0;
        self.topic.clear();
        self.data = Vec::new();
        self.offset_valid = 0;
        self.offset_sent = 0;
        self.length = 0;
        self.status = 0;
    }

    fn header(&self, op: MemOp, offset: u32, length: u32) -> Port3Header {
        Port3Header {
            op: op.into(),
            region: self.region,
            status: 0,
            arg: 0,
            offset: U32::new(offset),
            length: U32::new(length),
        }
    }
}

/// Parse `h/mem/{c|s}/<region>/<verb>` into the region code and verb.
fn parse_mem_topic(topic: &str) -> Option<(u8, &str)> {
    let rest = topic.strip_prefix("h/mem/")?;
    let (space, rest) = rest.split_once('/')?;
    let table = match space {
        "c" => MEM_REGIONS_CONTROLLER,
        "s" => MEM_REGIONS_SENSOR,
        _ => return None,
    };
    let (region_str, verb) = rest.split_once('/')?;
    let region = table.iter().find(|(name, _)| *name == region_str)?.1;
    Some((region, verb))
}
