//! Per-device driver event loop.
//!
//! One driver instance runs per attached device on its own task. It owns
//! two inbound queues — commands from the application and responses from
//! the lower-level USB backend — and two outbound sinks: requests to the
//! backend and topic/value messages to the broker.
//!
//! The loop is strictly single-threaded cooperative: it blocks only on
//! "either queue non-empty" with a 5 s ceiling (shortened by the active
//! handshake deadline) and never waits on device I/O. All device traffic is
//! asynchronous through the backend queues. The loop exits when the
//! connection state machine reaches `finalized`.
//!
//! Topic surface (device prefix stripped):
//!
//! - `!open` (value 1 = raw mode), `!close`, `!finalize` — lifecycle;
//!   `!open#`/`!close#` report the status.
//! - `h/link/!ping` — link ping; pongs surface at `h/link/!pong`.
//! - `h/mem/{c|s}/<region>/{!erase|!write|!read}` — memory operations.
//! - `h/!reset` — reset target {app, update1, update2}.
//! - anything else — forwarded to the device as a pubsub publish while
//!   open; `.../ctrl` topics additionally gate per-port streaming.

use crate::decompress::{decompress, DecodedSamples};
use crate::devices::{version_str, Generation};
use crate::error::EmError;
use crate::frame::{FrameCodec, FrameRef, LinkCtrl, LinkMsg, ServiceType, FRAME_SIZE};
use crate::memory::{MemEffects, MemoryCoordinator};
use crate::port::{
    port_index_for_ctrl_topic, StreamHeader, PORT_DATA_FIRST, PORT_HANDSHAKE, PORT_IDX_CURRENT, PORT_IDX_GPI0,
    PORT_IDX_GPI1, PORT_IDX_POWER, PORT_IDX_RANGE, PORT_IDX_VOLTAGE, PORT_LOGGING, PORT_MAP, PORT_MEMORY,
    PORT_PUBSUB,
};
use crate::pubsub::{
    decode_port_publish, decode_publish, encode_port_publish, encode_publish, strip_prefix, Message, Value,
};
use crate::reassembly::PortReassembly;
use crate::statemachine::{Action, ConnectionMachine, DeviceState, Event};
use crate::suppressor::SampleProcessor;
use bytes::{BufMut, Bytes, BytesMut};
use num_enum::FromPrimitive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, trace, warn};
use zerocopy::byteorder::little_endian::{I64, U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Ceiling on the event loop wait.
pub const LOOP_WAIT: Duration = Duration::from_secs(5);

/// Sentinel topic published to drain the device pubsub queue on close.
pub const FLUSH_PING_TOPIC: &str = "././!ping";
/// Topic on which the device echoes the flush sentinel.
pub const FLUSH_PONG_TOPIC: &str = "././!pong";
/// Sentinel value; the echo is matched case-insensitively.
pub const FLUSH_VALUE: &str = "h|disconnect";

/// Protocol major version this driver speaks.
pub const PROTOCOL_VERSION_MAJOR: u32 = 1;

const TOPIC_OPEN: &str = "!open";
const TOPIC_CLOSE: &str = "!close";
const TOPIC_FINALIZE: &str = "!finalize";

/// Requests to the lower-level USB backend.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendRequest {
    Open,
    BulkStreamOpen,
    BulkOut(Bytes),
    Close,
}

/// Responses and asynchronous events from the lower-level USB backend.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendResponse {
    OpenAck(i32),
    BulkOpenAck(i32),
    CloseAck(i32),
    BulkOutDone,
    /// One or more 512-byte frames from the bulk-in stream.
    StreamIn(Bytes),
    /// Device arrival or loss.
    Presence(bool),
}

/// Construction parameters for one driver instance.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Device topic prefix, e.g. `u/em220/000123`.
    pub prefix: String,
    pub generation: Generation,
    /// Whether the device is present at construction.
    pub present: bool,
}

/// Handle returned by [`Driver::spawn`].
pub struct DriverHandle {
    cmd_tx: mpsc::UnboundedSender<Message>,
    finalize: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl DriverHandle {
    /// Queue a command message to the driver.
    pub fn send(&self, msg: Message) -> Result<(), EmError> {
        self.cmd_tx.send(msg).map_err(|_| EmError::NotFound)
    }

    /// Request driver termination and return once the loop has exited.
    pub async fn finalize(self) {
        self.finalize.store(true, Ordering::Release);
        let _ = self.cmd_tx.send(Message::new(TOPIC_FINALIZE, Value::Null));
        let _ = self.join.await;
    }
}

// ---------------------------------------------------------------------------
// handshake port (port 0) wire structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::IntoPrimitive, FromPrimitive)]
#[repr(u8)]
enum Port0Op {
    Invalid = 0,
    Connect = 1,
    Echo = 2,
    Timesync = 3,
    Disconnect = 4,

    #[num_enum(catch_all)]
    Unknown(u8),
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct Port0Header {
    op: u8,
    status: u8,
    arg: U16,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct Port0Connect {
    app_id: U32,
    protocol_version: U32,
    fw_version: U32,
    hw_version: U32,
    fpga_version: U32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct Port0Timesync {
    rsv: I64,
    start_count: U64,
    utc_recv: I64,
    utc_send: I64,
    end_count: U64,
}

fn utc_now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// driver
// ---------------------------------------------------------------------------

enum Wake {
    Cmd(Option<Message>),
    Rsp(Option<BackendResponse>),
    Tick,
}

/// The per-device upper-level driver.
pub struct Driver {
    prefix: String,
    generation: Generation,
    codec: FrameCodec,
    sm: ConnectionMachine,
    mem: MemoryCoordinator,
    /// Front-panel pre-processor; only the older device has one.
    fp: Option<SampleProcessor>,
    ports: Vec<PortReassembly>,
    stream_in_port_enable: u32,
    stream_out_frame_id: u16,
    stream_in_frame_id: u16,
    voltage_range: u8,
    state_entered: Instant,
    finalize_flag: Arc<AtomicBool>,
    finalize_applied: bool,
    cmd_rx: mpsc::UnboundedReceiver<Message>,
    rsp_rx: mpsc::UnboundedReceiver<BackendResponse>,
    backend_tx: mpsc::UnboundedSender<BackendRequest>,
    broker_tx: mpsc::UnboundedSender<Message>,
}

impl Driver {
    pub fn new(
        config: DriverConfig,
        cmd_rx: mpsc::UnboundedReceiver<Message>,
        rsp_rx: mpsc::UnboundedReceiver<BackendResponse>,
        backend_tx: mpsc::UnboundedSender<BackendRequest>,
        broker_tx: mpsc::UnboundedSender<Message>,
    ) -> Self {
        Self::with_finalize_flag(config, cmd_rx, rsp_rx, backend_tx, broker_tx, Arc::new(AtomicBool::new(false)))
    }

    fn with_finalize_flag(
        config: DriverConfig,
        cmd_rx: mpsc::UnboundedReceiver<Message>,
        rsp_rx: mpsc::UnboundedReceiver<BackendResponse>,
        backend_tx: mpsc::UnboundedSender<BackendRequest>,
        broker_tx: mpsc::UnboundedSender<Message>,
        finalize_flag: Arc<AtomicBool>,
    ) -> Self {
        let ports = PORT_MAP
            .iter()
            .map(|def| {
                let r = PortReassembly::new(def);
                // the older device streams every signal at the raw rate
                if config.generation == Generation::Em110 {
                    r.with_downsample(1)
                } else {
                    r
                }
            })
            .collect();
        Self {
            generation: config.generation,
            codec: FrameCodec::new(),
            sm: ConnectionMachine::new(config.present),
            mem: MemoryCoordinator::new(),
            fp: match config.generation {
                Generation::Em110 => Some(SampleProcessor::new()),
                Generation::Em220 => None,
            },
            ports,
            stream_in_port_enable: 0x0F,
            stream_out_frame_id: 0,
            stream_in_frame_id: 0,
            voltage_range: 0,
            state_entered: Instant::now(),
            finalize_flag,
            finalize_applied: false,
            cmd_rx,
            rsp_rx,
            backend_tx,
            broker_tx,
            prefix: config.prefix,
        }
    }

    /// Spawn the driver on the current tokio runtime and return its handle.
    pub fn spawn(
        config: DriverConfig,
        rsp_rx: mpsc::UnboundedReceiver<BackendResponse>,
        backend_tx: mpsc::UnboundedSender<BackendRequest>,
        broker_tx: mpsc::UnboundedSender<Message>,
    ) -> DriverHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let finalize = Arc::new(AtomicBool::new(false));
        let driver = Self::with_finalize_flag(config, cmd_rx, rsp_rx, backend_tx, broker_tx, finalize.clone());
        let join = tokio::spawn(driver.run());
        DriverHandle {
            cmd_tx,
            finalize,
            join,
        }
    }

    /// Run the event loop to completion.
    pub async fn run(mut self) {
        info!("driver started for {} ({})", self.prefix, self.generation);
        self.publish_state();

        let mut cmd_open = true;
        let mut rsp_open = true;
        loop {
            while let Ok(msg) = self.cmd_rx.try_recv() {
                self.handle_cmd(msg);
            }
            while let Ok(rsp) = self.rsp_rx.try_recv() {
                self.handle_rsp(rsp);
            }

            if self.finalize_flag.load(Ordering::Acquire) {
                self.request_finalize();
            }
            if self.sm.state() == DeviceState::LlClosePend {
                self.apply(Event::Advance);
            }
            if let Some(limit) = self.sm.state_timeout() {
                if self.state_entered.elapsed() >= limit {
                    warn!("state {} timed out", self.sm.state());
                    self.apply(Event::Timeout);
                }
            }
            if self.sm.state() == DeviceState::Finalized {
                break;
            }
            if !cmd_open && !rsp_open {
                // nothing can make progress anymore
                warn!("both queues closed for {}, exiting", self.prefix);
                break;
            }

            let wait = self
                .sm
                .state_timeout()
                .map(|limit| limit.saturating_sub(self.state_entered.elapsed()))
                .unwrap_or(LOOP_WAIT)
                .min(LOOP_WAIT);
            let wake = tokio::select! {
                msg = self.cmd_rx.recv(), if cmd_open => Wake::Cmd(msg),
                rsp = self.rsp_rx.recv(), if rsp_open => Wake::Rsp(rsp),
                _ = sleep(wait) => Wake::Tick,
            };
            match wake {
                Wake::Cmd(Some(msg)) => self.handle_cmd(msg),
                Wake::Cmd(None) => cmd_open = false,
                Wake::Rsp(Some(rsp)) => self.handle_rsp(rsp),
                Wake::Rsp(None) => rsp_open = false,
                Wake::Tick => trace!("loop tick"),
            }
        }
        info!("driver done for {}", self.prefix);
    }

    // -- command queue ------------------------------------------------------

    fn handle_cmd(&mut self, msg: Message) {
        if msg.topic == TOPIC_FINALIZE {
            // full driver shutdown
            self.request_finalize();
            return;
        }
        let Some(topic) = strip_prefix(&self.prefix, &msg.topic).map(str::to_string) else {
            warn!("command topic mismatch: {} not under {}", msg.topic, self.prefix);
            return;
        };
        match topic.as_str() {
            TOPIC_OPEN => {
                let raw = msg.value.as_u32() == Some(1);
                self.apply(Event::ApiOpen { raw });
            }
            TOPIC_CLOSE => self.apply(Event::ApiClose),
            TOPIC_FINALIZE => self.request_finalize(),
            "h/link/!ping" => {
                if self.sm.state() == DeviceState::Open {
                    self.link_ping(&msg.value);
                } else {
                    warn!("dropping publish to {} while {}", topic, self.sm.state());
                }
            }
            "h/!reset" => {
                if self.sm.state() == DeviceState::Open {
                    self.reset_target(&msg.value);
                } else {
                    warn!("dropping publish to {} while {}", topic, self.sm.state());
                }
            }
            t if t.starts_with("h/mem/") => self.mem_request(t, &msg.value),
            t => {
                if t.ends_with("/ctrl") {
                    self.port_enable_from_topic(t, &msg.value);
                }
                if self.sm.state() == DeviceState::Open {
                    self.publish_to_device(t, &msg.value);
                } else {
                    warn!("dropping publish to {} while {}", t, self.sm.state());
                }
            }
        }
    }

    fn request_finalize(&mut self) {
        self.finalize_flag.store(true, Ordering::Release);
        if !self.finalize_applied {
            self.finalize_applied = true;
            self.apply(Event::Finalize);
        }
    }

    fn link_ping(&mut self, value: &Value) {
        let payload = value.as_bytes().unwrap_or(&[]);
        let payload = if payload.is_empty() { &[0u8; 4][..] } else { payload };
        match self.generation {
            Generation::Em220 => {
                self.send_link_msg(LinkMsg::Ping, payload);
            }
            Generation::Em110 => {
                let hdr = Port0Header {
                    op: Port0Op::Echo.into(),
                    status: 0,
                    arg: U16::new(0),
                };
                let mut buf = BytesMut::with_capacity(4 + payload.len());
                buf.put_slice(hdr.as_bytes());
                buf.put_slice(payload);
                self.send_stream_frame(PORT_HANDSHAKE, &buf);
            }
        }
    }

    fn reset_target(&mut self, value: &Value) {
        let target = match value {
            Value::Str(s) => match s.as_str() {
                "app" => Some(0),
                "update1" => Some(1),
                "update2" => Some(2),
                _ => None,
            },
            v => v.as_u32().filter(|&t| t <= 2),
        };
        let Some(target) = target else {
            warn!("invalid reset target: {:?}", value);
            return;
        };
        self.publish_to_device("h/!reset", &Value::U32(target));
    }

    fn mem_request(&mut self, topic: &str, value: &Value) {
        if self.sm.state() != DeviceState::Open {
            warn!("memory request while {}: {}", self.sm.state(), topic);
            self.broker(Message::new(
                format!("{}#", topic),
                Value::I32(crate::error::ErrorCode::NotFound.as_i32()),
            ));
            return;
        }
        let fx = self.mem.request(topic, value);
        self.mem_effects(fx);
    }

    fn mem_effects(&mut self, fx: MemEffects) {
        for frame in fx.frames {
            self.send_stream_frame(PORT_MEMORY, &frame);
        }
        for msg in fx.messages {
            self.broker(msg);
        }
    }

    fn port_enable_from_topic(&mut self, ctrl_topic: &str, value: &Value) {
        let Some(idx) = port_index_for_ctrl_topic(ctrl_topic) else {
            return;
        };
        let Some(enable) = value.as_bool() else {
            warn!("non-boolean port control on {}: {:?}", ctrl_topic, value);
            return;
        };
        let mask = 1u32 << (PORT_DATA_FIRST as u32 + idx as u32);
        if enable {
            self.stream_in_port_enable |= mask;
        } else {
            self.stream_in_port_enable &= !mask;
        }
    }

    // -- response queue -----------------------------------------------------

    fn handle_rsp(&mut self, rsp: BackendResponse) {
        match rsp {
            BackendResponse::OpenAck(0) => self.apply(Event::BackendOpenAck),
            BackendResponse::OpenAck(status) => self.apply(Event::BackendOpenNack { status }),
            BackendResponse::BulkOpenAck(0) => self.apply(Event::BackendBulkAck),
            BackendResponse::BulkOpenAck(status) => self.apply(Event::BackendBulkNack { status }),
            BackendResponse::CloseAck(status) => self.apply(Event::BackendCloseAck { status }),
            BackendResponse::BulkOutDone => trace!("bulk out done"),
            BackendResponse::StreamIn(data) => self.handle_stream_in(&data),
            BackendResponse::Presence(present) => self.apply(Event::Reset { present }),
        }
    }

    fn handle_stream_in(&mut self, data: &[u8]) {
        for chunk in data.chunks(FRAME_SIZE) {
            match self.generation {
                Generation::Em220 => self.handle_framed(chunk),
                Generation::Em110 => self.handle_stream_frame(chunk),
            }
        }
    }

    // -- framed protocol (EM220) -------------------------------------------

    fn handle_framed(&mut self, chunk: &[u8]) {
        let frame = match self.codec.decode(chunk) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("frame skipped: {}", e);
                return;
            }
        };
        match frame {
            FrameRef::Control { subtype } => match subtype {
                LinkCtrl::ResetRequest => self.apply(Event::LinkResetReq),
                LinkCtrl::ResetAck => self.apply(Event::LinkResetAck),
                LinkCtrl::DisconnectRequest => self.apply(Event::LinkDisconnectReq),
                LinkCtrl::DisconnectAck => self.apply(Event::LinkDisconnectAck),
                LinkCtrl::Unknown(subtype) => warn!("unknown link control subtype 0x{:02x}", subtype),
            },
            FrameRef::Ack { frame_type, frame_id } => {
                debug!("link {:?} for frame {}", frame_type, frame_id);
            }
            FrameRef::Data {
                service,
                metadata,
                payload,
                ..
            } => match service {
                ServiceType::Link => self.handle_link_in(metadata, payload),
                ServiceType::PubSub => match decode_publish(payload, metadata) {
                    Ok((topic, value)) => self.handle_pubsub_in(topic, value),
                    Err(e) => warn!("pubsub decode failed: {}", e),
                },
                ServiceType::Trace => trace!("trace frame, {} bytes", payload.len()),
                ServiceType::Throughput => self.handle_stream_frame(payload),
                ServiceType::Invalid | ServiceType::Unknown(_) => {
                    warn!("unsupported service type {:?}", service)
                }
            },
        }
    }

    fn handle_link_in(&mut self, metadata: u16, payload: &[u8]) {
        match LinkMsg::from_primitive((metadata & 0xFF) as u8) {
            LinkMsg::Pong => {
                self.publish_broker("h/link/!pong", Value::Bin(Bytes::copy_from_slice(payload)));
            }
            LinkMsg::Ping => {
                let echo = payload.to_vec();
                self.send_link_msg(LinkMsg::Pong, &echo);
            }
            LinkMsg::Status => debug!("link status, {} bytes", payload.len()),
            LinkMsg::TimesyncReq => {
                let Ok((req, _)) = Port0Timesync::read_from_prefix(payload) else {
                    warn!("short timesync request: {}", payload.len());
                    return;
                };
                let now = utc_now_ns();
                let rsp = Port0Timesync {
                    rsv: req.rsv,
                    start_count: req.start_count,
                    utc_recv: I64::new(now),
                    utc_send: I64::new(now),
                    end_count: U64::new(0),
                };
                self.send_link_msg(LinkMsg::TimesyncRsp, rsp.as_bytes());
            }
            LinkMsg::TimesyncRsp => warn!("unexpected timesync response"),
            LinkMsg::Invalid | LinkMsg::Unknown(_) => warn!("unknown link message: 0x{:04x}", metadata),
        }
    }

    // -- stream frames (both generations) ----------------------------------

    fn handle_stream_frame(&mut self, data: &[u8]) {
        if data.len() < 4 {
            warn!("stream frame too short: {}", data.len());
            return;
        }
        let hdr = StreamHeader::from_bytes(data[..4].try_into().unwrap());
        let frame_id = hdr.frame_id();
        if frame_id != self.stream_in_frame_id {
            warn!(
                "stream frame_id mismatch: expected {}, received {}",
                self.stream_in_frame_id, frame_id
            );
        }
        self.stream_in_frame_id = (frame_id + 1) & 0x7FF;

        let port_id = hdr.port_id();
        let length = hdr.length() as usize;
        if 4 + length > data.len() {
            warn!("truncated stream frame: {} > {}", 4 + length, data.len());
            return;
        }
        let payload = &data[4..4 + length];

        if self.stream_in_port_enable & (1 << port_id) == 0 {
            debug!("stream in ignored on inactive port {}", port_id);
            return;
        }
        match port_id {
            PORT_HANDSHAKE => self.handle_port0(payload),
            PORT_PUBSUB => match decode_port_publish(payload) {
                Ok((topic, value)) => self.handle_pubsub_in(topic, value),
                Err(e) => warn!("port pubsub decode failed: {}", e),
            },
            PORT_LOGGING => trace!("device log, {} bytes", payload.len()),
            PORT_MEMORY => {
                let fx = self.mem.handle_port3(payload);
                self.mem_effects(fx);
            }
            p if p >= PORT_DATA_FIRST => self.handle_data_port(p, payload),
            p => debug!("stream in on unsupported port {}", p),
        }
    }

    fn handle_port0(&mut self, payload: &[u8]) {
        let Ok((hdr, rest)) = Port0Header::read_from_prefix(payload) else {
            warn!("short port0 message: {}", payload.len());
            return;
        };
        match Port0Op::from_primitive(hdr.op) {
            Port0Op::Connect => {
                match Port0Connect::read_from_prefix(rest) {
                    Ok((c, _)) => {
                        let protocol = c.protocol_version.get();
                        if protocol >> 24 != PROTOCOL_VERSION_MAJOR {
                            warn!(
                                "protocol version mismatch: local {}.x, remote {}",
                                PROTOCOL_VERSION_MAJOR,
                                version_str(protocol)
                            );
                            return;
                        }
                        info!(
                            "connect: app_id={}, FW={}, HW={}, FPGA={}",
                            c.app_id.get(),
                            version_str(c.fw_version.get()),
                            version_str(c.hw_version.get()),
                            version_str(c.fpga_version.get()),
                        );
                        self.publish_broker("c/fw/version", Value::U32(c.fw_version.get()));
                        self.publish_broker("c/hw/version", Value::U32(c.hw_version.get()));
                        self.publish_broker("s/fpga/version", Value::U32(c.fpga_version.get()));
                    }
                    Err(_) => warn!("connect message too small: {}", rest.len()),
                }
                self.apply(Event::LinkResetAck);
            }
            Port0Op::Echo => {
                self.publish_broker("h/link/!pong", Value::Bin(Bytes::copy_from_slice(rest)));
            }
            Port0Op::Timesync => {
                let Ok((req, _)) = Port0Timesync::read_from_prefix(rest) else {
                    warn!("short timesync request: {}", rest.len());
                    return;
                };
                let now = utc_now_ns();
                let rsp = Port0Timesync {
                    rsv: req.rsv,
                    start_count: req.start_count,
                    utc_recv: I64::new(now),
                    utc_send: I64::new(now),
                    end_count: U64::new(0),
                };
                let hdr = Port0Header {
                    op: Port0Op::Timesync.into(),
                    status: 0,
                    arg: U16::new(0),
                };
                let mut buf = BytesMut::with_capacity(4 + core::mem::size_of::<Port0Timesync>());
                buf.put_slice(hdr.as_bytes());
                buf.put_slice(rsp.as_bytes());
                self.send_stream_frame(PORT_HANDSHAKE, &buf);
            }
            Port0Op::Disconnect => self.apply(Event::LinkDisconnectAck),
            Port0Op::Invalid | Port0Op::Unknown(_) => warn!("unsupported port0 op: {}", hdr.op),
        }
    }

    fn handle_pubsub_in(&mut self, mut topic: String, value: Value) {
        if topic == FLUSH_PONG_TOPIC {
            if let Value::Str(s) = &value {
                if s.eq_ignore_ascii_case(FLUSH_VALUE) {
                    self.apply(Event::PubsubFlush);
                    return;
                }
            }
        }
        if topic.ends_with('?') {
            // we asked for it, treat as a normal publish
            topic.pop();
        }
        if topic.ends_with("/ctrl") {
            // device-side view of the port gate; re-sync our mask
            self.port_enable_from_topic(&topic, &value);
        }
        if topic == "s/v/range" {
            if let Some(range) = value.as_u32() {
                self.voltage_range = (range & 1) as u8;
            }
        }
        debug!("publish from device: {} {:?}", topic, value);
        self.publish_broker(&topic, value);
    }

    fn handle_data_port(&mut self, port_id: u8, payload: &[u8]) {
        let idx = (port_id & 0x0F) as usize;
        let def = &PORT_MAP[idx];
        if def.data_topic.is_none() {
            return;
        }
        if payload.len() < 4 {
            warn!("data port {} payload too short: {}", port_id, payload.len());
            return;
        }
        let sample_id = u32::from_le_bytes(payload[..4].try_into().unwrap());
        let data = &payload[4..];

        if self.generation == Generation::Em110 && idx == 0 {
            self.front_panel(sample_id, data);
            return;
        }

        match decompress(def, data) {
            Ok(samples) => {
                let msgs = self.ports[idx].push(sample_id, samples);
                for msg in msgs {
                    self.broker_prefixed(msg);
                }
            }
            Err(e) => warn!("port {} stream decode failed: {}", port_id, e),
        }
    }

    /// Older-device front panel: raw multiplexed u32 samples pass through
    /// the range suppressor and fan out to the derived signal ports.
    fn front_panel(&mut self, sample_id: u32, data: &[u8]) {
        let Some(fp) = self.fp.as_mut() else {
            return;
        };
        let n = data.len() / 4;
        let mut i = Vec::with_capacity(n);
        let mut v = Vec::with_capacity(n);
        let mut p = Vec::with_capacity(n);
        let mut range = Vec::with_capacity(n);
        let mut gpi0 = Vec::with_capacity(n);
        let mut gpi1 = Vec::with_capacity(n);
        for word in data.chunks_exact(4) {
            let raw = u32::from_le_bytes(word.try_into().unwrap());
            let s = fp.process_raw(raw, self.voltage_range);
            i.push(s.i);
            v.push(s.v);
            p.push(s.p);
            range.push(s.current_range.min(15));
            gpi0.push(s.gpi0 & 1);
            gpi1.push(s.gpi1 & 1);
        }
        let outputs = [
            (PORT_IDX_CURRENT, DecodedSamples::F32(i)),
            (PORT_IDX_VOLTAGE, DecodedSamples::F32(v)),
            (PORT_IDX_POWER, DecodedSamples::F32(p)),
            (PORT_IDX_RANGE, DecodedSamples::U4(range)),
            (PORT_IDX_GPI0, DecodedSamples::U1(gpi0)),
            (PORT_IDX_GPI1, DecodedSamples::U1(gpi1)),
        ];
        for (idx, samples) in outputs {
            let msgs = self.ports[idx].push(sample_id, samples);
            for msg in msgs {
                self.broker_prefixed(msg);
            }
        }
    }

    // -- state machine plumbing --------------------------------------------

    fn apply(&mut self, event: Event) {
        let actions = self.sm.handle(event);
        for action in actions {
            self.perform(action);
        }
    }

    fn perform(&mut self, action: Action) {
        match action {
            Action::BackendOpen => {
                self.stream_in_port_enable = 0x0F;
                self.backend(BackendRequest::Open);
            }
            Action::BackendBulkOpen => self.backend(BackendRequest::BulkStreamOpen),
            Action::BackendClose => {
                self.stream_in_port_enable = 0;
                self.flush_ports();
                self.backend(BackendRequest::Close);
            }
            Action::SendLinkReset => match self.generation {
                Generation::Em220 => {
                    let frame = self.codec.encode_control(LinkCtrl::ResetRequest);
                    self.backend(BackendRequest::BulkOut(frame));
                }
                Generation::Em110 => self.send_port0_op(Port0Op::Connect),
            },
            Action::SendLinkResetAck => match self.generation {
                Generation::Em220 => {
                    let frame = self.codec.encode_control(LinkCtrl::ResetAck);
                    self.backend(BackendRequest::BulkOut(frame));
                }
                Generation::Em110 => debug!("link reset ack not used on {}", self.generation),
            },
            Action::SendLinkDisconnect => match self.generation {
                Generation::Em220 => {
                    let frame = self.codec.encode_control(LinkCtrl::DisconnectRequest);
                    self.backend(BackendRequest::BulkOut(frame));
                }
                Generation::Em110 => self.send_port0_op(Port0Op::Disconnect),
            },
            Action::SendLinkDisconnectAck => match self.generation {
                Generation::Em220 => {
                    let frame = self.codec.encode_control(LinkCtrl::DisconnectAck);
                    self.backend(BackendRequest::BulkOut(frame));
                }
                Generation::Em110 => debug!("link disconnect ack not used on {}", self.generation),
            },
            Action::PublishFlushPing => {
                self.publish_to_device(FLUSH_PING_TOPIC, &Value::Str(FLUSH_VALUE.to_string()));
            }
            Action::ReportOpen(status) => {
                self.publish_broker(&format!("{}#", TOPIC_OPEN), Value::I32(status));
            }
            Action::ReportClose(status) => {
                self.publish_broker(&format!("{}#", TOPIC_CLOSE), Value::I32(status));
            }
            Action::StateChanged => {
                self.state_entered = Instant::now();
                self.publish_state();
            }
        }
    }

    fn publish_state(&mut self) {
        let state = self.sm.state();
        debug!("{} state: {}", self.prefix, state);
        self.publish_broker("h/state", Value::U32(state.into()));
    }

    fn flush_ports(&mut self) {
        let msgs: Vec<Message> = self.ports.iter_mut().filter_map(|p| p.flush()).collect();
        for msg in msgs {
            self.broker_prefixed(msg);
        }
    }

    // -- outbound plumbing --------------------------------------------------

    fn backend(&mut self, req: BackendRequest) {
        if self.backend_tx.send(req).is_err() {
            warn!("backend queue closed for {}", self.prefix);
        }
    }

    fn broker(&mut self, mut msg: Message) {
        msg.topic = format!("{}/{}", self.prefix, msg.topic);
        if self.broker_tx.send(msg).is_err() {
            warn!("broker sink closed for {}", self.prefix);
        }
    }

    fn broker_prefixed(&mut self, msg: Message) {
        self.broker(msg);
    }

    fn publish_broker(&mut self, subtopic: &str, value: Value) {
        self.broker(Message::new(subtopic, value));
    }

    fn publish_to_device(&mut self, topic: &str, value: &Value) {
        debug!("publish to device: {} {:?}", topic, value);
        match self.generation {
            Generation::Em220 => match encode_publish(topic, value) {
                Ok((payload, metadata)) => {
                    match self.codec.encode_data(ServiceType::PubSub, metadata, &payload) {
                        Ok(frame) => self.backend(BackendRequest::BulkOut(frame)),
                        Err(e) => warn!("publish encode failed for {}: {}", topic, e),
                    }
                }
                Err(e) => warn!("publish failed for {}: {}", topic, e),
            },
            Generation::Em110 => match encode_port_publish(topic, value) {
                Ok(payload) => self.send_stream_frame(PORT_PUBSUB, &payload),
                Err(e) => warn!("publish failed for {}: {}", topic, e),
            },
        }
    }

    fn send_link_msg(&mut self, msg: LinkMsg, payload: &[u8]) {
        match self.codec.encode_data(ServiceType::Link, u8::from(msg) as u16, payload) {
            Ok(frame) => self.backend(BackendRequest::BulkOut(frame)),
            Err(e) => warn!("link {:?} encode failed: {}", msg, e),
        }
    }

    fn send_port0_op(&mut self, op: Port0Op) {
        let hdr = Port0Header {
            op: op.into(),
            status: 0,
            arg: U16::new(0),
        };
        let bytes = hdr.as_bytes().to_vec();
        self.send_stream_frame(PORT_HANDSHAKE, &bytes);
    }

    /// Wrap `payload` in a stream frame and put it on the wire. The older
    /// device sends stream frames bare; the newer one carries them inside a
    /// throughput-service frame.
    fn send_stream_frame(&mut self, port_id: u8, payload: &[u8]) {
        let hdr = StreamHeader::new()
            .with_frame_id(self.stream_out_frame_id)
            .with_port_id(port_id)
            .with_length(payload.len() as u16);
        self.stream_out_frame_id = (self.stream_out_frame_id + 1) & 0x7FF;
        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.put_slice(&hdr.into_bytes());
        buf.put_slice(payload);
        match self.generation {
            Generation::Em110 => {
                let frame = buf.freeze();
                self.backend(BackendRequest::BulkOut(frame));
            }
            Generation::Em220 => match self.codec.encode_data(ServiceType::Throughput, 0, &buf) {
                Ok(frame) => self.backend(BackendRequest::BulkOut(frame)),
                Err(e) => warn!("stream frame encode failed: {}", e),
            },
        }
    }
}
