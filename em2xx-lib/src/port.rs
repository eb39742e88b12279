//! Stream port map and the packed stream-frame header.
//!
//! Streaming traffic is organized by port. Ports 0..15 are reserved for
//! control functions (0 handshake, 1 pubsub, 2 logging, 3 memory); ports
//! 16 and up carry sampled data. Each data port is described by a fixed
//! [`PortDef`] entry giving its topics, field identity, element layout, and
//! the downsample factor relating its native rate to the raw 2 Msps
//! sample-id timebase.

use modular_bitfield::prelude::*;
use num_enum::{FromPrimitive, IntoPrimitive};
use strum_macros::Display;

/// Handshake/connect control port.
pub const PORT_HANDSHAKE: u8 = 0;
/// Device pubsub control port.
pub const PORT_PUBSUB: u8 = 1;
/// Device log stream control port.
pub const PORT_LOGGING: u8 = 2;
/// Memory operation control port.
pub const PORT_MEMORY: u8 = 3;
/// First data port id.
pub const PORT_DATA_FIRST: u8 = 16;

/// Packed 32-bit header prefixed to every stream frame.
#[bitfield(bytes = 4)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamHeader {
    pub frame_id: B11,
    pub port_id: B5,
    pub length: B16,
}

/// Sampled element representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum ElementType {
    Undefined = 0,
    Int = 1,
    Uint = 2,
    Float = 3,

    #[num_enum(catch_all)]
    Unknown(u8),
}

/// Signal field identity carried in emitted stream buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum FieldId {
    Undefined = 0,
    Current = 1,
    Voltage = 2,
    Power = 3,
    Range = 4,
    Gpi = 5,
    Uart = 6,
    Raw = 7,

    #[num_enum(catch_all)]
    Unknown(u8),
}

/// Static description of one data port.
#[derive(Debug, Clone, Copy)]
pub struct PortDef {
    pub ctrl_topic: Option<&'static str>,
    pub data_topic: Option<&'static str>,
    pub field_id: FieldId,
    pub index: u8,
    pub element_type: ElementType,
    pub element_bit_size_pow2: u8,
    pub downsample: u32,
}

const fn field(
    ctrl_topic: &'static str,
    data_topic: &'static str,
    field_id: FieldId,
    index: u8,
    element_type: ElementType,
    element_bit_size_pow2: u8,
    downsample: u32,
) -> PortDef {
    PortDef {
        ctrl_topic: Some(ctrl_topic),
        data_topic: Some(data_topic),
        field_id,
        index,
        element_type,
        element_bit_size_pow2,
        downsample,
    }
}

const RESERVED: PortDef = PortDef {
    ctrl_topic: None,
    data_topic: None,
    field_id: FieldId::Undefined,
    index: 0,
    element_type: ElementType::Uint,
    element_bit_size_pow2: 3,
    downsample: 0,
};

/// Data port table, indexed by `port_id & 0x0F` for ports 16..=31.
pub static PORT_MAP: [PortDef; 16] = [
    field("s/adc/0/ctrl", "s/adc/0/!data", FieldId::Raw, 0, ElementType::Int, 4, 1), // 16
    field("s/adc/1/ctrl", "s/adc/1/!data", FieldId::Raw, 1, ElementType::Int, 4, 1), // 17
    field("s/adc/2/ctrl", "s/adc/2/!data", FieldId::Raw, 2, ElementType::Int, 4, 1), // 18
    field("s/adc/3/ctrl", "s/adc/3/!data", FieldId::Raw, 3, ElementType::Int, 4, 1), // 19
    field("s/i/range/ctrl", "s/i/range/!data", FieldId::Range, 0, ElementType::Uint, 2, 1), // 20
    field("s/i/ctrl", "s/i/!data", FieldId::Current, 0, ElementType::Float, 5, 2), // 21
    field("s/v/ctrl", "s/v/!data", FieldId::Voltage, 0, ElementType::Float, 5, 2), // 22
    field("s/p/ctrl", "s/p/!data", FieldId::Power, 0, ElementType::Float, 5, 2), // 23
    field("s/gpi/0/ctrl", "s/gpi/0/!data", FieldId::Gpi, 0, ElementType::Uint, 0, 1), // 24
    field("s/gpi/1/ctrl", "s/gpi/1/!data", FieldId::Gpi, 1, ElementType::Uint, 0, 1), // 25
    field("s/gpi/2/ctrl", "s/gpi/2/!data", FieldId::Gpi, 2, ElementType::Uint, 0, 1), // 26
    field("s/gpi/3/ctrl", "s/gpi/3/!data", FieldId::Gpi, 3, ElementType::Uint, 0, 1), // 27
    field("s/gpi/255/ctrl", "s/gpi/255/!data", FieldId::Gpi, 255, ElementType::Uint, 0, 1), // 28 trigger
    field("s/uart/0/ctrl", "s/uart/0/!data", FieldId::Uart, 0, ElementType::Uint, 3, 1), // 29
    RESERVED, // 30
    RESERVED, // 31
];

/// Data-port indexes used by the older device's front-panel fan-out.
pub const PORT_IDX_RANGE: usize = 4;
pub const PORT_IDX_CURRENT: usize = 5;
pub const PORT_IDX_VOLTAGE: usize = 6;
pub const PORT_IDX_POWER: usize = 7;
pub const PORT_IDX_GPI0: usize = 8;
pub const PORT_IDX_GPI1: usize = 9;

/// Look up the data-port index for a `/ctrl` topic.
pub fn port_index_for_ctrl_topic(topic: &str) -> Option<usize> {
    PORT_MAP.iter().position(|def| def.ctrl_topic == Some(topic))
}
