//! Per-port reassembly of decoded samples into contiguous stream buffers.
//!
//! Compression makes ports deliver at uneven times, so each port
//! accumulates decoded samples into a pending buffer and emits it to the
//! broker when roughly 100000 sample-ids (at 2 Msps) have elapsed or the
//! buffer is about to overflow. Sample-id continuity is tracked per port;
//! a gap flushes the pending buffer and starts a new one at the received
//! id, never discarding data.

use crate::decompress::DecodedSamples;
use crate::port::PortDef;
use crate::pubsub::{Message, Value};
use bytes::Bytes;
use tracing::{debug, warn};
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Emit once this many 2 Msps sample-ids have elapsed since buffer start.
pub const EMIT_SAMPLE_ID_DELTA: u32 = 100_000;
/// Maximum packed sample bytes per emitted buffer.
pub const STREAM_DATA_SIZE_MAX: usize = 16384;
/// Worst-case packed bytes a single 512-byte frame can add to a buffer.
const FRAME_DATA_MAX: usize = 508;

/// Header of every emitted stream buffer, little-endian.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct SignalHeader {
    /// First sample-id in the buffer, at the raw 2 Msps timebase.
    pub sample_id: U32,
    pub field_id: u8,
    pub index: u8,
    pub element_type: u8,
    pub element_bit_size_pow2: u8,
    pub element_count: U32,
}

pub const SIGNAL_HEADER_SIZE: usize = core::mem::size_of::<SignalHeader>();

#[derive(Debug)]
struct Pending {
    start_sample_id: u32,
    expected_next: u32,
    samples: DecodedSamples,
}

/// Reassembly state for one data port.
#[derive(Debug)]
pub struct PortReassembly {
    def: &'static PortDef,
    downsample: u32,
    pending: Option<Pending>,
    gap_count: u64,
}

impl PortReassembly {
    pub fn new(def: &'static PortDef) -> Self {
        Self {
            def,
            downsample: def.downsample,
            pending: None,
            gap_count: 0,
        }
    }

    /// Override the port's downsample factor (the older device streams every
    /// signal at the raw rate).
    pub fn with_downsample(mut self, downsample: u32) -> Self {
        self.downsample = downsample;
        self
    }

    pub fn gap_count(&self) -> u64 {
        self.gap_count
    }

    /// Accept one decoded port payload; returns zero, one, or two emitted
    /// buffers (a discontinuity flush plus a threshold emit).
    pub fn push(&mut self, sample_id: u32, samples: DecodedSamples) -> Vec<Message> {
        let mut out = Vec::new();
        if samples.is_empty() {
            return out;
        }

        if let Some(pending) = &self.pending {
            if pending.expected_next != sample_id {
                warn!(
                    "port {} sample_id mismatch: expected {}, received {}",
                    self.def.data_topic.unwrap_or("?"),
                    pending.expected_next,
                    sample_id
                );
                self.gap_count += 1;
                let msg = self.emit();
                out.extend(msg);
            }
        }

        let count = samples.len() as u32;
        let advance = count * self.downsample;
        let pending = match &mut self.pending {
            Some(pending) => {
                pending.samples.extend(&samples);
                pending.expected_next = pending.expected_next.wrapping_add(advance);
                pending
            }
            slot @ None => slot.insert(Pending {
                start_sample_id: sample_id,
                expected_next: sample_id.wrapping_add(advance),
                samples,
            }),
        };

        let elapsed = pending.expected_next.wrapping_sub(pending.start_sample_id);
        let packed = pending.samples.packed_len(self.def.element_bit_size_pow2);
        if elapsed > EMIT_SAMPLE_ID_DELTA || packed + FRAME_DATA_MAX > STREAM_DATA_SIZE_MAX {
            debug!(
                "port {} emit: elapsed={}, packed={}",
                self.def.data_topic.unwrap_or("?"),
                elapsed,
                packed
            );
            out.extend(self.emit());
        }
        out
    }

    /// Emit the pending buffer, if any.
    pub fn flush(&mut self) -> Option<Message> {
        self.emit()
    }

    fn emit(&mut self) -> Option<Message> {
        let pending = self.pending.take()?;
        let topic = self.def.data_topic?;
        let header = SignalHeader {
            sample_id: U32::new(pending.start_sample_id),
            field_id: self.def.field_id.into(),
            index: self.def.index,
            element_type: self.def.element_type.into(),
            element_bit_size_pow2: self.def.element_bit_size_pow2,
            element_count: U32::new(pending.samples.len() as u32),
        };
        let mut buf = Vec::with_capacity(SIGNAL_HEADER_SIZE + pending.samples.packed_len(self.def.element_bit_size_pow2));
        buf.extend_from_slice(header.as_bytes());
        pending.samples.pack_into(&mut buf);
        Some(Message::new(topic, Value::Bin(Bytes::from(buf))))
    }
}
