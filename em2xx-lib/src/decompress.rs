//! Per-port sample stream decompression.
//!
//! Each data-port payload begins with a 32-bit sample-id (consumed by the
//! caller) followed by packed sample data. The packing depends on the
//! port's element bit size:
//!
//! - f32 (bit size 32): uncompressed, one word per sample.
//! - u16 / i16 ADC (bit size 16): uncompressed.
//! - u8 UART (bit size 8): uncompressed.
//! - u4 current range (bit size 4): 16-bit run-length groups
//!   `zzzzzzzz_zzzzxxxx` with value `x` and length `z + 1` (1..=4096).
//! - u1 binary (bit size 1): prefix-coded runs
//!   - `0xxxxxxx`: 7 literal samples in the low bits, LSB first.
//!   - `10xzzzzz`: value `x`, run length `z + 8` (8..=39).
//!   - `110xzzzz zzzzzzzz`: value `x`, run length `z + 40` (40..=4135).
//!
//! Decompression is sequential per port; a truncated group corrupts the
//! remainder of that port payload and the rest is discarded.

use crate::error::EmError;
use crate::port::PortDef;

/// Samples expanded from one port payload.
///
/// Sub-byte elements (u4, u1) are expanded to one byte per sample here and
/// re-packed densely when an outbound stream buffer is emitted.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedSamples {
    F32(Vec<f32>),
    U16(Vec<u16>),
    U8(Vec<u8>),
    U4(Vec<u8>),
    U1(Vec<u8>),
}

impl DecodedSamples {
    pub fn len(&self) -> usize {
        match self {
            DecodedSamples::F32(v) => v.len(),
            DecodedSamples::U16(v) => v.len(),
            DecodedSamples::U8(v) | DecodedSamples::U4(v) | DecodedSamples::U1(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append `other` to `self`. Both must come from the same port.
    pub fn extend(&mut self, other: &DecodedSamples) {
        match (self, other) {
            (DecodedSamples::F32(a), DecodedSamples::F32(b)) => a.extend_from_slice(b),
            (DecodedSamples::U16(a), DecodedSamples::U16(b)) => a.extend_from_slice(b),
            (DecodedSamples::U8(a), DecodedSamples::U8(b)) => a.extend_from_slice(b),
            (DecodedSamples::U4(a), DecodedSamples::U4(b)) => a.extend_from_slice(b),
            (DecodedSamples::U1(a), DecodedSamples::U1(b)) => a.extend_from_slice(b),
            _ => debug_assert!(false, "mixed sample variants on one port"),
        }
    }

    /// Packed wire size in bytes at the port's element bit size.
    pub fn packed_len(&self, element_bit_size_pow2: u8) -> usize {
        (self.len() << element_bit_size_pow2).div_ceil(8)
    }

    /// Pack the samples densely (LSB first for sub-byte elements).
    pub fn pack_into(&self, out: &mut Vec<u8>) {
        match self {
            DecodedSamples::F32(v) => {
                for s in v {
                    out.extend_from_slice(&s.to_le_bytes());
                }
            }
            DecodedSamples::U16(v) => {
                for s in v {
                    out.extend_from_slice(&s.to_le_bytes());
                }
            }
            DecodedSamples::U8(v) => out.extend_from_slice(v),
            DecodedSamples::U4(v) => {
                for pair in v.chunks(2) {
                    let lo = pair[0] & 0x0F;
                    let hi = if pair.len() > 1 { pair[1] & 0x0F } else { 0 };
                    out.push(lo | (hi << 4));
                }
            }
            DecodedSamples::U1(v) => {
                for bits in v.chunks(8) {
                    let mut byte = 0u8;
                    for (i, b) in bits.iter().enumerate() {
                        byte |= (b & 1) << i;
                    }
                    out.push(byte);
                }
            }
        }
    }
}

/// Decompress one port payload (after the sample-id) per the port's element
/// layout.
pub fn decompress(def: &PortDef, data: &[u8]) -> Result<DecodedSamples, EmError> {
    match def.element_bit_size_pow2 {
        5 => {
            check_aligned(data, 4)?;
            Ok(DecodedSamples::F32(
                data.chunks_exact(4)
                    .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
                    .collect(),
            ))
        }
        4 => {
            check_aligned(data, 2)?;
            Ok(DecodedSamples::U16(
                data.chunks_exact(2)
                    .map(|c| u16::from_le_bytes(c.try_into().unwrap()))
                    .collect(),
            ))
        }
        3 => Ok(DecodedSamples::U8(data.to_vec())),
        2 => decompress_u4(data),
        0 => decompress_u1(data),
        other => Err(EmError::StreamDecode(format!(
            "unsupported element bit size 2^{}",
            other
        ))),
    }
}

fn check_aligned(data: &[u8], unit: usize) -> Result<(), EmError> {
    if data.len() % unit != 0 {
        return Err(EmError::StreamDecode(format!(
            "payload size {} not a multiple of {}",
            data.len(),
            unit
        )));
    }
    Ok(())
}

/// Expand 16-bit run-length groups of 4-bit values.
pub fn decompress_u4(data: &[u8]) -> Result<DecodedSamples, EmError> {
    if data.len() % 2 != 0 {
        return Err(EmError::StreamDecode(format!(
            "truncated u4 run-length group at offset {}",
            data.len() & !1
        )));
    }
    let mut out = Vec::new();
    for group in data.chunks_exact(2) {
        let g = u16::from_le_bytes(group.try_into().unwrap());
        let value = (g & 0x0F) as u8;
        let run = ((g >> 4) as usize) + 1;
        out.resize(out.len() + run, value);
    }
    Ok(DecodedSamples::U4(out))
}

/// Expand prefix-coded binary runs.
pub fn decompress_u1(data: &[u8]) -> Result<DecodedSamples, EmError> {
    let mut out = Vec::new();
    let mut i = 0usize;
    while i < data.len() {
        let b = data[i];
        if b & 0x80 == 0 {
            // 7 literal samples, LSB first
            for bit in 0..7 {
                out.push((b >> bit) & 1);
            }
            i += 1;
        } else if b & 0xC0 == 0x80 {
            let value = (b >> 5) & 1;
            let run = ((b & 0x1F) as usize) + 8;
            out.resize(out.len() + run, value);
            i += 1;
        } else if b & 0xE0 == 0xC0 {
            let Some(&lo) = data.get(i + 1) else {
                return Err(EmError::StreamDecode(format!(
                    "truncated u1 run at offset {}",
                    i
                )));
            };
            let value = (b >> 4) & 1;
            let run = ((((b & 0x0F) as usize) << 8) | lo as usize) + 40;
            out.resize(out.len() + run, value);
            i += 2;
        } else {
            return Err(EmError::StreamDecode(format!(
                "invalid u1 run prefix 0x{:02x} at offset {}",
                b, i
            )));
        }
    }
    Ok(DecodedSamples::U1(out))
}
