//! Common test utilities and shared imports.

#[allow(unused_imports)]
pub use bytes::Bytes;
#[allow(unused_imports)]
pub use em2xx_lib::decompress::{decompress_u1, decompress_u4, DecodedSamples};
#[allow(unused_imports)]
pub use em2xx_lib::error::EmError;
#[allow(unused_imports)]
pub use em2xx_lib::frame::{
    length_check, link_check, FrameCodec, FrameRef, FrameType, LinkCtrl, ServiceType,
};
#[allow(unused_imports)]
pub use em2xx_lib::pubsub::{decode_publish, encode_publish, Message, Value};
#[allow(unused_imports)]
pub use num_enum::FromPrimitive;

/// Re-encode expanded 4-bit samples as 16-bit run-length groups.
///
/// Each group is `zzzzzzzz_zzzzxxxx` with run length `z + 1` (1..=4096).
#[allow(dead_code)]
pub fn compress_u4(samples: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < samples.len() {
        let value = samples[i] & 0x0F;
        let mut run = 1usize;
        while i + run < samples.len() && samples[i + run] & 0x0F == value && run < 4096 {
            run += 1;
        }
        let group = (((run - 1) as u16) << 4) | value as u16;
        out.extend_from_slice(&group.to_le_bytes());
        i += run;
    }
    out
}

/// Re-encode expanded binary samples with the shortest fitting prefix code.
///
/// Runs of 8+ use the run forms; shorter stretches are emitted as 7-sample
/// literal bytes. A trailing partial literal is zero-padded, so the decoded
/// stream may carry up to six padding samples at the end.
#[allow(dead_code)]
pub fn compress_u1(samples: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut lit: Vec<u8> = Vec::new();
    let mut i = 0;
    while i < samples.len() {
        let value = samples[i] & 1;
        let mut run = 1usize;
        while i + run < samples.len() && samples[i + run] & 1 == value && run < 4135 {
            run += 1;
        }
        if run >= 8 && lit.is_empty() {
            if run >= 40 {
                out.push(0xC0 | (value << 4) | (((run - 40) >> 8) as u8));
                out.push(((run - 40) & 0xFF) as u8);
            } else {
                out.push(0x80 | (value << 5) | ((run - 8) as u8));
            }
            i += run;
        } else {
            lit.push(value);
            i += 1;
            if lit.len() == 7 {
                out.push(literal_byte(&lit));
                lit.clear();
            }
        }
    }
    if !lit.is_empty() {
        while lit.len() < 7 {
            lit.push(0);
        }
        out.push(literal_byte(&lit));
    }
    out
}

#[allow(dead_code)]
fn literal_byte(bits: &[u8]) -> u8 {
    let mut byte = 0u8;
    for (i, b) in bits.iter().enumerate() {
        byte |= (b & 1) << i;
    }
    byte
}

/// Expanded sample values, whatever the element width.
#[allow(dead_code)]
pub fn sample_values(samples: &DecodedSamples) -> Vec<u8> {
    match samples {
        DecodedSamples::U4(v) | DecodedSamples::U1(v) | DecodedSamples::U8(v) => v.clone(),
        other => panic!("expected integer samples, got {:?}", other),
    }
}
