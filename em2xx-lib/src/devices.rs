//! The supported device family.

use strum_macros::Display;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// EM2xx vendor id.
pub const VENDOR_ID: u16 = 0x35D0;
/// EM110 streaming sample device.
pub const EM110_PID: u16 = 0x0110;
/// EM220 framed protocol device.
pub const EM220_PID: u16 = 0x0220;

/// The two instrument generations this driver core supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Generation {
    /// Older device: raw port-framed streaming, front-panel sample
    /// pre-processing on the host.
    Em110,
    /// Newer device: 512-byte SOF-framed protocol carrying link, pubsub,
    /// trace, and throughput services.
    Em220,
}

/// Map a USB id pair to the device generation.
pub fn generation_for(vid: u16, pid: u16) -> Option<Generation> {
    if vid != VENDOR_ID {
        return None;
    }
    match pid {
        EM110_PID => Some(Generation::Em110),
        EM220_PID => Some(Generation::Em220),
        _ => None,
    }
}

/// Render a major8.minor8.patch16 version word.
pub fn version_str(v: u32) -> String {
    format!("{}.{}.{}", v >> 24, (v >> 16) & 0xFF, v & 0xFFFF)
}
