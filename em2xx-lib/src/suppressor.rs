//! Front-panel sample pre-processing for the older device.
//!
//! Switching between hardware current ranges couples charge into the
//! measurement path and produces a transient lasting a handful of samples
//! at 2 Msps. This processor removes the transient: around every range
//! transition a suppression window is scheduled whose samples are either
//! linearly interpolated between the surrounding good samples or filled
//! with NaN.
//!
//! The processor is a fixed-delay pipeline over a power-of-two ring buffer:
//! each call accepts one input sample and returns the processed sample from
//! `pre + window + post + 1` inputs earlier. Until the pipeline fills, the
//! missing sample is returned.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Hardware current ranges are 0..=6; 7 means the front end is off.
pub const I_RANGE_OFF: u8 = 7;
/// Range value used for samples that never arrived.
pub const I_RANGE_MISSING: u8 = 8;

/// Upper bound on a single matrix suppression duration.
pub const SUPPRESS_WINDOW_MAX: u8 = 12;
/// Upper bound on the configured pre-transition samples.
pub const SUPPRESS_PRE_MAX: u8 = 8;
/// Upper bound on the configured post-transition samples.
pub const SUPPRESS_POST_MAX: u8 = 8;

/// Ring capacity; must hold `pre + window + post + 1` at their maxima.
const SUPPRESS_SAMPLES_MAX: usize = 32;
const SUPPRESS_SAMPLES_MASK: u64 = (SUPPRESS_SAMPLES_MAX - 1) as u64;

/// One front-panel sample at 2 Msps.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Sample {
    pub i: f32,
    pub v: f32,
    pub p: f32,
    /// 0..=6 hardware range, 7 off, 8 missing.
    pub current_range: u8,
    pub gpi0: u8,
    pub gpi1: u8,
}

/// The placeholder emitted for samples that are not (yet) available.
pub const SAMPLE_MISSING: Sample = Sample {
    i: f32::NAN,
    v: f32::NAN,
    p: f32::NAN,
    current_range: I_RANGE_MISSING,
    gpi0: 0,
    gpi1: 0,
};

/// What to do with samples inside a suppression window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SuppressMode {
    /// Leave the transient in the data.
    Off,
    /// Linearly interpolate current and voltage across the window and
    /// recompute power.
    #[default]
    Interp,
    /// Replace current, voltage, and power with NaN; ranges and GPIs are
    /// preserved.
    Nan,
}

/// Suppression durations in samples at 2 Msps, indexed `[to][from]`.
pub type SuppressMatrix = [[u8; 9]; 9];

/// Which of the two experimentally determined duration tables to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MatrixSelect {
    /// Tighter min/max at the cost of more distortion.
    Aggressive,
    /// Longer windows, less distortion.
    #[default]
    Conservative,
}

// Experimentally determined charge coupling durations in samples at 2 Msps.
// Rows and columns for range 7 (off) and 8 (missing) are zero: no window
// anchors on a sample where the front end is off or data is absent.
pub static SUPPRESS_MATRIX_AGGRESSIVE: SuppressMatrix = [
    // [to][from]
    // 0  1  2  3  4  5  6  7  8
    [0, 3, 4, 4, 4, 4, 4, 0, 0], // to 0
    [5, 0, 4, 4, 4, 4, 4, 0, 0], // to 1
    [5, 5, 0, 4, 4, 4, 4, 0, 0], // to 2
    [5, 5, 6, 0, 4, 4, 4, 0, 0], // to 3
    [5, 5, 6, 6, 0, 4, 4, 0, 0], // to 4
    [5, 6, 7, 6, 6, 0, 4, 0, 0], // to 5
    [6, 7, 7, 7, 7, 7, 0, 0, 0], // to 6
    [0, 0, 0, 0, 0, 0, 0, 0, 0], // to 7 (off)
    [0, 0, 0, 0, 0, 0, 0, 0, 0], // to 8 (missing)
];

pub static SUPPRESS_MATRIX_CONSERVATIVE: SuppressMatrix = [
    // [to][from]
    // 0  1  2  3  4  5  6  7  8
    [0, 3, 5, 5, 5, 5, 5, 0, 0], // to 0
    [5, 0, 5, 5, 5, 5, 5, 0, 0], // to 1
    [7, 7, 0, 5, 5, 5, 5, 0, 0], // to 2
    [7, 7, 7, 0, 5, 5, 5, 0, 0], // to 3
    [7, 7, 7, 7, 0, 5, 5, 0, 0], // to 4
    [7, 7, 7, 7, 7, 0, 5, 0, 0], // to 5
    [7, 7, 7, 7, 7, 7, 0, 0, 0], // to 6
    [0, 0, 0, 0, 0, 0, 0, 0, 0], // to 7 (off)
    [0, 0, 0, 0, 0, 0, 0, 0, 0], // to 8 (missing)
];

/// Per-range offset/gain calibration for the raw front-panel fields.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Calibration {
    pub current_offset: [f64; 8],
    pub current_gain: [f64; 8],
    pub voltage_offset: [f64; 2],
    pub voltage_gain: [f64; 2],
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            current_offset: [0.0; 8],
            current_gain: [1.0; 8],
            voltage_offset: [0.0; 2],
            voltage_gain: [1.0; 2],
        }
    }
}

/// Running statistics maintained across [`SampleProcessor::process_raw`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SampleStats {
    pub sample_count: u64,
    pub sample_missing_count: u64,
    pub skip_count: u64,
    pub contiguous_count: u64,
}

/// The current-range transient suppressor.
#[derive(Debug, Clone)]
pub struct SampleProcessor {
    samples: [Sample; SUPPRESS_SAMPLES_MAX],
    /// Absolute input count; the write position is `count & MASK`.
    count: u64,
    pre: u8,
    window: u8,
    post: u8,
    mode: SuppressMode,
    matrix: &'static SuppressMatrix,
    cal: Calibration,
    i_range_last: u8,
    /// Active suppression interval over absolute input indexes, `[start, end)`.
    sup_start: u64,
    sup_end: u64,
    anchor_before: Sample,
    anchor_after: Sample,
    is_skipping: bool,
    stats: SampleStats,
}

impl Default for SampleProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleProcessor {
    pub fn new() -> Self {
        Self::with_config(1, SUPPRESS_WINDOW_MAX, 1, SuppressMode::Interp, MatrixSelect::Conservative)
    }

    /// Configure the window shape. `pre`, `window`, and `post` are clamped
    /// to their maxima; `window` caps the matrix duration per transition.
    pub fn with_config(pre: u8, window: u8, post: u8, mode: SuppressMode, matrix: MatrixSelect) -> Self {
        let mut p = Self {
            samples: [SAMPLE_MISSING; SUPPRESS_SAMPLES_MAX],
            count: 0,
            pre: pre.min(SUPPRESS_PRE_MAX),
            window: window.min(SUPPRESS_WINDOW_MAX),
            post: post.min(SUPPRESS_POST_MAX),
            mode,
            matrix: match matrix {
                MatrixSelect::Aggressive => &SUPPRESS_MATRIX_AGGRESSIVE,
                MatrixSelect::Conservative => &SUPPRESS_MATRIX_CONSERVATIVE,
            },
            cal: Calibration::default(),
            i_range_last: I_RANGE_OFF,
            sup_start: 0,
            sup_end: 0,
            anchor_before: SAMPLE_MISSING,
            anchor_after: SAMPLE_MISSING,
            is_skipping: true,
            stats: SampleStats::default(),
        };
        p.reset();
        p
    }

    pub fn set_calibration(&mut self, cal: Calibration) {
        self.cal = cal;
    }

    pub fn stats(&self) -> SampleStats {
        self.stats
    }

    /// Pipeline delay in samples: each output corresponds to the input this
    /// many calls earlier.
    pub fn delay(&self) -> u64 {
        (self.pre + self.window + self.post + 1) as u64
    }

    /// Clear sample history and statistics; configuration is kept.
    pub fn reset(&mut self) {
        self.samples = [SAMPLE_MISSING; SUPPRESS_SAMPLES_MAX];
        self.count = 0;
        self.i_range_last = I_RANGE_OFF;
        self.sup_start = 0;
        self.sup_end = 0;
        self.anchor_before = SAMPLE_MISSING;
        self.anchor_after = SAMPLE_MISSING;
        self.is_skipping = true;
        self.stats = SampleStats::default();
    }

    /// Decode one raw front-panel word and process it.
    ///
    /// Bit layout: range select in bits 0..1 and 16, 14-bit current at bit
    /// 2, 14-bit voltage at bit 18; GPI0 and GPI1 ride bits 2 and 18 of the
    /// multiplexed word. The all-ones word and range values above 7 mark a
    /// missing sample.
    pub fn process_raw(&mut self, sample_u32: u32, v_range: u8) -> Sample {
        let i_range = ((sample_u32 & 3) | ((sample_u32 >> 14) & 4)) as u8;
        let s = if i_range > 7 || sample_u32 == 0xFFFF_FFFF {
            self.stats.sample_missing_count += 1;
            self.stats.contiguous_count = 0;
            if !self.is_skipping {
                self.stats.skip_count += 1;
                self.is_skipping = true;
            }
            SAMPLE_MISSING
        } else {
            self.stats.contiguous_count += 1;
            self.is_skipping = false;
            let v_range = (v_range & 1) as usize;
            let ir = i_range as usize;
            let i_raw = ((sample_u32 >> 2) & 0x3FFF) as f64;
            let v_raw = ((sample_u32 >> 18) & 0x3FFF) as f64;
            let i = (i_raw + self.cal.current_offset[ir]) * self.cal.current_gain[ir];
            let v = (v_raw + self.cal.voltage_offset[v_range]) * self.cal.voltage_gain[v_range];
            Sample {
                i: i as f32,
                v: v as f32,
                p: (i * v) as f32,
                current_range: i_range,
                gpi0: ((sample_u32 >> 2) & 1) as u8,
                gpi1: ((sample_u32 >> 18) & 1) as u8,
            }
        };
        self.process(s)
    }

    /// Process one sample, returning the (suppressed) sample `delay()`
    /// inputs earlier, or the missing sample during warm-up.
    pub fn process(&mut self, s: Sample) -> Sample {
        let idx = self.count;
        self.count += 1;
        self.stats.sample_count += 1;

        // transition detection and window scheduling
        let to = s.current_range.min(I_RANGE_MISSING);
        let from = self.i_range_last;
        if to != from {
            let m = self.matrix[to as usize][from as usize].min(self.window);
            if m > 0 {
                let start = idx.saturating_sub(self.pre as u64);
                let end = idx + m as u64 + self.post as u64;
                let cap = (self.pre + SUPPRESS_WINDOW_MAX + self.post) as u64;
                if self.sup_end > idx {
                    // overlapping transition extends the pending window
                    self.sup_end = end.max(self.sup_end).min(self.sup_start + cap);
                } else {
                    self.sup_start = start;
                    self.sup_end = end;
                    self.anchor_before = if start == 0 {
                        SAMPLE_MISSING
                    } else {
                        self.samples[((start - 1) & SUPPRESS_SAMPLES_MASK) as usize]
                    };
                    self.anchor_after = SAMPLE_MISSING;
                }
            }
            self.i_range_last = to;
        } else if self.sup_end == idx && self.sup_end > self.sup_start {
            // first good sample after the window: interpolation anchor
            self.anchor_after = s;
        }

        self.samples[(idx & SUPPRESS_SAMPLES_MASK) as usize] = s;

        let delay = self.delay();
        if idx < delay {
            return SAMPLE_MISSING;
        }
        let e = idx - delay;
        let mut out = self.samples[(e & SUPPRESS_SAMPLES_MASK) as usize];
        if self.mode != SuppressMode::Off && e >= self.sup_start && e < self.sup_end {
            match self.mode {
                SuppressMode::Nan => {
                    out.i = f32::NAN;
                    out.v = f32::NAN;
                    out.p = f32::NAN;
                }
                SuppressMode::Interp => {
                    let a = self.anchor_before;
                    let b = self.anchor_after;
                    let ia = self.sup_start as f64 - 1.0;
                    let ib = self.sup_end as f64;
                    let t = ((e as f64) - ia) / (ib - ia);
                    let i = a.i as f64 + (b.i as f64 - a.i as f64) * t;
                    let v = a.v as f64 + (b.v as f64 - a.v as f64) * t;
                    out.i = i as f32;
                    out.v = v as f32;
                    out.p = (i * v) as f32;
                }
                SuppressMode::Off => unreachable!(),
            }
        }
        out
    }
}
