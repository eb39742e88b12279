//! Current-range suppressor: delay, identity, windows, boundaries.

mod common;

use em2xx_lib::suppressor::{
    Calibration, MatrixSelect, Sample, SampleProcessor, SuppressMode, I_RANGE_MISSING, I_RANGE_OFF,
    SUPPRESS_MATRIX_CONSERVATIVE,
};

fn sample(i: f32, range: u8) -> Sample {
    Sample {
        i,
        v: 2.0 * i,
        p: i * 2.0 * i,
        current_range: range,
        gpi0: 0,
        gpi1: 0,
    }
}

#[test]
fn test_warmup_returns_missing() {
    let mut sp = SampleProcessor::with_config(1, 7, 1, SuppressMode::Interp, MatrixSelect::Conservative);
    assert_eq!(sp.delay(), 10);
    for k in 0..10 {
        let out = sp.process(sample(k as f32, 2));
        assert_eq!(out.current_range, I_RANGE_MISSING, "output {} should be missing", k);
        assert!(out.i.is_nan());
    }
    let out = sp.process(sample(10.0, 2));
    assert_eq!(out.current_range, 2);
    assert_eq!(out.i, 0.0); // input 0, delayed by 10
}

#[test]
fn test_identity_without_transitions() {
    let mut sp = SampleProcessor::with_config(2, 6, 2, SuppressMode::Interp, MatrixSelect::Conservative);
    let delay = sp.delay() as usize;
    let mut outputs = Vec::new();
    for k in 0..200 {
        outputs.push(sp.process(sample(k as f32, 3)));
    }
    for (k, out) in outputs.iter().enumerate().skip(delay) {
        assert_eq!(out.i, (k - delay) as f32);
        assert_eq!(out.current_range, 3);
    }
}

#[test]
fn test_conservative_matrix_entry() {
    // transition from range 2 to range 3 suppresses 7 samples
    assert_eq!(SUPPRESS_MATRIX_CONSERVATIVE[3][2], 7);
    // off and missing rows and columns are zero
    for r in 0..9 {
        assert_eq!(SUPPRESS_MATRIX_CONSERVATIVE[I_RANGE_OFF as usize][r], 0);
        assert_eq!(SUPPRESS_MATRIX_CONSERVATIVE[r][I_RANGE_OFF as usize], 0);
        assert_eq!(SUPPRESS_MATRIX_CONSERVATIVE[I_RANGE_MISSING as usize][r], 0);
        assert_eq!(SUPPRESS_MATRIX_CONSERVATIVE[r][I_RANGE_MISSING as usize], 0);
    }
}

#[test]
fn test_range_transition_interpolates() {
    // 100 samples of range 2, then range 3; pre=1, window=7, post=1.
    // The 9 outputs for inputs 99..=107 interpolate between inputs 98 and 108.
    let mut sp = SampleProcessor::with_config(1, 7, 1, SuppressMode::Interp, MatrixSelect::Conservative);
    let delay = sp.delay() as usize;
    assert_eq!(delay, 10);

    let mut outputs = Vec::new();
    for k in 0..130 {
        let range = if k < 100 { 2 } else { 3 };
        // poison the suppressed region so leakage is visible
        let i = if (99..108).contains(&k) { 9999.0 } else { k as f32 };
        let mut s = sample(i, range);
        if (99..108).contains(&k) {
            s.v = 9999.0;
            s.p = 9999.0;
        }
        outputs.push(sp.process(s));
    }

    for e in 99..108usize {
        let out = &outputs[e + delay];
        // anchors: input 98 (i=98, v=196) and input 108 (i=108, v=216)
        let t = (e as f64 - 98.0) / 10.0;
        let want_i = 98.0 + 10.0 * t;
        let want_v = 196.0 + 20.0 * t;
        assert!((out.i as f64 - want_i).abs() < 1e-3, "i at {}: {} != {}", e, out.i, want_i);
        assert!((out.v as f64 - want_v).abs() < 1e-3, "v at {}: {} != {}", e, out.v, want_v);
        assert!((out.p as f64 - want_i * want_v).abs() < 1e-1, "p at {}", e);
    }
    // the sample before and after the window pass through untouched
    assert_eq!(outputs[98 + delay].i, 98.0);
    assert_eq!(outputs[108 + delay].i, 108.0);
}

#[test]
fn test_nan_mode_preserves_range_and_gpi() {
    let mut sp = SampleProcessor::with_config(1, 7, 1, SuppressMode::Nan, MatrixSelect::Conservative);
    let delay = sp.delay() as usize;
    let mut outputs = Vec::new();
    for k in 0..130 {
        let range = if k < 100 { 2 } else { 3 };
        let mut s = sample(k as f32, range);
        s.gpi0 = 1;
        outputs.push(sp.process(s));
    }
    for e in 99..108usize {
        let out = &outputs[e + delay];
        assert!(out.i.is_nan() && out.v.is_nan() && out.p.is_nan(), "output {} not NaN", e);
        assert_eq!(out.current_range, if e < 100 { 2 } else { 3 });
        assert_eq!(out.gpi0, 1);
    }
    assert!(!outputs[98 + delay].i.is_nan());
    assert!(!outputs[108 + delay].i.is_nan());
}

#[test]
fn test_off_mode_is_identity() {
    let mut sp = SampleProcessor::with_config(1, 7, 1, SuppressMode::Off, MatrixSelect::Conservative);
    let delay = sp.delay() as usize;
    let mut outputs = Vec::new();
    for k in 0..130 {
        let range = if k < 100 { 2 } else { 3 };
        outputs.push(sp.process(sample(k as f32, range)));
    }
    for (k, out) in outputs.iter().enumerate().skip(delay) {
        assert_eq!(out.i, (k - delay) as f32);
    }
}

#[test]
fn test_transition_to_off_has_no_window() {
    let mut sp = SampleProcessor::with_config(2, 12, 2, SuppressMode::Nan, MatrixSelect::Conservative);
    let delay = sp.delay() as usize;
    let mut outputs = Vec::new();
    for k in 0..120 {
        let range = if k < 60 { 2 } else { I_RANGE_OFF };
        outputs.push(sp.process(sample(k as f32, range)));
    }
    for (k, out) in outputs.iter().enumerate().skip(delay) {
        assert!(!out.i.is_nan(), "output {} was suppressed", k);
    }
}

#[test]
fn test_transition_from_missing_has_no_window() {
    let mut sp = SampleProcessor::with_config(2, 12, 2, SuppressMode::Nan, MatrixSelect::Conservative);
    let delay = sp.delay() as usize;
    let mut outputs = Vec::new();
    for k in 0..120 {
        let s = if k < 60 {
            Sample {
                i: f32::NAN,
                v: f32::NAN,
                p: f32::NAN,
                current_range: I_RANGE_MISSING,
                gpi0: 0,
                gpi1: 0,
            }
        } else {
            sample(k as f32, 4)
        };
        outputs.push(sp.process(s));
    }
    // outputs for inputs 60.. are untouched: missing -> 4 schedules nothing
    for (k, out) in outputs.iter().enumerate().skip(60 + delay) {
        assert!(!out.i.is_nan(), "output {} was suppressed", k);
        assert_eq!(out.i, (k - delay) as f32);
    }
}

#[test]
fn test_overlapping_transitions_extend_window() {
    // a second transition inside the pending window extends it
    let mut sp = SampleProcessor::with_config(1, 7, 1, SuppressMode::Nan, MatrixSelect::Conservative);
    let delay = sp.delay() as usize;
    let mut outputs = Vec::new();
    for k in 0..160 {
        let range = if k < 100 {
            2
        } else if k < 103 {
            3
        } else {
            4
        };
        outputs.push(sp.process(sample(k as f32, range)));
    }
    // window from the 2->3 transition at 100: [99, 108); the 3->4 transition
    // at 103 extends it to [99, 109): matrix[4][3] = 7, 103 + 7 + 1 = 111,
    // capped at 99 + 1 + 12 + 1 = 113, so [99, 111)
    for e in 99..111usize {
        assert!(outputs[e + delay].i.is_nan(), "output {} not suppressed", e);
    }
    assert!(!outputs[98 + delay].i.is_nan());
    assert!(!outputs[111 + delay].i.is_nan());
}

#[test]
fn test_raw_decode_applies_calibration() {
    let mut sp = SampleProcessor::with_config(0, 0, 0, SuppressMode::Off, MatrixSelect::Conservative);
    let mut cal = Calibration::default();
    cal.current_offset[2] = 10.0;
    cal.current_gain[2] = 2.0;
    cal.voltage_offset[0] = -1.0;
    cal.voltage_gain[0] = 0.5;
    sp.set_calibration(cal);

    // range 2, i field 100, v field 200
    let raw = 2u32 | (100 << 2) | (200 << 18);
    let delay = sp.delay();
    let mut out = sp.process_raw(raw, 0);
    for _ in 0..delay {
        out = sp.process_raw(raw, 0);
    }
    assert_eq!(out.current_range, 2);
    assert_eq!(out.i, 220.0); // (100 + 10) * 2
    assert_eq!(out.v, 99.5); // (200 - 1) * 0.5
    assert_eq!(out.p, 220.0 * 99.5);
    assert_eq!(out.gpi0, 0);
    assert_eq!(out.gpi1, 0);
}

#[test]
fn test_raw_decode_missing_sample() {
    let mut sp = SampleProcessor::with_config(0, 0, 0, SuppressMode::Off, MatrixSelect::Conservative);
    let delay = sp.delay();
    let mut out = sp.process_raw(0xFFFF_FFFF, 0);
    for _ in 0..delay {
        out = sp.process_raw(0xFFFF_FFFF, 0);
    }
    assert_eq!(out.current_range, I_RANGE_MISSING);
    assert!(out.i.is_nan());
    assert_eq!(sp.stats().sample_missing_count, delay + 1);
    // the stream never went good -> missing, so no skip was recorded
    assert_eq!(sp.stats().skip_count, 0);
}

#[test]
fn test_skip_count_tracks_good_to_missing_transitions() {
    let mut sp = SampleProcessor::with_config(0, 0, 0, SuppressMode::Off, MatrixSelect::Conservative);
    let good = 4u32 | (7 << 2) | (9 << 18);
    sp.process_raw(good, 0);
    sp.process_raw(0xFFFF_FFFF, 0);
    sp.process_raw(good, 0);
    sp.process_raw(0xFFFF_FFFF, 0);
    assert_eq!(sp.stats().skip_count, 2);
    assert_eq!(sp.stats().sample_missing_count, 2);
}
