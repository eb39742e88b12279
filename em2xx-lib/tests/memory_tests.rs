//! Memory-op coordinator: windowed writes, reads, aborts, parameter errors.

mod common;

use common::*;
use em2xx_lib::error::ErrorCode;
use em2xx_lib::memory::{
    MemOp, MemoryCoordinator, Port3Header, MEM_SIZE_MAX, PORT3_BUFFER_SIZE, PORT3_DATA_SIZE_MAX,
    PORT3_HEADER_SIZE,
};
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, IntoBytes};

fn parse_frame(frame: &[u8]) -> (Port3Header, Vec<u8>) {
    let (hdr, data) = Port3Header::read_from_prefix(frame).expect("short port3 frame");
    (hdr, data.to_vec())
}

fn ack(arg: MemOp, status: u8, offset: u32) -> Vec<u8> {
    let hdr = Port3Header {
        op: MemOp::Ack.into(),
        region: 0x01,
        status,
        arg: arg.into(),
        offset: U32::new(offset),
        length: U32::new(0),
    };
    hdr.as_bytes().to_vec()
}

#[test]
fn test_erase_completes_on_ack() {
    let mut mem = MemoryCoordinator::new();
    let fx = mem.request("h/mem/c/app/!erase", &Value::Null);
    assert_eq!(fx.frames.len(), 1);
    let (hdr, data) = parse_frame(&fx.frames[0]);
    assert_eq!(MemOp::from_primitive(hdr.op), MemOp::Erase);
    assert_eq!(hdr.region, 0x01);
    assert!(data.is_empty());
    assert!(mem.active());

    let fx = mem.handle_port3(&ack(MemOp::Erase, 0, 0));
    assert!(!mem.active());
    assert_eq!(fx.messages.len(), 1);
    assert_eq!(fx.messages[0].topic, "h/mem/c/app/!erase#");
    assert_eq!(fx.messages[0].value, Value::I32(0));
}

#[test]
fn test_write_window_and_frame_count() {
    // an 8 KiB write: start, ceil(8192/484) = 17 data frames, finalize
    let total = 8192usize;
    let data = Bytes::from(vec![0xA5u8; total]);
    let mut mem = MemoryCoordinator::new();

    let fx = mem.request("h/mem/c/app/!write", &Value::Bin(data.clone()));
    assert_eq!(fx.frames.len(), 1);
    let (hdr, _) = parse_frame(&fx.frames[0]);
    assert_eq!(MemOp::from_primitive(hdr.op), MemOp::WriteStart);
    assert_eq!(hdr.length.get(), total as u32);

    let mut data_frames: Vec<(u32, usize)> = Vec::new();
    let mut outstanding: Vec<(u32, u32)> = Vec::new(); // (offset, len)
    let fx = mem.handle_port3(&ack(MemOp::WriteStart, 0, 0));
    let mut collect = |fx: em2xx_lib::memory::MemEffects, outstanding: &mut Vec<(u32, u32)>| {
        let mut finalized = false;
        for frame in &fx.frames {
            let (hdr, body) = parse_frame(frame);
            match MemOp::from_primitive(hdr.op) {
                MemOp::WriteData => {
                    assert!(body.len() <= PORT3_DATA_SIZE_MAX);
                    assert_eq!(hdr.length.get() as usize, body.len());
                    assert!(body.iter().all(|&b| b == 0xA5));
                    data_frames.push((hdr.offset.get(), body.len()));
                    outstanding.push((hdr.offset.get(), hdr.length.get()));
                }
                MemOp::WriteFinalize => finalized = true,
                other => panic!("unexpected frame {:?}", other),
            }
        }
        finalized
    };
    assert!(!collect(fx, &mut outstanding));

    // window invariant: sent - valid never exceeds buffer - chunk
    let mut finalized = false;
    while !outstanding.is_empty() {
        assert!(
            (mem.offset_sent() - mem.offset_valid()) as usize <= PORT3_BUFFER_SIZE - PORT3_DATA_SIZE_MAX
        );
        let (offset, len) = outstanding.remove(0);
        let fx = mem.handle_port3(&ack(MemOp::WriteData, 0, offset + len));
        finalized |= collect(fx, &mut outstanding);
    }
    assert!(finalized, "finalize frame never sent");

    // frames cover the whole transfer in order
    assert_eq!(data_frames.len(), total.div_ceil(PORT3_DATA_SIZE_MAX));
    assert_eq!(data_frames.len(), 17);
    let mut expect = 0u32;
    for (offset, len) in &data_frames {
        assert_eq!(*offset, expect);
        expect += *len as u32;
    }
    assert_eq!(expect, total as u32);

    let fx = mem.handle_port3(&ack(MemOp::WriteFinalize, 0, 0));
    assert!(!mem.active());
    assert_eq!(fx.messages.len(), 1);
    assert_eq!(fx.messages[0].topic, "h/mem/c/app/!write#");
    assert_eq!(fx.messages[0].value, Value::I32(0));
}

#[test]
fn test_write_out_of_sequence_ack_aborts() {
    let data = Bytes::from(vec![1u8; 1000]);
    let mut mem = MemoryCoordinator::new();
    mem.request("h/mem/c/app/!write", &Value::Bin(data));
    mem.handle_port3(&ack(MemOp::WriteStart, 0, 0));
    // ack an offset beyond anything sent
    let fx = mem.handle_port3(&ack(MemOp::WriteData, 0, 100_000));
    assert!(!mem.active());
    let last = fx.messages.last().unwrap();
    assert_eq!(last.topic, "h/mem/c/app/!write#");
    assert_eq!(last.value, Value::I32(ErrorCode::Synchronization.as_i32()));
}

#[test]
fn test_write_too_big_rejected() {
    let data = Bytes::from(vec![0u8; MEM_SIZE_MAX as usize + 1]);
    let mut mem = MemoryCoordinator::new();
    let fx = mem.request("h/mem/c/app/!write", &Value::Bin(data));
    assert!(fx.frames.is_empty());
    assert!(!mem.active());
    assert_eq!(fx.messages[0].topic, "h/mem/c/app/!write#");
    assert_eq!(fx.messages[0].value, Value::I32(ErrorCode::ParameterInvalid.as_i32()));
}

#[test]
fn test_read_collects_data_and_emits_rdata() {
    let mut mem = MemoryCoordinator::new();
    let fx = mem.request("h/mem/s/cal_f/!read", &Value::U32(1000));
    assert_eq!(fx.frames.len(), 1);
    let (hdr, _) = parse_frame(&fx.frames[0]);
    assert_eq!(MemOp::from_primitive(hdr.op), MemOp::ReadReq);
    assert_eq!(hdr.region, 0x85);
    assert_eq!(hdr.length.get(), 1000);

    // two chunks arrive in order
    for (offset, len) in [(0u32, 400u32), (400, 300)] {
        let mut msg = Port3Header {
            op: MemOp::ReadData.into(),
            region: 0x85,
            status: 0,
            arg: 0,
            offset: U32::new(offset),
            length: U32::new(len),
        }
        .as_bytes()
        .to_vec();
        msg.extend(std::iter::repeat(offset as u8).take(len as usize));
        let fx = mem.handle_port3(&msg);
        assert!(fx.messages.is_empty());
    }

    // terminating ack truncates to what arrived
    let fx = mem.handle_port3(&ack(MemOp::ReadReq, 0, 0));
    assert!(!mem.active());
    assert_eq!(fx.messages.len(), 2);
    assert_eq!(fx.messages[0].topic, "h/mem/s/cal_f/!rdata");
    match &fx.messages[0].value {
        Value::Bin(data) => {
            assert_eq!(data.len(), 700);
            assert!(data[..400].iter().all(|&b| b == 0));
            assert!(data[400..].iter().all(|&b| b == 144)); // 400 as u8
        }
        other => panic!("expected binary rdata, got {:?}", other),
    }
    assert_eq!(fx.messages[1].topic, "h/mem/s/cal_f/!read#");
    assert_eq!(fx.messages[1].value, Value::I32(0));
}

#[test]
fn test_read_offset_mismatch_records_first_status() {
    let mut mem = MemoryCoordinator::new();
    mem.request("h/mem/c/log/!read", &Value::U32(100));
    let mut msg = Port3Header {
        op: MemOp::ReadData.into(),
        region: 0x05,
        status: 0,
        arg: 0,
        offset: U32::new(64), // expected 0
        length: U32::new(32),
    }
    .as_bytes()
    .to_vec();
    msg.extend([0u8; 32]);
    mem.handle_port3(&msg);

    let fx = mem.handle_port3(&ack(MemOp::ReadReq, 0, 0));
    // no rdata on failure, just the return code
    assert_eq!(fx.messages.len(), 1);
    assert_eq!(fx.messages[0].topic, "h/mem/c/log/!read#");
    assert_eq!(fx.messages[0].value, Value::I32(ErrorCode::Synchronization.as_i32()));
}

#[test]
fn test_new_request_aborts_in_flight_operation() {
    let mut mem = MemoryCoordinator::new();
    mem.request("h/mem/c/app/!erase", &Value::Null);
    assert!(mem.active());
    let fx = mem.request("h/mem/c/storage/!erase", &Value::Null);
    // first message aborts the old topic, then a frame for the new one
    assert_eq!(fx.messages[0].topic, "h/mem/c/app/!erase#");
    assert_eq!(fx.messages[0].value, Value::I32(ErrorCode::Aborted.as_i32()));
    assert_eq!(fx.frames.len(), 1);
    assert!(mem.active());
}

#[test]
fn test_invalid_region_and_verb_rejected() {
    let mut mem = MemoryCoordinator::new();
    for topic in [
        "h/mem/c/nonesuch/!erase",
        "h/mem/x/app/!erase",
        "h/mem/c/app/!frobnicate",
        "h/mem/c/app",
    ] {
        let fx = mem.request(topic, &Value::Null);
        assert!(fx.frames.is_empty(), "{} should not emit frames", topic);
        let last = fx.messages.last().unwrap();
        assert_eq!(last.topic, format!("{}#", topic));
        assert_eq!(last.value, Value::I32(ErrorCode::ParameterInvalid.as_i32()));
        assert!(!mem.active());
    }
}

#[test]
fn test_header_size_is_twelve_bytes() {
    assert_eq!(PORT3_HEADER_SIZE, 12);
}
