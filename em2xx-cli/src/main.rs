//! Decode a raw EM2xx bulk-capture file and print the traffic.
//!
//! Captures are the concatenated 512-byte frames of the bulk-in pipe, as
//! produced by a USB analyzer or the backend's capture hook.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use em2xx_lib::decompress::decompress;
use em2xx_lib::frame::{FrameCodec, FrameRef, ServiceType, FRAME_SIZE};
use em2xx_lib::port::{StreamHeader, PORT_MAP};
use em2xx_lib::pubsub::{decode_port_publish, decode_publish};
use std::fs;
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Model {
    /// Older streaming sample device (bare stream frames).
    Em110,
    /// Newer framed protocol device.
    Em220,
}

#[derive(Parser)]
#[command(name = "em2xx-decode", about = "Decode an EM2xx bulk capture")]
struct Args {
    /// Capture file of concatenated bulk-in frames.
    capture: PathBuf,

    /// Which device generation produced the capture.
    #[arg(long, value_enum, default_value_t = Model::Em220)]
    model: Model,

    /// Print decoded sample counts for data ports.
    #[arg(long)]
    samples: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let data = fs::read(&args.capture)
        .with_context(|| format!("reading {}", args.capture.display()))?;
    println!(
        "{}: {} bytes, {} frames",
        args.capture.display(),
        data.len(),
        data.len().div_ceil(FRAME_SIZE)
    );

    let mut codec = FrameCodec::new();
    for (n, chunk) in data.chunks(FRAME_SIZE).enumerate() {
        match args.model {
            Model::Em220 => print_framed(&mut codec, n, chunk, args.samples),
            Model::Em110 => print_stream_frame(n, chunk, args.samples),
        }
    }

    let stats = codec.stats();
    if stats.frames_rx > 0 {
        println!(
            "{} frames, {} id gaps, {} length check errors",
            stats.frames_rx, stats.frame_id_gaps, stats.length_check_errors
        );
    }
    Ok(())
}

fn print_framed(codec: &mut FrameCodec, n: usize, chunk: &[u8], samples: bool) {
    match codec.decode(chunk) {
        Ok(FrameRef::Control { subtype }) => println!("[{n:6}] control {subtype:?}"),
        Ok(FrameRef::Ack { frame_type, frame_id }) => {
            println!("[{n:6}] {frame_type:?} frame_id={frame_id}")
        }
        Ok(FrameRef::Data {
            frame_id,
            service,
            metadata,
            payload,
        }) => match service {
            ServiceType::PubSub => match decode_publish(payload, metadata) {
                Ok((topic, value)) => println!("[{n:6}] pubsub {topic} = {value:?}"),
                Err(e) => warn!("[{n:6}] pubsub decode failed: {e}"),
            },
            ServiceType::Throughput => print_stream_frame(n, payload, samples),
            other => println!(
                "[{n:6}] {other:?} frame_id={frame_id} metadata=0x{metadata:04x} {} bytes",
                payload.len()
            ),
        },
        Err(e) => warn!("[{n:6}] skipped: {e}"),
    }
}

fn print_stream_frame(n: usize, data: &[u8], samples: bool) {
    if data.len() < 4 {
        warn!("[{n:6}] short stream frame: {} bytes", data.len());
        return;
    }
    let hdr = StreamHeader::from_bytes(data[..4].try_into().unwrap());
    let port_id = hdr.port_id();
    let length = (hdr.length() as usize).min(data.len() - 4);
    let payload = &data[4..4 + length];

    if port_id < 16 {
        match port_id {
            1 => match decode_port_publish(payload) {
                Ok((topic, value)) => println!("[{n:6}] pubsub {topic} = {value:?}"),
                Err(e) => warn!("[{n:6}] pubsub decode failed: {e}"),
            },
            p => println!("[{n:6}] control port {p}, {} bytes", payload.len()),
        }
        return;
    }

    let def = &PORT_MAP[(port_id & 0x0F) as usize];
    let Some(topic) = def.data_topic else {
        println!("[{n:6}] reserved port {port_id}");
        return;
    };
    if payload.len() < 4 {
        warn!("[{n:6}] data port {port_id} without sample id");
        return;
    }
    let sample_id = u32::from_le_bytes(payload[..4].try_into().unwrap());
    if samples {
        match decompress(def, &payload[4..]) {
            Ok(decoded) => println!(
                "[{n:6}] {topic} sample_id={sample_id} samples={}",
                decoded.len()
            ),
            Err(e) => warn!("[{n:6}] {topic} decode failed: {e}"),
        }
    } else {
        println!(
            "[{n:6}] {topic} sample_id={sample_id} {} payload bytes",
            payload.len() - 4
        );
    }
}
