use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use hvc_es_bridge::{
    ChunkResult, EncoderConfig, EncoderStream, FeedMode, FrameRate, FrameSource, GopType,
    LoopReactor, NalReassembler, PixelFormat, RawFileFrameSource, RawFrame, ReadDiscipline,
    RequestState, Resolution, SimulatedEncoder, SourceConfig, StreamError,
};

#[derive(Parser, Debug)]
#[command(about = "Stream a simulated HEVC encoder through the byte-stream source")]
struct Args {
    /// Raw NV12 input. Synthetic frames are generated when omitted.
    #[arg(long)]
    input: Option<PathBuf>,
    #[arg(long, default_value_t = 48)]
    frames: u64,
    #[arg(long, default_value_t = 720)]
    width: u32,
    #[arg(long, default_value_t = 576)]
    height: u32,
    #[arg(long, default_value_t = 24)]
    fps: u32,
    #[arg(long, default_value_t = 8000)]
    bitrate_kbps: u32,
    #[arg(long, default_value_t = 64)]
    gop: u16,
    #[arg(long, default_value_t = 7)]
    b_frames: u8,
    #[arg(long, default_value_t = 100_000)]
    max_size: usize,
    #[arg(long, default_value_t = 0)]
    preferred_frame_size: usize,
    #[arg(long, default_value_t = 0)]
    play_time_per_frame: u32,
    #[arg(long, default_value_t = 1_000_000)]
    staging_capacity: usize,
    #[arg(long, default_value_t = false)]
    event_driven: bool,
    /// Push frames from the request path instead of a producer thread. Requires --b-frames 0.
    #[arg(long, default_value_t = false)]
    inline: bool,
    #[arg(long, default_value = "output.h265")]
    output: PathBuf,
}

struct SyntheticFrames {
    image_size: usize,
    count: u64,
    next: u64,
    interval: u32,
}

impl FrameSource for SyntheticFrames {
    fn next_frame(&mut self) -> Result<Option<RawFrame>, StreamError> {
        if self.next >= self.count {
            return Ok(None);
        }
        let index = self.next;
        self.next += 1;
        Ok(Some(RawFrame {
            index,
            pts: index as u32 * self.interval,
            data: vec![(index % 200) as u8 + 16; self.image_size],
            last: self.next == self.count,
            format: PixelFormat::Nv12,
        }))
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let encoder_config = EncoderConfig {
        resolution: Resolution::from_dimensions(args.width, args.height)?,
        frame_rate: FrameRate::from_fps(args.fps)?,
        bitrate_kbps: args.bitrate_kbps,
        gop_size: args.gop,
        b_frames: args.b_frames,
        gop_type: if args.b_frames > 0 {
            GopType::Ib
        } else {
            GopType::Ip
        },
        ..EncoderConfig::default()
    };
    encoder_config.validate()?;
    let source_config = SourceConfig {
        preferred_frame_size: args.preferred_frame_size,
        play_time_per_frame: args.play_time_per_frame,
        discipline: if args.event_driven {
            ReadDiscipline::EventDriven
        } else {
            ReadDiscipline::Synchronous
        },
        staging_capacity: args.staging_capacity,
        ..SourceConfig::default()
    };
    let mode = if args.inline {
        FeedMode::Inline
    } else {
        FeedMode::Threaded
    };

    let frames: Box<dyn FrameSource + Send> = match &args.input {
        Some(path) => Box::new(
            RawFileFrameSource::open(path, encoder_config.image_size(), 1)
                .with_context(|| format!("failed to open {}", path.display()))?,
        ),
        None => Box::new(SyntheticFrames {
            image_size: encoder_config.image_size(),
            count: args.frames,
            next: 0,
            interval: 1,
        }),
    };

    let mut stream = EncoderStream::start(
        SimulatedEncoder::new(),
        &encoder_config,
        &source_config,
        mode,
        Some(frames),
    )?;

    let mut out = BufWriter::new(
        File::create(&args.output)
            .with_context(|| format!("failed to create {}", args.output.display()))?,
    );
    let mut reactor = LoopReactor::default();
    let mut buf = vec![0u8; args.max_size];
    let mut reassembler = NalReassembler::new();
    let mut chunks = 0usize;
    let mut bytes = 0usize;
    let mut access_units = 0usize;
    let started = Instant::now();

    loop {
        let outcome = match stream.get_next_chunk(&mut buf, &mut reactor) {
            Ok(RequestState::Ready(result)) => Ok(result),
            Ok(RequestState::Awaiting) => wait_for_chunk(&mut stream, &mut buf, &mut reactor),
            Err(err) => Err(err),
        };
        let result = match outcome {
            Ok(result) => result,
            Err(err) if err.is_recoverable() => {
                tracing::warn!(error = %err, "skipping access unit");
                continue;
            }
            Err(err) => return Err(err).context("encoder stream failed"),
        };
        if result.closed {
            break;
        }
        if result.is_not_ready() {
            std::thread::yield_now();
            continue;
        }
        let chunk = &buf[..result.bytes_written];
        out.write_all(chunk).context("failed to write output")?;
        access_units += reassembler.push_chunk(chunk).len();
        chunks += 1;
        bytes += result.bytes_written;
        tracing::debug!(
            bytes = result.bytes_written,
            pts = ?result.presentation_time.map(|t| t.to_string()),
            duration_us = result.duration_micros,
            "chunk"
        );
    }
    access_units += reassembler.flush().len();
    out.flush().context("failed to flush output")?;

    let stats = stream.stats();
    let producer = stream.finish(&mut reactor)?;
    println!(
        "chunks={chunks}, bytes={bytes}, access_units={access_units}, pushes={}, empty_pops={}, dropped_units={}, producer_frames={}, elapsed_ms={}, output={}",
        stats.pushes,
        stats.empty_pops,
        stats.dropped_units,
        producer.map_or(stats.pushes, |summary| summary.frames_pushed),
        started.elapsed().as_millis(),
        args.output.display()
    );
    Ok(())
}

fn wait_for_chunk(
    stream: &mut EncoderStream<SimulatedEncoder>,
    buf: &mut [u8],
    reactor: &mut LoopReactor,
) -> Result<ChunkResult, StreamError> {
    let handle = stream.handle();
    loop {
        let now = Instant::now();
        for woken in reactor.due_wakeups(now) {
            if woken != handle {
                continue;
            }
            if let Some(result) = stream.on_ready(buf, reactor)? {
                return Ok(result);
            }
        }
        let pause = reactor
            .next_deadline(now)
            .unwrap_or(Duration::from_micros(200));
        std::thread::sleep(pause.min(Duration::from_millis(5)));
    }
}
