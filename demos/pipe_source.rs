use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use hvc_es_bridge::{
    ByteStreamSource, ChunkResult, FileChunkProvider, LoopReactor, ReadDiscipline, RequestState,
    SourceConfig,
};

#[derive(Parser, Debug)]
#[command(about = "Read a file or pipe through the byte-stream source and print each chunk")]
struct Args {
    /// Regular file, FIFO or /dev/stdin.
    #[arg(long)]
    input: PathBuf,
    #[arg(long, default_value_t = 4096)]
    max_size: usize,
    #[arg(long, default_value_t = 0)]
    preferred_frame_size: usize,
    #[arg(long, default_value_t = 0)]
    play_time_per_frame: u32,
    #[arg(long, default_value_t = false)]
    event_driven: bool,
    #[arg(long, default_value_t = 5)]
    retry_delay_ms: u64,
    /// Seek here before reading. Seekable inputs only.
    #[arg(long)]
    offset: Option<u64>,
    /// Stop after this many bytes. 0 reads to the end.
    #[arg(long, default_value_t = 0)]
    limit: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let provider = FileChunkProvider::open(&args.input)
        .with_context(|| format!("failed to open {}", args.input.display()))?;
    let config = SourceConfig {
        preferred_frame_size: args.preferred_frame_size,
        play_time_per_frame: args.play_time_per_frame,
        discipline: if args.event_driven {
            ReadDiscipline::EventDriven
        } else {
            ReadDiscipline::Synchronous
        },
        retry_delay: Duration::from_millis(args.retry_delay_ms),
        byte_budget: (args.limit > 0).then_some(args.limit),
        ..SourceConfig::default()
    };
    let mut source = ByteStreamSource::with_system_clock(provider, &config)?;
    if let Some(offset) = args.offset {
        source
            .seek_absolute(offset, args.limit)
            .context("failed to seek input")?;
    }
    source.on_closure(|| tracing::info!("input closed"));

    let mut reactor = LoopReactor::default();
    let mut buf = vec![0u8; args.max_size];
    let mut total = 0u64;
    let started = Instant::now();

    loop {
        let result = match source.get_next_chunk(&mut buf, &mut reactor)? {
            RequestState::Ready(result) => result,
            RequestState::Awaiting => wait_for_chunk(&mut source, &mut buf, &mut reactor)?,
        };
        if result.closed && result.bytes_written == 0 {
            break;
        }
        if result.is_not_ready() {
            std::thread::sleep(config.retry_delay);
            continue;
        }
        total += result.bytes_written as u64;
        println!(
            "chunk bytes={} pts={} duration_us={}",
            result.bytes_written,
            result
                .presentation_time
                .map_or_else(|| "-".to_string(), |t| t.to_string()),
            result.duration_micros
        );
        if result.closed {
            break;
        }
    }

    println!(
        "total_bytes={total}, file_size={}, elapsed_ms={}",
        source
            .file_size()
            .map_or_else(|| "unknown".to_string(), |size| size.to_string()),
        started.elapsed().as_millis()
    );
    Ok(())
}

fn wait_for_chunk(
    source: &mut ByteStreamSource<FileChunkProvider>,
    buf: &mut [u8],
    reactor: &mut LoopReactor,
) -> anyhow::Result<ChunkResult> {
    let handle = source.handle();
    loop {
        let now = Instant::now();
        for woken in reactor.due_wakeups(now) {
            if woken == handle {
                if let Some(result) = source.on_ready(buf, reactor)? {
                    return Ok(result);
                }
            }
        }
        let pause = reactor
            .next_deadline(now)
            .unwrap_or(Duration::from_millis(1));
        std::thread::sleep(pause);
    }
}
