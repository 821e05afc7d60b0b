use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crate::{
    EncoderConfig, EncoderOp, HardwareEncoder, PixelFormat, PopOutcome, RawFrame, StreamError,
};

/// Supplies raw pictures to the encoder, one per call.
///
/// The final picture must carry `last`, since that is the only end-of-stream signal the encoder
/// sees.
pub trait FrameSource {
    /// `Ok(None)` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<RawFrame>, StreamError>;
}

impl<F> FrameSource for Box<F>
where
    F: FrameSource + ?Sized,
{
    fn next_frame(&mut self) -> Result<Option<RawFrame>, StreamError> {
        (**self).next_frame()
    }
}

impl FrameSource for VecDeque<RawFrame> {
    fn next_frame(&mut self) -> Result<Option<RawFrame>, StreamError> {
        Ok(self.pop_front())
    }
}

/// Reads whole pictures from a headerless raw YUV file.
///
/// Trailing bytes that do not make up a full picture are ignored. The final whole picture is
/// flagged `last`.
pub struct RawFileFrameSource<R> {
    reader: R,
    image_size: usize,
    remaining: u64,
    frame_interval: u32,
    next_index: u64,
}

impl RawFileFrameSource<BufReader<File>> {
    pub fn open(path: &Path, image_size: usize, frame_interval: u32) -> Result<Self, StreamError> {
        let file = File::open(path).map_err(|source| StreamError::Io {
            context: "open raw input",
            source,
        })?;
        let total = file
            .metadata()
            .map_err(|source| StreamError::Io {
                context: "stat raw input",
                source,
            })?
            .len();
        Self::new(BufReader::new(file), image_size, total, frame_interval)
    }
}

impl<R> RawFileFrameSource<R>
where
    R: Read,
{
    pub fn new(
        reader: R,
        image_size: usize,
        total_bytes: u64,
        frame_interval: u32,
    ) -> Result<Self, StreamError> {
        if image_size == 0 {
            return Err(StreamError::InvalidConfig(
                "raw image size must be non-zero".to_string(),
            ));
        }
        Ok(Self {
            reader,
            image_size,
            remaining: total_bytes / image_size as u64,
            frame_interval,
            next_index: 0,
        })
    }

    pub fn remaining_frames(&self) -> u64 {
        self.remaining
    }
}

impl<R> FrameSource for RawFileFrameSource<R>
where
    R: Read,
{
    fn next_frame(&mut self) -> Result<Option<RawFrame>, StreamError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let mut data = vec![0; self.image_size];
        self.reader
            .read_exact(&mut data)
            .map_err(|source| StreamError::Io {
                context: "read raw frame",
                source,
            })?;
        self.remaining -= 1;
        let index = self.next_index;
        self.next_index += 1;
        Ok(Some(RawFrame {
            index,
            pts: (index as u32).wrapping_mul(self.frame_interval),
            data,
            last: self.remaining == 0,
            format: PixelFormat::Nv12,
        }))
    }
}

/// Encoder handle shared between a producer thread and the consuming chunker.
///
/// Each call holds the lock only for the duration of one SDK operation.
#[derive(Debug)]
pub struct SharedEncoder<E> {
    inner: Arc<Mutex<E>>,
}

impl<E> Clone for SharedEncoder<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> SharedEncoder<E> {
    pub fn new(encoder: E) -> Self {
        Self {
            inner: Arc::new(Mutex::new(encoder)),
        }
    }

    fn lock(&self, op: EncoderOp) -> Result<MutexGuard<'_, E>, StreamError> {
        self.inner
            .lock()
            .map_err(|_| StreamError::encoder(op, "encoder lock poisoned"))
    }

    /// Runs `f` against the encoder. Returns `None` if the lock is poisoned.
    pub fn with<T>(&self, f: impl FnOnce(&E) -> T) -> Option<T> {
        self.inner.lock().ok().map(|guard| f(&guard))
    }
}

impl<E> HardwareEncoder for SharedEncoder<E>
where
    E: HardwareEncoder,
{
    fn init(&mut self, config: &EncoderConfig) -> Result<(), StreamError> {
        self.lock(EncoderOp::Init)?.init(config)
    }

    fn start(&mut self) -> Result<(), StreamError> {
        self.lock(EncoderOp::Start)?.start()
    }

    fn push(&mut self, frame: RawFrame) -> Result<(), StreamError> {
        self.lock(EncoderOp::Push)?.push(frame)
    }

    fn pop(&mut self) -> Result<PopOutcome, StreamError> {
        self.lock(EncoderOp::Pop)?.pop()
    }

    fn stop(&mut self) -> Result<(), StreamError> {
        self.lock(EncoderOp::Stop)?.stop()
    }

    fn shutdown(&mut self) -> Result<(), StreamError> {
        self.lock(EncoderOp::Shutdown)?.shutdown()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerSummary {
    pub frames_pushed: u64,
    pub reached_last: bool,
    pub cancelled: bool,
}

/// Pushes frames from a [`FrameSource`] on a dedicated thread.
///
/// The encoder's internal queue is the only thing shared with the consumer. Dropping the
/// producer cancels it and joins the thread.
#[derive(Debug)]
pub struct FrameProducer {
    cancel: Arc<AtomicBool>,
    worker: Option<JoinHandle<Result<ProducerSummary, StreamError>>>,
}

impl FrameProducer {
    pub fn spawn<F, E>(frames: F, encoder: SharedEncoder<E>) -> Self
    where
        F: FrameSource + Send + 'static,
        E: HardwareEncoder + Send + 'static,
    {
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);
        let worker = thread::spawn(move || run_producer(frames, encoder, &flag));
        Self {
            cancel,
            worker: Some(worker),
        }
    }

    /// Asks the thread to stop before its next push.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().is_none_or(JoinHandle::is_finished)
    }

    pub fn join(mut self) -> Result<ProducerSummary, StreamError> {
        match self.worker.take() {
            Some(worker) => worker
                .join()
                .map_err(|_| StreamError::encoder(EncoderOp::Push, "frame producer panicked"))?,
            None => Ok(ProducerSummary::default()),
        }
    }
}

impl Drop for FrameProducer {
    fn drop(&mut self) {
        self.cancel();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_producer<F, E>(
    mut frames: F,
    mut encoder: SharedEncoder<E>,
    cancel: &AtomicBool,
) -> Result<ProducerSummary, StreamError>
where
    F: FrameSource,
    E: HardwareEncoder,
{
    let mut summary = ProducerSummary::default();
    loop {
        if cancel.load(Ordering::Relaxed) {
            summary.cancelled = true;
            tracing::info!(frames = summary.frames_pushed, "frame producer cancelled");
            return Ok(summary);
        }
        let Some(frame) = frames.next_frame()? else {
            break;
        };
        let last = frame.last;
        if let Err(err) = encoder.push(frame) {
            tracing::warn!(error = %err, frames = summary.frames_pushed, "frame push failed");
            return Err(err);
        }
        summary.frames_pushed += 1;
        if last {
            summary.reached_last = true;
            break;
        }
    }
    tracing::info!(frames = summary.frames_pushed, "frame producer finished");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::simulated::ScriptedEncoder;

    #[test]
    fn raw_file_source_yields_whole_frames_and_flags_last() {
        let bytes = (0u8..25).collect::<Vec<_>>();
        let mut source = RawFileFrameSource::new(Cursor::new(bytes), 8, 25, 40).unwrap();
        assert_eq!(source.remaining_frames(), 3);

        let mut frames = Vec::new();
        while let Some(frame) = source.next_frame().unwrap() {
            frames.push(frame);
        }
        assert_eq!(frames.len(), 3);
        assert_eq!(
            frames.iter().map(|f| f.pts).collect::<Vec<_>>(),
            vec![0, 40, 80]
        );
        assert_eq!(
            frames.iter().map(|f| f.last).collect::<Vec<_>>(),
            vec![false, false, true]
        );
        assert_eq!(frames[2].data[0], 16);
        assert!(frames.iter().all(|f| f.format == PixelFormat::Nv12));
    }

    #[test]
    fn raw_file_source_reports_short_reads() {
        let mut source = RawFileFrameSource::new(Cursor::new(vec![0u8; 4]), 8, 16, 1).unwrap();
        assert!(matches!(
            source.next_frame(),
            Err(StreamError::Io { .. })
        ));
    }

    #[test]
    fn zero_image_size_is_rejected() {
        assert!(RawFileFrameSource::new(Cursor::new(Vec::new()), 0, 0, 1).is_err());
    }

    #[test]
    fn producer_pushes_until_last_frame() {
        let frames: VecDeque<RawFrame> = (0..4)
            .map(|i| RawFrame {
                index: i,
                pts: i as u32,
                data: vec![1; 8],
                last: i == 2,
                format: PixelFormat::Nv12,
            })
            .collect();
        let shared = SharedEncoder::new(ScriptedEncoder::new(Vec::new()));
        let producer = FrameProducer::spawn(frames, shared.clone());
        let summary = producer.join().unwrap();

        assert_eq!(summary.frames_pushed, 3);
        assert!(summary.reached_last);
        assert_eq!(shared.with(ScriptedEncoder::push_calls), Some(3));
    }

    #[test]
    fn push_failure_surfaces_from_join() {
        let frames: VecDeque<RawFrame> = std::iter::once(RawFrame {
            index: 0,
            pts: 0,
            data: vec![0; 4],
            last: true,
            format: PixelFormat::Nv12,
        })
        .collect();
        let mut encoder = ScriptedEncoder::new(Vec::new());
        encoder.fail_push_after(0);
        let producer = FrameProducer::spawn(frames, SharedEncoder::new(encoder));
        assert!(matches!(
            producer.join(),
            Err(StreamError::EncoderFault {
                op: EncoderOp::Push,
                ..
            })
        ));
    }
}
