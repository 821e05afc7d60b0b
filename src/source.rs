use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;

use crate::chunker::{DEFAULT_STAGING_CAPACITY, ElementaryStreamChunker, FillOutcome};
use crate::clock::{Pacing, PresentationClock, PresentationTime, SystemClock, TimeSource};
use crate::scheduler::{ReadDecision, ReadDiscipline, ReadScheduler};
use crate::{HardwareEncoder, Reactor, SourceHandle, StreamError};

/// Something that can fill a caller buffer with the next bytes of an elementary stream.
pub trait ChunkProvider {
    fn provide(&mut self, dst: &mut [u8]) -> Result<FillOutcome, StreamError>;

    /// Seekable providers are polled through a readiness registration, others are read on
    /// every request.
    fn is_seekable(&self) -> bool;

    fn set_non_blocking(&mut self) -> Result<(), StreamError> {
        Ok(())
    }

    /// Drops bytes that were produced but not delivered. Returns how many were dropped.
    fn discard_pending(&mut self) -> usize {
        0
    }

    fn seek(&mut self, _pos: SeekFrom) -> Result<u64, StreamError> {
        Err(StreamError::SeekUnsupported(
            "source is not file-backed".to_string(),
        ))
    }

    fn file_size(&self) -> Option<u64> {
        None
    }

    fn close(&mut self) {}
}

impl<E> ChunkProvider for ElementaryStreamChunker<E>
where
    E: HardwareEncoder,
{
    fn provide(&mut self, dst: &mut [u8]) -> Result<FillOutcome, StreamError> {
        self.fill(dst)
    }

    fn is_seekable(&self) -> bool {
        true
    }

    fn discard_pending(&mut self) -> usize {
        self.discard_leftover()
    }

    fn close(&mut self) {
        ElementaryStreamChunker::close(self);
    }
}

/// Reads a plain byte stream from a file or an inherited descriptor such as a pipe.
#[derive(Debug)]
pub struct FileChunkProvider {
    file: File,
    seekable: bool,
    file_size: Option<u64>,
    at_eof: bool,
}

impl FileChunkProvider {
    pub fn open(path: &Path) -> Result<Self, StreamError> {
        let file = File::open(path).map_err(|source| StreamError::Io {
            context: "open input file",
            source,
        })?;
        Ok(Self::from_file(file))
    }

    pub fn from_file(mut file: File) -> Self {
        let seekable = file.stream_position().is_ok();
        let file_size = file
            .metadata()
            .ok()
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len());
        Self {
            file,
            seekable,
            file_size,
            at_eof: false,
        }
    }
}

impl ChunkProvider for FileChunkProvider {
    fn provide(&mut self, dst: &mut [u8]) -> Result<FillOutcome, StreamError> {
        if self.at_eof {
            return Ok(FillOutcome::Closed);
        }
        match self.file.read(dst) {
            Ok(0) => {
                self.at_eof = true;
                Ok(FillOutcome::Closed)
            }
            Ok(n) => Ok(FillOutcome::Delivered(n)),
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                Ok(FillOutcome::NotReady)
            }
            Err(source) => Err(StreamError::Io {
                context: "read input",
                source,
            }),
        }
    }

    fn is_seekable(&self) -> bool {
        self.seekable
    }

    fn set_non_blocking(&mut self) -> Result<(), StreamError> {
        if self.seekable {
            return Ok(());
        }
        make_non_blocking(&self.file).map_err(|source| StreamError::Io {
            context: "set descriptor non-blocking",
            source,
        })
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64, StreamError> {
        if !self.seekable {
            return Err(StreamError::SeekUnsupported(
                "descriptor is not seekable".to_string(),
            ));
        }
        let offset = self.file.seek(pos).map_err(|source| StreamError::Io {
            context: "seek input",
            source,
        })?;
        self.at_eof = false;
        Ok(offset)
    }

    fn file_size(&self) -> Option<u64> {
        self.file_size
    }
}

#[cfg(unix)]
fn make_non_blocking(file: &File) -> std::io::Result<()> {
    use nix::fcntl::{FcntlArg, OFlag, fcntl};
    use std::os::fd::AsRawFd;

    let fd = file.as_raw_fd();
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let mut oflag = OFlag::from_bits_truncate(flags);
    oflag.insert(OFlag::O_NONBLOCK);
    fcntl(fd, FcntlArg::F_SETFL(oflag))?;
    Ok(())
}

#[cfg(not(unix))]
fn make_non_blocking(_file: &File) -> std::io::Result<()> {
    Ok(())
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub preferred_frame_size: usize,
    pub play_time_per_frame: u32,
    pub discipline: ReadDiscipline,
    pub staging_capacity: usize,
    pub retry_delay: Duration,
    pub byte_budget: Option<u64>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            preferred_frame_size: 0,
            play_time_per_frame: 0,
            discipline: ReadDiscipline::Synchronous,
            staging_capacity: DEFAULT_STAGING_CAPACITY,
            retry_delay: Duration::from_millis(5),
            byte_budget: None,
        }
    }
}

/// Optional cap on the total bytes a stream may deliver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteBudget {
    limited: bool,
    remaining: u64,
}

impl ByteBudget {
    /// A limit of zero means unlimited.
    pub fn set(&mut self, limit: u64) {
        self.remaining = limit;
        self.limited = limit > 0;
    }

    fn consume(&mut self, bytes: usize) {
        self.remaining = self.remaining.saturating_sub(bytes as u64);
    }

    fn cap(&self, max: usize) -> usize {
        if self.limited {
            max.min(usize::try_from(self.remaining).unwrap_or(usize::MAX))
        } else {
            max
        }
    }

    pub fn exhausted(&self) -> bool {
        self.limited && self.remaining == 0
    }

    pub fn remaining(&self) -> Option<u64> {
        self.limited.then_some(self.remaining)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkResult {
    pub bytes_written: usize,
    pub presentation_time: Option<PresentationTime>,
    pub duration_micros: u32,
    pub closed: bool,
}

impl ChunkResult {
    #[must_use]
    pub fn closed() -> Self {
        Self {
            bytes_written: 0,
            presentation_time: None,
            duration_micros: 0,
            closed: true,
        }
    }

    #[must_use]
    pub fn not_ready() -> Self {
        Self {
            closed: false,
            ..Self::closed()
        }
    }

    #[must_use]
    pub fn is_not_ready(&self) -> bool {
        self.bytes_written == 0 && !self.closed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Ready(ChunkResult),
    /// Data will arrive through [`ByteStreamSource::on_ready`].
    Awaiting,
}

/// Pull source exposed to the streaming framework.
pub struct ByteStreamSource<P, C = SystemClock> {
    provider: P,
    scheduler: ReadScheduler,
    clock: PresentationClock<C>,
    handle: SourceHandle,
    preferred_frame_size: usize,
    budget: ByteBudget,
    pending_max: Option<usize>,
    closed: bool,
    on_closure: Option<Box<dyn FnMut() + Send>>,
}

impl<P> ByteStreamSource<P, SystemClock>
where
    P: ChunkProvider,
{
    pub fn with_system_clock(provider: P, config: &SourceConfig) -> Result<Self, StreamError> {
        Self::new(provider, config, SystemClock)
    }
}

impl<P, C> ByteStreamSource<P, C>
where
    P: ChunkProvider,
    C: TimeSource,
{
    pub fn new(mut provider: P, config: &SourceConfig, clock: C) -> Result<Self, StreamError> {
        if config.discipline == ReadDiscipline::EventDriven {
            provider.set_non_blocking()?;
        }
        let pacing = Pacing::new(
            config.play_time_per_frame,
            u32::try_from(config.preferred_frame_size).unwrap_or(u32::MAX),
        );
        let mut budget = ByteBudget::default();
        if let Some(limit) = config.byte_budget {
            budget.set(limit);
        }
        Ok(Self {
            provider,
            scheduler: ReadScheduler::new(config.discipline, config.retry_delay),
            clock: PresentationClock::new(clock, pacing),
            handle: SourceHandle::next(),
            preferred_frame_size: config.preferred_frame_size,
            budget,
            pending_max: None,
            closed: false,
            on_closure: None,
        })
    }

    /// Registers the framework's closure notification. It fires at most once.
    pub fn on_closure<F>(&mut self, handler: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.on_closure = Some(Box::new(handler));
    }

    /// Requests the next chunk of at most `dst.len()` bytes.
    pub fn get_next_chunk(
        &mut self,
        dst: &mut [u8],
        reactor: &mut dyn Reactor,
    ) -> Result<RequestState, StreamError> {
        if self.closed {
            return Ok(RequestState::Ready(ChunkResult::closed()));
        }
        if self.scheduler.is_awaiting() {
            return Err(StreamError::RequestInFlight);
        }
        if self.budget.exhausted() {
            self.handle_closure(reactor);
            return Ok(RequestState::Ready(ChunkResult::closed()));
        }

        let seekable = self.provider.is_seekable();
        match self.scheduler.begin_request(reactor, self.handle, seekable) {
            ReadDecision::Await => {
                self.pending_max = Some(dst.len());
                Ok(RequestState::Awaiting)
            }
            ReadDecision::ReadNow => match self.read(dst, reactor) {
                Ok(Some(result)) => Ok(RequestState::Ready(result)),
                Ok(None) => {
                    self.pending_max = Some(dst.len());
                    Ok(RequestState::Awaiting)
                }
                Err(err) => {
                    self.finish_request();
                    Err(err)
                }
            },
        }
    }

    /// Reactor callback for this source's handle.
    ///
    /// Returns `None` when no chunk is ready yet, or when nothing was waiting for data, in which
    /// case the source stops getting chunks until the next request.
    pub fn on_ready(
        &mut self,
        dst: &mut [u8],
        reactor: &mut dyn Reactor,
    ) -> Result<Option<ChunkResult>, StreamError> {
        if self.closed {
            return Ok(None);
        }
        if !self.scheduler.on_wakeup() {
            self.stop_getting_chunks(reactor);
            return Ok(None);
        }
        let max = self.pending_max.map_or(dst.len(), |m| m.min(dst.len()));
        match self.read(&mut dst[..max], reactor) {
            Ok(Some(result)) => {
                self.finish_request();
                Ok(Some(result))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                self.finish_request();
                Err(err)
            }
        }
    }

    fn read(
        &mut self,
        dst: &mut [u8],
        reactor: &mut dyn Reactor,
    ) -> Result<Option<ChunkResult>, StreamError> {
        let mut max = self.budget.cap(dst.len());
        if self.preferred_frame_size > 0 {
            max = max.min(self.preferred_frame_size);
        }
        if max == 0 {
            return Ok(Some(ChunkResult::not_ready()));
        }

        let outcome = match self.provider.provide(&mut dst[..max]) {
            Ok(outcome) => outcome,
            Err(err) if err.is_recoverable() => return Err(err),
            Err(err) => {
                tracing::warn!(handle = self.handle.0, error = %err, "byte stream failed");
                self.closed = true;
                self.scheduler.stop(reactor, self.handle);
                self.pending_max = None;
                self.provider.close();
                return Err(err);
            }
        };

        match outcome {
            FillOutcome::Closed | FillOutcome::Delivered(0) => {
                self.handle_closure(reactor);
                Ok(Some(ChunkResult::closed()))
            }
            FillOutcome::NotReady => match self.scheduler.discipline() {
                ReadDiscipline::Synchronous => Ok(Some(ChunkResult::not_ready())),
                ReadDiscipline::EventDriven => {
                    if !self.provider.is_seekable() {
                        self.scheduler.schedule_retry(reactor, self.handle);
                    }
                    Ok(None)
                }
            },
            FillOutcome::Delivered(n) => {
                self.budget.consume(n);
                let stamp = self.clock.stamp(n);
                let closed = self.budget.exhausted();
                if closed {
                    let dropped = self.provider.discard_pending();
                    tracing::debug!(
                        handle = self.handle.0,
                        dropped,
                        "byte budget exhausted"
                    );
                    self.handle_closure(reactor);
                }
                tracing::trace!(
                    handle = self.handle.0,
                    bytes = n,
                    pts = %stamp.presentation_time,
                    duration_us = stamp.duration_micros,
                    "delivered chunk"
                );
                Ok(Some(ChunkResult {
                    bytes_written: n,
                    presentation_time: Some(stamp.presentation_time),
                    duration_micros: stamp.duration_micros,
                    closed,
                }))
            }
        }
    }

    fn finish_request(&mut self) {
        self.scheduler.complete();
        self.pending_max = None;
    }

    fn handle_closure(&mut self, reactor: &mut dyn Reactor) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.scheduler.stop(reactor, self.handle);
        self.pending_max = None;
        self.provider.close();
        tracing::info!(handle = self.handle.0, "byte stream closed");
        if let Some(mut handler) = self.on_closure.take() {
            handler();
        }
    }

    /// Cancels any pending continuation and readiness registration.
    pub fn stop_getting_chunks(&mut self, reactor: &mut dyn Reactor) {
        self.scheduler.stop(reactor, self.handle);
        self.pending_max = None;
    }

    /// Ends the stream and notifies the closure handler.
    pub fn close(&mut self, reactor: &mut dyn Reactor) {
        self.handle_closure(reactor);
    }

    pub fn seek_absolute(&mut self, byte_offset: u64, limit: u64) -> Result<u64, StreamError> {
        let offset = self.provider.seek(SeekFrom::Start(byte_offset))?;
        self.budget.set(limit);
        Ok(offset)
    }

    pub fn seek_relative(&mut self, offset: i64, limit: u64) -> Result<u64, StreamError> {
        let offset = self.provider.seek(SeekFrom::Current(offset))?;
        self.budget.set(limit);
        Ok(offset)
    }

    pub fn seek_to_end(&mut self) -> Result<u64, StreamError> {
        self.provider.seek(SeekFrom::End(0))
    }

    pub fn set_byte_budget(&mut self, limit: u64) {
        self.budget.set(limit);
    }

    pub fn remaining_budget(&self) -> Option<u64> {
        self.budget.remaining()
    }

    pub fn file_size(&self) -> Option<u64> {
        self.provider.file_size()
    }

    pub fn handle(&self) -> SourceHandle {
        self.handle
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_awaiting(&self) -> bool {
        self.scheduler.is_awaiting()
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn provider_mut(&mut self) -> &mut P {
        &mut self.provider
    }

    pub fn last_presentation_time(&self) -> Option<PresentationTime> {
        self.clock.last_stamp()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::PopOutcome;
    use crate::clock::ManualClock;
    use crate::reactor::LoopReactor;
    use crate::simulated::{ScriptedEncoder, scripted_unit};

    fn encoder_source(
        script: Vec<PopOutcome>,
        config: &SourceConfig,
    ) -> ByteStreamSource<ElementaryStreamChunker<ScriptedEncoder>, ManualClock> {
        let chunker =
            ElementaryStreamChunker::new(ScriptedEncoder::new(script), config.staging_capacity);
        ByteStreamSource::new(
            chunker,
            config,
            ManualClock::starting_at(PresentationTime::new(10, 0)),
        )
        .unwrap()
    }

    #[test]
    fn preferred_frame_size_caps_each_read() {
        let config = SourceConfig {
            preferred_frame_size: 4,
            ..SourceConfig::default()
        };
        let mut source = encoder_source(
            vec![PopOutcome::Unit(scripted_unit(&[10], true, 0))],
            &config,
        );
        let mut reactor = LoopReactor::default();
        let mut buf = [0u8; 64];
        let mut sizes = Vec::new();
        loop {
            let RequestState::Ready(result) = source.get_next_chunk(&mut buf, &mut reactor).unwrap()
            else {
                panic!("synchronous source should not defer");
            };
            if result.closed {
                break;
            }
            sizes.push(result.bytes_written);
        }
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn closure_handler_fires_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut source = encoder_source(
            vec![PopOutcome::Unit(scripted_unit(&[3], true, 0))],
            &SourceConfig::default(),
        );
        let counter = Arc::clone(&fired);
        source.on_closure(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        let mut reactor = LoopReactor::default();
        let mut buf = [0u8; 8];
        for _ in 0..5 {
            source.get_next_chunk(&mut buf, &mut reactor).unwrap();
        }
        assert!(source.is_closed());
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn event_driven_request_waits_for_wakeup_and_rejects_reentry() {
        let config = SourceConfig {
            discipline: ReadDiscipline::EventDriven,
            ..SourceConfig::default()
        };
        let mut source = encoder_source(
            vec![PopOutcome::Unit(scripted_unit(&[5], false, 0))],
            &config,
        );
        let mut reactor = LoopReactor::default();
        let mut buf = [0u8; 8];

        assert_eq!(
            source.get_next_chunk(&mut buf, &mut reactor).unwrap(),
            RequestState::Awaiting
        );
        assert!(reactor.is_registered(source.handle()));
        assert!(matches!(
            source.get_next_chunk(&mut buf, &mut reactor),
            Err(StreamError::RequestInFlight)
        ));

        let result = source.on_ready(&mut buf, &mut reactor).unwrap().unwrap();
        assert_eq!(result.bytes_written, 5);
        assert!(!source.is_awaiting());
    }

    #[test]
    fn stray_wakeup_stops_getting_chunks() {
        let config = SourceConfig {
            discipline: ReadDiscipline::EventDriven,
            ..SourceConfig::default()
        };
        let mut source = encoder_source(Vec::new(), &config);
        let mut reactor = LoopReactor::default();
        let mut buf = [0u8; 8];

        source.get_next_chunk(&mut buf, &mut reactor).unwrap();
        assert_eq!(source.on_ready(&mut buf, &mut reactor).unwrap(), None);
        source.stop_getting_chunks(&mut reactor);
        assert!(!reactor.is_registered(source.handle()));
        assert_eq!(source.on_ready(&mut buf, &mut reactor).unwrap(), None);
        assert_eq!(source.provider().encoder().pop_calls(), 1);
    }

    #[test]
    fn encoder_source_rejects_seeks() {
        let mut source = encoder_source(Vec::new(), &SourceConfig::default());
        assert!(matches!(
            source.seek_absolute(0, 10),
            Err(StreamError::SeekUnsupported(_))
        ));
        assert!(source.file_size().is_none());
    }

    #[test]
    fn file_provider_reports_size_and_seeks() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&(0u8..100).collect::<Vec<_>>()).unwrap();
        let provider = FileChunkProvider::open(tmp.path()).unwrap();
        assert!(provider.is_seekable());

        let mut source = ByteStreamSource::with_system_clock(provider, &SourceConfig::default())
            .unwrap();
        assert_eq!(source.file_size(), Some(100));
        assert_eq!(source.seek_absolute(90, 0).unwrap(), 90);

        let mut reactor = LoopReactor::default();
        let mut buf = [0u8; 64];
        let RequestState::Ready(result) = source.get_next_chunk(&mut buf, &mut reactor).unwrap()
        else {
            panic!("synchronous read should be ready");
        };
        assert_eq!(result.bytes_written, 10);
        assert_eq!(buf[0], 90);
        let RequestState::Ready(end) = source.get_next_chunk(&mut buf, &mut reactor).unwrap()
        else {
            panic!("synchronous read should be ready");
        };
        assert!(end.closed);
    }

    #[test]
    fn relative_seek_with_limit_bounds_delivery() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[7u8; 64]).unwrap();
        let provider = FileChunkProvider::open(tmp.path()).unwrap();
        let mut source = ByteStreamSource::new(
            provider,
            &SourceConfig::default(),
            ManualClock::default(),
        )
        .unwrap();
        assert_eq!(source.seek_relative(8, 20).unwrap(), 8);
        assert_eq!(source.remaining_budget(), Some(20));

        let mut reactor = LoopReactor::default();
        let mut buf = [0u8; 64];
        let RequestState::Ready(result) = source.get_next_chunk(&mut buf, &mut reactor).unwrap()
        else {
            panic!("synchronous read should be ready");
        };
        assert_eq!(result.bytes_written, 20);
        assert!(result.closed);
        assert_eq!(source.seek_to_end().unwrap(), 64);
    }
}
