mod chunker;
mod clock;
mod contract;
pub mod nal;
mod producer;
mod reactor;
mod scheduler;
mod simulated;
mod source;

pub use chunker::{
    ChunkerStats, DEFAULT_STAGING_CAPACITY, ElementaryStreamChunker, FillOutcome, StagingBuffer,
};
pub use clock::{
    ChunkStamp, ManualClock, Pacing, PresentationClock, PresentationTime, SystemClock, TimeSource,
};
pub use contract::{
    BitDepth, ChromaFormat, CodedAccessUnit, EncoderConfig, EncoderOp, FrameRate, FrameType,
    GopType, HardwareEncoder, InputMode, Level, MAX_B_FRAMES, NalUnit, PixelFormat, PopOutcome,
    Profile, RawFrame, Resolution, StreamError, Tier,
};
pub use nal::{NalReassembler, ParameterSets, ReassembledUnit};
pub use producer::{
    FrameProducer, FrameSource, ProducerSummary, RawFileFrameSource, SharedEncoder,
};
pub use reactor::LoopReactor;
pub use scheduler::{ReadDecision, ReadDiscipline, ReadScheduler, Reactor, SourceHandle, TaskId};
pub use simulated::{EncoderState, ScriptedEncoder, SimulatedEncoder, scripted_unit};
pub use source::{
    ByteBudget, ByteStreamSource, ChunkProvider, ChunkResult, FileChunkProvider, RequestState,
    SourceConfig,
};

/// How raw frames reach the encoder of an [`EncoderStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedMode {
    /// One frame is pushed from the request path per request cycle.
    Inline,
    /// A dedicated producer thread pushes frames as fast as the encoder accepts them.
    Threaded,
    /// The caller pushes through [`EncoderStream::encoder_handle`].
    External,
}

/// An encoder wired to a byte-stream source, ready to serve chunk requests.
pub struct EncoderStream<E> {
    source: ByteStreamSource<ElementaryStreamChunker<SharedEncoder<E>>>,
    encoder: SharedEncoder<E>,
    mode: FeedMode,
}

impl<E> EncoderStream<E>
where
    E: HardwareEncoder + Send + 'static,
{
    /// Initializes and starts `encoder`, then attaches `frames` according to `mode`.
    ///
    /// `frames` is ignored for [`FeedMode::External`]. Inline feeding pushes only after a pop
    /// yields data, so it is refused when the config holds B-frames back.
    pub fn start<F>(
        encoder: E,
        encoder_config: &EncoderConfig,
        source_config: &SourceConfig,
        mode: FeedMode,
        frames: Option<F>,
    ) -> Result<Self, StreamError>
    where
        F: FrameSource + Send + 'static,
    {
        if mode == FeedMode::Inline && encoder_config.b_frames > 0 {
            return Err(StreamError::InvalidConfig(format!(
                "inline feeding cannot fill {} frames of b-frame latency",
                encoder_config.b_frames
            )));
        }
        let frames = match (mode, frames) {
            (FeedMode::External, _) => None,
            (_, Some(frames)) => Some(frames),
            (mode, None) => {
                return Err(StreamError::InvalidConfig(format!(
                    "{mode:?} feeding needs a frame source"
                )));
            }
        };

        let mut shared = SharedEncoder::new(encoder);
        if let Err(err) = shared.init(encoder_config).and_then(|()| shared.start()) {
            abandon(&mut shared);
            return Err(err);
        }

        let capacity = source_config.staging_capacity;
        let chunker = match (mode, frames) {
            (FeedMode::Inline, Some(frames)) => {
                ElementaryStreamChunker::with_frame_source(shared.clone(), capacity, frames)
            }
            (FeedMode::Threaded, Some(frames)) => ElementaryStreamChunker::with_producer(
                shared.clone(),
                capacity,
                FrameProducer::spawn(frames, shared.clone()),
            ),
            _ => ElementaryStreamChunker::new(shared.clone(), capacity),
        };
        let source = match ByteStreamSource::with_system_clock(chunker, source_config) {
            Ok(source) => source,
            Err(err) => {
                abandon(&mut shared);
                return Err(err);
            }
        };
        tracing::info!(
            %encoder_config,
            ?mode,
            discipline = ?source_config.discipline,
            "encoder stream started"
        );

        Ok(Self {
            source,
            encoder: shared,
            mode,
        })
    }

    pub fn get_next_chunk(
        &mut self,
        dst: &mut [u8],
        reactor: &mut dyn Reactor,
    ) -> Result<RequestState, StreamError> {
        self.source.get_next_chunk(dst, reactor)
    }

    pub fn on_ready(
        &mut self,
        dst: &mut [u8],
        reactor: &mut dyn Reactor,
    ) -> Result<Option<ChunkResult>, StreamError> {
        self.source.on_ready(dst, reactor)
    }

    pub fn encoder_handle(&self) -> SharedEncoder<E> {
        self.encoder.clone()
    }

    pub fn source(&self) -> &ByteStreamSource<ElementaryStreamChunker<SharedEncoder<E>>> {
        &self.source
    }

    pub fn source_mut(
        &mut self,
    ) -> &mut ByteStreamSource<ElementaryStreamChunker<SharedEncoder<E>>> {
        &mut self.source
    }

    pub fn handle(&self) -> SourceHandle {
        self.source.handle()
    }

    pub fn mode(&self) -> FeedMode {
        self.mode
    }

    pub fn stats(&self) -> ChunkerStats {
        self.source.provider().stats()
    }

    pub fn is_closed(&self) -> bool {
        self.source.is_closed()
    }

    /// Stops the producer, closes the stream and tears the encoder down.
    ///
    /// The summary is `None` without a producer, or when its failure was already reported
    /// through a chunk request.
    pub fn finish(
        mut self,
        reactor: &mut dyn Reactor,
    ) -> Result<Option<ProducerSummary>, StreamError> {
        let summary = self.source.provider_mut().finish_producer();
        self.source.close(reactor);
        summary
    }
}

/// Stops and shuts down an encoder that never made it into a stream.
fn abandon<E: HardwareEncoder>(encoder: &mut SharedEncoder<E>) {
    for (op, result) in [
        (EncoderOp::Stop, encoder.stop()),
        (EncoderOp::Shutdown, encoder.shutdown()),
    ] {
        if let Err(err) = result {
            tracing::warn!(%op, error = %err, "encoder teardown after failed start");
        }
    }
}
