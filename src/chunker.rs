use crate::producer::{FrameProducer, FrameSource, ProducerSummary};
use crate::{CodedAccessUnit, EncoderOp, HardwareEncoder, PopOutcome, StreamError};

/// Historical access-unit ceiling of the board SDK.
pub const DEFAULT_STAGING_CAPACITY: usize = 1_000_000;

/// Popped bytes that have not been delivered yet.
///
/// The first `leftover` bytes of `data` are valid, in delivery order. Everything past that is
/// scratch space.
#[derive(Debug)]
pub struct StagingBuffer {
    data: Vec<u8>,
    leftover: usize,
}

impl StagingBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            leftover: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn leftover_len(&self) -> usize {
        self.leftover
    }

    pub fn is_empty(&self) -> bool {
        self.leftover == 0
    }

    /// Concatenates every NAL unit of `unit` at the head of the buffer.
    fn stage(&mut self, unit: &CodedAccessUnit) -> Result<usize, StreamError> {
        debug_assert!(self.is_empty(), "staging over undelivered bytes");
        let size = unit.byte_len();
        if size > self.data.len() {
            return Err(StreamError::CapacityExceeded {
                size,
                capacity: self.data.len(),
            });
        }
        let mut offset = 0usize;
        for nal in &unit.nalus {
            let end = offset + nal.data.len();
            self.data[offset..end].copy_from_slice(&nal.data);
            offset = end;
        }
        self.leftover = offset;
        Ok(offset)
    }

    /// Moves up to `dst.len()` leftover bytes into `dst` and shifts the rest to the head.
    fn drain_into(&mut self, dst: &mut [u8]) -> usize {
        let n = self.leftover.min(dst.len());
        dst[..n].copy_from_slice(&self.data[..n]);
        self.data.copy_within(n..self.leftover, 0);
        self.leftover -= n;
        n
    }

    fn discard(&mut self) -> usize {
        std::mem::take(&mut self.leftover)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    Delivered(usize),
    /// The encoder has nothing yet. Poll again.
    NotReady,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkerState {
    Streaming,
    Closed,
    Faulted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkerStats {
    pub pushes: u64,
    pub pops: u64,
    pub empty_pops: u64,
    pub units: u64,
    pub dropped_units: u64,
    pub bytes_delivered: u64,
}

/// Turns push/pop encoder output into caller-sized chunks.
///
/// A request first drains leftover bytes from the previous access unit. Only when nothing is
/// staged does it drive the encoder, submitting at most one frame per request cycle and popping
/// at most one access unit. A cycle ends when a pop yields data, so repeated empty polls never
/// push again.
///
/// When a [`FrameProducer`] feeds the encoder, an empty pop also checks whether the producer
/// has exited. A producer that died on an error faults the stream.
pub struct ElementaryStreamChunker<E> {
    encoder: E,
    staging: StagingBuffer,
    frames: Option<Box<dyn FrameSource + Send>>,
    producer: Option<FrameProducer>,
    producer_summary: Option<ProducerSummary>,
    cycle_pushed: bool,
    last_frame_pushed: bool,
    last_unit_popped: bool,
    torn_down: bool,
    state: ChunkerState,
    stats: ChunkerStats,
}

impl<E> ElementaryStreamChunker<E>
where
    E: HardwareEncoder,
{
    /// Chunker over an encoder that some other party feeds.
    pub fn new(encoder: E, staging_capacity: usize) -> Self {
        Self {
            encoder,
            staging: StagingBuffer::with_capacity(staging_capacity),
            frames: None,
            producer: None,
            producer_summary: None,
            cycle_pushed: false,
            last_frame_pushed: false,
            last_unit_popped: false,
            torn_down: false,
            state: ChunkerState::Streaming,
            stats: ChunkerStats::default(),
        }
    }

    /// Chunker that also submits frames from `frames`, one per request cycle.
    pub fn with_frame_source<F>(encoder: E, staging_capacity: usize, frames: F) -> Self
    where
        F: FrameSource + Send + 'static,
    {
        let mut this = Self::new(encoder, staging_capacity);
        this.frames = Some(Box::new(frames));
        this
    }

    /// Chunker over an encoder fed by `producer`. The producer is joined when it exits.
    pub fn with_producer(encoder: E, staging_capacity: usize, producer: FrameProducer) -> Self {
        let mut this = Self::new(encoder, staging_capacity);
        this.producer = Some(producer);
        this
    }

    pub fn fill(&mut self, dst: &mut [u8]) -> Result<FillOutcome, StreamError> {
        if self.state != ChunkerState::Streaming {
            return Ok(FillOutcome::Closed);
        }
        if dst.is_empty() {
            return Ok(FillOutcome::NotReady);
        }

        if !self.staging.is_empty() {
            let n = self.staging.drain_into(dst);
            tracing::debug!(
                delivered = n,
                leftover = self.staging.leftover_len(),
                "flushed staged bytes"
            );
            self.stats.bytes_delivered += n as u64;
            return Ok(FillOutcome::Delivered(n));
        }

        if self.last_unit_popped {
            tracing::info!("last access unit delivered, closing encoder stream");
            self.close();
            return Ok(FillOutcome::Closed);
        }

        if let Err(err) = self.submit_frame() {
            return Err(self.fail(err));
        }

        let unit = match self.encoder.pop() {
            Ok(PopOutcome::Empty) => {
                self.stats.pops += 1;
                self.stats.empty_pops += 1;
                tracing::trace!("encoder has no output yet");
                if let Err(err) = self.reap_producer() {
                    return Err(self.fail(err));
                }
                return Ok(FillOutcome::NotReady);
            }
            Ok(PopOutcome::Unit(unit)) => unit,
            Err(err) => return Err(self.fail(err)),
        };
        self.stats.pops += 1;
        self.cycle_pushed = false;
        if unit.last {
            self.last_unit_popped = true;
        }

        let staged = match self.staging.stage(&unit) {
            Ok(staged) => staged,
            Err(err) => {
                self.stats.dropped_units += 1;
                tracing::warn!(%unit, error = %err, "dropping oversize access unit");
                return Err(err);
            }
        };
        self.stats.units += 1;
        tracing::debug!(%unit, size = staged, "staged access unit");

        if staged == 0 {
            if self.last_unit_popped {
                self.close();
                return Ok(FillOutcome::Closed);
            }
            return Ok(FillOutcome::NotReady);
        }

        let n = self.staging.drain_into(dst);
        self.stats.bytes_delivered += n as u64;
        Ok(FillOutcome::Delivered(n))
    }

    fn submit_frame(&mut self) -> Result<(), StreamError> {
        if self.cycle_pushed || self.last_frame_pushed {
            return Ok(());
        }
        let Some(frames) = self.frames.as_mut() else {
            return Ok(());
        };
        match frames.next_frame()? {
            Some(frame) => {
                let last = frame.last;
                self.encoder.push(frame)?;
                self.stats.pushes += 1;
                self.cycle_pushed = true;
                self.last_frame_pushed = last;
            }
            None => {
                tracing::warn!(
                    pushes = self.stats.pushes,
                    "frame source ran dry without a last frame, encoder output may never end"
                );
                self.last_frame_pushed = true;
            }
        }
        Ok(())
    }

    fn reap_producer(&mut self) -> Result<(), StreamError> {
        if !self.producer.as_ref().is_some_and(FrameProducer::is_finished) {
            return Ok(());
        }
        if let Some(producer) = self.producer.take() {
            self.producer_summary = Some(producer.join()?);
        }
        Ok(())
    }

    /// Cancels and joins the producer if it is still attached.
    ///
    /// Returns the summary of a producer that finished cleanly. A producer whose failure
    /// already faulted the stream yields `None`.
    pub fn finish_producer(&mut self) -> Result<Option<ProducerSummary>, StreamError> {
        if let Some(producer) = self.producer.take() {
            producer.cancel();
            self.producer_summary = Some(producer.join()?);
        }
        Ok(self.producer_summary)
    }

    fn fail(&mut self, err: StreamError) -> StreamError {
        tracing::warn!(error = %err, "encoder stream failed, tearing down");
        self.state = ChunkerState::Faulted;
        self.staging.discard();
        self.teardown();
        err
    }

    /// Ends the stream. Leftover bytes are dropped and the encoder is stopped.
    pub fn close(&mut self) {
        if self.state == ChunkerState::Streaming {
            self.state = ChunkerState::Closed;
        }
        self.staging.discard();
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        if let Some(producer) = &self.producer {
            producer.cancel();
        }
        for (op, result) in [
            (EncoderOp::Stop, self.encoder.stop()),
            (EncoderOp::Shutdown, self.encoder.shutdown()),
        ] {
            if let Err(err) = result {
                tracing::warn!(%op, error = %err, "encoder teardown step failed");
            }
        }
    }

    pub fn discard_leftover(&mut self) -> usize {
        self.staging.discard()
    }

    pub fn leftover_len(&self) -> usize {
        self.staging.leftover_len()
    }

    pub fn staging_capacity(&self) -> usize {
        self.staging.capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.state != ChunkerState::Streaming
    }

    pub fn is_faulted(&self) -> bool {
        self.state == ChunkerState::Faulted
    }

    pub fn stats(&self) -> ChunkerStats {
        self.stats
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    pub fn encoder_mut(&mut self) -> &mut E {
        &mut self.encoder
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::producer::SharedEncoder;
    use crate::simulated::{ScriptedEncoder, scripted_unit};
    use crate::{PixelFormat, RawFrame};

    fn drain_all<E: HardwareEncoder>(
        chunker: &mut ElementaryStreamChunker<E>,
        max: usize,
    ) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; max];
        for _ in 0..10_000 {
            match chunker.fill(&mut buf).unwrap() {
                FillOutcome::Delivered(n) => out.extend_from_slice(&buf[..n]),
                FillOutcome::NotReady => {}
                FillOutcome::Closed => return out,
            }
        }
        panic!("chunker never closed");
    }

    #[test]
    fn staging_buffer_shifts_leftover_to_head() {
        let mut staging = StagingBuffer::with_capacity(16);
        let unit = scripted_unit(&[10], false, 0);
        staging.stage(&unit).unwrap();
        let expected = unit.nalus[0].data.clone();

        let mut dst = [0u8; 4];
        assert_eq!(staging.drain_into(&mut dst), 4);
        assert_eq!(&dst, &expected[..4]);
        assert_eq!(staging.leftover_len(), 6);
        let mut rest = [0u8; 8];
        assert_eq!(staging.drain_into(&mut rest), 6);
        assert_eq!(&rest[..6], &expected[4..]);
        assert!(staging.is_empty());
    }

    #[test]
    fn oversize_unit_is_reported_and_stream_continues() {
        let encoder = ScriptedEncoder::new(vec![
            PopOutcome::Unit(scripted_unit(&[64], false, 0)),
            PopOutcome::Unit(scripted_unit(&[8], true, 1)),
        ]);
        let mut chunker = ElementaryStreamChunker::new(encoder, 32);
        let mut buf = [0u8; 32];

        let err = chunker.fill(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            StreamError::CapacityExceeded {
                size: 64,
                capacity: 32
            }
        ));
        assert!(err.is_recoverable());
        assert!(!chunker.is_closed());

        assert_eq!(chunker.fill(&mut buf).unwrap(), FillOutcome::Delivered(8));
        assert_eq!(chunker.fill(&mut buf).unwrap(), FillOutcome::Closed);
        assert_eq!(chunker.stats().dropped_units, 1);
    }

    #[test]
    fn pop_fault_tears_down_once_and_then_reports_closed() {
        let mut encoder = ScriptedEncoder::new(Vec::new());
        encoder.fail_pop_after(0);
        let mut chunker = ElementaryStreamChunker::new(encoder, 1024);
        let mut buf = [0u8; 16];

        assert!(matches!(
            chunker.fill(&mut buf),
            Err(StreamError::EncoderFault {
                op: EncoderOp::Pop,
                ..
            })
        ));
        assert!(chunker.is_faulted());
        let pops = chunker.encoder().pop_calls();
        assert_eq!(chunker.fill(&mut buf).unwrap(), FillOutcome::Closed);
        assert_eq!(chunker.encoder().pop_calls(), pops);
        assert_eq!(chunker.encoder().stop_calls(), 1);
        assert_eq!(chunker.encoder().shutdown_calls(), 1);
    }

    #[test]
    fn frame_source_pushes_once_per_cycle_and_stops_after_last() {
        let frames: VecDeque<RawFrame> = (0..2)
            .map(|i| RawFrame {
                index: i,
                pts: i as u32,
                data: vec![0; 4],
                last: i == 1,
                format: PixelFormat::Nv12,
            })
            .collect();
        let encoder = ScriptedEncoder::new(vec![
            PopOutcome::Empty,
            PopOutcome::Empty,
            PopOutcome::Unit(scripted_unit(&[6], false, 0)),
            PopOutcome::Unit(scripted_unit(&[6], false, 1)),
            PopOutcome::Empty,
            PopOutcome::Unit(scripted_unit(&[6], true, 2)),
        ]);
        let mut chunker = ElementaryStreamChunker::with_frame_source(encoder, 1024, frames);
        let out = drain_all(&mut chunker, 64);

        assert_eq!(out.len(), 18);
        assert_eq!(chunker.encoder().push_calls(), 2);
        assert_eq!(chunker.stats().empty_pops, 3);
        assert_eq!(chunker.encoder().stop_calls(), 1);
    }

    #[test]
    fn frame_source_without_last_frame_stops_pushing() {
        let frames: VecDeque<RawFrame> = (0..2)
            .map(|i| RawFrame {
                index: i,
                pts: i as u32,
                data: vec![0; 4],
                last: false,
                format: PixelFormat::Nv12,
            })
            .collect();
        let encoder = ScriptedEncoder::new(vec![
            PopOutcome::Unit(scripted_unit(&[6], false, 0)),
            PopOutcome::Unit(scripted_unit(&[6], false, 1)),
        ]);
        let mut chunker = ElementaryStreamChunker::with_frame_source(encoder, 1024, frames);
        let mut buf = [0u8; 64];

        assert_eq!(chunker.fill(&mut buf).unwrap(), FillOutcome::Delivered(6));
        assert_eq!(chunker.fill(&mut buf).unwrap(), FillOutcome::Delivered(6));
        for _ in 0..3 {
            assert_eq!(chunker.fill(&mut buf).unwrap(), FillOutcome::NotReady);
        }
        assert_eq!(chunker.encoder().push_calls(), 2);
        assert!(!chunker.is_closed());
    }

    #[test]
    fn producer_push_fault_faults_the_stream_once() {
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
        let shared = SharedEncoder::new(encoder);
        let producer = FrameProducer::spawn(frames, shared.clone());
        let mut chunker = ElementaryStreamChunker::with_producer(shared.clone(), 64, producer);
        let mut buf = [0u8; 16];

        let mut fault = None;
        for _ in 0..2_000 {
            match chunker.fill(&mut buf) {
                Ok(FillOutcome::NotReady) => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Ok(other) => panic!("unexpected fill outcome {other:?}"),
                Err(err) => {
                    fault = Some(err);
                    break;
                }
            }
        }
        assert!(matches!(
            fault,
            Some(StreamError::EncoderFault {
                op: EncoderOp::Push,
                ..
            })
        ));
        assert!(chunker.is_faulted());
        assert_eq!(chunker.fill(&mut buf).unwrap(), FillOutcome::Closed);
        assert_eq!(shared.with(ScriptedEncoder::stop_calls), Some(1));
        assert_eq!(shared.with(ScriptedEncoder::shutdown_calls), Some(1));
        assert_eq!(chunker.finish_producer().unwrap(), None);
    }

    #[test]
    fn empty_dst_does_not_touch_encoder() {
        let encoder = ScriptedEncoder::new(vec![PopOutcome::Unit(scripted_unit(&[4], true, 0))]);
        let mut chunker = ElementaryStreamChunker::new(encoder, 64);
        assert_eq!(chunker.fill(&mut []).unwrap(), FillOutcome::NotReady);
        assert_eq!(chunker.encoder().pop_calls(), 0);
    }

    #[test]
    fn close_discards_leftover() {
        let encoder = ScriptedEncoder::new(vec![PopOutcome::Unit(scripted_unit(&[40], false, 0))]);
        let mut chunker = ElementaryStreamChunker::new(encoder, 64);
        let mut buf = [0u8; 10];
        assert_eq!(chunker.fill(&mut buf).unwrap(), FillOutcome::Delivered(10));
        assert_eq!(chunker.leftover_len(), 30);
        chunker.close();
        assert_eq!(chunker.leftover_len(), 0);
        assert_eq!(chunker.fill(&mut buf).unwrap(), FillOutcome::Closed);
    }
}
