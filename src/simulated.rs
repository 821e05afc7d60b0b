use std::collections::VecDeque;
use std::{fmt, fmt::Display};

use crate::nal::{
    NAL_IDR_W_RADL, NAL_PPS, NAL_SPS, NAL_TRAIL_N, NAL_TRAIL_R, NAL_VPS, annexb_nal,
};
use crate::{
    CodedAccessUnit, EncoderConfig, EncoderOp, FrameType, GopType, HardwareEncoder, NalUnit,
    PopOutcome, RawFrame, StreamError,
};

const MIN_SLICE_BYTES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    Created,
    Initialized,
    Running,
    Stopped,
    Shutdown,
}

impl Display for EncoderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Initialized => f.write_str("initialized"),
            Self::Running => f.write_str("running"),
            Self::Stopped => f.write_str("stopped"),
            Self::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// Software stand-in for the encoder board.
///
/// Produces syntactically plausible Annex-B access units sized from the configured bitrate. The
/// slice payload is filler; only the NAL structure and the push/pop timing behave like the
/// hardware.
#[derive(Debug)]
pub struct SimulatedEncoder {
    config: Option<EncoderConfig>,
    state: EncoderState,
    held: VecDeque<CodedAccessUnit>,
    ready: VecDeque<CodedAccessUnit>,
    frames_pushed: u64,
    units_emitted: u64,
    last_pushed: bool,
    filler_seed: u32,
}

impl Default for SimulatedEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedEncoder {
    pub fn new() -> Self {
        Self {
            config: None,
            state: EncoderState::Created,
            held: VecDeque::new(),
            ready: VecDeque::new(),
            frames_pushed: 0,
            units_emitted: 0,
            last_pushed: false,
            filler_seed: 0x2545_f491,
        }
    }

    /// Initialized and started encoder.
    pub fn started(config: &EncoderConfig) -> Result<Self, StreamError> {
        let mut encoder = Self::new();
        encoder.init(config)?;
        encoder.start()?;
        Ok(encoder)
    }

    pub fn state(&self) -> EncoderState {
        self.state
    }

    pub fn frames_pushed(&self) -> u64 {
        self.frames_pushed
    }

    pub fn units_emitted(&self) -> u64 {
        self.units_emitted
    }

    /// Units pushed but not yet poppable.
    pub fn latency(&self) -> usize {
        self.held.len()
    }

    fn require(&self, op: EncoderOp, expected: EncoderState) -> Result<(), StreamError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(StreamError::encoder(
                op,
                format!("encoder is {}, expected {expected}", self.state),
            ))
        }
    }

    fn frame_type_for(config: &EncoderConfig, index: u64) -> FrameType {
        let position = index % u64::from(config.gop_size);
        if position == 0 {
            return FrameType::I;
        }
        match config.gop_type {
            GopType::IOnly => FrameType::I,
            GopType::Ip => FrameType::P,
            GopType::Ib if position % (u64::from(config.b_frames) + 1) == 0 => FrameType::P,
            GopType::Ib => FrameType::B,
        }
    }

    fn slice_size(config: &EncoderConfig, frame_type: FrameType) -> usize {
        let per_frame =
            config.bitrate_kbps as usize * 1000 / 8 / config.frame_rate.per_second() as usize;
        let size = match frame_type {
            FrameType::I => per_frame * 4,
            FrameType::P | FrameType::Unknown => per_frame,
            FrameType::B => per_frame / 2,
        };
        size.max(MIN_SLICE_BYTES)
    }

    /// Nonzero filler, so slice data never emulates a start code.
    fn filler(&mut self, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        out.push(0x80 | 0x2f);
        while out.len() < len {
            self.filler_seed ^= self.filler_seed << 13;
            self.filler_seed ^= self.filler_seed >> 17;
            self.filler_seed ^= self.filler_seed << 5;
            out.push((self.filler_seed % 255) as u8 + 1);
        }
        out
    }

    fn parameter_sets(config: &EncoderConfig) -> [NalUnit; 3] {
        let (w, h) = config.resolution.dimensions();
        let profile = config.profile as u8 + 1;
        let level = config.level as u8 + 1;
        [
            annexb_nal(NAL_VPS, &[0x0c, 0x01, 0xff, 0xff, profile, level]),
            annexb_nal(
                NAL_SPS,
                &[
                    0x01,
                    profile,
                    level,
                    (w >> 4) as u8 | 0x01,
                    (h >> 4) as u8 | 0x01,
                    config.chroma_format as u8 + 1,
                    config.bit_depth as u8 + 1,
                ],
            ),
            annexb_nal(NAL_PPS, &[0xc1, 0x72, 0xb4, 0x62, 0x40]),
        ]
    }

    fn encode(&mut self, config: &EncoderConfig, frame: &RawFrame) -> CodedAccessUnit {
        let frame_type = Self::frame_type_for(config, frame.index);
        let at_gop_start = frame.index % u64::from(config.gop_size) == 0;
        let mut nalus = Vec::with_capacity(4);
        if at_gop_start {
            nalus.extend(Self::parameter_sets(config));
        }
        let nal_type = match frame_type {
            FrameType::I => NAL_IDR_W_RADL,
            FrameType::B => NAL_TRAIL_N,
            FrameType::P | FrameType::Unknown => NAL_TRAIL_R,
        };
        let body = self.filler(Self::slice_size(config, frame_type));
        nalus.push(annexb_nal(nal_type, &body));
        CodedAccessUnit {
            nalus,
            frame_type,
            pts: frame.pts,
            last: false,
        }
    }
}

impl HardwareEncoder for SimulatedEncoder {
    fn init(&mut self, config: &EncoderConfig) -> Result<(), StreamError> {
        self.require(EncoderOp::Init, EncoderState::Created)?;
        config.validate()?;
        tracing::info!(%config, "simulated encoder initialized");
        self.config = Some(config.clone());
        self.state = EncoderState::Initialized;
        Ok(())
    }

    fn start(&mut self) -> Result<(), StreamError> {
        self.require(EncoderOp::Start, EncoderState::Initialized)?;
        self.state = EncoderState::Running;
        Ok(())
    }

    fn push(&mut self, frame: RawFrame) -> Result<(), StreamError> {
        self.require(EncoderOp::Push, EncoderState::Running)?;
        let Some(config) = self.config.clone() else {
            return Err(StreamError::encoder(EncoderOp::Push, "encoder has no config"));
        };
        if self.last_pushed {
            return Err(StreamError::encoder(
                EncoderOp::Push,
                "frame pushed after the last frame",
            ));
        }
        let expected = config.image_size();
        if frame.data.len() != expected {
            return Err(StreamError::encoder(
                EncoderOp::Push,
                format!(
                    "frame {} is {} bytes, expected {expected}",
                    frame.index,
                    frame.data.len()
                ),
            ));
        }

        let unit = self.encode(&config, &frame);
        self.frames_pushed += 1;
        self.held.push_back(unit);

        if frame.last {
            self.last_pushed = true;
            self.ready.extend(self.held.drain(..));
            if let Some(tail) = self.ready.back_mut() {
                tail.last = true;
            }
        } else {
            while self.held.len() > usize::from(config.b_frames) {
                if let Some(unit) = self.held.pop_front() {
                    self.ready.push_back(unit);
                }
            }
        }
        Ok(())
    }

    fn pop(&mut self) -> Result<PopOutcome, StreamError> {
        self.require(EncoderOp::Pop, EncoderState::Running)?;
        Ok(match self.ready.pop_front() {
            Some(unit) => {
                self.units_emitted += 1;
                PopOutcome::Unit(unit)
            }
            None => PopOutcome::Empty,
        })
    }

    fn stop(&mut self) -> Result<(), StreamError> {
        match self.state {
            EncoderState::Initialized | EncoderState::Running => {
                self.state = EncoderState::Stopped;
                Ok(())
            }
            _ => self.require(EncoderOp::Stop, EncoderState::Running),
        }
    }

    fn shutdown(&mut self) -> Result<(), StreamError> {
        if self.state == EncoderState::Shutdown {
            return Err(StreamError::encoder(
                EncoderOp::Shutdown,
                "encoder already shut down",
            ));
        }
        self.held.clear();
        self.ready.clear();
        self.state = EncoderState::Shutdown;
        tracing::info!(
            frames = self.frames_pushed,
            units = self.units_emitted,
            "simulated encoder shut down"
        );
        Ok(())
    }
}

/// Test double that replays a fixed sequence of pop outcomes.
///
/// Once the script runs out every pop is `Empty`. Pushes are counted and otherwise ignored.
#[derive(Debug, Default)]
pub struct ScriptedEncoder {
    script: VecDeque<PopOutcome>,
    fail_pop_after: Option<usize>,
    fail_push_after: Option<usize>,
    push_calls: usize,
    pop_calls: usize,
    stop_calls: usize,
    shutdown_calls: usize,
}

impl ScriptedEncoder {
    pub fn new(script: Vec<PopOutcome>) -> Self {
        Self {
            script: script.into(),
            ..Self::default()
        }
    }

    /// The pop after `n` successful pops fails with a fault.
    pub fn fail_pop_after(&mut self, n: usize) {
        self.fail_pop_after = Some(n);
    }

    pub fn fail_push_after(&mut self, n: usize) {
        self.fail_push_after = Some(n);
    }

    pub fn push_calls(&self) -> usize {
        self.push_calls
    }

    pub fn pop_calls(&self) -> usize {
        self.pop_calls
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls
    }

    pub fn shutdown_calls(&self) -> usize {
        self.shutdown_calls
    }
}

impl HardwareEncoder for ScriptedEncoder {
    fn init(&mut self, _config: &EncoderConfig) -> Result<(), StreamError> {
        Ok(())
    }

    fn start(&mut self) -> Result<(), StreamError> {
        Ok(())
    }

    fn push(&mut self, _frame: RawFrame) -> Result<(), StreamError> {
        let before = self.push_calls;
        self.push_calls += 1;
        if self.fail_push_after.is_some_and(|n| before >= n) {
            return Err(StreamError::encoder(EncoderOp::Push, "scripted push failure"));
        }
        Ok(())
    }

    fn pop(&mut self) -> Result<PopOutcome, StreamError> {
        let before = self.pop_calls;
        self.pop_calls += 1;
        if self.fail_pop_after.is_some_and(|n| before >= n) {
            return Err(StreamError::encoder(EncoderOp::Pop, "scripted pop failure"));
        }
        Ok(self.script.pop_front().unwrap_or(PopOutcome::Empty))
    }

    fn stop(&mut self) -> Result<(), StreamError> {
        self.stop_calls += 1;
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), StreamError> {
        self.shutdown_calls += 1;
        Ok(())
    }
}

/// Access unit with one NAL per entry of `sizes`, each exactly that many bytes long.
///
/// Bytes are a deterministic function of `pts` and position so reassembled output can be
/// compared byte for byte.
pub fn scripted_unit(sizes: &[usize], last: bool, pts: u32) -> CodedAccessUnit {
    let nalus = sizes
        .iter()
        .enumerate()
        .map(|(n, &size)| NalUnit {
            nal_type: NAL_TRAIL_R,
            data: (0..size)
                .map(|i| ((pts as usize * 7 + n * 13 + i) % 251) as u8)
                .collect(),
        })
        .collect();
    CodedAccessUnit {
        nalus,
        frame_type: if pts == 0 { FrameType::I } else { FrameType::P },
        pts,
        last,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nal::nal_type_of;
    use crate::{PixelFormat, Resolution};

    fn small_config() -> EncoderConfig {
        EncoderConfig {
            resolution: Resolution::R720x480,
            gop_size: 4,
            b_frames: 1,
            bitrate_kbps: 400,
            ..EncoderConfig::default()
        }
    }

    fn frame(config: &EncoderConfig, index: u64, last: bool) -> RawFrame {
        RawFrame {
            index,
            pts: index as u32,
            data: vec![0x10; config.image_size()],
            last,
            format: PixelFormat::Nv12,
        }
    }

    fn pop_unit(encoder: &mut SimulatedEncoder) -> Option<CodedAccessUnit> {
        match encoder.pop().unwrap() {
            PopOutcome::Unit(unit) => Some(unit),
            PopOutcome::Empty => None,
        }
    }

    #[test]
    fn lifecycle_order_is_enforced() {
        let mut encoder = SimulatedEncoder::new();
        assert!(matches!(
            encoder.start(),
            Err(StreamError::EncoderFault {
                op: EncoderOp::Start,
                ..
            })
        ));
        encoder.init(&small_config()).unwrap();
        assert!(encoder.pop().is_err());
        encoder.start().unwrap();
        assert!(matches!(encoder.pop().unwrap(), PopOutcome::Empty));
        encoder.stop().unwrap();
        encoder.shutdown().unwrap();
        assert_eq!(encoder.state(), EncoderState::Shutdown);
    }

    #[test]
    fn init_rejects_invalid_config() {
        let mut encoder = SimulatedEncoder::new();
        let config = EncoderConfig {
            b_frames: 9,
            ..EncoderConfig::default()
        };
        assert!(matches!(
            encoder.init(&config),
            Err(StreamError::InvalidConfig(_))
        ));
    }

    #[test]
    fn wrong_frame_size_is_a_push_fault() {
        let config = small_config();
        let mut encoder = SimulatedEncoder::started(&config).unwrap();
        let mut bad = frame(&config, 0, false);
        bad.data.truncate(10);
        assert!(matches!(
            encoder.push(bad),
            Err(StreamError::EncoderFault {
                op: EncoderOp::Push,
                ..
            })
        ));
    }

    #[test]
    fn b_frame_latency_and_final_flush() {
        let config = small_config();
        let mut encoder = SimulatedEncoder::started(&config).unwrap();

        encoder.push(frame(&config, 0, false)).unwrap();
        assert!(pop_unit(&mut encoder).is_none());
        assert_eq!(encoder.latency(), 1);

        encoder.push(frame(&config, 1, false)).unwrap();
        let first = pop_unit(&mut encoder).unwrap();
        assert_eq!(first.frame_type, FrameType::I);
        assert_eq!(
            first.nalus.iter().map(|n| n.nal_type).collect::<Vec<_>>(),
            vec![NAL_VPS, NAL_SPS, NAL_PPS, NAL_IDR_W_RADL]
        );

        encoder.push(frame(&config, 2, true)).unwrap();
        let second = pop_unit(&mut encoder).unwrap();
        let third = pop_unit(&mut encoder).unwrap();
        assert_eq!(second.frame_type, FrameType::B);
        assert!(!second.last);
        assert_eq!(third.frame_type, FrameType::P);
        assert!(third.last);
        assert!(pop_unit(&mut encoder).is_none());
        assert!(encoder.push(frame(&config, 3, false)).is_err());
    }

    #[test]
    fn nal_headers_match_declared_types() {
        let config = small_config();
        let mut encoder = SimulatedEncoder::started(&config).unwrap();
        encoder.push(frame(&config, 0, true)).unwrap();
        let unit = pop_unit(&mut encoder).unwrap();
        for nal in &unit.nalus {
            assert_eq!(&nal.data[..4], &[0, 0, 0, 1]);
            assert_eq!(nal_type_of(&nal.data[4..]), Some(nal.nal_type));
            assert!(nal.data[4..].iter().all(|&b| b != 0));
        }
    }

    #[test]
    fn scripted_unit_sizes_are_exact() {
        let unit = scripted_unit(&[3, 0, 17], false, 2);
        assert_eq!(
            unit.nalus.iter().map(|n| n.data.len()).collect::<Vec<_>>(),
            vec![3, 0, 17]
        );
        assert_eq!(unit.byte_len(), 20);
    }
}
