use std::{fmt, fmt::Display};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    I,
    P,
    B,
    Unknown,
}

impl Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::I => f.write_str("'I'"),
            Self::P => f.write_str("'P'"),
            Self::B => f.write_str("'B'"),
            Self::Unknown => f.write_str("'?'"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Nv12,
    Yuv420p,
}

/// One uncompressed picture handed to the encoder.
///
/// Ownership moves into [`HardwareEncoder::push`]; the frame is not referenced afterwards.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub index: u64,
    pub pts: u32,
    pub data: Vec<u8>,
    pub last: bool,
    pub format: PixelFormat,
}

/// A single NAL unit as produced by the encoder, start code included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NalUnit {
    pub nal_type: u8,
    pub data: Vec<u8>,
}

/// One popped encoder output unit. Consumed immediately by the chunker and never retained.
#[derive(Debug, Clone)]
pub struct CodedAccessUnit {
    pub nalus: Vec<NalUnit>,
    pub frame_type: FrameType,
    pub pts: u32,
    pub last: bool,
}

impl CodedAccessUnit {
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.nalus.iter().map(|nal| nal.data.len()).sum()
    }
}

impl Display for CodedAccessUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} pts={} last={}",
            self.frame_type,
            self.pts,
            u8::from(self.last)
        )?;
        for nal in &self.nalus {
            write!(f, " NalType={}", nal.nal_type)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum PopOutcome {
    Unit(CodedAccessUnit),
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    Data,
    Vif,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Main,
    Main10,
    Main422_10,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    L30,
    L31,
    L40,
    L41,
    L50,
    L51,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Main,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    R720x480,
    R720x576,
    R1280x720,
    R1920x1080,
    R3840x2160,
}

impl Resolution {
    #[must_use]
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            Self::R720x480 => (720, 480),
            Self::R720x576 => (720, 576),
            Self::R1280x720 => (1280, 720),
            Self::R1920x1080 => (1920, 1080),
            Self::R3840x2160 => (3840, 2160),
        }
    }

    pub fn from_dimensions(width: u32, height: u32) -> Result<Self, StreamError> {
        match (width, height) {
            (720, 480) => Ok(Self::R720x480),
            (720, 576) => Ok(Self::R720x576),
            (1280, 720) => Ok(Self::R1280x720),
            (1920, 1080) => Ok(Self::R1920x1080),
            (3840, 2160) => Ok(Self::R3840x2160),
            _ => Err(StreamError::InvalidConfig(format!(
                "unsupported resolution {width}x{height}"
            ))),
        }
    }
}

impl Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (w, h) = self.dimensions();
        write!(f, "{w}x{h}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChromaFormat {
    Yuv420,
    Yuv422,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitDepth {
    Eight,
    Ten,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GopType {
    IOnly,
    Ip,
    Ib,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRate {
    Fps24,
    Fps25,
    Fps30,
    Fps50,
    Fps60,
}

impl FrameRate {
    #[must_use]
    pub fn per_second(self) -> u32 {
        match self {
            Self::Fps24 => 24,
            Self::Fps25 => 25,
            Self::Fps30 => 30,
            Self::Fps50 => 50,
            Self::Fps60 => 60,
        }
    }

    #[must_use]
    pub fn frame_interval_micros(self) -> u32 {
        1_000_000 / self.per_second()
    }

    pub fn from_fps(fps: u32) -> Result<Self, StreamError> {
        match fps {
            24 => Ok(Self::Fps24),
            25 => Ok(Self::Fps25),
            30 => Ok(Self::Fps30),
            50 => Ok(Self::Fps50),
            60 => Ok(Self::Fps60),
            _ => Err(StreamError::InvalidConfig(format!(
                "unsupported frame rate {fps}"
            ))),
        }
    }
}

pub const MAX_B_FRAMES: u8 = 7;

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub input_mode: InputMode,
    pub profile: Profile,
    pub level: Level,
    pub tier: Tier,
    pub resolution: Resolution,
    pub chroma_format: ChromaFormat,
    pub bit_depth: BitDepth,
    pub gop_type: GopType,
    pub gop_size: u16,
    pub b_frames: u8,
    pub frame_rate: FrameRate,
    pub bitrate_kbps: u32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            input_mode: InputMode::Data,
            profile: Profile::Main,
            level: Level::L40,
            tier: Tier::Main,
            resolution: Resolution::R720x576,
            chroma_format: ChromaFormat::Yuv420,
            bit_depth: BitDepth::Eight,
            gop_type: GopType::Ib,
            gop_size: 64,
            b_frames: MAX_B_FRAMES,
            frame_rate: FrameRate::Fps24,
            bitrate_kbps: 8000,
        }
    }
}

impl EncoderConfig {
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.bitrate_kbps == 0 {
            return Err(StreamError::InvalidConfig(
                "bitrate must be non-zero".to_string(),
            ));
        }
        if self.gop_size == 0 {
            return Err(StreamError::InvalidConfig(
                "gop size must be non-zero".to_string(),
            ));
        }
        if self.b_frames > MAX_B_FRAMES {
            return Err(StreamError::InvalidConfig(format!(
                "b-frame count {} exceeds maximum of {MAX_B_FRAMES}",
                self.b_frames
            )));
        }
        if self.b_frames > 0 && self.gop_type != GopType::Ib {
            return Err(StreamError::InvalidConfig(format!(
                "b-frames require an IB gop, got {:?}",
                self.gop_type
            )));
        }
        if self.bit_depth == BitDepth::Ten && self.profile == Profile::Main {
            return Err(StreamError::InvalidConfig(
                "10-bit input requires a 10-bit profile".to_string(),
            ));
        }
        if self.chroma_format == ChromaFormat::Yuv422 && self.profile != Profile::Main422_10 {
            return Err(StreamError::InvalidConfig(
                "4:2:2 chroma requires the Main 4:2:2 10 profile".to_string(),
            ));
        }
        Ok(())
    }

    /// Size in bytes of one raw input picture.
    #[must_use]
    pub fn image_size(&self) -> usize {
        let (w, h) = self.resolution.dimensions();
        let luma = w as usize * h as usize;
        let samples = match self.chroma_format {
            ChromaFormat::Yuv420 => luma * 3 / 2,
            ChromaFormat::Yuv422 => luma * 2,
        };
        match self.bit_depth {
            BitDepth::Eight => samples,
            BitDepth::Ten => samples * 2,
        }
    }
}

impl Display for EncoderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EncoderConfig(resolution={}, profile={:?}, level={:?}, gop={:?}/{}, b_frames={}, fps={}, bitrate_kbps={})",
            self.resolution,
            self.profile,
            self.level,
            self.gop_type,
            self.gop_size,
            self.b_frames,
            self.frame_rate.per_second(),
            self.bitrate_kbps
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderOp {
    Init,
    Start,
    Push,
    Pop,
    Stop,
    Shutdown,
}

impl Display for EncoderOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => f.write_str("init"),
            Self::Start => f.write_str("start"),
            Self::Push => f.write_str("push"),
            Self::Pop => f.write_str("pop"),
            Self::Stop => f.write_str("stop"),
            Self::Shutdown => f.write_str("shutdown"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("encoder fault during {op}: {message}")]
    EncoderFault { op: EncoderOp, message: String },
    #[error("access unit of {size} bytes exceeds staging capacity of {capacity} bytes")]
    CapacityExceeded { size: usize, capacity: usize },
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("seek unsupported: {0}")]
    SeekUnsupported(String),
    #[error("a chunk request is already in flight")]
    RequestInFlight,
    #[error("io error during {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl StreamError {
    pub fn encoder(op: EncoderOp, message: impl Into<String>) -> Self {
        Self::EncoderFault {
            op,
            message: message.into(),
        }
    }

    /// Whether the stream can keep going after this error.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. } | Self::RequestInFlight)
    }
}

/// Push/pop boundary of the hardware encoder SDK.
pub trait HardwareEncoder {
    fn init(&mut self, config: &EncoderConfig) -> Result<(), StreamError>;

    fn start(&mut self) -> Result<(), StreamError>;

    fn push(&mut self, frame: RawFrame) -> Result<(), StreamError>;

    fn pop(&mut self) -> Result<PopOutcome, StreamError>;

    fn stop(&mut self) -> Result<(), StreamError>;

    fn shutdown(&mut self) -> Result<(), StreamError>;
}

impl<E: HardwareEncoder + ?Sized> HardwareEncoder for Box<E> {
    fn init(&mut self, config: &EncoderConfig) -> Result<(), StreamError> {
        (**self).init(config)
    }

    fn start(&mut self) -> Result<(), StreamError> {
        (**self).start()
    }

    fn push(&mut self, frame: RawFrame) -> Result<(), StreamError> {
        (**self).push(frame)
    }

    fn pop(&mut self) -> Result<PopOutcome, StreamError> {
        (**self).pop()
    }

    fn stop(&mut self) -> Result<(), StreamError> {
        (**self).stop()
    }

    fn shutdown(&mut self) -> Result<(), StreamError> {
        (**self).shutdown()
    }
}
