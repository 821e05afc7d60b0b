use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use std::{fmt, fmt::Display};

const MICROS_PER_SECOND: u64 = 1_000_000;

/// Wall-clock instant as seconds plus microseconds. `micros` is always below one second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PresentationTime {
    secs: u64,
    micros: u32,
}

impl PresentationTime {
    /// Builds a time, carrying excess microseconds into seconds.
    #[must_use]
    pub fn new(secs: u64, micros: u64) -> Self {
        Self {
            secs: secs.saturating_add(micros / MICROS_PER_SECOND),
            micros: (micros % MICROS_PER_SECOND) as u32,
        }
    }

    #[must_use]
    pub fn from_micros(total: u64) -> Self {
        Self::new(0, total)
    }

    #[must_use]
    pub fn secs(self) -> u64 {
        self.secs
    }

    #[must_use]
    pub fn micros(self) -> u32 {
        self.micros
    }

    #[must_use]
    pub fn as_micros(self) -> u64 {
        self.secs
            .saturating_mul(MICROS_PER_SECOND)
            .saturating_add(u64::from(self.micros))
    }

    #[must_use]
    pub fn advanced_by(self, micros: u32) -> Self {
        Self::new(self.secs, u64::from(self.micros) + u64::from(micros))
    }
}

impl Display for PresentationTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.secs, self.micros)
    }
}

pub trait TimeSource {
    fn now(&self) -> PresentationTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now(&self) -> PresentationTime {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        PresentationTime::new(
            since_epoch.as_secs(),
            u64::from(since_epoch.subsec_micros()),
        )
    }
}

/// Settable clock. Clones share the same reading.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    micros: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn starting_at(time: PresentationTime) -> Self {
        Self {
            micros: Arc::new(AtomicU64::new(time.as_micros())),
        }
    }

    pub fn set(&self, time: PresentationTime) {
        self.micros.store(time.as_micros(), Ordering::Relaxed);
    }

    pub fn advance(&self, micros: u64) {
        self.micros.fetch_add(micros, Ordering::Relaxed);
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> PresentationTime {
        PresentationTime::from_micros(self.micros.load(Ordering::Relaxed))
    }
}

/// Synthetic per-frame play time. Only built when both values are non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    play_time_per_frame: u32,
    preferred_frame_size: u32,
}

impl Pacing {
    #[must_use]
    pub fn new(play_time_per_frame: u32, preferred_frame_size: u32) -> Option<Self> {
        (play_time_per_frame > 0 && preferred_frame_size > 0).then_some(Self {
            play_time_per_frame,
            preferred_frame_size,
        })
    }

    /// `play_time_per_frame * bytes / preferred_frame_size`, in microseconds.
    #[must_use]
    pub fn duration_for(&self, bytes: usize) -> u32 {
        let micros = u64::from(self.play_time_per_frame).saturating_mul(bytes as u64)
            / u64::from(self.preferred_frame_size);
        u32::try_from(micros).unwrap_or(u32::MAX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkStamp {
    pub presentation_time: PresentationTime,
    pub duration_micros: u32,
}

pub struct PresentationClock<C> {
    source: C,
    pacing: Option<Pacing>,
    last: Option<PresentationTime>,
    last_play_time: u32,
}

impl<C> PresentationClock<C>
where
    C: TimeSource,
{
    pub fn new(source: C, pacing: Option<Pacing>) -> Self {
        Self {
            source,
            pacing,
            last: None,
            last_play_time: 0,
        }
    }

    /// Stamps a delivered chunk of `bytes`.
    ///
    /// With pacing, the first chunk takes the wall clock and every later chunk is the previous
    /// stamp advanced by the previous chunk's duration. Without pacing, each chunk takes the
    /// wall clock and carries no duration.
    pub fn stamp(&mut self, bytes: usize) -> ChunkStamp {
        let Some(pacing) = self.pacing else {
            let now = self.source.now();
            self.last = Some(now);
            return ChunkStamp {
                presentation_time: now,
                duration_micros: 0,
            };
        };
        let presentation_time = match self.last {
            None => self.source.now(),
            Some(prev) => prev.advanced_by(self.last_play_time),
        };
        self.last = Some(presentation_time);
        self.last_play_time = pacing.duration_for(bytes);
        ChunkStamp {
            presentation_time,
            duration_micros: self.last_play_time,
        }
    }

    pub fn last_stamp(&self) -> Option<PresentationTime> {
        self.last
    }

    pub fn pacing(&self) -> Option<Pacing> {
        self.pacing
    }
}
