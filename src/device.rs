//! Device-layer contract. The engine drives one PCM endpoint through this
//! trait; the real backend sits in `alsa`, tests use `mock`.

use crate::config::DriverConfig;
use crate::error::Result;
use crate::format::SampleFormat;

/// Capability snapshot of the device configuration space.
#[derive(Debug, Clone)]
pub struct HwSpace {
    /// Encodings supported by both the device and the format table.
    pub formats: Vec<SampleFormat>,
    pub rate_min: u32,
    pub rate_max: u32,
    pub channels_min: u32,
    pub channels_max: u32,
}

/// Hardware parameter request. The format is exact, everything else is
/// resolved to the nearest supported value by the device.
#[derive(Debug, Clone, Copy)]
pub struct HwRequest {
    pub format: SampleFormat,
    pub channels: u32,
    pub rate: u32,
    pub period_size: u32,
    /// Nearest to this, or the device maximum when unset.
    pub buffer_size: Option<u32>,
}

/// What the device actually configured.
#[derive(Debug, Clone, Copy)]
pub struct HwApplied {
    pub format: SampleFormat,
    pub channels: u32,
    pub rate: u32,
    pub period_size: u32,
    pub buffer_frames: u64,
}

/// Software parameter request. `manual_start` keeps the device from
/// auto-starting on the first write; the engine triggers start itself.
#[derive(Debug, Clone, Copy)]
pub struct SwRequest {
    pub timestamps: bool,
    pub manual_start: bool,
    pub period_event: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcmState {
    Prepared,
    Running,
    Xrun,
    Suspended,
    Other,
}

#[derive(Debug, Clone, Copy)]
pub struct PcmStatus {
    pub state: PcmState,
    pub now_nsec: u64,
    pub trigger_nsec: u64,
}

/// Non-fatal and fatal I/O outcomes from `avail` and `mmap_commit`.
#[derive(Debug, Clone)]
pub enum PcmIoError {
    /// Underrun or overrun, recoverable in place.
    Xrun,
    Fatal(String),
}

impl std::fmt::Display for PcmIoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PcmIoError::Xrun => write!(f, "xrun"),
            PcmIoError::Fatal(msg) => write!(f, "{msg}"),
        }
    }
}

pub type IoResult<T> = std::result::Result<T, PcmIoError>;

/// One kernel PCM endpoint, already open in non-blocking mode with automatic
/// resample/channel/format conversion refused.
pub trait PcmDevice {
    fn hw_space(&mut self) -> Result<HwSpace>;

    /// Run the full hardware negotiation: mmap-interleaved access, device
    /// period wake-ups disabled, then commit the request.
    fn commit_hw_params(&mut self, req: &HwRequest) -> Result<HwApplied>;

    fn commit_sw_params(&mut self, req: &SwRequest) -> Result<()>;

    /// Device channel maps as native position codes, if the device reports
    /// any. One entry per supported layout.
    fn query_chmaps(&mut self) -> Option<Vec<Vec<u32>>>;

    fn prepare(&mut self) -> Result<()>;
    fn start(&mut self) -> Result<()>;
    /// Discard queued frames and stop.
    fn drop_pending(&mut self) -> Result<()>;
    /// Move the write pointer back, returns frames actually rewound.
    fn rewind(&mut self, frames: u64) -> Result<u64>;
    /// Bring the device back after an xrun: prepare plus silent resume.
    fn recover(&mut self, err: &PcmIoError) -> Result<()>;

    /// Frames that can be written (playback) or read (capture) right now.
    fn avail(&mut self) -> IoResult<u64>;
    fn status(&mut self) -> Result<PcmStatus>;

    /// Claim a window of the ring: `(offset, frames)` with `frames <=
    /// wanted`. The window may wrap past the end of the ring.
    fn mmap_begin(&mut self, wanted: u64) -> Result<(u64, u64)>;
    /// The mapped ring, `buffer_frames * frame_size` bytes. Only valid
    /// between `mmap_begin` and `mmap_commit`.
    fn ring(&mut self) -> &mut [u8];
    /// Publish `frames` of the claimed window, returns the frames the device
    /// accepted.
    fn mmap_commit(&mut self, offset: u64, frames: u64) -> IoResult<u64>;
    /// Fill `frames` at `offset` with the encoding's silence value.
    fn areas_silence(&mut self, offset: u64, frames: u64);
}

/// The engine's time source and wake mechanism: an absolute-deadline one-shot
/// timer on the monotonic clock.
pub trait WakeTimer {
    fn now_nsec(&self) -> u64;
    fn arm(&mut self, deadline_nsec: u64) -> Result<()>;
    fn disarm(&mut self) -> Result<()>;
    /// Acknowledge expirations since the last call, returns their count.
    fn consume(&mut self) -> u64;
}

/// A device/timer pairing the engine can be instantiated over.
pub trait Backend {
    type Pcm: PcmDevice;
    type Timer: WakeTimer;

    const LABEL: &'static str;

    fn open_device(config: &DriverConfig) -> Result<Self::Pcm>;
    fn open_timer() -> Result<Self::Timer>;
}
