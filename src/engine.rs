//! One device endpoint: session state, format negotiation and the host
//! surface. The transfer and scheduling halves of the engine live in
//! `transfer` and `sched`.

use crate::cell::LoopCell;
use crate::clock::{ClockRecord, IoRange, IoSlot, IoStatus, TimelinePosition};
use crate::config::{Direction, DriverConfig};
use crate::device::{Backend, HwRequest, PcmDevice};
use crate::dll::{Dll, BW_MAX};
use crate::error::{Error, Result};
use crate::format::{sanitize_map, Channel, SampleFormat};
use crate::pool::{Buffer, BufferPool, Chunk};
use std::sync::Arc;
use tracing::{debug, info};

/// Callbacks into the host graph. Delivered on the data loop.
pub trait HostEvents {
    fn ready(&mut self, status: IoStatus);
    fn reuse_buffer(&mut self, port: u32, id: u32);
    fn on_error(&mut self, _error: &Error) {}
}

/// No-op host, useful for bring-up.
#[derive(Debug, Default)]
pub struct NullHost;

impl HostEvents for NullHost {
    fn ready(&mut self, _status: IoStatus) {}
    fn reuse_buffer(&mut self, _port: u32, _id: u32) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Opened,
    Configured,
    Running,
    Recovering,
    Paused,
}

/// Negotiation request and echo for `set_format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioInfo {
    pub format: SampleFormat,
    pub rate: u32,
    pub channels: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatRange {
    pub default: u32,
    pub min: u32,
    pub max: u32,
}

/// One enumerated parameter set: available encodings (preferred first),
/// rate and channel ranges, and a sanitized channel map when the device
/// reports layouts and map enumeration is enabled.
#[derive(Debug, Clone)]
pub struct FormatParams {
    pub formats: Vec<SampleFormat>,
    pub rate: FormatRange,
    pub channels: FormatRange,
    pub positions: Option<Vec<Channel>>,
}

#[derive(Debug, Clone)]
pub struct EnumFormatResult {
    pub seq: u32,
    pub index: u32,
    /// Restart cursor for the next enumeration call.
    pub next: u32,
    pub params: FormatParams,
}

/// Optional narrowing applied while enumerating.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatFilter {
    pub format: Option<SampleFormat>,
    pub rate: Option<u32>,
    pub channels: Option<u32>,
}

pub struct Engine<B: Backend> {
    pub(crate) config: DriverConfig,
    pub(crate) dev: B::Pcm,
    pub(crate) timer: B::Timer,
    pub(crate) callbacks: Box<dyn HostEvents + Send>,

    pub(crate) have_format: bool,
    pub(crate) started: bool,
    pub(crate) paused: bool,
    pub(crate) slaved: bool,
    pub(crate) device_started: bool,
    pub(crate) recovering: bool,

    pub(crate) format: SampleFormat,
    pub(crate) rate: u32,
    pub(crate) channels: u32,
    pub(crate) frame_size: usize,
    pub(crate) buffer_frames: u64,
    pub(crate) period_frames: u64,
    pub(crate) threshold: u64,
    pub(crate) safety: f64,

    pub(crate) samples_produced: u64,
    pub(crate) sample_time: u64,
    pub(crate) last_time: u64,
    pub(crate) next_time: u64,
    pub(crate) ready_offset: usize,

    pub(crate) dll: Dll,
    pub(crate) old_dt: f64,
    pub(crate) xrun_count: u64,

    pub(crate) pool: BufferPool,
    pub(crate) clock: Option<Arc<LoopCell<ClockRecord>>>,
    pub(crate) position: Option<Arc<LoopCell<TimelinePosition>>>,
    pub(crate) io: Option<Arc<LoopCell<IoSlot>>>,
    pub(crate) range: Option<Arc<LoopCell<IoRange>>>,
}

impl<B: Backend> Engine<B> {
    /// Open the device endpoint and create the wake timer. Counters start
    /// from zero; closing is dropping the engine (or `close` for an explicit
    /// teardown through pause).
    pub fn open(config: DriverConfig, callbacks: Box<dyn HostEvents + Send>) -> Result<Self> {
        info!("{}: device open '{}'", B::LABEL, config.device);
        let dev = B::open_device(&config)?;
        let timer = B::open_timer()?;
        let safety = config.safety;
        Ok(Self {
            config,
            dev,
            timer,
            callbacks,
            have_format: false,
            started: false,
            paused: false,
            slaved: false,
            device_started: false,
            recovering: false,
            format: SampleFormat::Unknown,
            rate: 0,
            channels: 0,
            frame_size: 0,
            buffer_frames: 0,
            period_frames: 0,
            threshold: 0,
            safety,
            samples_produced: 0,
            sample_time: 0,
            last_time: 0,
            next_time: 0,
            ready_offset: 0,
            dll: Dll::new(BW_MAX),
            old_dt: 1.0,
            xrun_count: 0,
            pool: BufferPool::default(),
            clock: None,
            position: None,
            io: None,
            range: None,
        })
    }

    pub fn close(mut self) -> Result<()> {
        info!("{}: device '{}' closing", B::LABEL, self.config.device);
        self.pause()
    }

    pub fn set_clock(&mut self, clock: Arc<LoopCell<ClockRecord>>) {
        self.clock = Some(clock);
    }

    pub fn set_position(&mut self, position: Arc<LoopCell<TimelinePosition>>) {
        self.position = Some(position);
    }

    pub fn set_io(&mut self, io: Arc<LoopCell<IoSlot>>) {
        self.io = Some(io);
    }

    pub fn set_range(&mut self, range: Arc<LoopCell<IoRange>>) {
        self.range = Some(range);
    }

    pub fn state(&self) -> EngineState {
        if self.started {
            if self.recovering {
                EngineState::Recovering
            } else {
                EngineState::Running
            }
        } else if self.paused {
            EngineState::Paused
        } else if self.have_format {
            EngineState::Configured
        } else {
            EngineState::Opened
        }
    }

    /// The negotiated stream parameters, once `set_format` succeeded.
    pub fn audio_info(&self) -> Option<AudioInfo> {
        self.have_format.then(|| AudioInfo {
            format: self.format,
            rate: self.rate,
            channels: self.channels,
        })
    }

    pub fn samples_produced(&self) -> u64 {
        self.samples_produced
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn next_time(&self) -> u64 {
        self.next_time
    }

    pub fn last_time(&self) -> u64 {
        self.last_time
    }

    pub fn rate_diff(&self) -> f64 {
        self.old_dt
    }

    pub fn dll_bandwidth(&self) -> f64 {
        self.dll.bw()
    }

    pub fn xrun_count(&self) -> u64 {
        self.xrun_count
    }

    pub fn is_slaved(&self) -> bool {
        self.slaved
    }

    pub fn device(&self) -> &B::Pcm {
        &self.dev
    }

    pub fn device_mut(&mut self) -> &mut B::Pcm {
        &mut self.dev
    }

    pub fn timer(&self) -> &B::Timer {
        &self.timer
    }

    pub fn timer_mut(&mut self) -> &mut B::Timer {
        &mut self.timer
    }

    pub fn buffer_bytes(&self, id: u32) -> Option<&[u8]> {
        self.pool.buffer(id).map(|b| b.data())
    }

    pub fn buffer_header(&self, id: u32) -> Option<crate::pool::Header> {
        self.pool.buffer(id).map(|b| b.header)
    }

    /// Enumerate supported parameter sets, restartable through
    /// `(seq, start, num)`. Indexes consumed by the filter are skipped but
    /// still advance the cursor.
    pub fn enum_formats(
        &mut self,
        seq: u32,
        start: u32,
        num: u32,
        filter: Option<&FormatFilter>,
    ) -> Result<Vec<EnumFormatResult>> {
        let space = self.dev.hw_space()?;
        let maps = if self.config.enumerate_chmaps {
            self.dev.query_chmaps()
        } else {
            None
        };

        let mut formats = space.formats.clone();
        if let Some(pos) = formats.iter().position(|f| *f == self.config.format) {
            formats.swap(0, pos);
        }

        let mut out = Vec::new();
        let mut next = start;
        loop {
            let index = next;
            next += 1;

            let params = match &maps {
                Some(maps) => {
                    let Some(raw) = maps.get(index as usize) else {
                        break;
                    };
                    let mut positions: Vec<Channel> =
                        raw.iter().map(|c| Channel::from_native(*c)).collect();
                    debug!("map with {} channels", positions.len());
                    sanitize_map(&mut positions);
                    let n = positions.len() as u32;
                    FormatParams {
                        formats: formats.clone(),
                        rate: FormatRange {
                            default: self.config.rate.clamp(space.rate_min, space.rate_max),
                            min: space.rate_min,
                            max: space.rate_max,
                        },
                        channels: FormatRange { default: n, min: n, max: n },
                        positions: Some(positions),
                    }
                }
                None => {
                    if index > 0 {
                        break;
                    }
                    FormatParams {
                        formats: formats.clone(),
                        rate: FormatRange {
                            default: self.config.rate.clamp(space.rate_min, space.rate_max),
                            min: space.rate_min,
                            max: space.rate_max,
                        },
                        channels: FormatRange {
                            default: self
                                .config
                                .channels
                                .clamp(space.channels_min, space.channels_max),
                            min: space.channels_min,
                            max: space.channels_max,
                        },
                        positions: None,
                    }
                }
            };

            let Some(params) = apply_filter(params, filter) else {
                continue;
            };
            out.push(EnumFormatResult { seq, index, next, params });
            if out.len() as u32 == num {
                break;
            }
        }
        Ok(out)
    }

    /// Negotiate `(format, rate, channels)`. With `nearest`, device-resolved
    /// values are written back into `info`; without it any mismatch fails.
    pub fn set_format(&mut self, info: &mut AudioInfo, nearest: bool) -> Result<()> {
        if self.started {
            return Err(Error::invalid("cannot change format while started"));
        }
        if info.format == SampleFormat::Unknown {
            return Err(Error::invalid("unknown sample format"));
        }

        info!(
            "{}: stream parameters are {}Hz, {:?}, {} channels",
            B::LABEL,
            info.rate,
            info.format,
            info.channels
        );

        let req = HwRequest {
            format: info.format,
            channels: info.channels,
            rate: info.rate,
            period_size: self.config.period_size,
            buffer_size: self.config.buffer_size,
        };
        let applied = self.dev.commit_hw_params(&req)?;

        if applied.channels != info.channels {
            tracing::warn!(
                "channels do not match (requested {}, got {})",
                info.channels,
                applied.channels
            );
            if nearest {
                info.channels = applied.channels;
            } else {
                return Err(Error::invalid("channel count refused"));
            }
        }
        if applied.rate != info.rate {
            tracing::warn!(
                "rate does not match (requested {}Hz, got {}Hz)",
                info.rate,
                applied.rate
            );
            if nearest {
                info.rate = applied.rate;
            } else {
                return Err(Error::invalid("rate refused"));
            }
        }

        self.format = applied.format;
        self.channels = applied.channels;
        self.rate = applied.rate;
        self.frame_size = applied.channels as usize * applied.format.width();
        self.buffer_frames = applied.buffer_frames;
        self.period_frames = applied.period_size as u64;
        self.have_format = true;

        info!(
            "{}: buffer frames {}, period frames {}, periods {}, frame_size {}",
            B::LABEL,
            self.buffer_frames,
            self.period_frames,
            self.buffer_frames / self.period_frames.max(1),
            self.frame_size
        );
        Ok(())
    }

    /// Install the descriptor set. Ownership is reset for the configured
    /// direction: playback descriptors start host-owned, capture descriptors
    /// start free.
    pub fn attach_buffers(&mut self, buffers: Vec<Buffer>) -> Result<()> {
        if !self.have_format {
            return Err(Error::invalid("attach_buffers before set_format"));
        }
        self.ready_offset = 0;
        self.pool.attach(buffers, self.config.direction)
    }

    /// Host hands a descriptor to the driver: onto `ready` for playback,
    /// onto `free` for capture.
    pub fn submit_buffer(&mut self, id: u32, chunk: Chunk) -> Result<()> {
        self.pool.submit(id, chunk, self.config.direction)
    }

    /// Host picks up a captured descriptor queued past the io slot.
    pub fn dequeue_ready(&mut self) -> Option<u32> {
        self.pool.remove_front_ready()
    }

    pub(crate) fn adopt_threshold(&mut self) {
        if let Some(position) = &self.position {
            let size = position.get().size as u64;
            if size != 0 && self.threshold != size {
                self.threshold = size;
            }
        }
    }

    pub(crate) fn direction(&self) -> Direction {
        self.config.direction
    }
}

fn apply_filter(mut params: FormatParams, filter: Option<&FormatFilter>) -> Option<FormatParams> {
    let Some(filter) = filter else {
        return Some(params);
    };
    if let Some(format) = filter.format {
        if !params.formats.contains(&format) {
            return None;
        }
        params.formats = vec![format];
    }
    if let Some(rate) = filter.rate {
        if rate < params.rate.min || rate > params.rate.max {
            return None;
        }
        params.rate = FormatRange { default: rate, min: rate, max: rate };
    }
    if let Some(channels) = filter.channels {
        if channels < params.channels.min || channels > params.channels.max {
            return None;
        }
        params.channels = FormatRange { default: channels, min: channels, max: channels };
    }
    Some(params)
}
