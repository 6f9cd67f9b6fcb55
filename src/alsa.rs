//! Kernel PCM backend over libasound. The engine needs open flags, period
//! wake-up control and mmap cycles that the safe wrappers do not expose, so
//! this talks to the raw binding directly.

use crate::config::{Direction, DriverConfig};
use crate::device::{
    Backend, HwApplied, HwRequest, HwSpace, IoResult, PcmDevice, PcmIoError, PcmState, PcmStatus,
    SwRequest,
};
use crate::error::{Error, Result};
use crate::format::SampleFormat;
use crate::timer::TimerFd;
use alsa_sys::*;
use nix::libc;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_long, c_uint};
use tracing::{debug, info};

const OPEN_NONBLOCK: c_int = 0x0000_0001;
const OPEN_NO_AUTO_RESAMPLE: c_int = 0x0001_0000;
const OPEN_NO_AUTO_CHANNELS: c_int = 0x0002_0000;
const OPEN_NO_AUTO_FORMAT: c_int = 0x0004_0000;

const ACCESS_MMAP_INTERLEAVED: c_uint = 0;
const TSTAMP_ENABLE: c_uint = 1;

const STATE_PREPARED: c_uint = 2;
const STATE_RUNNING: c_uint = 3;
const STATE_XRUN: c_uint = 4;
const STATE_SUSPENDED: c_uint = 7;

fn strerror(err: c_int) -> String {
    unsafe {
        let msg = snd_strerror(err);
        if msg.is_null() {
            format!("error {err}")
        } else {
            CStr::from_ptr(msg).to_string_lossy().into_owned()
        }
    }
}

fn check(err: c_int, what: &str) -> Result<c_int> {
    if err < 0 {
        Err(Error::device(format!("{what}: {}", strerror(err))))
    } else {
        Ok(err)
    }
}

struct HwParams(*mut snd_pcm_hw_params_t);

impl HwParams {
    fn new() -> Result<Self> {
        let mut ptr = std::ptr::null_mut();
        check(unsafe { snd_pcm_hw_params_malloc(&mut ptr) }, "hw_params_malloc")?;
        Ok(Self(ptr))
    }
}

impl Drop for HwParams {
    fn drop(&mut self) {
        unsafe { snd_pcm_hw_params_free(self.0) };
    }
}

pub struct AlsaPcm {
    pcm: *mut snd_pcm_t,
    playback: bool,
    frame_size: usize,
    buffer_frames: u64,
    channels: u32,
    format_native: c_int,
    area_base: *mut u8,
    last_errno: c_int,
}

// The handle is only used from the data loop; moving it there is fine.
unsafe impl Send for AlsaPcm {}

impl AlsaPcm {
    pub fn open(name: &str, direction: Direction) -> Result<Self> {
        let cname = CString::new(name)
            .map_err(|_| Error::invalid(format!("bad device name '{name}'")))?;
        let playback = direction == Direction::Playback;
        let stream: snd_pcm_stream_t = if playback { 0 } else { 1 };
        let mut pcm = std::ptr::null_mut();
        check(
            unsafe {
                snd_pcm_open(
                    &mut pcm,
                    cname.as_ptr(),
                    stream,
                    OPEN_NONBLOCK
                        | OPEN_NO_AUTO_RESAMPLE
                        | OPEN_NO_AUTO_CHANNELS
                        | OPEN_NO_AUTO_FORMAT,
                )
            },
            "open failed",
        )?;
        Ok(Self {
            pcm,
            playback,
            frame_size: 0,
            buffer_frames: 0,
            channels: 0,
            format_native: -1,
            area_base: std::ptr::null_mut(),
            last_errno: -libc::EPIPE,
        })
    }

    fn classify(&mut self, err: c_int) -> PcmIoError {
        self.last_errno = err;
        if err == -libc::EPIPE || err == -libc::ESTRPIPE {
            PcmIoError::Xrun
        } else {
            PcmIoError::Fatal(strerror(err))
        }
    }

    /// Log the kernel's view of the configured stream.
    pub fn dump(&self) {
        unsafe {
            let mut out: *mut snd_output_t = std::ptr::null_mut();
            if snd_output_buffer_open(&mut out) < 0 {
                return;
            }
            snd_pcm_dump(self.pcm, out);
            let mut buf: *mut c_char = std::ptr::null_mut();
            let len = snd_output_buffer_string(out, &mut buf);
            if len > 0 && !buf.is_null() {
                let bytes = std::slice::from_raw_parts(buf as *const u8, len as usize);
                debug!("{}", String::from_utf8_lossy(bytes));
            }
            snd_output_close(out);
        }
    }
}

impl Drop for AlsaPcm {
    fn drop(&mut self) {
        unsafe { snd_pcm_close(self.pcm) };
    }
}

impl PcmDevice for AlsaPcm {
    fn hw_space(&mut self) -> Result<HwSpace> {
        let params = HwParams::new()?;
        check(
            unsafe { snd_pcm_hw_params_any(self.pcm, params.0) },
            "no configurations available",
        )?;
        check(
            unsafe { snd_pcm_hw_params_set_access(self.pcm, params.0, ACCESS_MMAP_INTERLEAVED) },
            "set_access",
        )?;

        let mut formats = Vec::new();
        for fmt in SampleFormat::all() {
            let native = fmt.to_native();
            if unsafe { snd_pcm_hw_params_test_format(self.pcm, params.0, native) } == 0 {
                formats.push(fmt);
            }
        }

        let mut dir: c_int = 0;
        let mut rate_min: c_uint = 0;
        let mut rate_max: c_uint = 0;
        check(
            unsafe { snd_pcm_hw_params_get_rate_min(params.0, &mut rate_min, &mut dir) },
            "get_rate_min",
        )?;
        check(
            unsafe { snd_pcm_hw_params_get_rate_max(params.0, &mut rate_max, &mut dir) },
            "get_rate_max",
        )?;

        let mut ch_min: c_uint = 0;
        let mut ch_max: c_uint = 0;
        check(
            unsafe { snd_pcm_hw_params_get_channels_min(params.0, &mut ch_min) },
            "get_channels_min",
        )?;
        check(
            unsafe { snd_pcm_hw_params_get_channels_max(params.0, &mut ch_max) },
            "get_channels_max",
        )?;

        Ok(HwSpace {
            formats,
            rate_min,
            rate_max,
            channels_min: ch_min,
            channels_max: ch_max,
        })
    }

    fn commit_hw_params(&mut self, req: &HwRequest) -> Result<HwApplied> {
        let params = HwParams::new()?;
        check(
            unsafe { snd_pcm_hw_params_any(self.pcm, params.0) },
            "no configurations available",
        )?;
        check(
            unsafe { snd_pcm_hw_params_set_rate_resample(self.pcm, params.0, 0) },
            "set_rate_resample",
        )?;
        check(
            unsafe { snd_pcm_hw_params_set_access(self.pcm, params.0, ACCESS_MMAP_INTERLEAVED) },
            "set_access",
        )?;

        // The wake timer replaces device interrupts.
        if unsafe { snd_pcm_hw_params_can_disable_period_wakeup(params.0) } == 1 {
            check(
                unsafe { snd_pcm_hw_params_set_period_wakeup(self.pcm, params.0, 0) },
                "set_period_wakeup",
            )?;
        }

        let native = req.format.to_native();
        if unsafe { snd_pcm_hw_params_set_format(self.pcm, params.0, native) } < 0 {
            return Err(Error::invalid(format!("format {:?} refused", req.format)));
        }

        let mut channels: c_uint = req.channels;
        check(
            unsafe { snd_pcm_hw_params_set_channels_near(self.pcm, params.0, &mut channels) },
            "set_channels_near",
        )?;

        let mut rate: c_uint = req.rate;
        let mut dir: c_int = 0;
        check(
            unsafe { snd_pcm_hw_params_set_rate_near(self.pcm, params.0, &mut rate, &mut dir) },
            "set_rate_near",
        )?;

        let mut period: snd_pcm_uframes_t = req.period_size as snd_pcm_uframes_t;
        dir = 0;
        check(
            unsafe {
                snd_pcm_hw_params_set_period_size_near(self.pcm, params.0, &mut period, &mut dir)
            },
            "set_period_size_near",
        )?;

        let mut buffer: snd_pcm_uframes_t = match req.buffer_size {
            Some(b) => b as snd_pcm_uframes_t,
            None => {
                let mut max: snd_pcm_uframes_t = 0;
                check(
                    unsafe { snd_pcm_hw_params_get_buffer_size_max(params.0, &mut max) },
                    "get_buffer_size_max",
                )?;
                max
            }
        };
        check(
            unsafe { snd_pcm_hw_params_set_buffer_size_near(self.pcm, params.0, &mut buffer) },
            "set_buffer_size_near",
        )?;

        check(unsafe { snd_pcm_hw_params(self.pcm, params.0) }, "set_hw_params")?;

        self.channels = channels;
        self.format_native = native;
        self.frame_size = channels as usize * req.format.width();
        self.buffer_frames = buffer as u64;
        self.area_base = std::ptr::null_mut();

        Ok(HwApplied {
            format: req.format,
            channels,
            rate,
            period_size: period as u32,
            buffer_frames: buffer as u64,
        })
    }

    fn commit_sw_params(&mut self, req: &SwRequest) -> Result<()> {
        unsafe {
            let mut params: *mut snd_pcm_sw_params_t = std::ptr::null_mut();
            check(snd_pcm_sw_params_malloc(&mut params), "sw_params_malloc")?;
            let res = (|| {
                check(snd_pcm_sw_params_current(self.pcm, params), "sw_params_current")?;
                if req.timestamps {
                    check(
                        snd_pcm_sw_params_set_tstamp_mode(self.pcm, params, TSTAMP_ENABLE),
                        "set_tstamp_mode",
                    )?;
                }
                if req.manual_start {
                    check(
                        snd_pcm_sw_params_set_start_threshold(
                            self.pcm,
                            params,
                            c_long::MAX as snd_pcm_uframes_t,
                        ),
                        "set_start_threshold",
                    )?;
                }
                check(
                    snd_pcm_sw_params_set_period_event(
                        self.pcm,
                        params,
                        req.period_event as c_int,
                    ),
                    "set_period_event",
                )?;
                check(snd_pcm_sw_params(self.pcm, params), "sw_params")?;
                Ok(())
            })();
            snd_pcm_sw_params_free(params);
            res
        }
    }

    fn query_chmaps(&mut self) -> Option<Vec<Vec<u32>>> {
        // The kernel interface for map queries is not wired up; enumeration
        // falls back to plain channel ranges.
        None
    }

    fn prepare(&mut self) -> Result<()> {
        check(unsafe { snd_pcm_prepare(self.pcm) }, "prepare")?;
        self.dump();
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        check(unsafe { snd_pcm_start(self.pcm) }, "start")?;
        Ok(())
    }

    fn drop_pending(&mut self) -> Result<()> {
        check(unsafe { snd_pcm_drop(self.pcm) }, "drop")?;
        Ok(())
    }

    fn rewind(&mut self, frames: u64) -> Result<u64> {
        let res = unsafe { snd_pcm_rewind(self.pcm, frames as snd_pcm_uframes_t) };
        if res < 0 {
            return Err(Error::device(format!("rewind: {}", strerror(res as c_int))));
        }
        Ok(res as u64)
    }

    fn recover(&mut self, _err: &PcmIoError) -> Result<()> {
        let res = unsafe { snd_pcm_recover(self.pcm, self.last_errno, 1) };
        check(res, "recover")?;
        Ok(())
    }

    fn avail(&mut self) -> IoResult<u64> {
        let av = unsafe { snd_pcm_avail(self.pcm) };
        if av < 0 {
            Err(self.classify(av as c_int))
        } else {
            Ok(av as u64)
        }
    }

    fn status(&mut self) -> Result<PcmStatus> {
        unsafe {
            let mut status: *mut snd_pcm_status_t = std::ptr::null_mut();
            check(snd_pcm_status_malloc(&mut status), "status_malloc")?;
            let res = (|| {
                check(snd_pcm_status(self.pcm, status), "status")?;
                let state = match snd_pcm_status_get_state(status) as c_uint {
                    STATE_PREPARED => PcmState::Prepared,
                    STATE_RUNNING => PcmState::Running,
                    STATE_XRUN => PcmState::Xrun,
                    STATE_SUSPENDED => PcmState::Suspended,
                    _ => PcmState::Other,
                };
                let mut now = libc::timeval { tv_sec: 0, tv_usec: 0 };
                let mut trigger = libc::timeval { tv_sec: 0, tv_usec: 0 };
                snd_pcm_status_get_tstamp(status, &mut now);
                snd_pcm_status_get_trigger_tstamp(status, &mut trigger);
                Ok(PcmStatus {
                    state,
                    now_nsec: now.tv_sec as u64 * 1_000_000_000 + now.tv_usec as u64 * 1_000,
                    trigger_nsec: trigger.tv_sec as u64 * 1_000_000_000
                        + trigger.tv_usec as u64 * 1_000,
                })
            })();
            snd_pcm_status_free(status);
            res
        }
    }

    fn mmap_begin(&mut self, wanted: u64) -> Result<(u64, u64)> {
        let mut areas: *const snd_pcm_channel_area_t = std::ptr::null();
        let mut offset: snd_pcm_uframes_t = 0;
        let mut frames: snd_pcm_uframes_t = wanted as snd_pcm_uframes_t;
        check(
            unsafe { snd_pcm_mmap_begin(self.pcm, &mut areas, &mut offset, &mut frames) },
            "mmap_begin",
        )?;
        if !areas.is_null() {
            // Interleaved: one area whose addr is the ring base.
            self.area_base = unsafe { (*areas).addr as *mut u8 };
        }
        Ok((offset as u64, frames as u64))
    }

    fn ring(&mut self) -> &mut [u8] {
        if self.area_base.is_null() || self.buffer_frames == 0 {
            return &mut [];
        }
        unsafe {
            std::slice::from_raw_parts_mut(
                self.area_base,
                self.buffer_frames as usize * self.frame_size,
            )
        }
    }

    fn mmap_commit(&mut self, offset: u64, frames: u64) -> IoResult<u64> {
        let res = unsafe {
            snd_pcm_mmap_commit(
                self.pcm,
                offset as snd_pcm_uframes_t,
                frames as snd_pcm_uframes_t,
            )
        };
        if res < 0 {
            Err(self.classify(res as c_int))
        } else {
            Ok(res as u64)
        }
    }

    fn areas_silence(&mut self, offset: u64, frames: u64) {
        if self.buffer_frames == 0 {
            return;
        }
        let area = snd_pcm_channel_area_t {
            addr: self.area_base as *mut libc::c_void,
            first: 0,
            step: (self.frame_size * 8) as c_uint,
        };
        let areas: Vec<snd_pcm_channel_area_t> = (0..self.channels)
            .map(|ch| snd_pcm_channel_area_t {
                addr: area.addr,
                first: ch * (self.frame_size as c_uint / self.channels.max(1)) * 8,
                step: area.step,
            })
            .collect();
        let b = self.buffer_frames;
        let mut off = offset % b;
        let mut left = frames;
        while left > 0 {
            let run = left.min(b - off);
            unsafe {
                snd_pcm_areas_silence(
                    areas.as_ptr(),
                    off as snd_pcm_uframes_t,
                    self.channels,
                    run as snd_pcm_uframes_t,
                    self.format_native,
                )
            };
            off = (off + run) % b;
            left -= run;
        }
    }
}

/// Kernel device plus timerfd wake-ups.
pub struct AlsaBackend;

impl Backend for AlsaBackend {
    type Pcm = AlsaPcm;
    type Timer = TimerFd;

    const LABEL: &'static str = "alsa";

    fn open_device(config: &DriverConfig) -> Result<Self::Pcm> {
        info!("alsa: opening '{}'", config.device);
        AlsaPcm::open(&config.device, config.direction)
    }

    fn open_timer() -> Result<Self::Timer> {
        TimerFd::new()
    }
}
