//! In-memory device and timer for tests and bring-up. The device models the
//! kernel ring with application/hardware pointers; tests script consumption,
//! xruns and timestamps directly.

use crate::config::DriverConfig;
use crate::device::{
    Backend, HwApplied, HwRequest, HwSpace, IoResult, PcmDevice, PcmIoError, PcmState, PcmStatus,
    SwRequest, WakeTimer,
};
use crate::error::{Error, Result};
use crate::format::SampleFormat;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct MockCaps {
    pub formats: Vec<SampleFormat>,
    pub rate_min: u32,
    pub rate_max: u32,
    pub channels_min: u32,
    pub channels_max: u32,
    pub buffer_max: u64,
    pub chmaps: Option<Vec<Vec<u32>>>,
}

impl Default for MockCaps {
    fn default() -> Self {
        Self {
            formats: vec![
                SampleFormat::S16Le,
                SampleFormat::S24_32Le,
                SampleFormat::S32Le,
                SampleFormat::F32Le,
            ],
            rate_min: 8_000,
            rate_max: 192_000,
            channels_min: 1,
            channels_max: 8,
            buffer_max: 8192,
            chmaps: None,
        }
    }
}

#[derive(Debug)]
pub struct MockPcm {
    pub caps: MockCaps,
    applied: Option<HwApplied>,
    sw: Option<SwRequest>,
    frame_size: usize,
    ring: Vec<u8>,
    appl_ptr: u64,
    hw_ptr: u64,
    playback: bool,
    state: PcmState,
    started: bool,
    /// Window cap for `mmap_begin`, unlimited when unset.
    pub max_window: Option<u64>,
    /// When set, windows wrap past the ring end instead of being clipped.
    pub wrap_windows: bool,
    commit_errors: VecDeque<PcmIoError>,
    status_now_nsec: u64,
    status_trigger_nsec: u64,
    pub start_count: u32,
    pub prepare_count: u32,
    pub recover_count: u32,
    pub drop_count: u32,
    pub rewinds: Vec<u64>,
    pub commits: Vec<(u64, u64)>,
}

impl MockPcm {
    pub fn new(caps: MockCaps, playback: bool) -> Self {
        Self {
            caps,
            applied: None,
            sw: None,
            frame_size: 0,
            ring: Vec::new(),
            appl_ptr: 0,
            hw_ptr: 0,
            playback,
            state: PcmState::Other,
            started: false,
            max_window: None,
            wrap_windows: false,
            commit_errors: VecDeque::new(),
            status_now_nsec: 0,
            status_trigger_nsec: 0,
            start_count: 0,
            prepare_count: 0,
            recover_count: 0,
            drop_count: 0,
            rewinds: Vec::new(),
            commits: Vec::new(),
        }
    }

    fn buffer_frames(&self) -> u64 {
        self.applied.map(|a| a.buffer_frames).unwrap_or(0)
    }

    pub fn applied(&self) -> Option<HwApplied> {
        self.applied
    }

    pub fn sw_params(&self) -> Option<SwRequest> {
        self.sw
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn ring_bytes(&self) -> &[u8] {
        &self.ring
    }

    /// Device progress: playback consumes queued frames, capture produces
    /// fresh ones.
    pub fn advance_hw(&mut self, frames: u64) {
        self.hw_ptr += frames;
    }

    pub fn queue_commit_error(&mut self, err: PcmIoError) {
        self.commit_errors.push_back(err);
    }

    pub fn force_xrun(&mut self) {
        self.state = PcmState::Xrun;
    }

    pub fn set_status_timestamps(&mut self, now_nsec: u64, trigger_nsec: u64) {
        self.status_now_nsec = now_nsec;
        self.status_trigger_nsec = trigger_nsec;
    }

    pub fn queued_frames(&self) -> u64 {
        self.appl_ptr.saturating_sub(self.hw_ptr)
    }
}

impl PcmDevice for MockPcm {
    fn hw_space(&mut self) -> Result<HwSpace> {
        Ok(HwSpace {
            formats: self.caps.formats.clone(),
            rate_min: self.caps.rate_min,
            rate_max: self.caps.rate_max,
            channels_min: self.caps.channels_min,
            channels_max: self.caps.channels_max,
        })
    }

    fn commit_hw_params(&mut self, req: &HwRequest) -> Result<HwApplied> {
        if !self.caps.formats.contains(&req.format) {
            return Err(Error::invalid(format!(
                "format {:?} not supported",
                req.format
            )));
        }
        let channels = req
            .channels
            .clamp(self.caps.channels_min, self.caps.channels_max);
        let rate = req.rate.clamp(self.caps.rate_min, self.caps.rate_max);
        let buffer_frames = req
            .buffer_size
            .map(|b| (b as u64).min(self.caps.buffer_max))
            .unwrap_or(self.caps.buffer_max);
        let period_size = req.period_size.min(buffer_frames as u32 / 2);
        let applied = HwApplied {
            format: req.format,
            channels,
            rate,
            period_size,
            buffer_frames,
        };
        self.frame_size = channels as usize * req.format.width();
        self.ring = vec![0; buffer_frames as usize * self.frame_size];
        self.appl_ptr = 0;
        self.hw_ptr = 0;
        self.applied = Some(applied);
        self.state = PcmState::Other;
        Ok(applied)
    }

    fn commit_sw_params(&mut self, req: &SwRequest) -> Result<()> {
        self.sw = Some(*req);
        Ok(())
    }

    fn query_chmaps(&mut self) -> Option<Vec<Vec<u32>>> {
        self.caps.chmaps.clone()
    }

    fn prepare(&mut self) -> Result<()> {
        self.prepare_count += 1;
        self.state = PcmState::Prepared;
        self.appl_ptr = 0;
        self.hw_ptr = 0;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.start_count += 1;
        self.started = true;
        self.state = PcmState::Running;
        Ok(())
    }

    fn drop_pending(&mut self) -> Result<()> {
        self.drop_count += 1;
        self.started = false;
        self.state = PcmState::Other;
        Ok(())
    }

    fn rewind(&mut self, frames: u64) -> Result<u64> {
        let rewound = frames.min(self.queued_frames());
        self.appl_ptr -= rewound;
        self.rewinds.push(rewound);
        Ok(rewound)
    }

    fn recover(&mut self, _err: &PcmIoError) -> Result<()> {
        self.recover_count += 1;
        self.state = PcmState::Prepared;
        self.started = false;
        self.appl_ptr = 0;
        self.hw_ptr = 0;
        Ok(())
    }

    fn avail(&mut self) -> IoResult<u64> {
        if self.state == PcmState::Xrun {
            return Err(PcmIoError::Xrun);
        }
        let b = self.buffer_frames();
        if self.playback {
            Ok(b.saturating_sub(self.queued_frames()))
        } else {
            Ok(self.hw_ptr.saturating_sub(self.appl_ptr))
        }
    }

    fn status(&mut self) -> Result<PcmStatus> {
        Ok(PcmStatus {
            state: self.state,
            now_nsec: self.status_now_nsec,
            trigger_nsec: self.status_trigger_nsec,
        })
    }

    fn mmap_begin(&mut self, wanted: u64) -> Result<(u64, u64)> {
        let b = self.buffer_frames();
        if b == 0 {
            return Err(Error::device("mmap_begin before hw params"));
        }
        let avail = match self.avail() {
            Ok(a) => a,
            Err(e) => return Err(Error::device(format!("mmap_begin: {e}"))),
        };
        let offset = self.appl_ptr % b;
        let mut frames = wanted.min(avail);
        if let Some(max) = self.max_window {
            frames = frames.min(max);
        }
        if !self.wrap_windows {
            frames = frames.min(b - offset);
        }
        Ok((offset, frames))
    }

    fn ring(&mut self) -> &mut [u8] {
        &mut self.ring
    }

    fn mmap_commit(&mut self, offset: u64, frames: u64) -> IoResult<u64> {
        if let Some(err) = self.commit_errors.pop_front() {
            if matches!(err, PcmIoError::Xrun) {
                self.state = PcmState::Xrun;
            }
            return Err(err);
        }
        self.commits.push((offset, frames));
        self.appl_ptr += frames;
        Ok(frames)
    }

    fn areas_silence(&mut self, offset: u64, frames: u64) {
        let b = self.buffer_frames();
        if b == 0 || self.frame_size == 0 {
            return;
        }
        let fs = self.frame_size;
        for f in 0..frames {
            let pos = ((offset + f) % b) as usize * fs;
            self.ring[pos..pos + fs].fill(0);
        }
    }
}

#[derive(Debug, Default)]
pub struct MockTimer {
    now_nsec: u64,
    pub armed: Vec<u64>,
    pub disarm_count: u32,
}

impl MockTimer {
    pub fn set_now(&mut self, nsec: u64) {
        self.now_nsec = nsec;
    }

    pub fn advance(&mut self, nsec: u64) {
        self.now_nsec += nsec;
    }

    pub fn last_deadline(&self) -> Option<u64> {
        self.armed.last().copied()
    }
}

impl WakeTimer for MockTimer {
    fn now_nsec(&self) -> u64 {
        self.now_nsec
    }

    fn arm(&mut self, deadline_nsec: u64) -> Result<()> {
        self.armed.push(deadline_nsec);
        Ok(())
    }

    fn disarm(&mut self) -> Result<()> {
        self.disarm_count += 1;
        Ok(())
    }

    fn consume(&mut self) -> u64 {
        1
    }
}

/// Backend over the mock device, playback or capture picked from the config.
#[derive(Debug)]
pub struct MockBackend;

impl Backend for MockBackend {
    type Pcm = MockPcm;
    type Timer = MockTimer;

    const LABEL: &'static str = "mock";

    fn open_device(config: &DriverConfig) -> Result<Self::Pcm> {
        let playback = config.direction == crate::config::Direction::Playback;
        Ok(MockPcm::new(MockCaps::default(), playback))
    }

    fn open_timer() -> Result<Self::Timer> {
        Ok(MockTimer::default())
    }
}
