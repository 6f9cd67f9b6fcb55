//! Timer-driven scheduling: one-shot absolute deadlines, a tick handler per
//! direction, and the start/pause transitions.

use crate::clock::{IoStatus, NSEC_PER_SEC};
use crate::config::Direction;
use crate::device::{Backend, PcmDevice, PcmIoError, SwRequest, WakeTimer};
use crate::dll::BW_MAX;
use crate::engine::Engine;
use crate::error::{Error, Result};
use tracing::{debug, error, trace, warn};

impl<B: Backend> Engine<B> {
    /// Arm the first tick and begin moving frames. A slaved engine skips the
    /// timer entirely and is driven by the clock master through `process`.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        if !self.have_format {
            return Err(Error::invalid("start before set_format"));
        }

        self.threshold = match &self.position {
            Some(position) => {
                let size = position.get().size as u64;
                if size != 0 { size } else { self.config.min_latency as u64 }
            }
            None => self.config.min_latency as u64,
        };

        self.slaved = match (&self.position, &self.clock) {
            (Some(position), Some(clock)) => position.get().clock.id != clock.get().id,
            _ => false,
        };

        self.dll.init(BW_MAX);
        self.old_dt = 1.0;
        self.safety = self.config.safety;

        debug!(
            "{}: start threshold {} slaved {}",
            B::LABEL,
            self.threshold,
            self.slaved
        );

        self.dev.commit_sw_params(&SwRequest {
            timestamps: true,
            manual_start: true,
            period_event: false,
        })?;
        self.dev.prepare()?;

        match self.direction() {
            Direction::Playback => {
                self.device_started = false;
                self.write(self.threshold * 2, true)?;
            }
            Direction::Capture => {
                self.dev.start()?;
                self.device_started = true;
            }
        }

        if !self.slaved {
            let now = self.timer.now_nsec();
            self.next_time = now + 1;
            self.timer.arm(self.next_time)?;
        }

        if let Some(io) = &self.io {
            let slot = io.get();
            slot.status = IoStatus::Ok;
            slot.buffer_id = None;
        }

        self.paused = false;
        self.started = true;
        Ok(())
    }

    /// Stop ticking and drop queued device frames. Idempotent.
    pub fn pause(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }
        debug!("{}: pause", B::LABEL);

        if !self.slaved {
            self.timer.disarm()?;
        }
        if let Err(e) = self.dev.drop_pending() {
            error!("{}: drop failed: {e}", B::LABEL);
        }

        self.started = false;
        self.device_started = false;
        self.paused = true;
        Ok(())
    }

    /// Timer expiry entry point. Runs one tick and arms the next deadline; a
    /// fatal device error pauses the engine and is surfaced to the host.
    pub fn handle_timeout(&mut self) {
        if !self.started {
            return;
        }
        if self.timer.consume() == 0 {
            warn!("{}: timer fired without expiration", B::LABEL);
        }

        let res = match self.direction() {
            Direction::Playback => self.playback_tick(),
            Direction::Capture => self.capture_tick(),
        };

        match res {
            Ok(()) => {
                if !self.slaved {
                    if let Err(e) = self.timer.arm(self.next_time) {
                        error!("{}: timer arm failed: {e}", B::LABEL);
                    }
                }
            }
            Err(e) => {
                error!("{}: tick failed: {e}", B::LABEL);
                let _ = self.pause();
                self.callbacks.on_error(&e);
            }
        }
    }

    /// Host-driven entry point: the clock master invokes this on a slaved
    /// engine every graph cycle.
    pub fn process(&mut self) -> Result<()> {
        match self.direction() {
            Direction::Playback => self.write(0, true),
            Direction::Capture => self.capture_tick(),
        }
    }

    fn playback_tick(&mut self) -> Result<()> {
        self.adopt_threshold();

        let nsec = self.timer.now_nsec();
        let delay = self.device_delay()?;

        trace!(
            "timeout {} {} {} {} {} {}",
            delay,
            nsec,
            self.next_time,
            nsec as i64 - self.next_time as i64,
            self.threshold,
            self.samples_produced
        );

        if delay >= self.threshold * 2 {
            trace!("early wakeup {} {}", delay, self.threshold);
            self.next_time =
                nsec + (self.threshold / 2) * NSEC_PER_SEC / self.rate.max(1) as u64;
            return Ok(());
        }

        self.update_time(nsec, delay, false);

        if self.pool.ready_is_empty() {
            if let Some(io) = &self.io {
                io.get().status = IoStatus::NeedBuffer;
            }
            if let Some(range) = &self.range {
                let r = range.get();
                r.offset = self.samples_produced * self.frame_size as u64;
                r.min_size = (self.threshold * self.frame_size as u64) as u32;
                r.max_size = r.min_size;
            }
            self.callbacks.ready(IoStatus::NeedBuffer);
        } else {
            self.write(0, true)?;
        }
        Ok(())
    }

    fn capture_tick(&mut self) -> Result<()> {
        self.adopt_threshold();

        let nsec = self.timer.now_nsec();
        let delay = self.device_delay()?;

        trace!(
            "timeout {} {} {} {} {} {}",
            delay,
            nsec,
            self.next_time,
            nsec as i64 - self.next_time as i64,
            self.threshold,
            self.samples_produced
        );

        if delay < self.threshold {
            trace!("early wakeup {} {}", delay, self.threshold);
            self.next_time =
                nsec + (self.threshold - delay) * NSEC_PER_SEC / self.rate.max(1) as u64;
            return Ok(());
        }

        self.update_time(nsec, delay, false);

        let mut to_read = delay.min(self.threshold);
        let mut total_read = 0u64;

        while total_read < to_read {
            let want = to_read - total_read;
            let (offset, frames) = self.dev.mmap_begin(want)?;
            if frames == 0 {
                break;
            }
            let read = self.push_frames(offset, frames, nsec);
            if read < frames {
                to_read = 0;
            }
            trace!("commit {} {}", offset, read);
            match self.dev.mmap_commit(offset, read) {
                Ok(_) => {}
                Err(PcmIoError::Xrun) => warn!("{}: mmap_commit xrun", B::LABEL),
                Err(PcmIoError::Fatal(e)) => {
                    error!("{}: mmap_commit error: {e}", B::LABEL);
                    return Err(Error::device(format!("mmap_commit: {e}")));
                }
            }
            total_read += read;
            if to_read == 0 {
                break;
            }
        }
        self.samples_produced += total_read;
        Ok(())
    }
}
