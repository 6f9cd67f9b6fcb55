//! Ring transfers and clock bookkeeping: the mmap write/read cycles, the
//! per-tick DLL update and xrun recovery.

use crate::clock::{Fraction, IoStatus, NSEC_PER_SEC};
use crate::config::Direction;
use crate::device::{Backend, PcmDevice, PcmIoError, PcmState};
use crate::dll::{BW_MAX, BW_MIN};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::pool::{Chunk, Header};
use tracing::{error, trace, warn};

// Copy into the ring with wrap on both sides: the ring wraps at its end, the
// source wraps at its own maxsize.
fn copy_to_ring(
    ring: &mut [u8],
    ring_off_frames: u64,
    frame_size: u64,
    src: &[u8],
    src_off: u64,
    n_bytes: u64,
) {
    if n_bytes == 0 || ring.is_empty() || src.is_empty() {
        return;
    }
    let ring_bytes = ring.len() as u64;
    let maxsize = src.len() as u64;
    let base = ring_off_frames * frame_size;
    let mut copied = 0u64;
    while copied < n_bytes {
        let p_r = ((base + copied) % ring_bytes) as usize;
        let p_s = ((src_off + copied) % maxsize) as usize;
        let seg = (n_bytes - copied)
            .min(ring_bytes - p_r as u64)
            .min(maxsize - p_s as u64) as usize;
        ring[p_r..p_r + seg].copy_from_slice(&src[p_s..p_s + seg]);
        copied += seg as u64;
    }
}

fn copy_from_ring(ring: &[u8], ring_off_frames: u64, frame_size: u64, dst: &mut [u8]) {
    let n_bytes = dst.len() as u64;
    if n_bytes == 0 || ring.is_empty() {
        return;
    }
    let ring_bytes = ring.len() as u64;
    let base = ring_off_frames * frame_size;
    let mut copied = 0u64;
    while copied < n_bytes {
        let p_r = ((base + copied) % ring_bytes) as usize;
        let seg = (n_bytes - copied).min(ring_bytes - p_r as u64) as usize;
        dst[copied as usize..copied as usize + seg].copy_from_slice(&ring[p_r..p_r + seg]);
        copied += seg as u64;
    }
}

impl<B: Backend> Engine<B> {
    /// Queue depth as the scheduler sees it: frames ahead of the hardware
    /// pointer for playback, frames waiting to be read for capture. Runs
    /// recovery when the device reports an xrun.
    pub(crate) fn device_delay(&mut self) -> Result<u64> {
        let av = match self.dev.avail() {
            Ok(av) => av,
            Err(err) => {
                self.recover_xrun(&err)?;
                match self.dev.avail() {
                    Ok(av) => av,
                    Err(e) => {
                        return Err(Error::device(format!("avail after recover: {e}")));
                    }
                }
            }
        };
        Ok(match self.direction() {
            Direction::Playback => self.buffer_frames.saturating_sub(av),
            Direction::Capture => av,
        })
    }

    /// Feed the DLL one observation and derive the next deadline, then
    /// publish the clock snapshot for slave engines.
    pub(crate) fn update_time(&mut self, nsec: u64, delay_in: u64, slaved: bool) {
        let sample_time = self.samples_produced;
        let mut elapsed: u64 = if slaved {
            self.threshold
        } else {
            sample_time - self.sample_time
        };
        let mut delay = delay_in;
        let rate = self.rate.max(1) as f64;
        let extra: f64;
        let sdelay: i64;

        match self.direction() {
            Direction::Capture => {
                elapsed = self.threshold;
                extra = elapsed as f64 / rate;
                sdelay = delay as i64 - elapsed as i64;
            }
            Direction::Playback => {
                if elapsed == 0 {
                    elapsed = self.threshold / 2;
                    delay = self.threshold / 2;
                }
                self.sample_time = sample_time;
                sdelay = -(delay as i64);
                extra = 0.0;
            }
        }

        let mut tw = nsec as f64 * 1e-9 - sdelay as f64 / rate - self.safety;
        tw = self.dll.update(tw, elapsed as f64 / rate);
        self.next_time = ((tw + extra - self.safety) * 1e9) as u64;

        if self.dll.needs_narrowing(tw) {
            self.dll.set_bandwidth(BW_MIN);
        }

        self.old_dt = self.dll.dt().clamp(0.95, 1.05);

        if let Some(clock) = &self.clock {
            let c = clock.get();
            c.nsec = self.last_time;
            c.rate = Fraction::new(1, self.rate);
            c.position = self.samples_produced as i64;
            c.delay = sdelay;
            c.rate_diff = self.old_dt;
        }

        trace!(
            "{} {} {} {} {} {} {} {}",
            nsec,
            self.old_dt,
            delay,
            elapsed,
            nsec as i64 - self.last_time as i64,
            self.threshold,
            self.next_time,
            tw
        );

        self.last_time = nsec;
    }

    /// Move ready data into the device ring, padding with up to `silence`
    /// frames when the queue runs short. With `start`, the device is started
    /// once something was written.
    pub fn write(&mut self, silence: u64, start: bool) -> Result<()> {
        self.adopt_threshold();

        if self.slaved {
            let master = match &self.position {
                Some(position) => {
                    let c = position.get().clock;
                    Some((c.position + c.delay).max(0) as u64)
                }
                None => None,
            };
            if let Some(master) = master {
                let nsec =
                    (master as u128 * NSEC_PER_SEC as u128 / self.rate.max(1) as u128) as u64;
                let delay = self.device_delay()?;
                self.update_time(nsec, delay, true);
                trace!("slave {} {} {} {}", self.dll.dt(), nsec, delay, self.rate);
                if delay > self.threshold * 2 {
                    self.dev.rewind(self.threshold)?;
                }
            }
        }

        let fs = self.frame_size.max(1) as u64;
        let mut silence = silence;
        let mut total_written = 0u64;

        loop {
            let (offset, frames) = self.dev.mmap_begin(self.buffer_frames)?;
            trace!("begin {} {} {}", offset, frames, self.threshold);

            silence = silence.min(frames);
            let mut to_write = frames;
            let mut off = offset;
            let mut written = 0u64;

            while to_write > 0 {
                let (n_frames, n_bytes, drained) = {
                    let ready_offset = self.ready_offset as u64;
                    let Some(buf) = self.pool.front_ready() else {
                        break;
                    };
                    let size = buf.chunk.size as u64;
                    let avail = size.saturating_sub(ready_offset) / fs;
                    let n_frames = avail.min(to_write);
                    let n_bytes = n_frames * fs;
                    let src_off = buf.chunk.offset as u64 + ready_offset;
                    let ring = self.dev.ring();
                    copy_to_ring(ring, off, fs, buf.data(), src_off, n_bytes);
                    (n_frames, n_bytes, ready_offset + n_bytes >= size)
                };

                self.ready_offset += n_bytes as usize;
                if drained {
                    if let Some(id) = self.pool.remove_front_ready() {
                        if let Some(io) = &self.io {
                            io.get().buffer_id = Some(id);
                        }
                        trace!("reuse buffer {id}");
                        self.callbacks.reuse_buffer(0, id);
                    }
                    self.ready_offset = 0;
                }

                written += n_frames;
                off += n_frames;
                to_write -= n_frames;
                silence = silence.saturating_sub(n_frames);
                if n_frames == 0 && !drained {
                    break;
                }
            }

            if silence > 0 {
                trace!("silence {silence}");
                self.dev.areas_silence(off, silence);
                written += silence;
            }

            trace!("commit {} {} {}", offset, written, self.samples_produced);
            total_written += written;

            match self.dev.mmap_commit(offset, written) {
                Ok(_) => {}
                // Recoverable: the next avail() classifies and recovers.
                Err(PcmIoError::Xrun) => warn!("{}: mmap_commit xrun", B::LABEL),
                Err(PcmIoError::Fatal(e)) => {
                    error!("{}: mmap_commit error: {e}", B::LABEL);
                    return Err(Error::device(format!("mmap_commit: {e}")));
                }
            }

            if self.pool.ready_is_empty() || written == 0 {
                break;
            }
        }

        self.samples_produced += total_written;

        if !self.device_started && total_written > 0 && start {
            trace!("pcm start {total_written}");
            self.dev.start()?;
            self.device_started = true;
        }
        Ok(())
    }

    /// Capture side of one mmap window: fill a free descriptor and hand it
    /// to the host, or drop frames to bound the lag when none is free.
    /// Returns the frames consumed from the window.
    pub(crate) fn push_frames(&mut self, offset: u64, frames: u64, nsec: u64) -> u64 {
        let id = match self.pool.take_free() {
            Err(_) => {
                warn!("{}: no more buffers, dropping frames", B::LABEL);
                return frames.min(self.threshold);
            }
            Ok(id) => id,
        };

        let fs = self.frame_size.max(1) as u64;
        let seq = self.samples_produced;
        let mut total = 0u64;
        {
            let ring = self.dev.ring();
            if let Some(buf) = self.pool.buffer_mut(id) {
                buf.header = Header { seq, pts: nsec, dts_offset: 0 };
                let avail = buf.maxsize() as u64 / fs;
                total = avail.min(frames);
                let n_bytes = (total * fs) as usize;
                copy_from_ring(ring, offset, fs, &mut buf.data_mut()[..n_bytes]);
                buf.chunk = Chunk {
                    offset: 0,
                    size: n_bytes as u32,
                    stride: fs as u32,
                };
            }
        }

        let mut queued = true;
        if let Some(io) = &self.io {
            let slot = io.get();
            if slot.status != IoStatus::HaveBuffer {
                slot.buffer_id = Some(id);
                slot.status = IoStatus::HaveBuffer;
                queued = false;
            }
        }
        if queued {
            // Io slot occupied: park on ready until the host drains it.
            self.pool.push_ready(id);
        } else {
            self.pool.mark_out(id);
        }
        self.callbacks.ready(IoStatus::HaveBuffer);
        total
    }

    /// Bring the stream back after an underrun or overrun: log the
    /// magnitude, reset the device and the rate tracker, re-prime and
    /// restart.
    pub(crate) fn recover_xrun(&mut self, err: &PcmIoError) -> Result<()> {
        self.recovering = true;
        let status = self.dev.status().map_err(|e| {
            self.recovering = false;
            e
        })?;

        if status.state == PcmState::Xrun {
            let diff = status.now_nsec.saturating_sub(status.trigger_nsec);
            let missing =
                (diff as u128 * self.rate as u128 / NSEC_PER_SEC as u128) as u64;
            warn!(
                "{}: xrun of {} usec, {} frames, safety {}",
                B::LABEL,
                diff / 1_000,
                missing,
                self.safety
            );
        } else {
            error!("{}: recover from state {:?}", B::LABEL, status.state);
        }
        self.xrun_count += 1;

        if let Err(e) = self.dev.recover(err) {
            self.recovering = false;
            error!("{}: recover failed: {e}", B::LABEL);
            return Err(e);
        }
        self.dll.init(BW_MAX);

        let res = match self.direction() {
            Direction::Capture => {
                let res = self.dev.start();
                if res.is_ok() {
                    self.device_started = true;
                }
                res
            }
            Direction::Playback => {
                self.device_started = false;
                self.write(self.threshold * 2, true)
            }
        };
        self.recovering = false;
        res
    }
}
