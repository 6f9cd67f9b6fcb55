use crate::clock::NSEC_PER_SEC;
use crate::device::WakeTimer;
use crate::error::{Error, Result};
use nix::libc;
use std::os::unix::io::{AsRawFd, RawFd};

/// One-shot absolute-deadline timer on CLOCK_MONOTONIC.
#[derive(Debug)]
pub struct TimerFd {
    fd: RawFd,
}

impl TimerFd {
    pub fn new() -> Result<Self> {
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_CLOEXEC | libc::TFD_NONBLOCK,
            )
        };
        if fd < 0 {
            return Err(Error::device(format!(
                "timerfd_create: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(Self { fd })
    }

    fn settime(&self, deadline_nsec: u64, absolute: bool) -> Result<()> {
        let ts = libc::itimerspec {
            it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
            it_value: libc::timespec {
                tv_sec: (deadline_nsec / NSEC_PER_SEC) as libc::time_t,
                tv_nsec: (deadline_nsec % NSEC_PER_SEC) as libc::c_long,
            },
        };
        let flags = if absolute { libc::TFD_TIMER_ABSTIME } else { 0 };
        let res = unsafe { libc::timerfd_settime(self.fd, flags, &ts, std::ptr::null_mut()) };
        if res < 0 {
            return Err(Error::device(format!(
                "timerfd_settime: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}

impl WakeTimer for TimerFd {
    fn now_nsec(&self) -> u64 {
        let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        ts.tv_sec as u64 * NSEC_PER_SEC + ts.tv_nsec as u64
    }

    fn arm(&mut self, deadline_nsec: u64) -> Result<()> {
        self.settime(deadline_nsec.max(1), true)
    }

    fn disarm(&mut self) -> Result<()> {
        self.settime(0, false)
    }

    fn consume(&mut self) -> u64 {
        let mut expirations: u64 = 0;
        let res = unsafe {
            libc::read(
                self.fd,
                &mut expirations as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if res == std::mem::size_of::<u64>() as isize {
            expirations
        } else {
            0
        }
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for TimerFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}
