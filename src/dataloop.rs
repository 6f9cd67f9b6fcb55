//! Dedicated data-loop thread for one engine: waits on the wake timer and an
//! eventfd, runs ticks, and executes host requests between ticks. `invoke`
//! returns only after the request ran on the loop, so callers observe their
//! effects immediately.

use crate::device::Backend;
use crate::engine::Engine;
use crate::error::{Error, Result};
use nix::libc;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use tracing::error;

type Command<B> = Box<dyn FnOnce(&mut Engine<B>) + Send>;

struct LoopState<B: Backend> {
    commands: Vec<(u64, Command<B>)>,
    next_seq: u64,
    done_seq: u64,
    shutdown: bool,
}

struct Shared<B: Backend> {
    state: Mutex<LoopState<B>>,
    cond: Condvar,
}

pub struct DataLoop<B: Backend> {
    shared: Arc<Shared<B>>,
    wake_fd: RawFd,
    handle: Option<JoinHandle<()>>,
}

impl<B> DataLoop<B>
where
    B: Backend + 'static,
    B::Pcm: Send,
    B::Timer: Send + AsRawFd,
{
    pub fn spawn(mut engine: Engine<B>) -> Result<Self> {
        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if wake_fd < 0 {
            return Err(Error::device(format!(
                "eventfd: {}",
                std::io::Error::last_os_error()
            )));
        }
        let shared = Arc::new(Shared {
            state: Mutex::new(LoopState {
                commands: Vec::new(),
                next_seq: 0,
                done_seq: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });
        let loop_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("tactus-data".to_string())
            .spawn(move || run_loop(&mut engine, &loop_shared, wake_fd))
            .map_err(|e| Error::device(format!("spawn data loop: {e}")))?;
        Ok(Self {
            shared,
            wake_fd,
            handle: Some(handle),
        })
    }

    fn signal(&self) {
        let one: u64 = 1;
        unsafe {
            libc::write(
                self.wake_fd,
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
    }

    /// Run `f` on the data loop and wait for it to finish. A tick in flight
    /// completes before the request runs.
    pub fn invoke<F>(&self, f: F)
    where
        F: FnOnce(&mut Engine<B>) + Send + 'static,
    {
        let seq = {
            let mut st = self.shared.state.lock().expect("data loop mutex poisoned");
            st.next_seq += 1;
            let seq = st.next_seq;
            st.commands.push((seq, Box::new(f)));
            seq
        };
        self.signal();
        let mut st = self.shared.state.lock().expect("data loop mutex poisoned");
        while st.done_seq < seq && !st.shutdown {
            st = self
                .shared
                .cond
                .wait(st)
                .expect("data loop condvar failed");
        }
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        {
            let mut st = self.shared.state.lock().expect("data loop mutex poisoned");
            st.shutdown = true;
        }
        self.signal();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl<B: Backend> Drop for DataLoop<B> {
    fn drop(&mut self) {
        {
            let mut st = self.shared.state.lock().expect("data loop mutex poisoned");
            st.shutdown = true;
        }
        let one: u64 = 1;
        unsafe {
            libc::write(
                self.wake_fd,
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        unsafe { libc::close(self.wake_fd) };
    }
}

fn run_loop<B>(engine: &mut Engine<B>, shared: &Shared<B>, wake_fd: RawFd)
where
    B: Backend,
    B::Timer: AsRawFd,
{
    loop {
        let timer_fd = engine.timer().as_raw_fd();
        let mut fds = [
            libc::pollfd { fd: timer_fd, events: libc::POLLIN, revents: 0 },
            libc::pollfd { fd: wake_fd, events: libc::POLLIN, revents: 0 },
        ];
        let res = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if res < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            error!("data loop poll failed: {err}");
            break;
        }

        if fds[0].revents & libc::POLLIN != 0 {
            engine.handle_timeout();
        }

        if fds[1].revents & libc::POLLIN != 0 {
            let mut counter: u64 = 0;
            unsafe {
                libc::read(
                    wake_fd,
                    &mut counter as *mut u64 as *mut libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
        }

        let (commands, shutdown) = {
            let mut st = shared.state.lock().expect("data loop mutex poisoned");
            (std::mem::take(&mut st.commands), st.shutdown)
        };
        for (seq, command) in commands {
            command(engine);
            let mut st = shared.state.lock().expect("data loop mutex poisoned");
            st.done_seq = st.done_seq.max(seq);
            shared.cond.notify_all();
        }
        if shutdown {
            break;
        }
    }
    let mut st = shared.state.lock().expect("data loop mutex poisoned");
    st.shutdown = true;
    st.done_seq = st.next_seq;
    shared.cond.notify_all();
}
