use std::cell::UnsafeCell;

// Interior mutability for records shared between an engine and its host
// (clock, position, io slot). There is no locking: every reader and writer
// must live on the same data loop. The host passes these in at configuration
// time and only touches them from loop callbacks.
#[derive(Debug, Default)]
pub struct LoopCell<T> {
    data: UnsafeCell<T>,
}

impl<T> LoopCell<T> {
    pub fn new(data: T) -> Self {
        LoopCell {
            data: UnsafeCell::new(data),
        }
    }

    // SAFETY: single-writer, data-loop confinement. Callers outside the data
    // loop must go through DataLoop::invoke.
    #[allow(clippy::mut_from_ref)]
    pub fn get(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

unsafe impl<T: Send> Send for LoopCell<T> {}
unsafe impl<T: Send> Sync for LoopCell<T> {}
