//! Two-pole rate tracker. Fed the observed service time of every tick, it
//! keeps a smoothed timeline and a smoothed tick period; the period over the
//! nominal period is the device rate ratio used for pacing.

use std::f64::consts::PI;

/// Wide lock-in bandwidth used at start and after recovery.
pub const BW_MAX: f64 = 0.128;
/// Narrow steady-state bandwidth.
pub const BW_MIN: f64 = 0.016;
/// Seconds of stable tracking before the bandwidth is narrowed.
pub const BW_PERIOD: f64 = 3.0;

#[derive(Debug, Clone, Copy)]
pub struct Dll {
    bw: f64,
    b: f64,
    c: f64,
    /// Filtered time of the last observation.
    time: f64,
    /// Observation time when the current bandwidth was engaged.
    base: f64,
    /// Smoothed seconds between observations.
    period: f64,
    dt: f64,
    ready: bool,
}

impl Dll {
    pub fn new(bw: f64) -> Self {
        let mut dll = Dll {
            bw: 0.0,
            b: 0.0,
            c: 0.0,
            time: 0.0,
            base: 0.0,
            period: 0.0,
            dt: 1.0,
            ready: false,
        };
        dll.init(bw);
        dll
    }

    /// Reset to an unlocked state at the given bandwidth. The next update
    /// re-seeds the timeline.
    pub fn init(&mut self, bw: f64) {
        self.set_bandwidth(bw);
        self.time = 0.0;
        self.base = 0.0;
        self.period = 0.0;
        self.dt = 1.0;
        self.ready = false;
    }

    pub fn set_bandwidth(&mut self, bw: f64) {
        let w = 2.0 * PI * bw;
        self.bw = bw;
        self.b = std::f64::consts::SQRT_2 * w;
        self.c = w * w;
        self.base = self.time;
    }

    /// Feed one observation: `t` is the measured service time in seconds,
    /// `elapsed` the nominal seconds since the previous observation. Returns
    /// the filtered service time.
    pub fn update(&mut self, t: f64, elapsed: f64) -> f64 {
        if !self.ready {
            self.time = t;
            self.base = t;
            self.period = elapsed;
            self.dt = 1.0;
            self.ready = true;
            return t;
        }
        let predicted = self.time + self.period;
        let err = t - predicted;
        self.time = predicted + self.b * err;
        self.period += self.c * err;
        if elapsed > 0.0 {
            self.dt = self.period / elapsed;
        }
        self.time
    }

    /// True once this bandwidth has tracked long enough to be narrowed.
    pub fn needs_narrowing(&self, t: f64) -> bool {
        self.ready && self.bw > BW_MIN && t > self.base + BW_PERIOD
    }

    pub fn bw(&self) -> f64 {
        self.bw
    }

    /// Smoothed period over nominal period, ~1.0 when locked.
    pub fn dt(&self) -> f64 {
        self.dt
    }
}
