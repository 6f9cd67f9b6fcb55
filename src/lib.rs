//! Timer-scheduled PCM driver engine. Moves audio frames between host
//! buffer queues and a kernel sound device over mmap, keeps a software
//! clock locked to the device rate with a two-pole tracker, and publishes
//! that clock so other engines on the same data loop can follow it.

pub mod cell;
pub mod clock;
pub mod config;
pub mod device;
pub mod dll;
pub mod engine;
pub mod error;
pub mod format;
pub mod mock;
pub mod pool;
mod sched;
mod transfer;

#[cfg(target_os = "linux")]
pub mod dataloop;
#[cfg(target_os = "linux")]
pub mod timer;

#[cfg(all(target_os = "linux", feature = "alsa"))]
pub mod alsa;

pub use config::{Direction, DriverConfig};
pub use device::{Backend, PcmDevice, WakeTimer};
pub use engine::{
    AudioInfo, Engine, EngineState, EnumFormatResult, FormatFilter, FormatParams, FormatRange,
    HostEvents, NullHost,
};
pub use error::{Error, Result};
pub use format::{Channel, SampleFormat};
pub use pool::{Buffer, Chunk, Header};
