use crate::format::SampleFormat;
use serde::{Deserialize, Serialize};

pub const CHMAP_ENUM_ENV: &str = "TACTUS_CHMAP_ENUM";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Playback,
    Capture,
}

/// Static configuration for one device endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Opaque device name handed to the device layer.
    pub device: String,
    pub direction: Direction,
    /// Frames per tick when the host publishes no quantum override.
    pub min_latency: u32,
    /// Defaults offered during format enumeration.
    pub rate: u32,
    pub channels: u32,
    pub format: SampleFormat,
    /// Preferred transfer granularity, resolved near by the device.
    pub period_size: u32,
    /// Preferred hardware buffer, resolved near; the device maximum when unset.
    pub buffer_size: Option<u32>,
    /// Enumerate device channel maps instead of plain channel ranges.
    pub enumerate_chmaps: bool,
    /// Deadline bias in seconds, subtracted from every wake time.
    pub safety: f64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            device: "default".to_string(),
            direction: Direction::Playback,
            min_latency: 1024,
            rate: 48_000,
            channels: 2,
            format: SampleFormat::S16Le,
            period_size: 1024,
            buffer_size: None,
            enumerate_chmaps: env_flag(CHMAP_ENUM_ENV),
            safety: 0.0,
        }
    }
}

pub fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| {
            let s = v.trim().to_ascii_lowercase();
            s == "1" || s == "true" || s == "yes" || s == "on"
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_targets_stereo_s16() {
        let cfg = DriverConfig::default();
        assert_eq!(cfg.rate, 48_000);
        assert_eq!(cfg.channels, 2);
        assert_eq!(cfg.format, SampleFormat::S16Le);
        assert_eq!(cfg.period_size, 1024);
        assert_eq!(cfg.buffer_size, None);
        assert_eq!(cfg.safety, 0.0);
    }
}
